//! Hardware abstraction for RDMA network devices.
//!
//! A [`Device`] wraps one opened verbs context: it snapshots port and PCI
//! capabilities at open time, gates usable ports, negotiates RoCE GIDs,
//! caches address handles, and fans hardware async events out to waiters.
//! Hardware access goes through the [`Verbs`] trait; `ibdev-verbs` provides
//! the libibverbs implementation.

pub mod ah_cache;
pub mod async_event;
pub mod callback;
pub mod catalog;
pub mod config;
pub mod cqe;
pub mod device;
pub mod error;
pub mod fabric;
pub mod gid;
pub mod pci;
pub mod port;
pub mod sysfs;
pub mod topology;
pub mod verbs;

pub use ah_cache::{AhAttr, AhCache, GlobalRoute};
pub use async_event::{
    AsyncEventKey, AsyncEventRegistry, AsyncEventType, ElementKind, EventElement, HwAsyncEvent,
    WaitContext,
};
pub use callback::{CallbackId, CallbackQueue, ProgressQueue};
pub use catalog::{Catalog, DeviceFlags, DeviceSpec, PciId};
pub use config::DeviceConfig;
pub use device::{Device, DeviceStats, PortLayout, PortResource, ResourceKind};
pub use error::{IbError, Result};
pub use gid::{AddrFamily, Gid, GidInfo, RoceVersion};
pub use pci::{PciBandwidthEstimator, UNBOUNDED_BANDWIDTH};
pub use port::{LinkLayer, Mtu, PortAttr, PortState};
pub use topology::{SysDeviceId, Topology};
pub use verbs::{
    AdminQp, DeviceAttr, ECE_DEFAULT, Ece, EventLoop, NodeType, QpState, TransportType, Verbs,
    modify_qp, set_ece,
};
