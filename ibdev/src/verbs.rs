//! Hardware and event-loop boundaries.
//!
//! [`Verbs`] is the synchronous native API the device layer wraps; the
//! `ibdev-verbs` crate implements it on top of libibverbs. [`EventLoop`] is
//! the externally owned reactor that watches the async event descriptor.

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::path::PathBuf;

use crate::ah_cache::AhAttr;
use crate::async_event::HwAsyncEvent;
use crate::error::{IbError, Result};
use crate::gid::Gid;
use crate::port::PortAttr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Unknown,
    Ca,
    Switch,
    Router,
    Rnic,
    Usnic,
    UsnicUdp,
    Unspecified,
}

impl NodeType {
    /// Decode a raw `ibv_node_type` value.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => Self::Ca,
            2 => Self::Switch,
            3 => Self::Router,
            4 => Self::Rnic,
            5 => Self::Usnic,
            6 => Self::UsnicUdp,
            7 => Self::Unspecified,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ca => "InfiniBand channel adapter",
            Self::Switch => "InfiniBand switch",
            Self::Router => "InfiniBand router",
            Self::Rnic => "iWARP NIC",
            Self::Usnic => "usNIC",
            Self::UsnicUdp => "usNIC UDP",
            Self::Unspecified => "unspecified",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    Unknown,
    Ib,
    Iwarp,
    Usnic,
    UsnicUdp,
    Unspecified,
}

impl TransportType {
    /// Decode a raw `ibv_transport_type` value.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Self::Ib,
            1 => Self::Iwarp,
            2 => Self::Usnic,
            3 => Self::UsnicUdp,
            4 => Self::Unspecified,
            _ => Self::Unknown,
        }
    }
}

/// The subset of `ibv_device_attr` this crate consults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceAttr {
    pub fw_ver: String,
    pub phys_port_cnt: u8,
    /// Dynamically-connected transport is available.
    pub has_dc: bool,
}

/// Synchronous verbs interface of one opened device.
pub trait Verbs: Send + Sync + 'static {
    /// Created address handle. Cloning must not create a new hardware object.
    type AddressHandle: Clone + Send + Sync + 'static;

    fn name(&self) -> &str;

    fn node_type(&self) -> NodeType;

    fn transport_type(&self) -> TransportType;

    /// `ibdev_path` of the device, used to locate its PCI function in sysfs.
    fn ibdev_path(&self) -> Option<PathBuf>;

    fn query_device(&self) -> io::Result<DeviceAttr>;

    fn query_port(&self, port: u8) -> io::Result<PortAttr>;

    fn query_gid(&self, port: u8, index: u32) -> io::Result<Gid>;

    fn create_ah(&self, attr: &AhAttr) -> io::Result<Self::AddressHandle>;

    fn destroy_ah(&self, ah: Self::AddressHandle);

    /// Non-blocking descriptor that becomes readable when async events are
    /// pending.
    fn async_fd(&self) -> Option<RawFd>;

    /// Fetch and acknowledge the next async event. `Ok(None)` when none is
    /// pending.
    fn get_async_event(&self) -> io::Result<Option<HwAsyncEvent>>;
}

/// Invoked by the event loop when a watched descriptor is readable.
pub type ReadyHandler = Box<dyn Fn() + Send + Sync + 'static>;

/// An externally owned reactor.
pub trait EventLoop: Send + Sync {
    fn add_reader(&self, fd: RawFd, handler: ReadyHandler) -> io::Result<()>;

    fn remove_reader(&self, fd: RawFd);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    Reset,
    Init,
    Rtr,
    Rts,
    Sqd,
    Sqe,
    Err,
}

impl fmt::Display for QpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Reset => "RESET",
            Self::Init => "INIT",
            Self::Rtr => "RTR",
            Self::Rts => "RTS",
            Self::Sqd => "SQD",
            Self::Sqe => "SQE",
            Self::Err => "ERR",
        })
    }
}

/// Enhanced connection establishment data of a queue pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ece {
    pub vendor_id: u32,
    pub options: u32,
    pub comp_mask: u32,
}

/// ECE value that leaves the queue pair untouched.
pub const ECE_DEFAULT: u32 = 0;

/// A queue pair that supports a bare state transition.
pub trait AdminQp {
    fn qp_num(&self) -> u32;

    /// Move to `state` with only the state attribute set.
    fn set_state(&self, state: QpState) -> io::Result<()>;

    fn query_ece(&self) -> io::Result<Ece> {
        Err(io::ErrorKind::Unsupported.into())
    }

    fn set_ece(&self, _ece: &Ece) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }
}

/// Administrative queue-pair state change.
pub fn modify_qp<Q: AdminQp + ?Sized>(qp: &Q, state: QpState) -> Result<()> {
    qp.set_state(state).map_err(|e| {
        tracing::warn!(qpn = qp.qp_num(), %state, error = %e, "modify_qp failed");
        IbError::io(format!("modify_qp(0x{:x}, {state})", qp.qp_num()), e)
    })
}

/// Apply ECE `options` to a queue pair, keeping its vendor id.
///
/// [`ECE_DEFAULT`] is a no-op. A failed query is an I/O error; a value the
/// provider refuses is an invalid parameter.
pub fn set_ece<Q: AdminQp + ?Sized>(qp: &Q, options: u32) -> Result<()> {
    if options == ECE_DEFAULT {
        return Ok(());
    }

    let qpn = qp.qp_num();
    let mut ece = qp.query_ece().map_err(|e| {
        if e.kind() == io::ErrorKind::Unsupported {
            return IbError::unsupported(format!("ECE on QP 0x{qpn:x}"));
        }
        tracing::warn!(qpn, error = %e, "ibv_query_ece failed");
        IbError::io(format!("ibv_query_ece(0x{qpn:x})"), e)
    })?;

    ece.options = options;
    qp.set_ece(&ece).map_err(|e| {
        if e.kind() == io::ErrorKind::Unsupported {
            return IbError::unsupported(format!("ECE on QP 0x{qpn:x}"));
        }
        tracing::warn!(qpn, options, error = %e, "ibv_set_ece failed");
        IbError::invalid_param(format!("ibv_set_ece(0x{qpn:x}, 0x{options:x}): {e}"))
    })
}
