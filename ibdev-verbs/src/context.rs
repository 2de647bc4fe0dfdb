//! Opened verbs context and the resources address handles hang off.

use ibdev::error::{IbError, Result};
use ibdev::{
    AhAttr, AsyncEventType, DeviceAttr, ElementKind, EventElement, Gid, HwAsyncEvent, LinkLayer,
    Mtu, NodeType, PortAttr, PortState, TransportType, Verbs,
};
use std::ffi::CStr;
use std::io;
use std::os::fd::RawFd;
use std::os::raw::c_int;
use std::path::PathBuf;
use std::ptr::NonNull;

/// Address handle created on an [`IbvDevice`]. Copies share the hardware
/// object; it is released through [`Verbs::destroy_ah`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IbvAh(NonNull<ibverbs_sys::ibv_ah>);

unsafe impl Send for IbvAh {}
unsafe impl Sync for IbvAh {}

impl IbvAh {
    pub fn as_ptr(&self) -> *mut ibverbs_sys::ibv_ah {
        self.0.as_ptr()
    }
}

/// One opened RDMA device.
///
/// Owns the verbs context and a protection domain used for address handles.
/// The async event descriptor is switched to non-blocking mode at open time
/// so [`Verbs::get_async_event`] never stalls the event loop.
pub struct IbvDevice {
    ctx: *mut ibverbs_sys::ibv_context,
    pd: *mut ibverbs_sys::ibv_pd,
    name: String,
    node_type: NodeType,
    transport_type: TransportType,
    ibdev_path: Option<PathBuf>,
}

unsafe impl Send for IbvDevice {}
unsafe impl Sync for IbvDevice {}

/// Names of every RDMA device libibverbs can see.
pub fn device_names() -> Result<Vec<String>> {
    unsafe {
        let mut num_devices: c_int = 0;
        let dev_list = ibverbs_sys::ibv_get_device_list(&mut num_devices);
        if dev_list.is_null() {
            return Err(IbError::io(
                "ibv_get_device_list",
                io::Error::last_os_error(),
            ));
        }
        let names = (0..num_devices.max(0) as usize)
            .map(|i| cstr_to_string(ibverbs_sys::ibv_get_device_name(*dev_list.add(i))))
            .collect();
        ibverbs_sys::ibv_free_device_list(dev_list);
        Ok(names)
    }
}

impl IbvDevice {
    /// Open the device called `name`, e.g. `mlx5_0`.
    pub fn open(name: &str) -> Result<Self> {
        unsafe {
            let mut num_devices: c_int = 0;
            let dev_list = ibverbs_sys::ibv_get_device_list(&mut num_devices);
            if dev_list.is_null() || num_devices == 0 {
                if !dev_list.is_null() {
                    ibverbs_sys::ibv_free_device_list(dev_list);
                }
                return Err(IbError::NoDevice("no RDMA devices found".into()));
            }

            let dev = (0..num_devices as usize)
                .map(|i| *dev_list.add(i))
                .find(|&dev| cstr_to_string(ibverbs_sys::ibv_get_device_name(dev)) == name);
            let Some(dev) = dev else {
                ibverbs_sys::ibv_free_device_list(dev_list);
                return Err(IbError::NoDevice(format!("RDMA device {name} not found")));
            };

            let node_type = NodeType::from_raw((*dev).node_type as i32);
            let transport_type = TransportType::from_raw((*dev).transport_type as i32);
            let ibdev_path = {
                let path = cstr_to_string((*dev).ibdev_path.as_ptr());
                (!path.is_empty()).then(|| PathBuf::from(path))
            };

            let ctx = ibverbs_sys::ibv_open_device(dev);
            ibverbs_sys::ibv_free_device_list(dev_list);
            if ctx.is_null() {
                return Err(IbError::io(
                    format!("ibv_open_device({name})"),
                    io::Error::last_os_error(),
                ));
            }

            let pd = ibverbs_sys::ibv_alloc_pd(ctx);
            if pd.is_null() {
                let err = io::Error::last_os_error();
                ibverbs_sys::ibv_close_device(ctx);
                return Err(IbError::io(format!("ibv_alloc_pd({name})"), err));
            }

            if let Err(e) = set_nonblocking((*ctx).async_fd) {
                ibverbs_sys::ibv_dealloc_pd(pd);
                ibverbs_sys::ibv_close_device(ctx);
                return Err(IbError::io(format!("fcntl(async_fd) on {name}"), e));
            }

            tracing::debug!(device = name, %node_type, "opened verbs context");
            Ok(Self {
                ctx,
                pd,
                name: name.to_string(),
                node_type,
                transport_type,
                ibdev_path,
            })
        }
    }

    pub fn as_ptr(&self) -> *mut ibverbs_sys::ibv_context {
        self.ctx
    }

    /// Protection domain shared by the address handles of this device.
    pub fn pd(&self) -> *mut ibverbs_sys::ibv_pd {
        self.pd
    }
}

impl Verbs for IbvDevice {
    type AddressHandle = IbvAh;

    fn name(&self) -> &str {
        &self.name
    }

    fn node_type(&self) -> NodeType {
        self.node_type
    }

    fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    fn ibdev_path(&self) -> Option<PathBuf> {
        self.ibdev_path.clone()
    }

    fn query_device(&self) -> io::Result<DeviceAttr> {
        unsafe {
            let mut attr: ibverbs_sys::ibv_device_attr = std::mem::zeroed();
            check_rc(ibverbs_sys::ibv_query_device(self.ctx, &mut attr))?;
            Ok(DeviceAttr {
                fw_ver: cstr_to_string(attr.fw_ver.as_ptr()),
                phys_port_cnt: attr.phys_port_cnt,
                // DC is only reachable through the mlx5 direct-verbs API.
                has_dc: false,
            })
        }
    }

    fn query_port(&self, port: u8) -> io::Result<PortAttr> {
        unsafe {
            let mut attr: ibverbs_sys::ibv_port_attr = std::mem::zeroed();
            check_rc(ibverbs_sys::ibv_query_port(self.ctx, port, &mut attr))?;
            let active_mtu = Mtu::from_raw(attr.active_mtu as u32)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            Ok(PortAttr {
                state: PortState::from_raw(attr.state as u32),
                link_layer: LinkLayer::from_raw(attr.link_layer),
                gid_tbl_len: attr.gid_tbl_len.max(0) as u32,
                active_mtu,
                lid: attr.lid,
            })
        }
    }

    fn query_gid(&self, port: u8, index: u32) -> io::Result<Gid> {
        let index = c_int::try_from(index)
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        unsafe {
            let mut gid: ibverbs_sys::ibv_gid = std::mem::zeroed();
            check_rc(ibverbs_sys::ibv_query_gid(self.ctx, port, index, &mut gid))?;
            Ok(Gid(gid.raw))
        }
    }

    fn create_ah(&self, attr: &AhAttr) -> io::Result<IbvAh> {
        unsafe {
            let mut ah_attr: ibverbs_sys::ibv_ah_attr = std::mem::zeroed();
            ah_attr.grh.dgid.raw = attr.grh.dgid.0;
            ah_attr.grh.flow_label = attr.grh.flow_label;
            ah_attr.grh.sgid_index = attr.grh.sgid_index;
            ah_attr.grh.hop_limit = attr.grh.hop_limit;
            ah_attr.grh.traffic_class = attr.grh.traffic_class;
            ah_attr.dlid = attr.dlid;
            ah_attr.sl = attr.sl;
            ah_attr.src_path_bits = attr.src_path_bits;
            ah_attr.static_rate = attr.static_rate;
            ah_attr.is_global = u8::from(attr.is_global);
            ah_attr.port_num = attr.port_num;

            let ah = ibverbs_sys::ibv_create_ah(self.pd, &mut ah_attr);
            NonNull::new(ah).map(IbvAh).ok_or_else(io::Error::last_os_error)
        }
    }

    fn destroy_ah(&self, ah: IbvAh) {
        let rc = unsafe { ibverbs_sys::ibv_destroy_ah(ah.as_ptr()) };
        if rc != 0 {
            tracing::warn!(
                device = %self.name,
                error = %io::Error::from_raw_os_error(rc),
                "ibv_destroy_ah failed"
            );
        }
    }

    fn async_fd(&self) -> Option<RawFd> {
        let fd = unsafe { (*self.ctx).async_fd };
        (fd >= 0).then_some(fd)
    }

    fn get_async_event(&self) -> io::Result<Option<HwAsyncEvent>> {
        unsafe {
            let mut event: ibverbs_sys::ibv_async_event = std::mem::zeroed();
            if ibverbs_sys::ibv_get_async_event(self.ctx, &mut event) != 0 {
                let err = io::Error::last_os_error();
                return match err.kind() {
                    io::ErrorKind::WouldBlock => Ok(None),
                    _ => Err(err),
                };
            }

            let event_type = AsyncEventType::from_raw(event.event_type as u32);
            let element = match event_type.element_kind() {
                ElementKind::Cq => EventElement::Cq(event.element.cq as u64),
                ElementKind::Qp => EventElement::Qp((*event.element.qp).qp_num),
                ElementKind::Srq => EventElement::Srq(event.element.srq as u64),
                ElementKind::Port => {
                    EventElement::Port(u8::try_from(event.element.port_num).unwrap_or(0))
                }
                ElementKind::None => EventElement::None,
            };
            ibverbs_sys::ibv_ack_async_event(&mut event);
            Ok(Some(HwAsyncEvent::new(event_type, element)))
        }
    }
}

impl Drop for IbvDevice {
    fn drop(&mut self) {
        unsafe {
            if !self.pd.is_null() {
                ibverbs_sys::ibv_dealloc_pd(self.pd);
            }
            if !self.ctx.is_null() {
                ibverbs_sys::ibv_close_device(self.ctx);
            }
        }
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Verbs query calls return an errno value, or -1 with `errno` set.
fn check_rc(rc: c_int) -> io::Result<()> {
    match rc {
        0 => Ok(()),
        rc if rc > 0 => Err(io::Error::from_raw_os_error(rc)),
        _ => Err(io::Error::last_os_error()),
    }
}

unsafe fn cstr_to_string(ptr: *const std::os::raw::c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}
