//! Device descriptor: static capability snapshot plus the per-device
//! address-handle cache and async event registry.

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::ah_cache::{AhAttr, AhCache, GlobalRoute};
use crate::async_event::{
    AsyncEventKey, AsyncEventRegistry, AsyncEventType, EventSeverity, HwAsyncEvent, WaitContext,
};
use crate::catalog::{Catalog, DeviceFlags, DeviceSpec, PciId};
use crate::config::DeviceConfig;
use crate::error::{IbError, Result};
use crate::gid::{self, Gid, GidInfo, RoceVersion, parse_gid_type};
use crate::pci::{PciBandwidthEstimator, UNBOUNDED_BANDWIDTH};
use crate::port::{FIRST_CA_PORT, MAX_PORTS, PortAttr};
use crate::sysfs::{self, CpuMask, SysfsReader};
use crate::topology::{SysDeviceId, Topology};
use crate::verbs::{self, AdminQp, DeviceAttr, EventLoop, NodeType, TransportType, Verbs};

/// UDP source port base used as the DLID of RoCE address handles.
pub const ROCE_UDP_SRC_PORT_BASE: u16 = 0xc000;

/// Resource kind reported by [`Device::query_ports`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Network,
}

/// One usable `(device, port)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortResource {
    /// `"<device>:<port>"`
    pub name: String,
    pub port: u8,
    pub kind: ResourceKind,
    pub sys_dev: SysDeviceId,
}

/// Per-device counters.
#[derive(Debug, Default)]
pub struct DeviceStats {
    async_event: AtomicU64,
}

impl DeviceStats {
    /// Hardware async events handled so far.
    pub fn async_event(&self) -> u64 {
        self.async_event.load(Ordering::Relaxed)
    }
}

/// Ports exposed by a node, fixed at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortLayout {
    /// Switches are managed through port 0 only.
    Switch,
    /// Channel adapters number their ports from 1.
    ChannelAdapter { num_ports: u8 },
}

impl PortLayout {
    fn new(node_type: NodeType, phys_port_cnt: u8, device: &str) -> Self {
        match node_type {
            NodeType::Switch => Self::Switch,
            _ => {
                if phys_port_cnt > MAX_PORTS {
                    tracing::debug!(
                        device,
                        ports = phys_port_cnt,
                        max = MAX_PORTS,
                        "device has more ports than supported"
                    );
                }
                Self::ChannelAdapter {
                    num_ports: phys_port_cnt.min(MAX_PORTS),
                }
            }
        }
    }

    pub fn first_port(&self) -> u8 {
        match self {
            Self::Switch => 0,
            Self::ChannelAdapter { .. } => FIRST_CA_PORT,
        }
    }

    pub fn num_ports(&self) -> u8 {
        match self {
            Self::Switch => 1,
            Self::ChannelAdapter { num_ports } => *num_ports,
        }
    }

    pub fn contains(&self, port: u8) -> bool {
        let first = self.first_port();
        port >= first && u16::from(port) < u16::from(first) + u16::from(self.num_ports())
    }

    pub fn ports(&self) -> impl Iterator<Item = u8> {
        let first = self.first_port();
        (0..self.num_ports()).map(move |i| first + i)
    }
}

struct AsyncRegistration {
    event_loop: Arc<dyn EventLoop>,
    fd: RawFd,
    active: AtomicBool,
}

/// An opened RDMA device.
pub struct Device<V: Verbs> {
    verbs: V,
    config: DeviceConfig,
    catalog: Catalog,
    sysfs: SysfsReader,
    dev_attr: DeviceAttr,
    layout: PortLayout,
    ports: Vec<PortAttr>,
    pci_id: PciId,
    pci_bw: f64,
    sys_dev: SysDeviceId,
    numa_node: Option<u32>,
    local_cpus: CpuMask,
    ah_cache: AhCache<V::AddressHandle>,
    async_events: AsyncEventRegistry,
    stats: DeviceStats,
    async_registration: Option<AsyncRegistration>,
}

impl<V: Verbs> Device<V> {
    /// Query `verbs` and sysfs and build the descriptor.
    ///
    /// When `config.async_events` is set and an event loop is supplied, the
    /// device's async event descriptor is registered with it; the handler
    /// holds only a weak reference to the device.
    pub fn open(
        verbs: V,
        config: DeviceConfig,
        topology: &Topology,
        event_loop: Option<Arc<dyn EventLoop>>,
    ) -> Result<Arc<Self>> {
        let name = verbs.name().to_owned();
        let sysfs = config.sysfs();
        let local_cpus = sysfs.local_cpus(&name);
        let numa_node = sysfs.numa_node(&name);

        let dev_attr = verbs
            .query_device()
            .map_err(|e| IbError::io(format!("ibv_query_device({name})"), e))?;
        let layout = PortLayout::new(verbs.node_type(), dev_attr.phys_port_cnt, &name);

        let mut ports = Vec::with_capacity(usize::from(layout.num_ports()));
        for port in layout.ports() {
            let attr = verbs.query_port(port).map_err(|e| {
                tracing::error!(device = %name, port, error = %e, "ibv_query_port failed");
                IbError::io(format!("ibv_query_port({name}:{port})"), e)
            })?;
            ports.push(attr);
        }

        let pci_path = verbs
            .ibdev_path()
            .and_then(|path| sysfs::resolve_pci_path(&path));
        let sys_dev = pci_path
            .as_deref()
            .and_then(sysfs::bdf_name)
            .and_then(|bdf| topology.find_device_by_bdf_name(bdf))
            .unwrap_or(SysDeviceId::UNKNOWN);
        if sys_dev.is_unknown() {
            tracing::debug!(device = %name, "system device unknown");
        } else {
            topology.set_name(sys_dev, &name);
            tracing::debug!(device = %name, %sys_dev, "resolved system device");
        }
        let pci_id = sysfs::read_pci_id(pci_path.as_deref());
        let pci_bw = match &pci_path {
            Some(path) => PciBandwidthEstimator::default().estimate_from_sysfs(path),
            None => UNBOUNDED_BANDWIDTH,
        };
        if pci_bw == UNBOUNDED_BANDWIDTH {
            tracing::debug!(device = %name, "pci bandwidth undetected, using maximal value");
        }
        tracing::debug!(device = %name, %pci_id, "PCI identity");

        let async_registration = match (config.async_events, event_loop, verbs.async_fd()) {
            (true, Some(event_loop), Some(fd)) => Some(AsyncRegistration {
                event_loop,
                fd,
                active: AtomicBool::new(false),
            }),
            _ => None,
        };

        let catalog = config.catalog();
        let device = Arc::new(Self {
            verbs,
            config,
            catalog,
            sysfs,
            dev_attr,
            layout,
            ports,
            pci_id,
            pci_bw,
            sys_dev,
            numa_node,
            local_cpus,
            ah_cache: AhCache::new(),
            async_events: AsyncEventRegistry::new(),
            stats: DeviceStats::default(),
            async_registration,
        });

        if let Some(reg) = &device.async_registration {
            let weak: Weak<Self> = Arc::downgrade(&device);
            reg.event_loop
                .add_reader(
                    reg.fd,
                    Box::new(move || {
                        if let Some(device) = weak.upgrade() {
                            device.process_async_events();
                        }
                    }),
                )
                .map_err(|e| IbError::io("register async event handler", e))?;
            reg.active.store(true, Ordering::Release);
        }

        tracing::debug!(
            device = %device.name(),
            node_type = %device.verbs.node_type(),
            ports = device.layout.num_ports(),
            "initialized device"
        );
        Ok(device)
    }

    pub fn name(&self) -> &str {
        self.verbs.name()
    }

    pub fn verbs(&self) -> &V {
        &self.verbs
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn device_attr(&self) -> &DeviceAttr {
        &self.dev_attr
    }

    pub fn layout(&self) -> PortLayout {
        self.layout
    }

    pub fn first_port(&self) -> u8 {
        self.layout.first_port()
    }

    pub fn num_ports(&self) -> u8 {
        self.layout.num_ports()
    }

    pub fn pci_id(&self) -> PciId {
        self.pci_id
    }

    /// Effective PCIe bandwidth in bytes/sec, `f64::MAX` when unknown.
    pub fn pci_bw(&self) -> f64 {
        self.pci_bw
    }

    pub fn sys_dev(&self) -> SysDeviceId {
        self.sys_dev
    }

    pub fn numa_node(&self) -> Option<u32> {
        self.numa_node
    }

    pub fn local_cpus(&self) -> &CpuMask {
        &self.local_cpus
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    /// Set once a fatal device event has been seen. Never cleared.
    pub fn is_failed(&self) -> bool {
        self.async_events.is_failed()
    }

    pub fn spec(&self) -> &DeviceSpec {
        self.catalog.lookup(self.pci_id)
    }

    pub fn port_attr(&self, port: u8) -> Result<&PortAttr> {
        if !self.layout.contains(port) {
            return Err(IbError::NoDevice(format!("{}:{port}", self.name())));
        }
        Ok(&self.ports[usize::from(port - self.layout.first_port())])
    }

    /// Check that `port` can serve a transport needing `flags`.
    ///
    /// Structural checks run before the GID query, which runs before the
    /// subnet policy check. The first failure is returned.
    pub fn port_check(&self, port: u8, flags: DeviceFlags) -> Result<()> {
        let name = self.name();
        let attr = self.port_attr(port)?;

        if attr.gid_tbl_len == 0 {
            tracing::debug!(device = name, port, "port has no gid");
            return Err(IbError::unsupported(format!("{name}:{port} has no gid")));
        }
        if !attr.is_active() {
            tracing::trace!(device = name, port, state = ?attr.state, "port is not active");
            return Err(IbError::Unreachable {
                device: name.to_owned(),
                port,
            });
        }
        if self.verbs.transport_type() == TransportType::Iwarp {
            tracing::debug!(device = name, "iWarp device is not supported");
            return Err(IbError::unsupported(format!("iWarp device {name}")));
        }
        if flags.contains(DeviceFlags::LINK_IB) && !attr.is_ib() {
            tracing::debug!(device = name, port, "port is not IB link layer");
            return Err(IbError::unsupported(format!(
                "{name}:{port} is not IB link layer"
            )));
        }
        if flags.intersects(DeviceFlags::DC) && !self.dev_attr.has_dc {
            tracing::trace!(device = name, port, "DC is not supported");
            return Err(IbError::unsupported(format!("{name}:{port} does not support DC")));
        }

        let spec = self.spec();
        let required = flags & DeviceFlags::PRM;
        if !spec.flags.contains(required) {
            tracing::trace!(
                device = name,
                port,
                model = %spec.name,
                required = ?required,
                "device does not support required flags"
            );
            return Err(IbError::unsupported(format!(
                "{name}:{port} ({}) does not support {required:?}",
                spec.name
            )));
        }

        let gid = self.query_gid(port, self.config.effective_gid_index())?;
        if let Some(filter) = self.config.subnet_filter
            && attr.is_ib()
            && filter != gid.subnet_prefix()
        {
            tracing::trace!(device = name, port, "subnet prefix does not match");
            return Err(IbError::unsupported(format!(
                "{name}:{port} subnet prefix does not match"
            )));
        }
        Ok(())
    }

    /// Every port that passes [`Device::port_check`] for `flags`.
    pub fn query_ports(&self, flags: DeviceFlags) -> Result<Vec<PortResource>> {
        let mut resources = Vec::new();
        for port in self.layout.ports() {
            if let Err(e) = self.port_check(port, flags) {
                tracing::trace!(device = self.name(), port, ?flags, error = %e, "port skipped");
                continue;
            }
            resources.push(PortResource {
                name: format!("{}:{port}", self.name()),
                port,
                kind: ResourceKind::Network,
                sys_dev: self.sys_dev,
            });
        }
        if resources.is_empty() {
            tracing::debug!(device = self.name(), ?flags, "no compatible ports found");
            return Err(IbError::NoDevice(format!(
                "{}: no compatible ports",
                self.name()
            )));
        }
        Ok(resources)
    }

    /// Resolve a `"<device>:<port>"` resource name to a port number.
    pub fn find_port(&self, resource_name: &str) -> Result<u8> {
        let port = resource_name
            .rsplit_once(':')
            .filter(|(dev, _)| *dev == self.name())
            .and_then(|(_, port)| port.parse::<u8>().ok())
            .filter(|port| self.layout.contains(*port));
        port.ok_or_else(|| {
            tracing::error!(resource = resource_name, "failed to find port");
            IbError::NoDevice(resource_name.to_owned())
        })
    }

    /// Active MTU in bytes of the port named by `resource_name`.
    pub fn mtu(&self, resource_name: &str) -> Result<usize> {
        let port = self.find_port(resource_name)?;
        Ok(self.port_attr(port)?.active_mtu.bytes())
    }

    /// Read one GID table entry and decode its RoCE version and family.
    pub fn query_gid_info(&self, port: u8, index: u32) -> Result<GidInfo> {
        let name = self.name();
        let gid = self.verbs.query_gid(port, index).map_err(|e| {
            tracing::error!(device = name, port, index, error = %e, "ibv_query_gid failed");
            IbError::invalid_param(format!("ibv_query_gid({name}:{port} index {index}): {e}"))
        })?;

        let version = match self.sysfs.gid_type(name, port, index) {
            None => RoceVersion::V1,
            Some(raw) => parse_gid_type(&raw).ok_or_else(|| {
                let raw = raw.trim();
                tracing::error!(device = name, port, index, gid_type = raw, "failed to parse gid type");
                IbError::invalid_param(format!(
                    "gid type '{raw}' ({name}:{port} index {index})"
                ))
            })?,
        };
        Ok(GidInfo::new(gid, version, index))
    }

    /// GID at `index`. An all-zero entry is rejected.
    pub fn query_gid(&self, port: u8, index: u32) -> Result<Gid> {
        let info = self.query_gid_info(port, index)?;
        if info.gid.is_zero() {
            tracing::info!(device = self.name(), port, index, "invalid gid");
            return Err(IbError::InvalidAddr(format!(
                "gid[{index}] on {}:{port} is empty",
                self.name()
            )));
        }
        Ok(info.gid)
    }

    /// Liveness probe: create and immediately destroy an address handle
    /// sourced from `index` towards `gid`.
    pub fn test_roce_gid_index(&self, port: u8, gid: &Gid, index: u32) -> bool {
        let Ok(sgid_index) = u8::try_from(index) else {
            return false;
        };
        let attr = AhAttr {
            grh: GlobalRoute {
                dgid: *gid,
                flow_label: 1,
                sgid_index,
                hop_limit: 255,
                traffic_class: 0,
            },
            dlid: ROCE_UDP_SRC_PORT_BASE,
            is_global: true,
            port_num: port,
            ..Default::default()
        };
        match self.verbs.create_ah(&attr) {
            Ok(ah) => {
                self.verbs.destroy_ah(ah);
                true
            }
            Err(e) => {
                tracing::trace!(device = self.name(), port, index, error = %e, "gid entry is not operational");
                false
            }
        }
    }

    fn roce_port(&self, port: u8) -> Result<&PortAttr> {
        let attr = self.port_attr(port)?;
        if !attr.is_roce() {
            return Err(IbError::unsupported(format!(
                "{}:{port} is not a RoCE port",
                self.name()
            )));
        }
        Ok(attr)
    }

    /// Pick the best operational GID on a RoCE port. See [`gid::select_gid`].
    pub fn select_gid(&self, port: u8) -> Result<GidInfo> {
        let attr = self.roce_port(port)?;
        let info = gid::select_gid(
            attr.gid_tbl_len,
            |index| self.query_gid_info(port, index),
            |info| self.test_roce_gid_index(port, &info.gid, info.index),
        )?;
        tracing::debug!(
            device = self.name(),
            port,
            gid_index = info.index,
            roce = %info.roce_version,
            family = %info.addr_family,
            "using gid"
        );
        Ok(info)
    }

    /// Network interface backing a RoCE GID entry.
    pub fn roce_ndev_name(&self, port: u8, gid_index: u32) -> Result<String> {
        self.roce_port(port)?;
        self.sysfs
            .gid_ndev(self.name(), port, gid_index)
            .map_err(|e| {
                tracing::info!(device = self.name(), port, gid_index, error = %e, "failed to read gid ndev");
                IbError::NoDevice(format!("{}:{port} gid {gid_index} has no netdev", self.name()))
            })
    }

    /// Number of bonded links behind a RoCE GID entry, 1 if not bonded.
    pub fn roce_lag_level(&self, port: u8, gid_index: u32) -> u32 {
        let Ok(ndev) = self.roce_ndev_name(port, gid_index) else {
            return 1;
        };
        let level = self.sysfs.bond_ad_num_ports(&ndev);
        tracing::debug!(device = self.name(), port, ndev = %ndev, level, "RoCE LAG level");
        level
    }

    /// Cached address handle for `attr`, created on first use.
    pub fn create_ah_cached(&self, attr: &AhAttr, usage: &str) -> Result<V::AddressHandle> {
        self.ah_cache
            .get_or_create(attr, |attr| self.verbs.create_ah(attr))
            .inspect_err(|e| {
                tracing::error!(device = self.name(), usage, ah_attr = %attr, error = %e, "create_ah failed");
            })
    }

    pub fn ah_cache(&self) -> &AhCache<V::AddressHandle> {
        &self.ah_cache
    }

    /// Destroy every cached address handle. None may be in use.
    pub fn cleanup_ah_cached(&self) -> usize {
        self.ah_cache.cleanup_all(|ah| self.verbs.destroy_ah(ah))
    }

    /// Apply ECE `options` to `qp`, which must belong to this device.
    pub fn set_ece<Q: AdminQp + ?Sized>(&self, qp: &Q, options: u32) -> Result<()> {
        verbs::set_ece(qp, options).inspect_err(|e| {
            tracing::debug!(device = self.name(), qpn = qp.qp_num(), error = %e, "set_ece failed");
        })
    }

    pub fn async_event_register(&self, event_type: AsyncEventType, resource_id: u32) -> Result<()> {
        self.async_events
            .register(AsyncEventKey::new(event_type, resource_id))
    }

    pub fn async_event_wait(
        &self,
        event_type: AsyncEventType,
        resource_id: u32,
        ctx: &Arc<WaitContext>,
    ) -> Result<()> {
        self.async_events
            .wait(AsyncEventKey::new(event_type, resource_id), ctx)
    }

    pub fn async_event_unregister(&self, event_type: AsyncEventType, resource_id: u32) {
        self.async_events
            .unregister(AsyncEventKey::new(event_type, resource_id));
    }

    pub fn async_events(&self) -> &AsyncEventRegistry {
        &self.async_events
    }

    /// Log one hardware event, update the registry, and count it.
    pub fn handle_async_event(&self, event: &HwAsyncEvent) {
        match event.event_type {
            AsyncEventType::QpLastWqeReached => self.async_events.dispatch(event.key()),
            AsyncEventType::DeviceFatal => self.async_events.dispatch_fatal(),
            _ => {}
        }

        self.stats.async_event.fetch_add(1, Ordering::Relaxed);
        let device = self.name();
        match event.event_type.severity() {
            EventSeverity::Error => tracing::error!(device, "IB async event: {event}"),
            EventSeverity::Warn => tracing::warn!(device, "IB async event: {event}"),
            EventSeverity::Diag | EventSeverity::Info => {
                tracing::info!(device, "IB async event: {event}")
            }
            EventSeverity::Debug => tracing::debug!(device, "IB async event: {event}"),
        }
    }

    /// Drain pending hardware events. Called by the event loop on readiness.
    pub fn process_async_events(&self) -> usize {
        let mut handled = 0;
        loop {
            match self.verbs.get_async_event() {
                Ok(Some(event)) => {
                    self.handle_async_event(&event);
                    handled += 1;
                }
                Ok(None) => break,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(device = self.name(), error = %e, "ibv_get_async_event failed");
                    break;
                }
            }
        }
        handled
    }
}

impl<V: Verbs> Drop for Device<V> {
    fn drop(&mut self) {
        tracing::debug!(device = self.name(), "destroying device");
        if !self.async_events.is_empty() {
            tracing::warn!(
                device = self.name(),
                remaining = self.async_events.len(),
                "async event registry not empty"
            );
        }
        if let Some(reg) = &self.async_registration
            && reg.active.load(Ordering::Acquire)
        {
            reg.event_loop.remove_reader(reg.fd);
        }
        self.cleanup_ah_cached();
    }
}

impl<V: Verbs> fmt::Debug for Device<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name())
            .field("layout", &self.layout)
            .field("pci_id", &self.pci_id)
            .field("sys_dev", &self.sys_dev)
            .field("numa_node", &self.numa_node)
            .field("failed", &self.is_failed())
            .finish_non_exhaustive()
    }
}
