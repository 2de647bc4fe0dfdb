use ibdev::{
    AhAttr, DeviceAttr, DeviceConfig, EventLoop, Gid, HwAsyncEvent, LinkLayer, Mtu, NodeType,
    PortAttr, PortState, TransportType, Verbs,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::Ipv6Addr;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tempfile::TempDir;

pub fn gid(s: &str) -> Gid {
    s.parse::<Ipv6Addr>().unwrap().into()
}

pub fn active_port(link_layer: LinkLayer, gid_tbl_len: u32) -> PortAttr {
    PortAttr {
        state: PortState::Active,
        link_layer,
        gid_tbl_len,
        active_mtu: Mtu::Mtu4096,
        lid: 1,
    }
}

/// In-memory verbs backend.
pub struct FakeVerbs {
    pub name: String,
    pub node_type: NodeType,
    pub transport: TransportType,
    pub dev_attr: DeviceAttr,
    pub ports: HashMap<u8, PortAttr>,
    pub gids: HashMap<(u8, u32), Gid>,
    pub ibdev_path: Option<PathBuf>,
    pub async_fd: Option<RawFd>,
    /// GID indices whose liveness probe fails.
    pub dead_gid_indices: HashSet<u8>,
    /// errno returned by every `create_ah`.
    pub ah_errno: Option<i32>,
    pub ah_delay: Option<Duration>,
    pub events: Mutex<VecDeque<io::Result<Option<HwAsyncEvent>>>>,
    next_ah: AtomicU64,
    pub ah_created: AtomicU64,
    pub ah_destroyed: Mutex<Vec<u64>>,
}

impl FakeVerbs {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            node_type: NodeType::Ca,
            transport: TransportType::Ib,
            dev_attr: DeviceAttr {
                fw_ver: "20.31.1014".into(),
                phys_port_cnt: 1,
                has_dc: false,
            },
            ports: HashMap::new(),
            gids: HashMap::new(),
            ibdev_path: None,
            async_fd: None,
            dead_gid_indices: HashSet::new(),
            ah_errno: None,
            ah_delay: None,
            events: Mutex::new(VecDeque::new()),
            next_ah: AtomicU64::new(1),
            ah_created: AtomicU64::new(0),
            ah_destroyed: Mutex::new(Vec::new()),
        }
    }

    /// One active RoCE port with `gids` at indices 0.. on port 1.
    pub fn roce(name: &str, gids: &[Gid]) -> Self {
        let mut verbs = Self::new(name);
        verbs
            .ports
            .insert(1, active_port(LinkLayer::Ethernet, gids.len() as u32));
        for (i, g) in gids.iter().enumerate() {
            verbs.gids.insert((1, i as u32), *g);
        }
        verbs
    }

    /// One active InfiniBand port with a single link-local GID.
    pub fn ib(name: &str) -> Self {
        let mut verbs = Self::new(name);
        verbs.ports.insert(1, active_port(LinkLayer::InfiniBand, 1));
        verbs
            .gids
            .insert((1, 0), gid("fe80::2:c903:a:1b2c"));
        verbs
    }

    pub fn push_event(&self, event: HwAsyncEvent) {
        self.events.lock().unwrap().push_back(Ok(Some(event)));
    }

    pub fn push_error(&self, err: io::Error) {
        self.events.lock().unwrap().push_back(Err(err));
    }

    pub fn created(&self) -> u64 {
        self.ah_created.load(Ordering::SeqCst)
    }
}

impl Verbs for FakeVerbs {
    type AddressHandle = u64;

    fn name(&self) -> &str {
        &self.name
    }

    fn node_type(&self) -> NodeType {
        self.node_type
    }

    fn transport_type(&self) -> TransportType {
        self.transport
    }

    fn ibdev_path(&self) -> Option<PathBuf> {
        self.ibdev_path.clone()
    }

    fn query_device(&self) -> io::Result<DeviceAttr> {
        Ok(self.dev_attr.clone())
    }

    fn query_port(&self, port: u8) -> io::Result<PortAttr> {
        self.ports
            .get(&port)
            .copied()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
    }

    fn query_gid(&self, port: u8, index: u32) -> io::Result<Gid> {
        self.gids
            .get(&(port, index))
            .copied()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
    }

    fn create_ah(&self, attr: &AhAttr) -> io::Result<u64> {
        if let Some(delay) = self.ah_delay {
            std::thread::sleep(delay);
        }
        if let Some(errno) = self.ah_errno {
            return Err(io::Error::from_raw_os_error(errno));
        }
        if attr.is_global && self.dead_gid_indices.contains(&attr.grh.sgid_index) {
            return Err(io::Error::from_raw_os_error(libc::ENODATA));
        }
        self.ah_created.fetch_add(1, Ordering::SeqCst);
        Ok(self.next_ah.fetch_add(1, Ordering::SeqCst))
    }

    fn destroy_ah(&self, ah: u64) {
        self.ah_destroyed.lock().unwrap().push(ah);
    }

    fn async_fd(&self) -> Option<RawFd> {
        self.async_fd
    }

    fn get_async_event(&self) -> io::Result<Option<HwAsyncEvent>> {
        self.events.lock().unwrap().pop_front().unwrap_or(Ok(None))
    }
}

/// Event loop that runs handlers only when told to.
#[derive(Default)]
pub struct ManualEventLoop {
    handlers: Mutex<HashMap<RawFd, ibdev::verbs::ReadyHandler>>,
    pub removed: Mutex<Vec<RawFd>>,
}

impl ManualEventLoop {
    pub fn fire(&self, fd: RawFd) -> bool {
        let handlers = self.handlers.lock().unwrap();
        match handlers.get(&fd) {
            Some(handler) => {
                handler();
                true
            }
            None => false,
        }
    }

    pub fn is_watching(&self, fd: RawFd) -> bool {
        self.handlers.lock().unwrap().contains_key(&fd)
    }
}

impl EventLoop for ManualEventLoop {
    fn add_reader(&self, fd: RawFd, handler: ibdev::verbs::ReadyHandler) -> io::Result<()> {
        self.handlers.lock().unwrap().insert(fd, handler);
        Ok(())
    }

    fn remove_reader(&self, fd: RawFd) {
        self.handlers.lock().unwrap().remove(&fd);
        self.removed.lock().unwrap().push(fd);
    }
}

/// Temporary sysfs tree.
pub struct SysfsFixture {
    pub dir: TempDir,
}

impl SysfsFixture {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn config(&self) -> DeviceConfig {
        DeviceConfig {
            sysfs_root: self.root().to_path_buf(),
            ..Default::default()
        }
    }

    fn write(&self, rel: impl AsRef<Path>, contents: &str) {
        let path = self.root().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    pub fn gid_type(&self, dev: &str, port: u8, index: u32, value: &str) {
        self.write(
            format!("class/infiniband/{dev}/ports/{port}/gid_attrs/types/{index}"),
            value,
        );
    }

    pub fn gid_ndev(&self, dev: &str, port: u8, index: u32, value: &str) {
        self.write(
            format!("class/infiniband/{dev}/ports/{port}/gid_attrs/ndevs/{index}"),
            value,
        );
    }

    pub fn bond(&self, ndev: &str, ports: u32) {
        self.write(
            format!("class/net/{ndev}/bonding/ad_num_ports"),
            &format!("{ports}\n"),
        );
    }

    pub fn locality(&self, dev: &str, local_cpus: &str, numa_node: &str) {
        self.write(format!("class/infiniband/{dev}/device/local_cpus"), local_cpus);
        self.write(format!("class/infiniband/{dev}/device/numa_node"), numa_node);
    }

    /// Create a PCI function directory for `dev` and return its `ibdev_path`.
    pub fn pci_device(
        &self,
        dev: &str,
        bdf: &str,
        vendor: &str,
        device: &str,
        link: Option<(&str, &str)>,
    ) -> PathBuf {
        let pci = format!("devices/pci0000:00/{bdf}");
        self.write(format!("{pci}/vendor"), vendor);
        self.write(format!("{pci}/device"), device);
        if let Some((width, speed)) = link {
            self.write(format!("{pci}/current_link_width"), width);
            self.write(format!("{pci}/current_link_speed"), speed);
        }
        let ibdev = self.root().join(format!("{pci}/infiniband/{dev}"));
        std::fs::create_dir_all(&ibdev).unwrap();
        ibdev
    }
}
