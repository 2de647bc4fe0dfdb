use super::helpers::*;
use ibdev::{
    Device, DeviceConfig, EventLoop, IbError, LinkLayer, NodeType, PciId, SysDeviceId, Topology,
    UNBOUNDED_BANDWIDTH,
};
use std::sync::Arc;

#[test]
fn test_open_without_sysfs_uses_defaults() {
    let fixture = SysfsFixture::new();
    let verbs = FakeVerbs::ib("mlx5_0");
    let dev = Device::open(verbs, fixture.config(), &Topology::new(), None).unwrap();

    assert_eq!(dev.name(), "mlx5_0");
    assert_eq!(dev.first_port(), 1);
    assert_eq!(dev.num_ports(), 1);
    assert_eq!(dev.pci_bw(), UNBOUNDED_BANDWIDTH);
    assert_eq!(dev.sys_dev(), SysDeviceId::UNKNOWN);
    assert_eq!(dev.pci_id(), PciId::default());
    assert_eq!(dev.numa_node(), None);
    assert_eq!(dev.local_cpus().count(), ibdev::sysfs::CPU_SETSIZE);
    assert!(dev.spec().is_generic());
    assert!(!dev.is_failed());
}

#[test]
fn test_open_reads_pci_and_locality() {
    let fixture = SysfsFixture::new();
    let ibdev_path = fixture.pci_device(
        "mlx5_0",
        "0000:3b:00.0",
        "0x15b3\n",
        "0x101b\n",
        Some(("16\n", "8.0 GT/s PCIe\n")),
    );
    fixture.locality("mlx5_0", "00000000,ffff0000\n", "0\n");

    let mut verbs = FakeVerbs::ib("mlx5_0");
    verbs.ibdev_path = Some(ibdev_path);
    let topology = Topology::new();
    let dev = Device::open(verbs, fixture.config(), &topology, None).unwrap();

    assert_eq!(dev.pci_id(), PciId::new(0x15b3, 0x101b));
    assert_eq!(dev.spec().name, "ConnectX-6");
    let bw = dev.pci_bw();
    assert!(bw.is_finite() && bw < 16.0e9);
    assert!(!dev.sys_dev().is_unknown());
    assert_eq!(topology.name(dev.sys_dev()).as_deref(), Some("mlx5_0"));
    assert_eq!(dev.numa_node(), Some(0));
    assert_eq!(dev.local_cpus().count(), 16);
    assert!(dev.local_cpus().contains(16));
}

#[test]
fn test_ca_ports_are_capped() {
    let fixture = SysfsFixture::new();
    let mut verbs = FakeVerbs::ib("mlx5_0");
    verbs.dev_attr.phys_port_cnt = 4;
    verbs.ports.insert(2, active_port(LinkLayer::InfiniBand, 1));
    let dev = Device::open(verbs, fixture.config(), &Topology::new(), None).unwrap();
    assert_eq!(dev.first_port(), 1);
    assert_eq!(dev.num_ports(), 2);
    assert!(dev.port_attr(2).is_ok());
    assert!(matches!(dev.port_attr(3), Err(IbError::NoDevice(_))));
}

#[test]
fn test_switch_exposes_port_zero() {
    let fixture = SysfsFixture::new();
    let mut verbs = FakeVerbs::new("switch0");
    verbs.node_type = NodeType::Switch;
    verbs.dev_attr.phys_port_cnt = 36;
    verbs.ports.insert(0, active_port(LinkLayer::InfiniBand, 1));
    let dev = Device::open(verbs, fixture.config(), &Topology::new(), None).unwrap();
    assert_eq!(dev.first_port(), 0);
    assert_eq!(dev.num_ports(), 1);
    assert!(matches!(dev.port_attr(1), Err(IbError::NoDevice(_))));
}

#[test]
fn test_port_query_failure_is_io() {
    let fixture = SysfsFixture::new();
    let mut verbs = FakeVerbs::ib("mlx5_0");
    verbs.dev_attr.phys_port_cnt = 2;
    let err = Device::open(verbs, fixture.config(), &Topology::new(), None).unwrap_err();
    assert!(matches!(err, IbError::Io { .. }));
}

#[test]
fn test_find_port_and_mtu() {
    let fixture = SysfsFixture::new();
    let dev = Device::open(FakeVerbs::ib("mlx5_0"), fixture.config(), &Topology::new(), None)
        .unwrap();

    assert_eq!(dev.find_port("mlx5_0:1").unwrap(), 1);
    assert_eq!(dev.mtu("mlx5_0:1").unwrap(), 4096);
    for bad in ["mlx5_0:2", "mlx5_1:1", "mlx5_0", "mlx5_0:x", "mlx5:0:1", "mlx5_0:1 "] {
        assert!(
            matches!(dev.find_port(bad), Err(IbError::NoDevice(_))),
            "{bad} should not resolve"
        );
    }
}

#[test]
fn test_async_fd_registration_lifecycle() {
    let fixture = SysfsFixture::new();
    let event_loop = Arc::new(ManualEventLoop::default());
    let mut verbs = FakeVerbs::ib("mlx5_0");
    verbs.async_fd = Some(42);

    let dev = Device::open(
        verbs,
        fixture.config(),
        &Topology::new(),
        Some(event_loop.clone() as Arc<dyn EventLoop>),
    )
    .unwrap();
    assert!(event_loop.is_watching(42));

    dev.verbs().push_event(ibdev::HwAsyncEvent::new(
        ibdev::AsyncEventType::PortActive,
        ibdev::EventElement::Port(1),
    ));
    assert!(event_loop.fire(42));
    assert_eq!(dev.stats().async_event(), 1);

    drop(dev);
    assert!(!event_loop.is_watching(42));
    assert_eq!(*event_loop.removed.lock().unwrap(), vec![42]);
}

#[test]
fn test_async_events_disabled_skips_registration() {
    let fixture = SysfsFixture::new();
    let event_loop = Arc::new(ManualEventLoop::default());
    let mut verbs = FakeVerbs::ib("mlx5_0");
    verbs.async_fd = Some(7);
    let config = DeviceConfig {
        async_events: false,
        ..fixture.config()
    };
    let dev = Device::open(
        verbs,
        config,
        &Topology::new(),
        Some(event_loop.clone() as Arc<dyn EventLoop>),
    )
    .unwrap();
    assert!(!event_loop.is_watching(7));
    drop(dev);
    assert!(event_loop.removed.lock().unwrap().is_empty());
}
