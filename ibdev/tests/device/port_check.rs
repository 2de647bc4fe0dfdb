use super::helpers::*;
use ibdev::{
    Device, DeviceConfig, DeviceFlags, DeviceSpec, Gid, IbError, LinkLayer, PciId, PortState,
    ResourceKind, Topology, TransportType,
};

fn open(verbs: FakeVerbs, config: DeviceConfig) -> std::sync::Arc<Device<FakeVerbs>> {
    Device::open(verbs, config, &Topology::new(), None).unwrap()
}

#[test]
fn test_healthy_ib_port_passes() {
    let fixture = SysfsFixture::new();
    let dev = open(FakeVerbs::ib("mlx5_0"), fixture.config());
    dev.port_check(1, DeviceFlags::empty()).unwrap();
    dev.port_check(1, DeviceFlags::LINK_IB).unwrap();
}

#[test]
fn test_out_of_range_is_no_device() {
    let fixture = SysfsFixture::new();
    let dev = open(FakeVerbs::ib("mlx5_0"), fixture.config());
    assert!(matches!(
        dev.port_check(0, DeviceFlags::empty()),
        Err(IbError::NoDevice(_))
    ));
    assert!(matches!(
        dev.port_check(2, DeviceFlags::empty()),
        Err(IbError::NoDevice(_))
    ));
}

#[test]
fn test_empty_gid_table_precedes_inactive_state() {
    let fixture = SysfsFixture::new();
    let mut verbs = FakeVerbs::ib("mlx5_0");
    let port = verbs.ports.get_mut(&1).unwrap();
    port.gid_tbl_len = 0;
    port.state = PortState::Down;
    let dev = open(verbs, fixture.config());
    assert!(matches!(
        dev.port_check(1, DeviceFlags::empty()),
        Err(IbError::Unsupported(_))
    ));
}

#[test]
fn test_inactive_port_is_unreachable() {
    let fixture = SysfsFixture::new();
    let mut verbs = FakeVerbs::ib("mlx5_0");
    verbs.ports.get_mut(&1).unwrap().state = PortState::Init;
    // Also iWARP: the state check must win.
    verbs.transport = TransportType::Iwarp;
    let dev = open(verbs, fixture.config());
    let err = dev.port_check(1, DeviceFlags::empty()).unwrap_err();
    assert_eq!(err.to_string(), "mlx5_0:1 is not active");
}

#[test]
fn test_iwarp_is_unsupported() {
    let fixture = SysfsFixture::new();
    let mut verbs = FakeVerbs::ib("iwp0");
    verbs.transport = TransportType::Iwarp;
    let dev = open(verbs, fixture.config());
    assert!(matches!(
        dev.port_check(1, DeviceFlags::empty()),
        Err(IbError::Unsupported(_))
    ));
}

#[test]
fn test_link_ib_requirement_on_roce_port() {
    let fixture = SysfsFixture::new();
    let dev = open(
        FakeVerbs::roce("mlx5_1", &[gid("::ffff:10.0.0.1")]),
        fixture.config(),
    );
    dev.port_check(1, DeviceFlags::empty()).unwrap();
    assert!(matches!(
        dev.port_check(1, DeviceFlags::LINK_IB),
        Err(IbError::Unsupported(_))
    ));
}

#[test]
fn test_dc_requires_hardware_support() {
    let fixture = SysfsFixture::new();
    let dev = open(FakeVerbs::ib("mlx5_0"), fixture.config());
    assert!(matches!(
        dev.port_check(1, DeviceFlags::DC_V2),
        Err(IbError::Unsupported(_))
    ));

    let mut verbs = FakeVerbs::ib("mlx5_0");
    verbs.dev_attr.has_dc = true;
    let dev = open(verbs, fixture.config());
    dev.port_check(1, DeviceFlags::DC).unwrap();
}

#[test]
fn test_prm_flags_come_from_catalog() {
    let fixture = SysfsFixture::new();
    // Unknown PCI id resolves to the generic spec, which has no PRM flags.
    let dev = open(FakeVerbs::ib("mlx5_0"), fixture.config());
    assert!(matches!(
        dev.port_check(1, DeviceFlags::MLX5_PRM),
        Err(IbError::Unsupported(_))
    ));

    // A custom entry for PCI id 0:0 grants them.
    let config = DeviceConfig {
        custom_devices: vec![DeviceSpec::custom(
            "lab card",
            PciId::new(0, 0),
            DeviceFlags::MLX5_PRM,
            1,
        )],
        ..fixture.config()
    };
    let dev = open(FakeVerbs::ib("mlx5_0"), config);
    dev.port_check(1, DeviceFlags::MLX5_PRM).unwrap();
    assert!(dev.port_check(1, DeviceFlags::PRM).is_err());
}

#[test]
fn test_zero_gid_is_invalid_addr() {
    let fixture = SysfsFixture::new();
    let mut verbs = FakeVerbs::ib("mlx5_0");
    verbs.gids.insert((1, 0), Gid::ZERO);
    let dev = open(verbs, fixture.config());
    assert!(matches!(
        dev.port_check(1, DeviceFlags::empty()),
        Err(IbError::InvalidAddr(_))
    ));
}

#[test]
fn test_configured_gid_index_is_queried() {
    let fixture = SysfsFixture::new();
    let config = DeviceConfig {
        gid_index: Some(5),
        ..fixture.config()
    };
    let dev = open(FakeVerbs::ib("mlx5_0"), config);
    // Index 5 does not exist in the fake table.
    assert!(matches!(
        dev.port_check(1, DeviceFlags::empty()),
        Err(IbError::InvalidParam(_))
    ));
}

#[test]
fn test_subnet_filter_applies_to_ib_only() {
    let fixture = SysfsFixture::new();
    let config = DeviceConfig {
        subnet_filter: Some(0xfec0_0000_0000_0000),
        ..fixture.config()
    };
    let dev = open(FakeVerbs::ib("mlx5_0"), config.clone());
    assert!(matches!(
        dev.port_check(1, DeviceFlags::empty()),
        Err(IbError::Unsupported(_))
    ));

    let matching = DeviceConfig {
        subnet_filter: Some(0xfe80_0000_0000_0000),
        ..fixture.config()
    };
    let dev = open(FakeVerbs::ib("mlx5_0"), matching);
    dev.port_check(1, DeviceFlags::empty()).unwrap();

    let dev = open(FakeVerbs::roce("mlx5_1", &[gid("::ffff:10.0.0.1")]), config);
    dev.port_check(1, DeviceFlags::empty()).unwrap();
}

#[test]
fn test_query_ports_filters_and_tags() {
    let fixture = SysfsFixture::new();
    let mut verbs = FakeVerbs::ib("mlx5_0");
    verbs.dev_attr.phys_port_cnt = 2;
    let mut down = active_port(LinkLayer::InfiniBand, 1);
    down.state = PortState::Down;
    verbs.ports.insert(2, down);
    let dev = open(verbs, fixture.config());

    let resources = dev.query_ports(DeviceFlags::empty()).unwrap();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].name, "mlx5_0:1");
    assert_eq!(resources[0].port, 1);
    assert_eq!(resources[0].kind, ResourceKind::Network);
    assert_eq!(resources[0].sys_dev, dev.sys_dev());

    assert!(matches!(
        dev.query_ports(DeviceFlags::MLX4_PRM),
        Err(IbError::NoDevice(_))
    ));
}
