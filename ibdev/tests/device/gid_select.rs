use super::helpers::*;
use ibdev::{AddrFamily, Device, GidInfo, IbError, RoceVersion, Topology};
use std::sync::Arc;

fn roce_device(fixture: &SysfsFixture, verbs: FakeVerbs) -> Arc<Device<FakeVerbs>> {
    Device::open(verbs, fixture.config(), &Topology::new(), None).unwrap()
}

#[test]
fn test_v2_ipv4_wins_over_lower_tiers() {
    let fixture = SysfsFixture::new();
    let gids = [
        gid("fe80::268a:7ff:fe4e:1234"),
        gid("::ffff:192.168.10.7"),
        gid("::ffff:192.168.10.7"),
        gid("fe80::268a:7ff:fe4e:1234"),
    ];
    fixture.gid_type("mlx5_1", 1, 0, "IB/RoCE v1\n");
    fixture.gid_type("mlx5_1", 1, 1, "IB/RoCE v1\n");
    fixture.gid_type("mlx5_1", 1, 2, "RoCE v2\n");
    fixture.gid_type("mlx5_1", 1, 3, "RoCE v2\n");
    let dev = roce_device(&fixture, FakeVerbs::roce("mlx5_1", &gids));

    let info = dev.select_gid(1).unwrap();
    assert_eq!(info.index, 2);
    assert_eq!(info.roce_version, RoceVersion::V2);
    assert_eq!(info.addr_family, AddrFamily::Ipv4);
    // The winning probe created and destroyed exactly one handle.
    assert_eq!(dev.verbs().created(), 1);
    assert_eq!(dev.verbs().ah_destroyed.lock().unwrap().len(), 1);
}

#[test]
fn test_dead_entry_falls_through_to_next_tier() {
    let fixture = SysfsFixture::new();
    let gids = [gid("::ffff:10.1.1.1"), gid("fe80::1")];
    fixture.gid_type("mlx5_1", 1, 0, "RoCE v2\n");
    fixture.gid_type("mlx5_1", 1, 1, "RoCE v2\n");
    let mut verbs = FakeVerbs::roce("mlx5_1", &gids);
    verbs.dead_gid_indices.insert(0);
    let dev = roce_device(&fixture, verbs);

    let info = dev.select_gid(1).unwrap();
    assert_eq!(info.index, 1);
    assert_eq!(info.roce_version, RoceVersion::V2);
    assert_eq!(info.addr_family, AddrFamily::Ipv6);
}

#[test]
fn test_missing_type_file_means_v1() {
    let fixture = SysfsFixture::new();
    let dev = roce_device(&fixture, FakeVerbs::roce("mlx5_1", &[gid("::ffff:10.1.1.1")]));
    let info = dev.query_gid_info(1, 0).unwrap();
    assert_eq!(info.roce_version, RoceVersion::V1);
    assert_eq!(dev.select_gid(1).unwrap().index, 0);
}

#[test]
fn test_nothing_operational_falls_back_to_default() {
    let fixture = SysfsFixture::new();
    let gids = [gid("fe80::1"), gid("fe80::2")];
    fixture.gid_type("mlx5_1", 1, 0, "RoCE v2\n");
    fixture.gid_type("mlx5_1", 1, 1, "RoCE v2\n");
    let mut verbs = FakeVerbs::roce("mlx5_1", &gids);
    verbs.dead_gid_indices.extend([0, 1]);
    let dev = roce_device(&fixture, verbs);

    assert_eq!(dev.select_gid(1).unwrap(), GidInfo::fallback());
    assert_eq!(dev.verbs().created(), 0);
}

#[test]
fn test_unparseable_type_aborts_search() {
    let fixture = SysfsFixture::new();
    let gids = [gid("::ffff:10.1.1.1"), gid("::ffff:10.1.1.2")];
    fixture.gid_type("mlx5_1", 1, 0, "IB/RoCE v1\n");
    fixture.gid_type("mlx5_1", 1, 1, "RoCE v9\n");
    let dev = roce_device(&fixture, FakeVerbs::roce("mlx5_1", &gids));
    assert!(matches!(dev.select_gid(1), Err(IbError::InvalidParam(_))));
}

#[test]
fn test_select_gid_rejects_ib_port() {
    let fixture = SysfsFixture::new();
    let dev = roce_device(&fixture, FakeVerbs::ib("mlx5_0"));
    assert!(matches!(dev.select_gid(1), Err(IbError::Unsupported(_))));
}

#[test]
fn test_roce_ndev_and_lag_level() {
    let fixture = SysfsFixture::new();
    fixture.gid_ndev("mlx5_bond_0", 1, 3, "bond0\n");
    fixture.bond("bond0", 2);
    let dev = roce_device(
        &fixture,
        FakeVerbs::roce("mlx5_bond_0", &[gid("::ffff:10.1.1.1")]),
    );

    assert_eq!(dev.roce_ndev_name(1, 3).unwrap(), "bond0");
    assert_eq!(dev.roce_lag_level(1, 3), 2);
    assert!(matches!(
        dev.roce_ndev_name(1, 0),
        Err(IbError::NoDevice(_))
    ));
    assert_eq!(dev.roce_lag_level(1, 0), 1);
}
