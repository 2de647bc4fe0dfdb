use super::helpers::*;
use ibdev::{AhAttr, Device, GlobalRoute, IbError, Topology};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn attr(dlid: u16) -> AhAttr {
    AhAttr {
        dlid,
        sl: 0,
        port_num: 1,
        ..Default::default()
    }
}

#[test]
fn test_concurrent_identical_requests_create_once() {
    let fixture = SysfsFixture::new();
    let mut verbs = FakeVerbs::ib("mlx5_0");
    verbs.ah_delay = Some(Duration::from_millis(20));
    let dev = Device::open(verbs, fixture.config(), &Topology::new(), None).unwrap();

    const N: usize = 8;
    let barrier = Arc::new(Barrier::new(N));
    let handles: Vec<_> = (0..N)
        .map(|_| {
            let dev = Arc::clone(&dev);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                dev.create_ah_cached(&attr(7), "test").unwrap()
            })
        })
        .collect();
    let results: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(dev.verbs().created(), 1);
    assert!(results.iter().all(|&ah| ah == results[0]));
    assert_eq!(dev.ah_cache().len(), 1);
}

#[test]
fn test_distinct_attrs_get_distinct_handles() {
    let fixture = SysfsFixture::new();
    let dev = Device::open(FakeVerbs::ib("mlx5_0"), fixture.config(), &Topology::new(), None)
        .unwrap();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let dev = Arc::clone(&dev);
            thread::spawn(move || dev.create_ah_cached(&attr(i), "test").unwrap())
        })
        .collect();
    let ahs: HashSet<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(ahs.len(), 4);

    let global = AhAttr {
        grh: GlobalRoute {
            dgid: gid("fe80::1"),
            hop_limit: 64,
            ..Default::default()
        },
        is_global: true,
        ..attr(0)
    };
    let g = dev.create_ah_cached(&global, "test").unwrap();
    assert!(!ahs.contains(&g));
    assert_eq!(dev.create_ah_cached(&attr(0), "test").unwrap(), dev.ah_cache().get(&attr(0)).unwrap());
    assert_eq!(dev.verbs().created(), 5);
}

#[test]
fn test_creation_errors_are_classified_and_not_cached() {
    let fixture = SysfsFixture::new();
    let mut verbs = FakeVerbs::ib("mlx5_0");
    verbs.ah_errno = Some(libc::ETIMEDOUT);
    let dev = Device::open(verbs, fixture.config(), &Topology::new(), None).unwrap();
    assert!(matches!(
        dev.create_ah_cached(&attr(1), "test"),
        Err(IbError::EndpointTimeout(_))
    ));
    assert!(dev.ah_cache().is_empty());

    let mut verbs = FakeVerbs::ib("mlx5_0");
    verbs.ah_errno = Some(libc::EHOSTUNREACH);
    let dev = Device::open(verbs, fixture.config(), &Topology::new(), None).unwrap();
    assert!(matches!(
        dev.create_ah_cached(&attr(1), "test"),
        Err(IbError::InvalidAddr(_))
    ));
}

#[test]
fn test_cleanup_destroys_cached_handles() {
    let fixture = SysfsFixture::new();
    let dev = Device::open(FakeVerbs::ib("mlx5_0"), fixture.config(), &Topology::new(), None)
        .unwrap();
    let a = dev.create_ah_cached(&attr(1), "test").unwrap();
    let b = dev.create_ah_cached(&attr(2), "test").unwrap();

    assert_eq!(dev.cleanup_ah_cached(), 2);
    let mut destroyed = dev.verbs().ah_destroyed.lock().unwrap().clone();
    destroyed.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(destroyed, expected);
    assert!(dev.ah_cache().is_empty());
}
