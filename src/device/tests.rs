use super::*;

#[test]
fn test_device_family() {
    assert_eq!(device_family("HOST"), "HOST");
    assert_eq!(device_family("HOST:1"), "HOST");
    assert_eq!(device_family("GPU:0:fast"), "GPU");
}

#[test]
fn test_registry_creates_devices_once() {
    let reg = DeviceRegistry::with_host();
    assert!(reg.names().is_empty());
    let a = reg.get("HOST:0").unwrap();
    let b = reg.get("HOST:0").unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.family(), "HOST");
    reg.get("HOST:1").unwrap();
    assert_eq!(reg.names(), vec!["HOST:0".to_string(), "HOST:1".to_string()]);
    reg.synchronize().unwrap();
}

#[test]
fn test_registry_unknown_family() {
    let reg = DeviceRegistry::with_host();
    assert_eq!(
        reg.get("GPU:0").unwrap_err(),
        ExecError::UnknownDevice("GPU:0".to_string())
    );
}

#[test]
fn test_registered_device_wins() {
    let reg = DeviceRegistry::new();
    let mem = Arc::new(host::HostMemory::default());
    reg.register(host::device("CUSTOM", mem, host::HostOptions::without_transfer()));
    let dev = reg.get("CUSTOM").unwrap();
    assert!(!dev.allocator.supports_transfer());
}

#[test]
fn test_family_shares_memory() {
    let reg = DeviceRegistry::with_host();
    let d0 = reg.get("HOST:0").unwrap();
    let d1 = reg.get("HOST:1").unwrap();
    let src = d0.allocator.alloc(8).unwrap();
    let dest = d1.allocator.alloc(8).unwrap();
    d0.allocator.copyin(&src, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
    assert!(d1.allocator.supports_transfer());
    d1.allocator.transfer(&dest, &src, 8).unwrap();
    let mut out = [0u8; 8];
    d1.allocator.copyout(&mut out, &dest).unwrap();
    assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn test_raw_buffer_window() {
    let raw = RawBuffer {
        handle: 3,
        offset: 4,
        nbytes: 32,
    };
    assert_eq!(
        raw.window(8, 16),
        RawBuffer {
            handle: 3,
            offset: 12,
            nbytes: 16
        }
    );
}

#[test]
fn test_launch_vals_in_order() {
    let n = Variable::new("n", 1, 8);
    let m = Variable::new("m", 1, 8);
    let mut vals = VarVals::new();
    vals.insert(n.clone(), 3);
    vals.insert(m.clone(), 5);
    assert_eq!(launch_vals(&[n.clone(), m.clone()], &vals).unwrap(), vec![3, 5]);
    vals.remove(&m);
    assert_eq!(
        launch_vals(&[n, m], &vals).unwrap_err(),
        ExecError::UnboundVariable("m".to_string())
    );
}
