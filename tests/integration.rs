//! Cross-module integration tests exercising the public API together:
//! the factory resolving real descriptors, the device facade, the
//! logical name mapping layer, and the rebot backend's timeout
//! behavior. Unit-level behavior for each piece already lives beside
//! its module; these tests check the seams between them.

use std::io::Write as _;

use devaccess::device::Device;
use devaccess::factory::DeviceMap;

fn write_map(dir: &std::path::Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    path
}

#[test]
fn logical_name_mapping_redirects_through_a_dummy_backend() {
    let dir = tempfile::tempdir().unwrap();
    let raw_map = write_map(dir.path(), "raw.map", "VOLTAGE 1 0 4 0 32 8 1 RW\n");
    let mapping_yaml = write_map(
        dir.path(),
        "mapping.yaml",
        r#"
registers:
  - path: /app/voltage
    kind: redirect
    target: /VOLTAGE
    n_elements: 1
"#,
    );

    let mut device_map = DeviceMap::new();
    device_map.register("raw", format!("(dummy?map={})", raw_map.to_string_lossy()), None);
    device_map.register(
        "app",
        format!(
            "(logical-name-mapping?target=raw&map={})",
            mapping_yaml.to_string_lossy()
        ),
        None,
    );

    let device = Device::new(device_map);
    device.open("app").unwrap();

    device.write_scalar::<f64>("/app/voltage", 12.5).unwrap();
    let value: f64 = device.read_scalar("/app/voltage").unwrap();
    assert!((value - 12.5).abs() < 1e-6);
}

#[test]
fn rebot_descriptor_surfaces_a_runtime_error_through_the_factory() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let dir = tempfile::tempdir().unwrap();
    let map = write_map(dir.path(), "rebot.map", "VOLTAGE 1 0 4 0 32 8 1 RW\n");

    let mut device_map = DeviceMap::new();
    device_map.register(
        "network-board",
        format!(
            "(rebot?endpoint={addr}&timeout_ms=200&map={})",
            map.to_string_lossy()
        ),
        None,
    );

    let device = Device::new(device_map);
    let err = device.open("network-board").unwrap_err();
    assert!(err.is_runtime());
    assert!(!device.is_opened());
}

#[test]
fn subdevice_area_descriptor_shares_a_dummy_host_backend() {
    let dir = tempfile::tempdir().unwrap();
    let host_map = write_map(
        dir.path(),
        "host.map",
        "AREA 4 0 16 0 32 0 1 RW\n",
    );
    let sub_map = write_map(
        dir.path(),
        "sub.map",
        "WINDOW 1 0 4 0 32 0 1 RW\n",
    );

    let mut device_map = DeviceMap::new();
    device_map.register("host", format!("(dummy?map={})", host_map.to_string_lossy()), None);
    device_map.register(
        "window",
        format!(
            "(subdevice?target=host&mode=area&register=AREA&map={})",
            sub_map.to_string_lossy()
        ),
        None,
    );

    let device = Device::new(device_map);
    device.open("window").unwrap();
    device.write_scalar::<f64>("/WINDOW", 7.0).unwrap();
    let value: f64 = device.read_scalar("/WINDOW").unwrap();
    assert!((value - 7.0).abs() < 1e-6);
}

#[test]
fn closing_and_reopening_a_device_clears_a_prior_fault() {
    let dir = tempfile::tempdir().unwrap();
    let map = write_map(dir.path(), "fault.map", "VOLTAGE 1 0 4 0 32 8 1 RW\n");
    let mut device_map = DeviceMap::new();
    device_map.register("board", format!("(dummy?map={})", map.to_string_lossy()), None);

    let device = Device::new(device_map);
    device.open("board").unwrap();
    assert!(device.is_functional());

    device.close().unwrap();
    device.reopen().unwrap();
    assert!(device.is_functional());
}
