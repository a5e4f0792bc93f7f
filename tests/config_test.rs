//! Configuration loading from disk

use sensord::config::DaemonConfig;
use sensord::hardware::{DeviceAdaptor, MockSensor};
use sensord::sensor::frame::SensorType;
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_shipped_config_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/sensord.toml");
    let config = DaemonConfig::load_from(path).unwrap();
    config.validate().unwrap();

    let enabled: Vec<_> = config.enabled_sensors().iter().map(|s| s.id.clone()).collect();
    assert_eq!(enabled, vec!["accel", "gyro", "light"]);
}

#[test]
fn test_partial_file_keeps_defaults() {
    let file = write_config(
        r#"
        [application]
        name = "bench"
        log_level = "warn"

        [daemon]
        control_socket = "/tmp/bench/control.sock"
        data_socket_dir = "/tmp/bench/data"
        "#,
    );

    let config = DaemonConfig::load_from(file.path()).unwrap();
    assert_eq!(config.application.name, "bench");
    assert_eq!(config.daemon.max_sessions, 64);
    assert_eq!(config.daemon.default_buffer_size, 256);
    // No [[sensors]] table: the default accelerometer stays.
    assert_eq!(config.sensors.len(), 1);
    assert!(config.validate().is_ok());
}

#[test]
fn test_invalid_sensor_type_fails_validation() {
    let file = write_config(
        r#"
        [[sensors]]
        id = "t0"
        type = "thermometer"
        "#,
    );

    let config = DaemonConfig::load_from(file.path()).unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.contains("t0"));
}

#[test]
fn test_rate_limit_clips_mock_catalog() {
    let file = write_config(
        r#"
        [[sensors]]
        id = "gyro"
        type = "gyroscope"
        sample_rate_limit_hz = 25
        "#,
    );

    let config = DaemonConfig::load_from(file.path()).unwrap();
    let gyro = &config.sensors[0];
    assert_eq!(gyro.sensor_type(), Ok(SensorType::Gyroscope));
    assert_eq!(gyro.min_interval_ms(), Some(40));

    let mock = MockSensor::for_type(SensorType::Gyroscope);
    let clipped = mock.catalog().with_min_interval(40);
    assert!(clipped.validate().is_ok());
    assert!(clipped.resolve_interval(10).is_err());
    assert_eq!(clipped.resolve_interval(50).unwrap(), 50);
    assert_eq!(clipped.default_interval, 100);
}
