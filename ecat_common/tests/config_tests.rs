//! File-based configuration tests.
//!
//! Master settings (TOML) and device descriptors (JSON) loaded from disk,
//! validation failures, and the descriptor → runtime entry pipeline.

use ecat_common::config::{ConfigError, ConfigLoader, LogLevel, MasterConfig, Period};
use ecat_common::descriptor::load_devices;
use ecat_common::entry::Direction;
use ecat_common::flatten::flatten;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_master_toml_full() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "master.toml",
        r#"
[master]
index = 1
period_us = 500
health_check_interval_ms = 250
drain_timeout_ms = 2000
request_poll_interval_us = 50
data_interval_ms = 100
rt_priority = 80
cpu_core = 3

[devices]
path = "/opt/bus/slaves.json"
sort = true

[logging]
level = "debug"
"#,
    );

    let config = MasterConfig::load_validated(&path).unwrap();
    assert_eq!(config.master.index, 1);
    assert_eq!(config.period(), Period::Micros(500));
    assert_eq!(config.period().as_nanos().unwrap(), 500_000);
    assert_eq!(config.health_check_interval().as_millis(), 250);
    assert_eq!(config.drain_timeout().as_millis(), 2000);
    assert_eq!(config.request_poll_interval().as_micros(), 50);
    assert_eq!(config.data_interval().as_millis(), 100);
    assert_eq!(config.master.rt_priority, Some(80));
    assert_eq!(config.master.cpu_core, Some(3));
    assert_eq!(config.devices.path, PathBuf::from("/opt/bus/slaves.json"));
    assert!(config.devices.sort);
    assert_eq!(config.logging.level, LogLevel::Debug);
}

#[test]
fn test_master_toml_empty_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "master.toml", "");

    let config = MasterConfig::load_validated(&path).unwrap();
    assert_eq!(config.period(), Period::Frequency(1000));
    assert_eq!(config.period().as_nanos().unwrap(), 1_000_000);
    assert_eq!(config.health_check_interval().as_secs(), 1);
    assert!(!config.devices.sort);
    assert_eq!(config.logging.level, LogLevel::Info);
}

#[test]
fn test_master_toml_rejections() {
    let dir = TempDir::new().unwrap();

    let both = write(&dir, "both.toml", "[master]\nfrequency_hz = 1000\nperiod_us = 1000\n");
    assert!(matches!(
        MasterConfig::load_validated(&both),
        Err(ConfigError::ValidationError(_))
    ));

    let zero = write(&dir, "zero.toml", "[master]\nfrequency_hz = 0\n");
    assert!(matches!(
        MasterConfig::load_validated(&zero),
        Err(ConfigError::ValidationError(_))
    ));

    let unknown = write(&dir, "unknown.toml", "[master]\nspeed = 3\n");
    assert!(matches!(
        MasterConfig::load(&unknown),
        Err(ConfigError::ParseError(_))
    ));

    let missing = dir.path().join("absent.toml");
    assert!(matches!(
        MasterConfig::load(&missing),
        Err(ConfigError::FileNotFound(p)) if p == missing
    ));
}

#[test]
fn test_devices_file_to_runtime_entries() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "slaves.json",
        r#"[
  {"alias": 0, "position": 1, "vendor_id": "0x00000002", "product_code": "0x0bbc3052",
   "syncs": [
     {"index": 3, "pdos": [{"index": "0x1a00", "entries": [
       {"index": "0x6000", "subindex": 17, "size": 16, "add_to_domain": true, "signed": true}
     ]}]}
   ]},
  {"alias": 0, "position": 0, "vendor_id": 2, "product_code": "0x07d43052",
   "syncs": [
     {"index": 0, "direction": "output", "watchdog_enabled": true, "pdos": [
       {"index": "0x1600", "entries": [
         {"index": "0x7000", "subindex": 1, "size": 1, "add_to_domain": true},
         {"index": "0x0000", "subindex": 0, "size": 7}
       ]}
     ]}
   ],
   "parameters": [{"index": "0x8000", "subindex": 6, "size": 8, "value": 1}]}
]"#,
    );

    let devices = load_devices(&path).unwrap();
    assert_eq!(devices.len(), 2);

    let flat = flatten(&devices, true).unwrap();
    assert_eq!(flat.positions(), vec![0, 1]);
    assert_eq!(flat.cyclic_count(), 2);
    assert_eq!(flat.parameters.len(), 1);
    assert_eq!(flat.parameters[0].position, 0);

    let first = &flat.entries[0];
    assert_eq!((first.position, first.index, first.subindex), (0, 0x7000, 1));
    assert_eq!(first.direction, Direction::Output);
    assert!(first.watchdog_enabled);

    let input = flat
        .entries
        .iter()
        .find(|e| e.index == 0x6000)
        .unwrap();
    assert_eq!(input.position, 1);
    assert_eq!(input.subindex, 17);
    assert!(input.signed);
    assert!(input.is_cyclic());

    let padding = flat.entries.iter().find(|e| e.bit_len == 7).unwrap();
    assert!(!padding.is_cyclic());
}

#[test]
fn test_devices_file_errors() {
    let dir = TempDir::new().unwrap();

    let missing = dir.path().join("absent.json");
    assert!(matches!(load_devices(&missing), Err(ConfigError::FileNotFound(_))));

    let garbage = write(&dir, "garbage.json", "{ not json");
    assert!(matches!(load_devices(&garbage), Err(ConfigError::ParseError(_))));

    let direction = write(
        &dir,
        "direction.json",
        r#"[{"alias":0,"position":0,"vendor_id":1,"product_code":1,
            "syncs":[{"index":2,"direction":"sideways","pdos":[]}]}]"#,
    );
    let devices = load_devices(&direction).unwrap();
    assert!(matches!(
        flatten(&devices, false),
        Err(ConfigError::InvalidDirection(d)) if d == "sideways"
    ));
}
