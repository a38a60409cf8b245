//! Integration tests for configuration loading

use parking_gateway::domain::{FloorId, LaneRole, Tariff};
use parking_gateway::infra::{Config, OperatingMode, UnknownExitPolicy};
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(content.as_bytes()).unwrap();
    temp_file.flush().unwrap();
    temp_file
}

#[test]
fn test_load_config_from_file() {
    let temp_file = write_config(
        r#"
[site]
id = "test-site"

[mode]
operating = "hardware"

[central]
host = "central.local"
port = 9100
request_timeout_ms = 1500

[serial]
device = "/dev/test"
baud = 19200
slave_id = 7

[billing]
price_per_minute = 0.25
minimum_fee = 3.0
unknown_exit_policy = "deny"

[facility]
total_spaces = 120
floor_id = "level-2"

[lpr]
min_confidence = 0.9

[floor]
auto_reset = true

[[lanes]]
id = "north-in"
role = "entry"

[[lanes]]
id = "north-out"
role = "exit"
coil = 0x10
presence_register = 0x20

[store]
journal_file = "/var/lib/parking/journal.jsonl"

[metrics]
interval_secs = 15
prometheus_port = 9091
"#,
    );

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "test-site");
    assert_eq!(config.operating_mode(), OperatingMode::Hardware);
    assert_eq!(config.central_addr(), "central.local:9100");
    assert_eq!(config.central_request_timeout_ms(), 1500);
    assert_eq!(config.serial_device(), "/dev/test");
    assert_eq!(config.serial_baud(), 19200);
    assert_eq!(config.serial_slave_id(), 7);
    assert_eq!(config.tariff(), Tariff::new(0.25, 3.0));
    assert_eq!(config.unknown_exit_policy(), UnknownExitPolicy::Deny);
    assert_eq!(config.total_spaces(), 120);
    assert_eq!(config.floor_id(), &FloorId::new("level-2"));
    assert_eq!(config.min_confidence(), 0.9);
    assert!(config.auto_reset());
    assert_eq!(config.journal_file(), Some("/var/lib/parking/journal.jsonl"));
    assert_eq!(config.prometheus_port(), 9091);

    let lanes = config.lanes();
    assert_eq!(lanes.len(), 2);
    assert_eq!(lanes[0].role, LaneRole::Entry);
    assert_eq!((lanes[0].coil(), lanes[0].presence_register()), (0x01, 0x08));
    assert_eq!((lanes[1].coil(), lanes[1].presence_register()), (0x10, 0x20));
}

#[test]
fn test_missing_sections_use_defaults() {
    let temp_file = write_config("[site]\nid = \"minimal\"\n");
    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "minimal");
    assert_eq!(config.operating_mode(), OperatingMode::Simulation);
    assert_eq!(config.tariff(), Tariff::new(0.15, 2.00));
    assert_eq!(config.total_spaces(), 8);
    assert_eq!(config.lanes().len(), 2);
}

#[test]
fn test_invalid_values_rejected() {
    let zero_spaces = write_config("[facility]\ntotal_spaces = 0\n");
    assert!(Config::from_file(zero_spaces.path()).is_err());

    let bad_confidence = write_config("[lpr]\nmin_confidence = 1.5\n");
    assert!(Config::from_file(bad_confidence.path()).is_err());

    let duplicate_lanes = write_config(
        r#"
[[lanes]]
id = "gate"
role = "entry"

[[lanes]]
id = "gate"
role = "exit"
"#,
    );
    assert!(Config::from_file(duplicate_lanes.path()).is_err());
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.config_file(), "default");
    assert_eq!(config.lanes().len(), 2);
    assert_eq!(config.unknown_exit_policy(), UnknownExitPolicy::Grant);
}

#[test]
fn test_shipped_config_parses() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/parking.toml");
    let config = Config::from_file(path).unwrap();
    assert_eq!(config.operating_mode(), OperatingMode::Simulation);
    assert_eq!(config.lanes().len(), 2);
    assert!(config.auto_reset());
}
