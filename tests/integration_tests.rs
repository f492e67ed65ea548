/*
 * Integration tests for fan-service
 *
 * End-to-end control scenarios: simulated platforms replayed through the
 * mokujin board, and one generic board driving real files in a temp dir.
 */

use std::fs;
use std::path::Path;

use serde_json::json;
use serial_test::serial;
use tempfile::TempDir;

use fan_service::bsp::{BspOptions, GenericBsp};
use fan_service::config::{resolve_config_path, BspType, ServiceConfig};
use fan_service::constants::defaults;
use fan_service::mokujin::{Journal, MokujinBsp, SimClock, Timeline};
use fan_service::{FanService, FanServiceError};

fn mokujin_service(config: serde_json::Value, timeline: serde_json::Value) -> (FanService, SimClock, Journal) {
    let config = ServiceConfig::parse(&config.to_string()).unwrap();
    let bsp = MokujinBsp::new(Timeline::parse(&timeline.to_string()).unwrap());
    let (clock, journal) = (bsp.clock(), bsp.journal());
    (FanService::new(config, Box::new(bsp)), clock, journal)
}

fn cpu_sensor() -> serde_json::Value {
    json!({
        "access": { "source": "thrift", "path": "" },
        "type": "linear_four_curves",
        "normal_up_table": [[0, 20], [40, 35], [60, 60], [80, 100]],
        "normal_down_table": [[0, 20], [40, 30], [60, 50], [80, 90]],
        "onefail_up_table": [[0, 60], [60, 100]],
        "onefail_down_table": [[0, 60], [60, 100]]
    })
}

fn sysfs_fan(index: u32) -> serde_json::Value {
    json!({
        "pwm": { "source": "sysfs", "path": format!("/run/fan{}_pwm", index) },
        "rpm": { "source": "sysfs", "path": format!("/run/fan{}_rpm", index) },
        "led": { "source": "sysfs", "path": format!("/run/fan{}_led", index) }
    })
}

#[test]
fn test_rising_temperature_is_slewed() {
    let config = json!({
        "bsp": "mokujin",
        "pwm_transition_value": 50,
        "zones": { "zone1": { "zone_type": "max", "slope": 10, "sensors": ["CPU_TEMP"], "fans": ["fan_1"] } },
        "fans": { "fan_1": sysfs_fan(1) },
        "sensors": { "CPU_TEMP": cpu_sensor() }
    });
    let timeline = json!({
        "start_time": 1000,
        "events": [
            { "kind": "sensor", "time": 1000, "name": "CPU_TEMP", "value": 45.0 },
            { "kind": "sensor", "time": 1030, "name": "CPU_TEMP", "value": 70.0 },
            { "kind": "sensor", "time": 1060, "name": "CPU_TEMP", "value": 85.0 },
            { "kind": "sysfs", "time": 1000, "path": "/run/fan1_rpm", "value": 9000 }
        ]
    });
    let (mut service, clock, journal) = mokujin_service(config, timeline);

    service.kickstart();
    assert_eq!(journal.last_pwm("/run/fan1_pwm"), Some(127));

    let mut seen = Vec::new();
    for _ in 0..3 {
        assert!(service.control_fan());
        seen.push(service.get_fan_statuses()["fan_1"].current_pwm);
        clock.advance(30);
    }
    assert_eq!(seen, vec![40.0, 50.0, 60.0]);
    assert_eq!(journal.last_pwm("/run/fan1_pwm"), Some(153));
    assert_eq!(service.get_fan_statuses()["fan_1"].rpm, Some(9000));
}

#[test]
fn test_dead_fan_triggers_boost_after_grace_period() {
    let config = json!({
        "bsp": "mokujin",
        "pwm_transition_value": 40,
        "pwm_boost_value": 80,
        "boost_on_dead_fan": 1,
        "zones": { "zone1": { "zone_type": "max", "slope": 0, "sensors": ["CPU_TEMP"], "fans": ["fan_1", "fan_2"] } },
        "fans": { "fan_1": sysfs_fan(1), "fan_2": sysfs_fan(2) },
        "sensors": { "CPU_TEMP": cpu_sensor() }
    });
    // fan_2 never reports an RPM
    let timeline = json!({
        "start_time": 1000,
        "events": [
            { "kind": "sensor", "time": 1000, "name": "CPU_TEMP", "value": 45.0 },
            { "kind": "sysfs", "time": 1000, "path": "/run/fan1_rpm", "value": 9000 }
        ]
    });
    let (mut service, clock, journal) = mokujin_service(config, timeline);
    service.kickstart();

    while clock.now() < 1300 {
        service.control_fan();
        assert!(!service.control_logic().boost_mode());
        assert!(!service.get_fan_statuses()["fan_2"].fan_failed);
        clock.advance(30);
    }

    service.control_fan();
    let statuses = service.get_fan_statuses();
    assert!(statuses["fan_2"].fan_failed);
    assert!(!statuses["fan_1"].fan_failed);
    assert!(service.control_logic().boost_mode());
    assert_eq!(statuses["fan_1"].current_pwm, 80.0);
    assert_eq!(journal.led_writes("/run/fan2_led"), vec![1, 2]);
    assert_eq!(journal.led_writes("/run/fan1_led"), vec![1]);
}

#[test]
fn test_out_of_range_sensor_shuts_down_once() {
    let mut sensor = cpu_sensor();
    sensor["range_check"] = json!({
        "range_low": 0,
        "range_high": 150,
        "tolerance": 2,
        "invalid_range_action": "shutdown"
    });
    let config = json!({
        "bsp": "mokujin",
        "shutdown_command": "poweroff",
        "zones": { "zone1": { "zone_type": "max", "sensors": ["CPU_TEMP"], "fans": ["fan_1"] } },
        "fans": { "fan_1": sysfs_fan(1) },
        "sensors": { "CPU_TEMP": sensor }
    });
    let timeline = json!({
        "start_time": 1000,
        "events": [
            { "kind": "sensor", "time": 1000, "name": "CPU_TEMP", "value": 45.0 },
            { "kind": "sensor", "time": 1030, "name": "CPU_TEMP", "value": 200.0 },
            { "kind": "sysfs", "time": 1000, "path": "/run/fan1_rpm", "value": 9000 }
        ]
    });
    let (mut service, clock, journal) = mokujin_service(config, timeline);
    service.kickstart();

    for _ in 0..5 {
        service.control_fan();
        clock.advance(30);
    }
    assert_eq!(journal.shutdown_count(), 1);
}

#[test]
fn test_optics_drive_zone_until_service_goes_quiet() {
    let config = json!({
        "bsp": "mokujin",
        "pwm_boost_value": 70,
        "boost_on_no_qsfp_after": 60,
        "zones": { "zone1": { "zone_type": "max", "slope": 0, "sensors": ["CPU_TEMP", "qsfp_group_1"], "fans": ["fan_1"] } },
        "fans": { "fan_1": sysfs_fan(1) },
        "sensors": { "CPU_TEMP": cpu_sensor() },
        "optics": { "qsfp_group_1": {
            "access": { "source": "thrift", "path": "" },
            "speed_100": [[0, 30], [40, 50]]
        } }
    });
    let timeline = json!({
        "start_time": 1000,
        "events": [
            { "kind": "sensor", "time": 1000, "name": "CPU_TEMP", "value": 45.0 },
            { "kind": "sysfs", "time": 1000, "path": "/run/fan1_rpm", "value": 9000 },
            { "kind": "optic", "time": 1000, "name": "qsfp_group_1", "table": "speed_100", "value": 45.0 },
            { "kind": "qsfp_down", "time": 1060 }
        ]
    });
    let (mut service, clock, _journal) = mokujin_service(config, timeline);
    service.kickstart();

    service.control_fan();
    assert_eq!(service.sensor_data().get_optics_pwm("qsfp_group_1").unwrap(), 50);
    assert_eq!(service.get_fan_statuses()["fan_1"].current_pwm, 50.0);

    clock.set_time(1030);
    service.control_fan();
    clock.set_time(1060);
    service.control_fan();
    assert!(!service.control_logic().boost_mode());
    assert_eq!(service.sensor_data().get_last_qsfp_svc_time(), 1030);

    clock.set_time(1090);
    service.control_fan();
    assert!(service.control_logic().boost_mode());
    assert_eq!(service.get_fan_statuses()["fan_1"].current_pwm, 70.0);
}

fn write_sysfs_fixture(dir: &Path) -> serde_json::Value {
    fs::write(dir.join("cpu_temp"), "45000\n").unwrap();
    fs::write(dir.join("fan1_rpm"), "9000\n").unwrap();
    fs::write(dir.join("fan1_present"), "1\n").unwrap();
    let path = |name: &str| dir.join(name).to_string_lossy().into_owned();
    json!({
        "bsp": "darwin",
        "pwm_transition_value": 50,
        "zones": { "zone1": { "zone_type": "max", "slope": 0, "sensors": ["CPU_TEMP"], "fans": ["fan_1"] } },
        "fans": { "fan_1": {
            "pwm": { "source": "sysfs", "path": path("fan1_pwm") },
            "rpm": { "source": "sysfs", "path": path("fan1_rpm") },
            "led": { "source": "sysfs", "path": path("fan1_led") },
            "presence": { "source": "sysfs", "path": path("fan1_present") }
        } },
        "sensors": { "CPU_TEMP": {
            "access": { "source": "sysfs", "path": path("cpu_temp") },
            "scale": 1000,
            "type": "linear_four_curves",
            "normal_up_table": [[0, 20], [40, 35], [60, 60]],
            "normal_down_table": [[0, 20], [40, 30], [60, 50]],
            "onefail_up_table": [[0, 60]],
            "onefail_down_table": [[0, 60]]
        } }
    })
}

#[test]
#[serial]
fn test_generic_board_drives_files() {
    let dir = TempDir::new().unwrap();
    let config_doc = write_sysfs_fixture(dir.path());
    let config_path = dir.path().join("fan_service.json");
    fs::write(&config_path, serde_json::to_string_pretty(&config_doc).unwrap()).unwrap();

    std::env::set_var(defaults::CONFIG_PATH_ENV, &config_path);
    let resolved = resolve_config_path(None);
    std::env::remove_var(defaults::CONFIG_PATH_ENV);
    assert_eq!(resolved, config_path);

    let mut service = FanService::from_config_file(&resolved, &BspOptions::default()).unwrap();
    assert_eq!(service.config().bsp_type, BspType::Darwin);

    service.kickstart();
    assert_eq!(fs::read_to_string(dir.path().join("fan1_pwm")).unwrap(), "127");
    assert_eq!(fs::read_to_string(dir.path().join("fan1_led")).unwrap(), "1");

    assert!(service.control_fan());
    assert_eq!(fs::read_to_string(dir.path().join("fan1_pwm")).unwrap(), "89");
    let status = &service.get_fan_statuses()["fan_1"];
    assert_eq!(status.rpm, Some(9000));
    assert!(!status.fan_failed);
}

#[test]
fn test_generic_board_without_clients() {
    let config = ServiceConfig::parse(r#"{ "sensors": { "S": { "access": { "source": "thrift", "path": "" } } } }"#).unwrap();
    let mut service = FanService::new(config, Box::new(GenericBsp::new(BspType::Generic)));
    service.kickstart();
    assert!(!service.sensor_data().check_if_entry_exists("S"));
}

#[test]
fn test_mokujin_requires_timeline() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("fan_service.json");
    fs::write(&config_path, r#"{ "bsp": "mokujin" }"#).unwrap();
    let err = FanService::from_config_file(&config_path, &BspOptions::default()).err().unwrap();
    assert!(matches!(err, FanServiceError::Config(_)));
}

#[test]
fn test_bad_config_is_fatal() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("fan_service.json");
    fs::write(&config_path, r#"{ "zones": {}, "fan_speed": 3 }"#).unwrap();
    let err = FanService::from_config_file(&config_path, &BspOptions::default()).err().unwrap();
    assert!(err.is_fatal());
    assert!(err.to_string().contains("fan_speed"));
}
