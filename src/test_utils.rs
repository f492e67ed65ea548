/*
 * This file is part of fan-service.
 *
 * Copyright (C) 2025 fan-service contributors
 *
 * fan-service is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * fan-service is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with fan-service. If not, see <https://www.gnu.org/licenses/>.
 */

//! Shared fixtures for unit tests

/// A generic-platform config touching every section
pub fn sample_config_json() -> String {
    r#"{
        "bsp": "generic",
        "pwm_boost_value": 60,
        "pwm_transition_value": 50,
        "boost_on_dead_fan": 1,
        "boost_on_dead_sensor": 2,
        "boost_on_no_qsfp_after": 90,
        "pwm_percent_upper_limit": 100,
        "pwm_percent_lower_limit": 15,
        "shutdown_command": "echo shutdown",
        "sensor_fetch_frequency": 30,
        "control_frequency": 30,
        "watchdog": {
            "access": { "source": "sysfs", "path": "/run/devmap/watchdogs/FAN_WATCHDOG" },
            "value": 0
        },
        "zones": {
            "zone1": {
                "zone_type": "max",
                "slope": 10,
                "sensors": ["CPU_TEMP", "SWITCH_TEMP", "qsfp_group_1"],
                "fans": ["fan_1", "fan_2"]
            }
        },
        "fans": {
            "fan_1": {
                "pwm": { "source": "sysfs", "path": "/run/devmap/fans/FAN1_PWM" },
                "rpm": { "source": "sysfs", "path": "/run/devmap/fans/FAN1_RPM" },
                "led": { "source": "sysfs", "path": "/run/devmap/fans/FAN1_LED" },
                "presence": { "source": "sysfs", "path": "/run/devmap/fans/FAN1_PRESENT" },
                "pwm_min": 1,
                "pwm_max": 255,
                "fan_present_val": 1,
                "fan_missing_val": 0,
                "fan_good_led_val": 1,
                "fan_fail_led_val": 2
            },
            "fan_2": {
                "pwm": { "source": "util", "path": "/usr/local/bin/set_fan_speed.sh _NAME_ _PWM_" },
                "rpm": { "source": "thrift", "path": "FAN2_RPM" },
                "pwm_min": 0,
                "pwm_max": 100
            }
        },
        "sensors": {
            "CPU_TEMP": {
                "access": { "source": "sysfs", "path": "/run/devmap/sensors/CPU_TEMP" },
                "scale": 1000,
                "adjustment": [[0, 0], [60, -2]],
                "type": "linear_four_curves",
                "normal_up_table": [[0, 10], [50, 40], [80, 70]],
                "normal_down_table": [[0, 10], [50, 30], [80, 60]],
                "onefail_up_table": [[0, 40], [50, 70], [80, 100]],
                "onefail_down_table": [[0, 40], [50, 60], [80, 90]],
                "alarm": { "alarm_major": 95, "alarm_minor": 85, "alarm_minor_soak": 30 },
                "range_check": {
                    "range_low": -20,
                    "range_high": 150,
                    "tolerance": 3,
                    "invalid_range_action": "shutdown"
                }
            },
            "SWITCH_TEMP": {
                "access": { "source": "thrift", "path": "" },
                "type": "incrementpid",
                "setpoint": 90,
                "positive_hysteresis": 1,
                "negative_hysteresis": 3,
                "kp": 2.5,
                "ki": 0.5,
                "kd": 0.1
            }
        },
        "optics": {
            "qsfp_group_1": {
                "access": { "source": "thrift", "path": "" },
                "aggregation": "max",
                "speed_100": [[5, 24], [38, 26], [40, 28], [45, 32], [48, 35]],
                "speed_400": [[5, 26], [38, 30], [40, 32], [45, 38], [48, 42]]
            }
        }
    }"#
    .to_string()
}

/// Simulated platform config paired with [`mokujin_timeline_json`]
pub fn mokujin_config_json() -> String {
    r#"{
        "bsp": "mokujin",
        "pwm_transition_value": 50,
        "sensor_fetch_frequency": 30,
        "control_frequency": 30,
        "watchdog": { "access": { "source": "sysfs", "path": "/run/watchdog" }, "value": 1 },
        "zones": {
            "zone1": { "zone_type": "max", "slope": 10, "sensors": ["CPU_TEMP"], "fans": ["fan_1"] }
        },
        "fans": {
            "fan_1": {
                "pwm": { "source": "sysfs", "path": "/run/fan1_pwm" },
                "rpm": { "source": "sysfs", "path": "/run/fan1_rpm" },
                "led": { "source": "sysfs", "path": "/run/fan1_led" }
            }
        },
        "sensors": {
            "CPU_TEMP": {
                "access": { "source": "thrift", "path": "" },
                "type": "linear_four_curves",
                "normal_up_table": [[0, 20], [40, 35], [60, 60], [80, 100]],
                "normal_down_table": [[0, 20], [40, 30], [60, 50], [80, 90]],
                "onefail_up_table": [[0, 60], [60, 100]],
                "onefail_down_table": [[0, 60], [60, 100]]
            }
        }
    }"#
    .to_string()
}

pub fn mokujin_timeline_json() -> String {
    r#"{
        "start_time": 1000,
        "events": [
            { "kind": "sensor", "time": 1000, "name": "CPU_TEMP", "value": 45.0 },
            { "kind": "sysfs", "time": 1000, "path": "/run/fan1_rpm", "value": 9000 }
        ]
    }"#
    .to_string()
}
