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

//! Centralized constants for the fan control engine
//!
//! Timing thresholds, configuration defaults and shell template tokens.

/// Failure debounce windows
pub mod thresholds {
    /// Seconds a fan RPM read may keep failing before the fan is declared failed
    pub const FAN_FAIL_THRESHOLD_SECS: u64 = 300;

    /// Seconds a sensor may go without a fresh reading before it is declared failed
    pub const SENSOR_FAIL_THRESHOLD_SECS: u64 = 300;
}

/// Defaults applied when the config file omits a key
pub mod defaults {
    pub const SENSOR_FETCH_FREQUENCY_SECS: u64 = 30;
    pub const CONTROL_FREQUENCY_SECS: u64 = 30;
    pub const CHECK_INTERVAL_SECS: u64 = 1;

    pub const PWM_LOWER_THRESHOLD: f32 = 0.0;
    pub const PWM_UPPER_THRESHOLD: f32 = 100.0;

    /// Raw PWM range of a typical hwmon/fpga fan controller
    pub const FAN_PWM_MIN: i32 = 0;
    pub const FAN_PWM_MAX: i32 = 255;

    pub const FAN_PRESENT_VAL: u32 = 1;
    pub const FAN_MISSING_VAL: u32 = 0;
    pub const FAN_GOOD_LED_VAL: u32 = 1;
    pub const FAN_FAIL_LED_VAL: u32 = 2;

    pub const SENSOR_SCALE: f32 = 1.0;

    pub const CONFIG_PATH: &str = "/etc/fan_service/fan_service.json";
    pub const CONFIG_PATH_ENV: &str = "FAN_SERVICE_CONFIG";
}

/// RPC budgets toward the sensor and optics services
pub mod rpc {
    pub const CONNECT_TIMEOUT_MS: u64 = 2000;
    pub const SEND_TIMEOUT_MS: u64 = 5000;
}

/// Tokens substituted into util (shell) command templates
pub mod shell {
    pub const NAME_TOKEN: &str = "_NAME_";
    pub const PWM_TOKEN: &str = "_PWM_";
    pub const VALUE_TOKEN: &str = "_VALUE_";
}

/// Counter name templates
pub mod counters {
    /// Format a per-fan PWM write failure counter key
    pub fn fan_write_failure(zone: &str, fan: &str) -> String {
        format!("fan_write.{}.{}.failure", zone, fan)
    }
}

/// Suffix of the sensor-data key holding a fan's last presence reading
pub const PRESENCE_KEY_SUFFIX: &str = "_presence";
