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

//! Fan control engine
//!
//! One call to [`ControlLogic::update_control`] is one control cycle:
//!
//! 1. make sure sensor data was fetched at least once
//! 2. fan presence and RPM, with a grace period on access failures
//! 3. per-sensor scaling, adjustment, alarms, range check and target PWM
//! 4. optics tables, consumed once per delivery
//! 5. boost decision
//! 6. per-zone aggregation, slew limiting and PWM writes
//! 7. LED programming on fail-state edges
//!
//! Static configuration is shared through an `Arc<ServiceConfig>`; everything
//! that changes between cycles lives in the runtime maps owned here.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use fan_error::FanServiceError;

use crate::bsp::{fan_presence_key, fan_rpm_key, Bsp};
use crate::config::{
    AccessType, CalculationType, FanConfig, RangeCheckAction, SensorConfig, ServiceConfig, Table,
    Zone, ZoneType,
};
use crate::constants::{counters, thresholds, PRESENCE_KEY_SUFFIX};
use crate::sensor_data::SensorData;

/// Cycle-to-cycle state of one sensor
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SensorRuntimeState {
    pub adjusted_read_cache: f32,
    pub target_pwm_cache: f32,
    pub last_updated_time: u64,
    pub sensor_failed: bool,
    pub minor_alarm_triggered: bool,
    pub major_alarm_triggered: bool,
    pub soak_started: bool,
    pub soak_started_at: u64,
    pub invalid_range_count: u32,
    pub previous_sensor_read: f32,
    pub previous_read1: f32,
    pub previous_read2: f32,
    /// Zone PWM this sensor contributed to last cycle
    pub previous_target_pwm: f32,
    pub integral: f32,
    pub last_error: f32,
}

impl SensorRuntimeState {
    fn new(now: u64) -> Self {
        Self {
            last_updated_time: now,
            ..Self::default()
        }
    }
}

/// Externally visible state of one fan
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FanStatus {
    pub rpm: Option<i32>,
    /// Last programmed PWM, in percent
    pub current_pwm: f32,
    pub fan_failed: bool,
    pub fan_access_lost: bool,
    pub first_time_led_access: bool,
    pub last_successful_access: u64,
    /// Timestamp of the last RPM reading accepted from the sensor service
    pub rpm_timestamp: u64,
    /// Same, for presence readings from the sensor service
    pub presence_timestamp: u64,
    #[serde(skip)]
    led_failed: bool,
}

impl FanStatus {
    fn new(now: u64) -> Self {
        Self {
            rpm: None,
            current_pwm: 0.0,
            fan_failed: false,
            fan_access_lost: false,
            first_time_led_access: true,
            last_successful_access: now,
            rpm_timestamp: 0,
            presence_timestamp: 0,
            led_failed: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Presence {
    Present,
    Missing,
    Unreadable,
}

/// Value of the largest breakpoint not above `input`
fn highest_at_or_below(table: &Table, input: f32) -> Option<f32> {
    table
        .iter()
        .filter(|(breakpoint, _)| *breakpoint <= input)
        .fold(None, |best: Option<(f32, f32)>, &(bp, value)| match best {
            Some((best_bp, _)) if best_bp > bp => best,
            _ => Some((bp, value)),
        })
        .map(|(_, value)| value)
}

/// Table lookup that falls back to the first entry below every breakpoint
pub fn table_lookup(table: &Table, input: f32) -> Option<f32> {
    let (_, first) = table.first()?;
    Some(highest_at_or_below(table, input).unwrap_or(*first))
}

/// Step from `current` toward `target` by at most `slope`
///
/// A zero slope or a fan that was never programmed jumps straight to the target.
pub fn slew_pwm(current: f32, target: f32, slope: f32) -> f32 {
    if slope == 0.0 || current == 0.0 {
        return target;
    }
    if target > current && target - current > slope {
        current + slope
    } else if target < current && current - target > slope {
        current - slope
    } else {
        target
    }
}

/// Percent to raw controller units, clamped to the fan's range
pub fn percent_to_raw(fan: &FanConfig, percent: f32) -> i32 {
    let raw = ((fan.pwm_max - fan.pwm_min) as f32 * percent / 100.0 + fan.pwm_min as f32) as i32;
    raw.clamp(fan.pwm_min, fan.pwm_max)
}

pub struct ControlLogic {
    config: Arc<ServiceConfig>,
    sensor_states: HashMap<String, SensorRuntimeState>,
    fan_statuses: HashMap<String, FanStatus>,
    num_fan_failed: u32,
    num_sensor_failed: u32,
    boost_mode: bool,
    last_control_update_sec: u64,
    counters: HashMap<String, u64>,
}

impl ControlLogic {
    pub fn new(config: Arc<ServiceConfig>, now: u64) -> Self {
        let sensor_states = config
            .sensors
            .iter()
            .map(|s| (s.name.clone(), SensorRuntimeState::new(now)))
            .collect();
        let fan_statuses = config
            .fans
            .iter()
            .map(|f| (f.name.clone(), FanStatus::new(now)))
            .collect();
        Self {
            config,
            sensor_states,
            fan_statuses,
            num_fan_failed: 0,
            num_sensor_failed: 0,
            boost_mode: false,
            last_control_update_sec: now,
            counters: HashMap::new(),
        }
    }

    pub fn config(&self) -> &Arc<ServiceConfig> {
        &self.config
    }

    /// Run one full control cycle
    pub fn update_control(&mut self, bsp: &mut dyn Bsp, sensor_data: &mut SensorData) {
        let config = Arc::clone(&self.config);

        if !bsp.check_if_initial_sensor_data_read() {
            info!("Reading sensors for the first time");
            bsp.get_sensor_data(&config, sensor_data);
        }

        let now = bsp.current_time();
        let dt = match now.saturating_sub(self.last_control_update_sec) {
            0 => 1,
            dt => dt,
        };

        self.get_fan_update(bsp, sensor_data);
        self.get_sensor_update(bsp, sensor_data, dt);
        self.get_optics_update(sensor_data);

        self.boost_mode = self.evaluate_boost(now, sensor_data);
        info!(
            failed_fans = self.num_fan_failed,
            failed_sensors = self.num_sensor_failed,
            boost = self.boost_mode,
            "Control cycle status"
        );

        self.adjust_zone_fans(bsp, sensor_data);
        self.set_fan_fail_state(bsp);

        self.last_control_update_sec = now;
    }

    // ------------------------------------------------------------------------
    // Fans
    // ------------------------------------------------------------------------

    fn check_fan_presence(
        bsp: &dyn Bsp,
        sensor_data: &mut SensorData,
        fan: &FanConfig,
        status: &mut FanStatus,
        now: u64,
    ) -> Presence {
        let reading = match fan.presence.access_type {
            AccessType::Invalid => return Presence::Present,
            AccessType::Sysfs if fan.presence.path.is_empty() => return Presence::Present,
            AccessType::Sysfs => match bsp.read_sysfs(&fan.presence.path) {
                Ok(value) => {
                    let key = format!("{}{}", fan.name, PRESENCE_KEY_SUFFIX);
                    sensor_data.update_entry_float(&key, value, now);
                    value
                }
                Err(e) => {
                    warn!(fan = %fan.name, error = %e, "Fan presence read failed");
                    return Presence::Unreadable;
                }
            },
            AccessType::Thrift => {
                let key = fan_presence_key(&fan.name, &fan.presence.path);
                let reading = sensor_data
                    .get_last_updated(&key)
                    .and_then(|t| Ok((sensor_data.get_sensor_value(&key)?, t)));
                match reading {
                    Ok((_, timestamp)) if timestamp <= status.presence_timestamp => {
                        warn!(fan = %fan.name, timestamp, "Fan presence data is stale");
                        return Presence::Unreadable;
                    }
                    Ok((value, timestamp)) => {
                        status.presence_timestamp = timestamp;
                        value
                    }
                    Err(e) => {
                        warn!(fan = %fan.name, error = %e, "No fan presence data");
                        return Presence::Unreadable;
                    }
                }
            }
            access @ (AccessType::Util | AccessType::Rest) => {
                let e = FanServiceError::unsupported(access, "fan presence");
                error!(fan = %fan.name, error = %e, "Unable to check fan presence");
                return Presence::Unreadable;
            }
        };

        let value = reading.round() as u32;
        if value == fan.fan_present_val {
            Presence::Present
        } else {
            debug!(
                fan = %fan.name,
                value,
                present = fan.fan_present_val,
                missing = fan.fan_missing_val,
                "Fan reported absent"
            );
            Presence::Missing
        }
    }

    /// RPM and the timestamp it was taken at, or `None` on access failure
    fn read_fan_rpm(
        bsp: &dyn Bsp,
        sensor_data: &SensorData,
        fan: &FanConfig,
        status: &FanStatus,
        now: u64,
    ) -> Option<(i32, u64)> {
        match fan.rpm.access_type {
            AccessType::Sysfs => match bsp.read_sysfs(&fan.rpm.path) {
                Ok(rpm) => Some((rpm as i32, now)),
                Err(e) => {
                    warn!(fan = %fan.name, path = %fan.rpm.path, error = %e, "Fan RPM access failed");
                    None
                }
            },
            AccessType::Thrift => {
                let key = fan_rpm_key(&fan.name, &fan.rpm.path);
                let timestamp = sensor_data.get_last_updated(&key).ok()?;
                if timestamp <= status.rpm_timestamp {
                    warn!(fan = %fan.name, timestamp, "Fan RPM data is stale");
                    return None;
                }
                let rpm = sensor_data.get_sensor_value(&key).ok()?;
                Some((rpm as i32, timestamp))
            }
            access => {
                let e = FanServiceError::unsupported(access, "fan RPM");
                error!(fan = %fan.name, error = %e, "Unable to read fan RPM");
                None
            }
        }
    }

    fn get_fan_update(&mut self, bsp: &mut dyn Bsp, sensor_data: &mut SensorData) {
        let config = Arc::clone(&self.config);
        let now = bsp.current_time();
        self.num_fan_failed = 0;

        for fan in &config.fans {
            let status = self
                .fan_statuses
                .entry(fan.name.clone())
                .or_insert_with(|| FanStatus::new(now));
            let was_failed = status.fan_failed;
            let presence = Self::check_fan_presence(bsp, sensor_data, fan, status, now);

            let reading = match presence {
                Presence::Missing => None,
                Presence::Present => Self::read_fan_rpm(bsp, sensor_data, fan, status, now),
                Presence::Unreadable => None,
            };

            match (presence, reading) {
                (Presence::Missing, _) => {
                    status.rpm = None;
                    status.fan_failed = true;
                    status.fan_access_lost = false;
                }
                (_, Some((rpm, timestamp))) => {
                    status.rpm = Some(rpm);
                    status.rpm_timestamp = timestamp;
                    status.last_successful_access = now;
                    status.fan_access_lost = false;
                    status.fan_failed = false;
                }
                (_, None) => {
                    status.rpm = None;
                    status.fan_access_lost = true;
                    let since_success = now.saturating_sub(status.last_successful_access);
                    if since_success >= thresholds::FAN_FAIL_THRESHOLD_SECS {
                        status.fan_failed = true;
                    }
                }
            }

            if status.fan_failed && !was_failed {
                error!(fan = %fan.name, presence = ?presence, "Fan failed");
            } else if !status.fan_failed && was_failed {
                info!(fan = %fan.name, rpm = ?status.rpm, "Fan recovered");
            }
            if status.fan_failed {
                self.num_fan_failed += 1;
            }
            debug!(fan = %fan.name, rpm = ?status.rpm, failed = status.fan_failed, "Fan status");
        }
    }

    // ------------------------------------------------------------------------
    // Sensors
    // ------------------------------------------------------------------------

    fn get_sensor_update(&mut self, bsp: &mut dyn Bsp, sensor_data: &SensorData, dt: u64) {
        let config = Arc::clone(&self.config);
        let now = bsp.current_time();
        self.num_sensor_failed = 0;

        for sensor in &config.sensors {
            let state = self
                .sensor_states
                .entry(sensor.name.clone())
                .or_insert_with(|| SensorRuntimeState::new(now));

            let reading = sensor_data
                .get_sensor_value(&sensor.name)
                .and_then(|v| Ok((v, sensor_data.get_last_updated(&sensor.name)?)));
            let reading = match reading {
                Ok((value, _)) if !value.is_finite() => {
                    warn!(sensor = %sensor.name, value, "Discarding non-finite sensor value");
                    None
                }
                Ok(reading) => Some(reading),
                Err(e) => {
                    debug!(sensor = %sensor.name, error = %e, "Sensor read fail");
                    None
                }
            };

            if let Some((_, timestamp)) = reading {
                state.last_updated_time = timestamp;
            }
            let was_failed = state.sensor_failed;
            state.sensor_failed = now.saturating_sub(state.last_updated_time)
                >= thresholds::SENSOR_FAIL_THRESHOLD_SECS;
            if state.sensor_failed {
                self.num_sensor_failed += 1;
                if !was_failed {
                    error!(sensor = %sensor.name, last_update = state.last_updated_time, "Sensor failed");
                }
            } else if was_failed {
                info!(sensor = %sensor.name, "Sensor recovered");
            }

            if let Some((raw, timestamp)) = reading {
                let raw = raw / sensor.scale;
                let offset = highest_at_or_below(&sensor.offset_table, raw).unwrap_or(0.0);
                state.adjusted_read_cache = raw + offset;
                debug!(sensor = %sensor.name, raw, adjusted = state.adjusted_read_cache, "Sensor value");

                Self::check_alarms(sensor, state, timestamp, now);
                let shutdown = Self::check_range(sensor, state);
                Self::update_target_pwm(sensor, state, self.num_fan_failed > 0, dt);

                if shutdown && !bsp.emergency_state() {
                    if let Err(e) = bsp.emergency_shutdown(&config, true) {
                        error!(sensor = %sensor.name, error = %e, "Emergency shutdown failed");
                    }
                }
            }

            let clamped = state
                .target_pwm_cache
                .clamp(config.pwm_lower_threshold, config.pwm_upper_threshold);
            state.target_pwm_cache = clamped;
            info!(sensor = %sensor.name, pwm = clamped, "Sensor target PWM");
        }
    }

    fn check_alarms(sensor: &SensorConfig, state: &mut SensorRuntimeState, timestamp: u64, now: u64) {
        let Some(alarm) = &sensor.alarm else {
            return;
        };
        let value = state.adjusted_read_cache;

        let prev_major = state.major_alarm_triggered;
        state.major_alarm_triggered = value >= alarm.high_major;
        if !prev_major && state.major_alarm_triggered {
            error!(sensor = %sensor.name, value, "Major alarm triggered");
        } else if prev_major && !state.major_alarm_triggered {
            warn!(sensor = %sensor.name, value, "Major alarm cleared");
        }

        let prev_minor = state.minor_alarm_triggered;
        if value >= alarm.high_minor {
            if !state.soak_started && !state.minor_alarm_triggered {
                state.soak_started = true;
                state.soak_started_at = timestamp;
            }
            if state.soak_started
                && now.saturating_sub(state.soak_started_at) >= alarm.minor_soak_secs
            {
                state.minor_alarm_triggered = true;
                state.soak_started = false;
            }
        } else {
            state.minor_alarm_triggered = false;
            state.soak_started = false;
        }
        if !prev_minor && state.minor_alarm_triggered {
            warn!(sensor = %sensor.name, value, "Minor alarm triggered");
        } else if prev_minor && !state.minor_alarm_triggered {
            warn!(sensor = %sensor.name, value, "Minor alarm cleared");
        }
    }

    /// True when the configured shutdown action is due
    fn check_range(sensor: &SensorConfig, state: &mut SensorRuntimeState) -> bool {
        let Some(range) = &sensor.range_check else {
            return false;
        };
        let value = state.adjusted_read_cache;
        if value >= range.range_low && value <= range.range_high {
            state.invalid_range_count = 0;
            return false;
        }
        state.invalid_range_count += 1;
        if state.invalid_range_count < range.tolerance {
            return false;
        }
        if state.invalid_range_count == range.tolerance.max(1) {
            error!(
                sensor = %sensor.name,
                value,
                low = range.range_low,
                high = range.range_high,
                "Sensor out of range for too long"
            );
        }
        range.action == RangeCheckAction::Shutdown
    }

    fn update_target_pwm(
        sensor: &SensorConfig,
        state: &mut SensorRuntimeState,
        dead_fan_exists: bool,
        dt: u64,
    ) {
        let value = state.adjusted_read_cache;
        match sensor.calculation_type {
            CalculationType::FourLinearTable => {
                let accelerate = state.previous_sensor_read == 0.0 || value > state.previous_sensor_read;
                let curves = &sensor.four_curves;
                let table = match (accelerate, dead_fan_exists) {
                    (true, false) => &curves.normal_up,
                    (false, false) => &curves.normal_down,
                    (true, true) => &curves.fail_up,
                    (false, true) => &curves.fail_down,
                };
                if let Some(mut pwm) = table_lookup(table, value) {
                    if accelerate {
                        pwm = pwm.max(state.target_pwm_cache);
                    } else {
                        pwm = pwm.min(state.target_pwm_cache);
                    }
                    state.target_pwm_cache = pwm;
                }
                state.previous_sensor_read = value;
                debug!(sensor = %sensor.name, value, accelerate, pwm = state.target_pwm_cache, "[4CUV]");
            }
            CalculationType::IncrementPid => {
                let pid = &sensor.pid;
                let pwm = state.previous_target_pwm
                    + pid.kp * (value - state.previous_read1)
                    + pid.ki * (value - pid.set_point)
                    + pid.kd * (value - 2.0 * state.previous_read1 + state.previous_read2);
                state.previous_target_pwm = pwm;
                state.target_pwm_cache = pwm;
                state.previous_read2 = state.previous_read1;
                state.previous_read1 = value;
                debug!(sensor = %sensor.name, value, pwm, "[IPID]");
            }
            CalculationType::Pid => {
                let pid = &sensor.pid;
                let (min_val, max_val) = (pid.min_val(), pid.max_val());
                if value < min_val {
                    state.integral = 0.0;
                    state.previous_target_pwm = 0.0;
                }
                if value > max_val {
                    let error = max_val - value;
                    state.integral += error * dt as f32;
                    let derivative = (error - state.last_error) / dt as f32;
                    let pwm = pid.kp * error + pid.ki * state.integral + pid.kd * derivative;
                    state.target_pwm_cache = pwm;
                    state.previous_target_pwm = pwm;
                    state.last_error = error;
                }
                state.previous_read2 = state.previous_read1;
                state.previous_read1 = value;
                debug!(sensor = %sensor.name, value, dt, min_val, max_val, pwm = state.target_pwm_cache, "[PID]");
            }
            CalculationType::Disable => {}
        }
    }

    // ------------------------------------------------------------------------
    // Optics
    // ------------------------------------------------------------------------

    fn get_optics_update(&mut self, sensor_data: &mut SensorData) {
        for optic in &self.config.optics {
            let Ok(entry) = sensor_data.get_optic_entry_mut(&optic.name) else {
                continue;
            };
            if entry.data.is_empty() {
                continue;
            }
            let pwm = entry
                .data
                .iter()
                .filter_map(|(table_type, value)| {
                    optic
                        .table(*table_type)
                        .and_then(|table| table_lookup(table, *value))
                })
                .fold(0.0_f32, f32::max);
            entry.calculated_pwm = pwm as i32;
            entry.data.clear();
            entry.data_process_timestamp = entry.last_optics_update_time_sec;
            info!(optic = %optic.name, pwm = entry.calculated_pwm, "Optics target PWM");
        }
    }

    // ------------------------------------------------------------------------
    // Boost, zones and outputs
    // ------------------------------------------------------------------------

    fn evaluate_boost(&self, now: u64, sensor_data: &SensorData) -> bool {
        let config = &self.config;
        let dead_fans = config.pwm_boost_on_dead_fan != 0
            && self.num_fan_failed >= config.pwm_boost_on_dead_fan;
        let dead_sensors = config.pwm_boost_on_dead_sensor != 0
            && self.num_sensor_failed >= config.pwm_boost_on_dead_sensor;
        let since_optics = now.saturating_sub(sensor_data.get_last_qsfp_svc_time());
        let stale_optics = config.pwm_boost_no_qsfp_after_secs != 0
            && since_optics >= config.pwm_boost_no_qsfp_after_secs;
        if stale_optics {
            info!(since_optics, "No optics update, boosting");
        }
        dead_fans || dead_sensors || stale_optics
    }

    fn calculate_zone_pwm(&mut self, zone: &Zone, sensor_data: &SensorData) -> f32 {
        let mut so_far: Option<f32> = None;
        let mut sum = 0.0;
        let mut considered = 0u32;
        for name in &zone.sensor_names {
            let pwm = if self.config.is_sensor_present_in_config(name) {
                self.sensor_states
                    .get(name)
                    .map(|s| s.target_pwm_cache)
                    .unwrap_or_default()
            } else if let Ok(pwm) = sensor_data.get_optics_pwm(name) {
                pwm as f32
            } else {
                continue;
            };
            considered += 1;
            sum += pwm;
            so_far = Some(match (zone.zone_type, so_far) {
                (_, None) => pwm,
                (ZoneType::Max, Some(current)) => current.max(pwm),
                (ZoneType::Min, Some(current)) => current.min(pwm),
                (ZoneType::Avg, Some(current)) => current,
            });
            debug!(zone = %zone.name, member = %name, pwm, "Zone member");
        }

        let mut zone_pwm = match zone.zone_type {
            ZoneType::Avg if considered > 0 => sum / considered as f32,
            ZoneType::Avg => 0.0,
            _ => so_far.unwrap_or(0.0),
        };
        if self.boost_mode && zone_pwm < self.config.pwm_boost_value {
            zone_pwm = self.config.pwm_boost_value;
        }

        for name in &zone.sensor_names {
            if let Some(state) = self.sensor_states.get_mut(name) {
                state.previous_target_pwm = zone_pwm;
            }
        }
        info!(zone = %zone.name, pwm = zone_pwm, boost = self.boost_mode, "Zone PWM");
        zone_pwm
    }

    fn write_fan_pwm(bsp: &mut dyn Bsp, fan: &FanConfig, raw: i32) -> bool {
        match fan.pwm.access_type {
            AccessType::Sysfs => bsp.set_fan_pwm_sysfs(&fan.pwm.path, raw),
            AccessType::Util => bsp.set_fan_pwm_shell(&fan.pwm.path, &fan.name, raw),
            access => {
                let e = FanServiceError::unsupported(access, "fan PWM write");
                error!(fan = %fan.name, error = %e, "Cannot program fan");
                false
            }
        }
    }

    /// Slew toward `target`, write it, and record the outcome
    fn program_fan(&mut self, bsp: &mut dyn Bsp, zone: &Zone, fan: &FanConfig, target: f32) {
        let now = bsp.current_time();
        let status = self
            .fan_statuses
            .entry(fan.name.clone())
            .or_insert_with(|| FanStatus::new(now));
        let pwm = slew_pwm(status.current_pwm, target, zone.slope);
        let raw = percent_to_raw(fan, pwm);
        let written = Self::write_fan_pwm(bsp, fan, raw);
        status.current_pwm = pwm;
        info!(fan = %fan.name, zone = %zone.name, percent = pwm, raw, written, "Programmed fan");

        if !written {
            if !status.fan_failed {
                error!(fan = %fan.name, "PWM write failed, marking fan failed");
            }
            status.fan_failed = true;
            *self
                .counters
                .entry(counters::fan_write_failure(&zone.name, &fan.name))
                .or_insert(0) += 1;
        }
    }

    fn adjust_zone_fans(&mut self, bsp: &mut dyn Bsp, sensor_data: &SensorData) {
        let config = Arc::clone(&self.config);
        for zone in &config.zones {
            let zone_pwm = self.calculate_zone_pwm(zone, sensor_data);
            for fan in config.fans.iter().filter(|f| zone.fan_names.contains(&f.name)) {
                self.program_fan(bsp, zone, fan, zone_pwm);
            }
        }
    }

    fn program_led(bsp: &mut dyn Bsp, fan: &FanConfig, failed: bool) -> bool {
        let value = (if failed {
            fan.fan_fail_led_val
        } else {
            fan.fan_good_led_val
        }) as i32;
        let written = match fan.led.access_type {
            AccessType::Sysfs => bsp.set_fan_led_sysfs(&fan.led.path, value),
            AccessType::Util => bsp.set_fan_led_shell(&fan.led.path, &fan.name, value),
            access => {
                let e = FanServiceError::unsupported(access, "fan LED write");
                error!(fan = %fan.name, error = %e, "Cannot program LED");
                false
            }
        };
        info!(fan = %fan.name, failed, value, written, "Set fan LED");
        written
    }

    /// Write LEDs whose fail state changed, plus any never written before
    fn set_fan_fail_state(&mut self, bsp: &mut dyn Bsp) {
        let config = Arc::clone(&self.config);
        for fan in &config.fans {
            if fan.led.access_type == AccessType::Invalid {
                continue;
            }
            let Some(status) = self.fan_statuses.get_mut(&fan.name) else {
                continue;
            };
            if !status.first_time_led_access && status.led_failed == status.fan_failed {
                continue;
            }
            if Self::program_led(bsp, fan, status.fan_failed) {
                status.first_time_led_access = false;
                status.led_failed = status.fan_failed;
            }
        }
    }

    /// Drive every zoned fan to the transition PWM before regular control starts
    pub fn set_transition_value(&mut self, bsp: &mut dyn Bsp) {
        let config = Arc::clone(&self.config);
        let transition = config.pwm_transition_value;
        info!(pwm = transition, "Setting transition PWM");
        for zone in &config.zones {
            for name in &zone.sensor_names {
                if let Some(state) = self.sensor_states.get_mut(name) {
                    state.previous_target_pwm = transition;
                }
            }
            for fan in config.fans.iter().filter(|f| zone.fan_names.contains(&f.name)) {
                self.program_fan(bsp, zone, fan, transition);
            }
        }
        self.set_fan_fail_state(bsp);
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Snapshot of every fan's status, ordered by name
    pub fn fan_statuses(&self) -> BTreeMap<String, FanStatus> {
        self.fan_statuses
            .iter()
            .map(|(name, status)| (name.clone(), status.clone()))
            .collect()
    }

    pub fn fan_status(&self, name: &str) -> Option<&FanStatus> {
        self.fan_statuses.get(name)
    }

    pub fn sensor_state(&self, name: &str) -> Option<&SensorRuntimeState> {
        self.sensor_states.get(name)
    }

    pub fn boost_mode(&self) -> bool {
        self.boost_mode
    }

    pub fn num_fan_failed(&self) -> u32 {
        self.num_fan_failed
    }

    pub fn num_sensor_failed(&self) -> u32 {
        self.num_sensor_failed
    }

    pub fn counters(&self) -> &HashMap<String, u64> {
        &self.counters
    }
}
