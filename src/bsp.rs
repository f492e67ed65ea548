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

//! Board support proxy
//!
//! The [`Bsp`] trait is the only path from the control engine to hardware:
//! sensor and optics ingestion, PWM/LED writes, the emergency shutdown hook
//! and the clock. [`GenericBsp`] talks to sysfs, shell utilities and the
//! sensor/qsfp services; [`crate::mokujin::MokujinBsp`] replays a recorded
//! timeline instead.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, warn};

use fan_error::{FanServiceError, Result};

use crate::config::{AccessType, BspType, ServiceConfig};
use crate::constants::{rpc, PRESENCE_KEY_SUFFIX};
use crate::mokujin::MokujinBsp;
use crate::sensor_data::{OpticTableType, SensorData};
use crate::sysfs;

/// One value returned by the sensor service
#[derive(Clone, Debug, PartialEq)]
pub struct SensorReading {
    pub name: String,
    pub value: f32,
    pub timestamp: u64,
}

/// One transceiver temperature returned by the qsfp service
#[derive(Clone, Debug, PartialEq)]
pub struct OpticReading {
    pub optic: String,
    pub table: OpticTableType,
    pub value: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RpcTimeouts {
    pub connect: Duration,
    pub send: Duration,
}

impl Default for RpcTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(rpc::CONNECT_TIMEOUT_MS),
            send: Duration::from_millis(rpc::SEND_TIMEOUT_MS),
        }
    }
}

/// Bulk sensor reads from the platform sensor service
pub trait SensorServiceClient: Send {
    fn get_sensor_values(
        &mut self,
        names: &[String],
        timeouts: &RpcTimeouts,
    ) -> Result<Vec<SensorReading>>;
}

/// Transceiver temperatures from the qsfp service
pub trait QsfpServiceClient: Send {
    fn get_optic_readings(&mut self, timeouts: &RpcTimeouts) -> Result<Vec<OpticReading>>;
}

/// Hardware access used by the control engine
#[cfg_attr(test, mockall::automock)]
pub trait Bsp: Send {
    /// Fetch every configured sensor into `sensor_data`; read failures are logged and skipped
    fn get_sensor_data(&mut self, config: &ServiceConfig, sensor_data: &mut SensorData);

    /// Fetch transceiver temperatures into per-optic entries
    fn get_optics_data(&mut self, config: &ServiceConfig, sensor_data: &mut SensorData);

    fn check_if_initial_sensor_data_read(&self) -> bool;

    fn read_sysfs(&self, path: &str) -> Result<f32>;

    fn write_sysfs(&mut self, path: &str, value: i32) -> bool;

    fn set_fan_pwm_sysfs(&mut self, path: &str, pwm: i32) -> bool;

    fn set_fan_pwm_shell(&mut self, command: &str, fan_name: &str, pwm: i32) -> bool;

    fn set_fan_led_sysfs(&mut self, path: &str, value: i32) -> bool;

    fn set_fan_led_shell(&mut self, command: &str, fan_name: &str, value: i32) -> bool;

    /// Run the shutdown command on a false to true transition only
    fn emergency_shutdown(&mut self, config: &ServiceConfig, enable: bool) -> Result<()>;

    fn emergency_state(&self) -> bool;

    /// Wall clock in seconds
    fn current_time(&self) -> u64;
}

/// Options consumed by [`make_bsp`]
#[derive(Clone, Debug, Default)]
pub struct BspOptions {
    /// Timeline file for the mokujin simulator
    pub mock_input: Option<PathBuf>,
}

/// Build the board support implementation selected by the config
pub fn make_bsp(config: &ServiceConfig, options: &BspOptions) -> Result<Box<dyn Bsp>> {
    info!(bsp = config.bsp_type.keyword(), "Creating board support proxy");
    match config.bsp_type {
        BspType::Mokujin => {
            let path = options.mock_input.as_deref().ok_or_else(|| {
                FanServiceError::config("mokujin BSP requires a mock input timeline")
            })?;
            Ok(Box::new(MokujinBsp::from_file(path)?))
        }
        bsp_type => Ok(Box::new(GenericBsp::new(bsp_type))),
    }
}

/// Sensor-data key a fan's Thrift RPM reading is stored under
pub fn fan_rpm_key(fan_name: &str, path: &str) -> String {
    if path.is_empty() {
        fan_name.to_string()
    } else {
        path.to_string()
    }
}

/// Sensor-data key a fan's Thrift presence reading is stored under
pub fn fan_presence_key(fan_name: &str, path: &str) -> String {
    if path.is_empty() {
        format!("{}{}", fan_name, PRESENCE_KEY_SUFFIX)
    } else {
        path.to_string()
    }
}

/// Names the sensor service must be asked for: Thrift sensors plus Thrift fan RPM/presence keys
pub(crate) fn thrift_sensor_names(config: &ServiceConfig) -> Vec<String> {
    let mut names: Vec<String> = config
        .sensors
        .iter()
        .filter(|s| s.access.access_type == AccessType::Thrift)
        .map(|s| s.name.clone())
        .collect();
    for fan in &config.fans {
        if fan.rpm.access_type == AccessType::Thrift {
            names.push(fan_rpm_key(&fan.name, &fan.rpm.path));
        }
        if fan.presence.access_type == AccessType::Thrift {
            names.push(fan_presence_key(&fan.name, &fan.presence.path));
        }
    }
    names
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Board support for real platforms
///
/// Darwin, Lassen and Minipack3 share the generic access paths; the BSP type
/// is kept for logging.
pub struct GenericBsp {
    bsp_type: BspType,
    sensor_client: Option<Box<dyn SensorServiceClient>>,
    qsfp_client: Option<Box<dyn QsfpServiceClient>>,
    timeouts: RpcTimeouts,
    initial_sensor_data_read: bool,
    emergency_state: bool,
}

impl GenericBsp {
    pub fn new(bsp_type: BspType) -> Self {
        Self {
            bsp_type,
            sensor_client: None,
            qsfp_client: None,
            timeouts: RpcTimeouts::default(),
            initial_sensor_data_read: false,
            emergency_state: false,
        }
    }

    pub fn with_sensor_client(mut self, client: Box<dyn SensorServiceClient>) -> Self {
        self.sensor_client = Some(client);
        self
    }

    pub fn with_qsfp_client(mut self, client: Box<dyn QsfpServiceClient>) -> Self {
        self.qsfp_client = Some(client);
        self
    }

    pub fn with_timeouts(mut self, timeouts: RpcTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn bsp_type(&self) -> BspType {
        self.bsp_type
    }

    fn fetch_thrift_sensors(&mut self, config: &ServiceConfig, sensor_data: &mut SensorData) {
        let names = thrift_sensor_names(config);
        if names.is_empty() {
            return;
        }
        let Some(client) = self.sensor_client.as_mut() else {
            warn!(count = names.len(), "No sensor service client, skipping thrift sensors");
            return;
        };
        match client.get_sensor_values(&names, &self.timeouts) {
            Ok(readings) => {
                debug!(count = readings.len(), "Received sensor service readings");
                for reading in readings {
                    sensor_data.update_entry_float(&reading.name, reading.value, reading.timestamp);
                }
            }
            Err(e) => warn!(error = %e, "Sensor service fetch failed, keeping cached data"),
        }
    }

    fn fetch_util_sensors(&mut self, config: &ServiceConfig, sensor_data: &mut SensorData) {
        let now = self.current_time();
        for sensor in config
            .sensors
            .iter()
            .filter(|s| s.access.access_type == AccessType::Util)
        {
            match sysfs::read_shell_value(&sensor.access.path) {
                Ok(value) => sensor_data.update_entry_float(&sensor.name, value, now),
                Err(e) => warn!(sensor = %sensor.name, error = %e, "Util sensor read failed"),
            }
        }
    }
}

impl Bsp for GenericBsp {
    fn get_sensor_data(&mut self, config: &ServiceConfig, sensor_data: &mut SensorData) {
        let now = self.current_time();
        let mut has_util = false;
        for sensor in &config.sensors {
            match sensor.access.access_type {
                AccessType::Sysfs => match self.read_sysfs(&sensor.access.path) {
                    Ok(value) => sensor_data.update_entry_float(&sensor.name, value, now),
                    Err(e) => {
                        warn!(sensor = %sensor.name, error = %e, "Sysfs sensor read failed")
                    }
                },
                AccessType::Util => has_util = true,
                AccessType::Thrift => {}
                access @ (AccessType::Rest | AccessType::Invalid) => {
                    let e = FanServiceError::unsupported(access, "sensor read");
                    warn!(sensor = %sensor.name, error = %e, "Skipping sensor");
                }
            }
        }
        self.fetch_thrift_sensors(config, sensor_data);
        if has_util {
            self.fetch_util_sensors(config, sensor_data);
        }
        self.initial_sensor_data_read = true;
    }

    fn get_optics_data(&mut self, config: &ServiceConfig, sensor_data: &mut SensorData) {
        if config.optics.is_empty() {
            return;
        }
        for optic in &config.optics {
            if optic.access.access_type != AccessType::Thrift {
                let e = FanServiceError::unsupported(optic.access.access_type, "optics read");
                warn!(optic = %optic.name, error = %e, "Skipping optic");
            }
        }
        let Some(client) = self.qsfp_client.as_mut() else {
            debug!("No qsfp service client, optics data not refreshed");
            return;
        };
        let readings = match client.get_optic_readings(&self.timeouts) {
            Ok(readings) => readings,
            Err(e) => {
                warn!(error = %e, "Qsfp service fetch failed");
                return;
            }
        };
        let now = self.current_time();
        store_optic_readings(config, sensor_data, readings, now);
    }

    fn check_if_initial_sensor_data_read(&self) -> bool {
        self.initial_sensor_data_read
    }

    fn read_sysfs(&self, path: &str) -> Result<f32> {
        sysfs::read_value(Path::new(path))
    }

    fn write_sysfs(&mut self, path: &str, value: i32) -> bool {
        match sysfs::write_value(Path::new(path), value) {
            Ok(()) => true,
            Err(e) => {
                warn!(path, value, error = %e, "Sysfs write failed");
                false
            }
        }
    }

    fn set_fan_pwm_sysfs(&mut self, path: &str, pwm: i32) -> bool {
        self.write_sysfs(path, pwm)
    }

    fn set_fan_pwm_shell(&mut self, command: &str, fan_name: &str, pwm: i32) -> bool {
        run_template(command, fan_name, pwm)
    }

    fn set_fan_led_sysfs(&mut self, path: &str, value: i32) -> bool {
        self.write_sysfs(path, value)
    }

    fn set_fan_led_shell(&mut self, command: &str, fan_name: &str, value: i32) -> bool {
        run_template(command, fan_name, value)
    }

    fn emergency_shutdown(&mut self, config: &ServiceConfig, enable: bool) -> Result<()> {
        transition_emergency_state(&mut self.emergency_state, config, enable, |cmd| {
            sysfs::run_shell(cmd).map(|_| ())
        })
    }

    fn emergency_state(&self) -> bool {
        self.emergency_state
    }

    fn current_time(&self) -> u64 {
        now_secs()
    }
}

fn run_template(template: &str, fan_name: &str, value: i32) -> bool {
    let command = sysfs::expand_template(template, fan_name, value);
    match sysfs::run_shell(&command) {
        Ok(_) => true,
        Err(e) => {
            warn!(fan = fan_name, error = %e, "Shell write failed");
            false
        }
    }
}

/// Group optic readings by configured optic and store them
pub(crate) fn store_optic_readings(
    config: &ServiceConfig,
    sensor_data: &mut SensorData,
    readings: Vec<OpticReading>,
    now: u64,
) {
    let mut grouped: HashMap<String, Vec<(OpticTableType, f32)>> = HashMap::new();
    for reading in readings {
        if config.optic(&reading.optic).is_none() {
            debug!(optic = %reading.optic, "Ignoring reading for unconfigured optic");
            continue;
        }
        grouped
            .entry(reading.optic)
            .or_default()
            .push((reading.table, reading.value));
    }
    for optic in &config.optics {
        if let Some(data) = grouped.remove(&optic.name) {
            sensor_data.set_optic_entry(&optic.name, data, now);
        }
    }
    sensor_data.set_last_qsfp_svc_time(now);
}

/// Shared false to true gate around the shutdown command
pub(crate) fn transition_emergency_state<F>(
    state: &mut bool,
    config: &ServiceConfig,
    enable: bool,
    run: F,
) -> Result<()>
where
    F: FnOnce(&str) -> Result<()>,
{
    if !enable {
        if *state {
            info!("Emergency state cleared");
        }
        *state = false;
        return Ok(());
    }
    let command = config
        .shutdown_command
        .as_deref()
        .ok_or(FanServiceError::NoShutdownCommand)?;
    if *state {
        debug!("Emergency shutdown already performed");
        return Ok(());
    }
    error!(command, "Executing emergency shutdown");
    *state = true;
    run(command)
}
