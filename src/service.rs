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

//! Fan service orchestration
//!
//! Owns the board, the control engine and the sensor store, and decides on
//! every check tick whether a sensor fetch or a control cycle is due.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use fan_error::{FanServiceError, Result};

use crate::bsp::{make_bsp, Bsp, BspOptions};
use crate::config::{AccessType, ServiceConfig};
use crate::control_logic::{ControlLogic, FanStatus};
use crate::sensor_data::SensorData;

pub struct FanService {
    config: Arc<ServiceConfig>,
    bsp: Box<dyn Bsp>,
    control_logic: ControlLogic,
    sensor_data: SensorData,
    /// 0 until the first fetch
    last_sensor_fetch_sec: u64,
    /// 0 until the first control cycle
    last_control_sec: u64,
    control_cycles: u64,
}

impl FanService {
    pub fn new(config: ServiceConfig, bsp: Box<dyn Bsp>) -> Self {
        let config = Arc::new(config);
        let control_logic = ControlLogic::new(Arc::clone(&config), bsp.current_time());
        Self {
            config,
            bsp,
            control_logic,
            sensor_data: SensorData::new(),
            last_sensor_fetch_sec: 0,
            last_control_sec: 0,
            control_cycles: 0,
        }
    }

    /// Load the config file and build the board it selects
    pub fn from_config_file(path: &Path, options: &BspOptions) -> Result<Self> {
        let config = ServiceConfig::from_file(path)?;
        let bsp = make_bsp(&config, options)?;
        Ok(Self::new(config, bsp))
    }

    /// First fetch, then park every zoned fan at the transition PWM
    pub fn kickstart(&mut self) {
        info!(
            zones = self.config.zones.len(),
            fans = self.config.fans.len(),
            sensors = self.config.sensors.len(),
            "Kickstarting fan service"
        );
        self.fetch_sensor_data();
        self.set_transition_value();
    }

    fn fetch_sensor_data(&mut self) {
        self.bsp.get_sensor_data(&self.config, &mut self.sensor_data);
        self.bsp.get_optics_data(&self.config, &mut self.sensor_data);
        self.last_sensor_fetch_sec = self.bsp.current_time();
        debug!(entries = self.sensor_data.len(), "Sensor data fetched");
    }

    /// One check tick; returns true when a control cycle ran
    pub fn control_fan(&mut self) -> bool {
        let now = self.bsp.current_time();

        if self.last_sensor_fetch_sec == 0
            || now.saturating_sub(self.last_sensor_fetch_sec) >= self.config.sensor_fetch_frequency_secs
        {
            self.fetch_sensor_data();
        }

        if self.last_control_sec != 0
            && now.saturating_sub(self.last_control_sec) < self.config.control_frequency_secs
        {
            return false;
        }

        self.control_logic
            .update_control(self.bsp.as_mut(), &mut self.sensor_data);
        self.last_control_sec = now;
        self.control_cycles += 1;
        self.pet_watchdog();
        true
    }

    pub fn set_transition_value(&mut self) {
        self.control_logic.set_transition_value(self.bsp.as_mut());
    }

    fn pet_watchdog(&mut self) {
        let Some(watchdog) = &self.config.watchdog else {
            return;
        };
        match watchdog.access.access_type {
            AccessType::Sysfs => {
                if !self.bsp.write_sysfs(&watchdog.access.path, watchdog.value) {
                    warn!(path = %watchdog.access.path, "Failed to pet watchdog");
                }
            }
            access => {
                let e = FanServiceError::unsupported(access, "watchdog");
                warn!(error = %e, "Watchdog not petted");
            }
        }
    }

    pub fn get_fan_statuses(&self) -> BTreeMap<String, FanStatus> {
        self.control_logic.fan_statuses()
    }

    pub fn control_logic(&self) -> &ControlLogic {
        &self.control_logic
    }

    pub fn sensor_data(&self) -> &SensorData {
        &self.sensor_data
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn control_cycles(&self) -> u64 {
        self.control_cycles
    }

    /// Tick `control_fan` every `check_interval` until `shutdown` is raised
    pub async fn run(&mut self, check_interval: Duration, shutdown: Arc<AtomicBool>) {
        info!(interval_ms = check_interval.as_millis() as u64, "Fan control loop starting");
        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if shutdown.load(Ordering::SeqCst) {
                info!(cycles = self.control_cycles, "Fan control loop shutting down");
                break;
            }
            self.control_fan();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mokujin::{JournalEntry, MokujinBsp, Timeline};
    use crate::test_utils::{mokujin_config_json, mokujin_timeline_json};

    fn service() -> (FanService, crate::mokujin::SimClock, crate::mokujin::Journal) {
        let config = ServiceConfig::parse(&mokujin_config_json()).unwrap();
        let bsp = MokujinBsp::new(Timeline::parse(&mokujin_timeline_json()).unwrap());
        let (clock, journal) = (bsp.clock(), bsp.journal());
        (FanService::new(config, Box::new(bsp)), clock, journal)
    }

    #[test]
    fn test_kickstart_sets_transition_value() {
        let (mut service, _clock, journal) = service();
        service.kickstart();
        // transition 50% of a 0..=255 fan
        assert_eq!(journal.last_pwm("/run/fan1_pwm"), Some(127));
        assert_eq!(service.get_fan_statuses()["fan_1"].current_pwm, 50.0);
        assert!(service.sensor_data().check_if_entry_exists("CPU_TEMP"));
    }

    #[test]
    fn test_control_frequency_gating() {
        let (mut service, clock, _journal) = service();
        service.kickstart();

        assert!(service.control_fan());
        clock.advance(10);
        assert!(!service.control_fan());
        clock.advance(20);
        assert!(service.control_fan());
        assert_eq!(service.control_cycles(), 2);
    }

    #[test]
    fn test_watchdog_petted_after_control() {
        let (mut service, _clock, journal) = service();
        service.kickstart();
        service.control_fan();
        let pets = journal
            .entries()
            .into_iter()
            .filter(|e| matches!(e, JournalEntry::Sysfs { path, value: 1, .. } if path == "/run/watchdog"))
            .count();
        assert_eq!(pets, 1);
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let (mut service, _clock, _journal) = service();
        service.kickstart();
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
        });
        service.run(Duration::from_millis(5), shutdown).await;
        assert_eq!(service.control_cycles(), 1);
    }
}
