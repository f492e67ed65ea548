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

//! Mokujin: timeline-driven simulated board
//!
//! Sensor, sysfs and optics values come from a recorded event timeline and a
//! simulated clock. Every write lands in a journal instead of the hardware,
//! so control decisions can be replayed and inspected deterministically.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fan_error::{FanServiceError, Result};

use crate::bsp::{store_optic_readings, thrift_sensor_names, transition_emergency_state, Bsp, OpticReading};
use crate::config::{AccessType, ServiceConfig};
use crate::sensor_data::{OpticTableType, SensorData};
use crate::sysfs;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimelineEvent {
    Sensor { time: u64, name: String, value: f32 },
    Sysfs { time: u64, path: String, value: f32 },
    Optic {
        time: u64,
        name: String,
        table: OpticTableType,
        value: f32,
    },
    /// No optics are delivered from this point on
    QsfpDown { time: u64 },
}

impl TimelineEvent {
    pub fn time(&self) -> u64 {
        match self {
            TimelineEvent::Sensor { time, .. }
            | TimelineEvent::Sysfs { time, .. }
            | TimelineEvent::Optic { time, .. }
            | TimelineEvent::QsfpDown { time } => *time,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub start_time: u64,
    #[serde(default)]
    pub events: Vec<TimelineEvent>,
}

impl Timeline {
    pub fn parse(contents: &str) -> Result<Self> {
        let mut timeline: Timeline = serde_json::from_str(contents)?;
        // Stable sort keeps document order between events at the same second
        timeline.events.sort_by_key(TimelineEvent::time);
        Ok(timeline)
    }

    /// Newest sensor value for `name` at or before `now`
    fn sensor_at(&self, name: &str, now: u64) -> Option<(f32, u64)> {
        self.events
            .iter()
            .take_while(|e| e.time() <= now)
            .filter_map(|e| match e {
                TimelineEvent::Sensor { time, name: n, value } if n == name => Some((*value, *time)),
                _ => None,
            })
            .last()
    }

    fn sysfs_at(&self, path: &str, now: u64) -> Option<f32> {
        self.events
            .iter()
            .take_while(|e| e.time() <= now)
            .filter_map(|e| match e {
                TimelineEvent::Sysfs { path: p, value, .. } if p == path => Some(*value),
                _ => None,
            })
            .last()
    }

    fn qsfp_down_at(&self, now: u64) -> bool {
        self.events
            .iter()
            .take_while(|e| e.time() <= now)
            .any(|e| matches!(e, TimelineEvent::QsfpDown { .. }))
    }

    /// Newest value per (optic, table) at or before `now`
    fn optics_at(&self, now: u64) -> Vec<OpticReading> {
        let mut latest: HashMap<(String, OpticTableType), f32> = HashMap::new();
        let mut order = Vec::new();
        for event in self.events.iter().take_while(|e| e.time() <= now) {
            if let TimelineEvent::Optic { name, table, value, .. } = event {
                let key = (name.clone(), *table);
                if latest.insert(key.clone(), *value).is_none() {
                    order.push(key);
                }
            }
        }
        order
            .into_iter()
            .filter_map(|key| {
                latest.get(&key).map(|value| OpticReading {
                    optic: key.0.clone(),
                    table: key.1,
                    value: *value,
                })
            })
            .collect()
    }
}

/// Simulated wall clock, shared between the board and its driver
#[derive(Clone, Debug, Default)]
pub struct SimClock(Arc<AtomicU64>);

impl SimClock {
    pub fn new(start: u64) -> Self {
        Self(Arc::new(AtomicU64::new(start)))
    }

    pub fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set_time(&self, time: u64) {
        self.0.store(time, Ordering::SeqCst);
    }
}

/// A write the control engine attempted against the simulated board
#[derive(Clone, Debug, PartialEq)]
pub enum JournalEntry {
    Pwm { target: String, value: i32, time: u64 },
    Led { target: String, value: i32, time: u64 },
    Sysfs { path: String, value: i32, time: u64 },
    Shutdown { command: String, time: u64 },
}

#[derive(Clone, Debug, Default)]
pub struct Journal(Arc<Mutex<Vec<JournalEntry>>>);

impl Journal {
    fn push(&self, entry: JournalEntry) {
        if let Ok(mut entries) = self.0.lock() {
            entries.push(entry);
        }
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.0.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Last PWM value written to `target`
    pub fn last_pwm(&self, target: &str) -> Option<i32> {
        self.entries().into_iter().rev().find_map(|e| match e {
            JournalEntry::Pwm { target: t, value, .. } if t == target => Some(value),
            _ => None,
        })
    }

    pub fn led_writes(&self, target: &str) -> Vec<i32> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                JournalEntry::Led { target: t, value, .. } if t == target => Some(value),
                _ => None,
            })
            .collect()
    }

    pub fn shutdown_count(&self) -> usize {
        self.entries()
            .iter()
            .filter(|e| matches!(e, JournalEntry::Shutdown { .. }))
            .count()
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.0.lock() {
            entries.clear();
        }
    }
}

pub struct MokujinBsp {
    timeline: Timeline,
    clock: SimClock,
    journal: Journal,
    initial_sensor_data_read: bool,
    emergency_state: bool,
}

impl MokujinBsp {
    pub fn new(timeline: Timeline) -> Self {
        let clock = SimClock::new(timeline.start_time);
        info!(
            start_time = timeline.start_time,
            events = timeline.events.len(),
            "Mokujin timeline loaded"
        );
        Self {
            timeline,
            clock,
            journal: Journal::default(),
            initial_sensor_data_read: false,
            emergency_state: false,
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| FanServiceError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(Self::new(Timeline::parse(&contents)?))
    }

    pub fn clock(&self) -> SimClock {
        self.clock.clone()
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    fn record_pwm(&self, target: &str, value: i32) -> bool {
        self.journal.push(JournalEntry::Pwm {
            target: target.to_string(),
            value,
            time: self.clock.now(),
        });
        true
    }

    fn record_led(&self, target: &str, value: i32) -> bool {
        self.journal.push(JournalEntry::Led {
            target: target.to_string(),
            value,
            time: self.clock.now(),
        });
        true
    }
}

impl Bsp for MokujinBsp {
    fn get_sensor_data(&mut self, config: &ServiceConfig, sensor_data: &mut SensorData) {
        let now = self.clock.now();
        let mut names: Vec<String> = config.sensors.iter().map(|s| s.name.clone()).collect();
        names.extend(
            thrift_sensor_names(config)
                .into_iter()
                .filter(|n| config.sensor(n).is_none()),
        );
        for name in &names {
            if let Some((value, time)) = self.timeline.sensor_at(name, now) {
                sensor_data.update_entry_float(name, value, time);
                continue;
            }
            let sysfs_value = config
                .sensor(name)
                .filter(|s| s.access.access_type == AccessType::Sysfs)
                .and_then(|s| self.timeline.sysfs_at(&s.access.path, now));
            match sysfs_value {
                Some(value) => sensor_data.update_entry_float(name, value, now),
                None => debug!(sensor = %name, now, "No simulated data yet"),
            }
        }
        self.initial_sensor_data_read = true;
    }

    fn get_optics_data(&mut self, config: &ServiceConfig, sensor_data: &mut SensorData) {
        let now = self.clock.now();
        if self.timeline.qsfp_down_at(now) {
            debug!(now, "Simulated qsfp service is down");
            return;
        }
        let readings = self.timeline.optics_at(now);
        if readings.is_empty() {
            return;
        }
        store_optic_readings(config, sensor_data, readings, now);
    }

    fn check_if_initial_sensor_data_read(&self) -> bool {
        self.initial_sensor_data_read
    }

    fn read_sysfs(&self, path: &str) -> Result<f32> {
        self.timeline
            .sysfs_at(path, self.clock.now())
            .ok_or_else(|| FanServiceError::not_found(path))
    }

    fn write_sysfs(&mut self, path: &str, value: i32) -> bool {
        self.journal.push(JournalEntry::Sysfs {
            path: path.to_string(),
            value,
            time: self.clock.now(),
        });
        true
    }

    fn set_fan_pwm_sysfs(&mut self, path: &str, pwm: i32) -> bool {
        self.record_pwm(path, pwm)
    }

    fn set_fan_pwm_shell(&mut self, command: &str, fan_name: &str, pwm: i32) -> bool {
        self.record_pwm(&sysfs::expand_template(command, fan_name, pwm), pwm)
    }

    fn set_fan_led_sysfs(&mut self, path: &str, value: i32) -> bool {
        self.record_led(path, value)
    }

    fn set_fan_led_shell(&mut self, command: &str, fan_name: &str, value: i32) -> bool {
        self.record_led(&sysfs::expand_template(command, fan_name, value), value)
    }

    fn emergency_shutdown(&mut self, config: &ServiceConfig, enable: bool) -> Result<()> {
        let journal = self.journal.clone();
        let now = self.clock.now();
        transition_emergency_state(&mut self.emergency_state, config, enable, |command| {
            warn!(command, "Simulated emergency shutdown");
            journal.push(JournalEntry::Shutdown {
                command: command.to_string(),
                time: now,
            });
            Ok(())
        })
    }

    fn emergency_state(&self) -> bool {
        self.emergency_state
    }

    fn current_time(&self) -> u64 {
        self.clock.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccessMethod, OpticConfig, SensorConfig};

    const TIMELINE: &str = r#"{
        "start_time": 1000,
        "events": [
            { "kind": "sensor", "time": 1000, "name": "CPU_TEMP", "value": 40.0 },
            { "kind": "sensor", "time": 1060, "name": "CPU_TEMP", "value": 55.0 },
            { "kind": "sysfs", "time": 1000, "path": "/run/fan1_rpm", "value": 9000 },
            { "kind": "optic", "time": 1000, "name": "qsfp_group_1", "table": "speed_100", "value": 45.0 },
            { "kind": "qsfp_down", "time": 1200 }
        ]
    }"#;

    fn config() -> ServiceConfig {
        ServiceConfig {
            sensors: vec![SensorConfig {
                access: AccessMethod::new(AccessType::Thrift, ""),
                ..SensorConfig::new("CPU_TEMP")
            }],
            optics: vec![OpticConfig {
                name: "qsfp_group_1".into(),
                access: AccessMethod::new(AccessType::Thrift, ""),
                ..OpticConfig::default()
            }],
            shutdown_command: Some("poweroff".into()),
            ..ServiceConfig::default()
        }
    }

    #[test]
    fn test_sensor_replay_follows_clock() {
        let mut bsp = MokujinBsp::new(Timeline::parse(TIMELINE).unwrap());
        let clock = bsp.clock();
        let config = config();
        let mut data = SensorData::new();

        bsp.get_sensor_data(&config, &mut data);
        assert_eq!(data.get_sensor_data_float("CPU_TEMP").unwrap(), 40.0);
        assert_eq!(data.get_last_updated("CPU_TEMP").unwrap(), 1000);

        clock.advance(30);
        bsp.get_sensor_data(&config, &mut data);
        assert_eq!(data.get_last_updated("CPU_TEMP").unwrap(), 1000);

        clock.set_time(1060);
        bsp.get_sensor_data(&config, &mut data);
        assert_eq!(data.get_sensor_data_float("CPU_TEMP").unwrap(), 55.0);
        assert_eq!(bsp.current_time(), 1060);
    }

    #[test]
    fn test_sysfs_replay() {
        let bsp = MokujinBsp::new(Timeline::parse(TIMELINE).unwrap());
        assert_eq!(bsp.read_sysfs("/run/fan1_rpm").unwrap(), 9000.0);
        assert!(matches!(bsp.read_sysfs("/run/other"), Err(FanServiceError::NotFound(_))));
    }

    #[test]
    fn test_optics_until_qsfp_down() {
        let mut bsp = MokujinBsp::new(Timeline::parse(TIMELINE).unwrap());
        let clock = bsp.clock();
        let config = config();
        let mut data = SensorData::new();

        bsp.get_optics_data(&config, &mut data);
        assert_eq!(data.get_last_qsfp_svc_time(), 1000);
        assert_eq!(data.get_optic_entry("qsfp_group_1").unwrap().data.len(), 1);

        clock.set_time(1300);
        bsp.get_optics_data(&config, &mut data);
        assert_eq!(data.get_last_qsfp_svc_time(), 1000);
    }

    #[test]
    fn test_writes_are_journaled() {
        let mut bsp = MokujinBsp::new(Timeline::parse(TIMELINE).unwrap());
        let journal = bsp.journal();
        assert!(bsp.set_fan_pwm_sysfs("/run/fan1_pwm", 128));
        assert!(bsp.set_fan_led_shell("led _NAME_ _VALUE_", "fan_1", 2));
        assert_eq!(journal.last_pwm("/run/fan1_pwm"), Some(128));
        assert_eq!(journal.led_writes("led fan_1 2"), vec![2]);

        let config = config();
        bsp.emergency_shutdown(&config, true).unwrap();
        bsp.emergency_shutdown(&config, true).unwrap();
        assert_eq!(journal.shutdown_count(), 1);
    }

    #[test]
    fn test_bad_timeline() {
        assert!(Timeline::parse(r#"{ "start_time": 1, "events": [{ "kind": "smoke" }] }"#).is_err());
    }
}
