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

//! Latest sensor and optics readings
//!
//! A name-keyed store refreshed by the board support proxy on every fetch
//! cycle and consumed by the control logic. Each entry carries the time of
//! its last successful read, which is how stale data is detected.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use fan_error::{FanServiceError, Result};

/// Stored representation of a sensor reading
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorEntryType {
    Int,
    Float,
}

impl fmt::Display for SensorEntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorEntryType::Int => write!(f, "Int"),
            SensorEntryType::Float => write!(f, "Float"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum SensorValue {
    Int(i32),
    Float(f32),
}

impl SensorValue {
    pub fn entry_type(&self) -> SensorEntryType {
        match self {
            SensorValue::Int(_) => SensorEntryType::Int,
            SensorValue::Float(_) => SensorEntryType::Float,
        }
    }

    /// Numeric value regardless of representation
    pub fn as_f32(&self) -> f32 {
        match self {
            SensorValue::Int(v) => *v as f32,
            SensorValue::Float(v) => *v,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SensorEntry {
    pub name: String,
    pub value: SensorValue,
    pub timestamp_sec: u64,
}

/// Transceiver class an optics temperature belongs to; selects the table
/// used to translate it to a PWM percentage
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpticTableType {
    #[serde(rename = "speed_100")]
    Speed100,
    #[serde(rename = "speed_200")]
    Speed200,
    #[serde(rename = "speed_400")]
    Speed400,
    #[serde(rename = "speed_800")]
    Speed800,
}

impl OpticTableType {
    pub const ALL: [OpticTableType; 4] = [
        OpticTableType::Speed100,
        OpticTableType::Speed200,
        OpticTableType::Speed400,
        OpticTableType::Speed800,
    ];

    pub fn keyword(&self) -> &'static str {
        match self {
            OpticTableType::Speed100 => "speed_100",
            OpticTableType::Speed200 => "speed_200",
            OpticTableType::Speed400 => "speed_400",
            OpticTableType::Speed800 => "speed_800",
        }
    }

    pub fn from_keyword(keyword: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.keyword() == keyword)
    }
}

impl fmt::Display for OpticTableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Pending readings of one optics group
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OpticEntry {
    pub name: String,
    /// Cleared once consumed by the control logic
    pub data: Vec<(OpticTableType, f32)>,
    pub last_optics_update_time_sec: u64,
    pub data_process_timestamp: u64,
    pub calculated_pwm: i32,
}

#[derive(Debug, Default)]
pub struct SensorData {
    entries: HashMap<String, SensorEntry>,
    optics: HashMap<String, OpticEntry>,
    last_qsfp_svc_time: u64,
}

impl SensorData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_entry_int(&mut self, name: &str, value: i32, timestamp: u64) {
        self.update_entry(name, SensorValue::Int(value), timestamp);
    }

    pub fn update_entry_float(&mut self, name: &str, value: f32, timestamp: u64) {
        self.update_entry(name, SensorValue::Float(value), timestamp);
    }

    fn update_entry(&mut self, name: &str, value: SensorValue, timestamp: u64) {
        self.entries.insert(
            name.to_string(),
            SensorEntry {
                name: name.to_string(),
                value,
                timestamp_sec: timestamp,
            },
        );
    }

    fn entry(&self, name: &str) -> Result<&SensorEntry> {
        self.entries
            .get(name)
            .ok_or_else(|| FanServiceError::not_found(name))
    }

    pub fn get_sensor_data_int(&self, name: &str) -> Result<i32> {
        match self.entry(name)?.value {
            SensorValue::Int(v) => Ok(v),
            SensorValue::Float(_) => Err(FanServiceError::TypeMismatch {
                name: name.to_string(),
                expected: "Int",
            }),
        }
    }

    pub fn get_sensor_data_float(&self, name: &str) -> Result<f32> {
        match self.entry(name)?.value {
            SensorValue::Float(v) => Ok(v),
            SensorValue::Int(_) => Err(FanServiceError::TypeMismatch {
                name: name.to_string(),
                expected: "Float",
            }),
        }
    }

    /// Numeric value of an entry whichever type it was stored as
    pub fn get_sensor_value(&self, name: &str) -> Result<f32> {
        Ok(self.entry(name)?.value.as_f32())
    }

    /// Stored type of an entry. Unlike the float accessor this never
    /// rejects an Int entry.
    pub fn get_sensor_entry_type(&self, name: &str) -> Result<SensorEntryType> {
        Ok(self.entry(name)?.value.entry_type())
    }

    pub fn check_if_entry_exists(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn check_if_optic_entry_exists(&self, name: &str) -> bool {
        self.optics.contains_key(name)
    }

    pub fn get_last_updated(&self, name: &str) -> Result<u64> {
        Ok(self.entry(name)?.timestamp_sec)
    }

    /// Only meant for tests and replay tooling
    pub fn remove_entry(&mut self, name: &str) -> Option<SensorEntry> {
        self.entries.remove(name)
    }

    pub fn set_optic_entry(&mut self, name: &str, data: Vec<(OpticTableType, f32)>, timestamp: u64) {
        let entry = self
            .optics
            .entry(name.to_string())
            .or_insert_with(|| OpticEntry {
                name: name.to_string(),
                ..OpticEntry::default()
            });
        entry.data = data;
        entry.last_optics_update_time_sec = timestamp;
        entry.calculated_pwm = 0;
    }

    pub fn get_optic_entry(&self, name: &str) -> Result<&OpticEntry> {
        self.optics
            .get(name)
            .ok_or_else(|| FanServiceError::not_found(name))
    }

    pub fn get_optic_entry_mut(&mut self, name: &str) -> Result<&mut OpticEntry> {
        self.optics
            .get_mut(name)
            .ok_or_else(|| FanServiceError::not_found(name))
    }

    pub fn get_optics_pwm(&self, name: &str) -> Result<i32> {
        Ok(self.get_optic_entry(name)?.calculated_pwm)
    }

    pub fn set_optics_pwm(&mut self, name: &str, pwm: i32) -> Result<()> {
        self.get_optic_entry_mut(name)?.calculated_pwm = pwm;
        Ok(())
    }

    pub fn set_last_qsfp_svc_time(&mut self, timestamp: u64) {
        self.last_qsfp_svc_time = timestamp;
    }

    pub fn get_last_qsfp_svc_time(&self) -> u64 {
        self.last_qsfp_svc_time
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
