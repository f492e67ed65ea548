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

//! fan-service: closed-loop fan control for switch platforms
//!
//! Sensor and transceiver temperatures are turned into per-zone PWM targets
//! by table, PID or incremental PID policies, slewed, and written to the fan
//! controllers. Fan and sensor health drive boost mode, fan LEDs and, as a
//! last resort, an emergency shutdown.

pub mod bsp;
pub mod config;
pub mod constants;
pub mod control_logic;
pub mod logger;
pub mod mokujin;
pub mod sensor_data;
pub mod service;
pub mod sysfs;

#[cfg(test)]
mod test_utils;

pub use bsp::{make_bsp, Bsp, BspOptions, GenericBsp};
pub use config::ServiceConfig;
pub use control_logic::{ControlLogic, FanStatus};
pub use fan_error::{FanServiceError, Result};
pub use mokujin::MokujinBsp;
pub use sensor_data::SensorData;
pub use service::FanService;
