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

//! Logging setup
//!
//! Logs go to the systemd journal when its socket is present, otherwise to
//! stdout through a `fmt` subscriber. The filter comes from the command line,
//! then `FAN_SERVICE_LOG`, then defaults to `info`.

use std::path::Path;

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "FAN_SERVICE_LOG";
pub const DEFAULT_LOG_LEVEL: &str = "info";
const JOURNALD_SOCKET: &str = "/run/systemd/journal/socket";

/// Where log records end up
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogTarget {
    Journald,
    Stdout,
}

impl LogTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogTarget::Journald => "systemd journal",
            LogTarget::Stdout => "stdout",
        }
    }
}

/// Filter directive in effect: explicit level, then environment, then default
pub fn resolve_log_level(explicit: Option<&str>) -> String {
    if let Some(level) = explicit.filter(|l| !l.is_empty()) {
        return level.to_string();
    }
    std::env::var(LOG_ENV)
        .ok()
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
}

/// Install the global subscriber
pub fn init_logging(level: Option<&str>) -> LogTarget {
    let log_level = resolve_log_level(level);

    if Path::new(JOURNALD_SOCKET).exists() {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(EnvFilter::new(&log_level))
                    .init();
                return LogTarget::Journald;
            }
            Err(e) => {
                eprintln!("Failed to create journald layer: {}, falling back to stdout", e);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(EnvFilter::new(&log_level))
        .init();
    LogTarget::Stdout
}
