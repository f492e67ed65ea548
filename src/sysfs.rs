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

//! Low-level sysfs and shell access
//!
//! Platform control files hold a single integer or float in ASCII. Util
//! access runs a shell command template and reads the value from stdout.

use std::fs;
use std::path::Path;
use std::process::Command;

use tracing::{debug, trace};

use fan_error::{FanServiceError, Result};

use crate::constants::shell;

/// Read a numeric value from a sysfs-style file
///
/// Integer and float contents are both accepted; surrounding whitespace is ignored.
pub fn read_value(path: &Path) -> Result<f32> {
    let content = fs::read_to_string(path).map_err(|e| FanServiceError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_value(path, &content)
}

fn parse_value(path: &Path, content: &str) -> Result<f32> {
    match content.trim().parse::<f32>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(FanServiceError::Parse {
            path: path.to_path_buf(),
            content: content.trim().to_string(),
        }),
    }
}

/// Write an integer value to a sysfs-style file
pub fn write_value(path: &Path, value: i32) -> Result<()> {
    trace!(path = %path.display(), value, "sysfs write");
    fs::write(path, value.to_string()).map_err(|e| FanServiceError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Run a command through `sh -c` and return its stdout
pub fn run_shell(command: &str) -> Result<String> {
    debug!(command, "Running shell command");
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .map_err(|e| FanServiceError::ShellCommand {
            command: command.to_string(),
            reason: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(FanServiceError::ShellCommand {
            command: command.to_string(),
            reason: format!(
                "exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run a util read command and parse the first token of its output
pub fn read_shell_value(command: &str) -> Result<f32> {
    let stdout = run_shell(command)?;
    let token = stdout.split_whitespace().next().unwrap_or("");
    match token.parse::<f32>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(FanServiceError::ShellCommand {
            command: command.to_string(),
            reason: format!("unparsable output '{}'", stdout.trim()),
        }),
    }
}

/// Fill in the `_NAME_`, `_PWM_` and `_VALUE_` placeholders of a command template
pub fn expand_template(template: &str, name: &str, value: i32) -> String {
    let value = value.to_string();
    template
        .replace(shell::NAME_TOKEN, name)
        .replace(shell::PWM_TOKEN, &value)
        .replace(shell::VALUE_TOKEN, &value)
}
