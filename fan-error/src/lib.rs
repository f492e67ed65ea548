//! Unified error handling for fan-service
//!
//! A single error type shared by the control engine, the board support
//! proxies and the daemon binary. Per-item failures (one sensor, one fan) are
//! reported through it and accounted by the caller; only configuration errors
//! are fatal at startup.

use std::io;
use std::path::PathBuf;

/// Result type alias using FanServiceError
pub type Result<T> = std::result::Result<T, FanServiceError>;

/// Unified error type for all fan-service operations
#[derive(thiserror::Error, Debug)]
pub enum FanServiceError {
    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    // ============================================================================
    // I/O Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Shell command `{command}` failed: {reason}")]
    ShellCommand {
        command: String,
        reason: String,
    },

    #[error("Failed to parse '{content}' read from {path}")]
    Parse {
        path: PathBuf,
        content: String,
    },

    // ============================================================================
    // Lookup Errors
    // ============================================================================
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Sensor entry {name} is not {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
    },

    // ============================================================================
    // Board Support Errors
    // ============================================================================
    #[error("Access type {access} is not supported for {operation}")]
    AccessTypeUnsupported {
        access: String,
        operation: String,
    },

    #[error("Emergency shutdown requested but no shutdown command is configured")]
    NoShutdownCommand,
}

impl FanServiceError {
    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid config value error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a not-found error for a sensor, optic or fan name
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound(name.into())
    }

    /// Create an unsupported access type error
    pub fn unsupported(access: impl ToString, operation: impl Into<String>) -> Self {
        Self::AccessTypeUnsupported {
            access: access.to_string(),
            operation: operation.into(),
        }
    }

    /// True for errors that must abort startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::JsonParse(_) | Self::InvalidConfig { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_are_fatal() {
        assert!(FanServiceError::config("Unrecognizable keyword foo").is_fatal());
        assert!(FanServiceError::invalid_config("pwm_min", "above pwm_max").is_fatal());
        assert!(!FanServiceError::not_found("CPU").is_fatal());
        assert!(!FanServiceError::NoShutdownCommand.is_fatal());
    }

    #[test]
    fn test_error_messages() {
        let err = FanServiceError::TypeMismatch { name: "TEST".into(), expected: "Float" };
        assert_eq!(err.to_string(), "Sensor entry TEST is not Float");

        let err = FanServiceError::unsupported("REST", "fan PWM write");
        assert_eq!(err.to_string(), "Access type REST is not supported for fan PWM write");

        let err = FanServiceError::Parse { path: PathBuf::from("/run/x"), content: "abc".into() };
        assert!(err.to_string().contains("abc"));
    }
}
