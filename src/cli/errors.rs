//! CLI-specific error types
//!
//! Every CLI error ends the process with a non-zero exit.

use std::fmt;
use std::io;

use crate::failover::FailoverError;
use crate::vrrp::VrrpError;

/// CLI error codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Settings file error
    ConfigError,
    /// I/O error
    IoError,
    /// Invalid command argument
    InvalidArgument,
    /// Engine failed to start
    BootFailed,
    /// Role source failed
    RoleSourceFailed,
}

impl CliErrorCode {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "HA_CLI_CONFIG_ERROR",
            Self::IoError => "HA_CLI_IO_ERROR",
            Self::InvalidArgument => "HA_CLI_INVALID_ARGUMENT",
            Self::BootFailed => "HA_CLI_BOOT_FAILED",
            Self::RoleSourceFailed => "HA_CLI_ROLE_SOURCE_FAILED",
        }
    }
}

/// CLI error
#[derive(Debug)]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    /// Create a new CLI error
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Config error
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    /// I/O error
    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::InvalidArgument, msg)
    }

    /// Boot failed
    pub fn boot_failed(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::BootFailed, msg)
    }

    /// Get the error code
    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    /// Get the error code string
    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for CliError {}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

impl From<FailoverError> for CliError {
    fn from(e: FailoverError) -> Self {
        match e {
            FailoverError::Config(msg) => Self::config_error(msg),
            FailoverError::InvalidEvent(event) => {
                Self::invalid_argument(format!("invalid event: {}", event))
            }
            other => Self::boot_failed(other.to_string()),
        }
    }
}

impl From<VrrpError> for CliError {
    fn from(e: VrrpError) -> Self {
        Self::new(CliErrorCode::RoleSourceFailed, e.to_string())
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;
