//! # Control Errors
//!
//! Failures of calls made through the collaborator interface.

use thiserror::Error;

/// `errno` value reported when a pool import cannot find its devices
/// through the cache file.
pub const ENOENT: i32 = 2;

/// `errno` value reported when a collaborator call timed out.
pub const ETIMEDOUT: i32 = 110;

/// Result type for collaborator calls
pub type CallResult<T> = Result<T, CallError>;

/// A collaborator call that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{method} failed: {message}")]
pub struct CallError {
    /// Name of the method that failed (e.g. `zfs.pool.import_pool`)
    pub method: String,

    /// OS error number, when the collaborator reported one
    pub errno: Option<i32>,

    /// Human readable failure
    pub message: String,
}

impl CallError {
    /// Create a new call error without an errno.
    pub fn new(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            errno: None,
            message: message.into(),
        }
    }

    /// Create a call error carrying an errno.
    pub fn with_errno(method: impl Into<String>, errno: i32, message: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            errno: Some(errno),
            message: message.into(),
        }
    }

    /// The call did not answer in time.
    pub fn timed_out(method: impl Into<String>, after_secs: u64) -> Self {
        Self::with_errno(method, ETIMEDOUT, format!("timed out after {}s", after_secs))
    }

    /// Whether the failure is `ENOENT`.
    pub fn is_enoent(&self) -> bool {
        self.errno == Some(ENOENT)
    }

    /// Whether the failure is a timeout.
    pub fn is_timeout(&self) -> bool {
        self.errno == Some(ETIMEDOUT)
    }
}
