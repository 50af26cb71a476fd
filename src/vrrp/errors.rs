//! # Role Source Errors

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for role source operations
pub type VrrpResult<T> = Result<T, VrrpError>;

/// Role source errors
#[derive(Debug, Error)]
pub enum VrrpError {
    /// A FIFO line that is not a keepalived notification
    #[error("malformed notification: {0:?}")]
    Malformed(String),

    /// Nobody opened the FIFO for reading in time
    #[error("no role source is reading {}", .0.display())]
    NoReader(PathBuf),

    /// The FIFO could not be opened or read
    #[error("FIFO I/O error: {0}")]
    Io(#[from] io::Error),
}
