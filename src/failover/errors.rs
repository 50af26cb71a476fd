//! # Failover Errors
//!
//! An ignored event is modelled as an error so that any phase can bail out
//! with `?`; the runner maps it to progress `IGNORED` and a successful job.

use std::fmt;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::fencing::FencingOutcome;
use crate::control::CallError;

/// Result type for failover operations
pub type FailoverResult<T> = Result<T, FailoverError>;

/// Why an event was valid but not acted upon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum IgnoreReason {
    /// Failover is administratively disabled and this node is parked as BACKUP
    Disabled,

    /// Failover is disabled yet this node is marked master
    DisabledWithMasterHint,

    /// The interface does not participate in failover
    NonCriticalInterface { ifname: String },

    /// Every pool is already imported
    AlreadyImported,

    /// An event of the same kind is already in flight
    Duplicate { running_ifname: String },

    /// Siblings in the failover group disagree with the event
    GroupDisagrees { siblings: Vec<String> },
}

impl IgnoreReason {
    /// Short machine readable code
    pub fn code(&self) -> &'static str {
        match self {
            IgnoreReason::Disabled => "DISABLED",
            IgnoreReason::DisabledWithMasterHint => "DISABLED_MASTER_HINT",
            IgnoreReason::NonCriticalInterface { .. } => "NON_CRITICAL_INTERFACE",
            IgnoreReason::AlreadyImported => "ALREADY_IMPORTED",
            IgnoreReason::Duplicate { .. } => "DUPLICATE",
            IgnoreReason::GroupDisagrees { .. } => "GROUP_DISAGREES",
        }
    }
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoreReason::Disabled => write!(f, "failover is disabled"),
            IgnoreReason::DisabledWithMasterHint => {
                write!(f, "failover is disabled but this node is marked master")
            }
            IgnoreReason::NonCriticalInterface { ifname } => {
                write!(f, "{} is not a critical interface", ifname)
            }
            IgnoreReason::AlreadyImported => write!(f, "all pools are already imported"),
            IgnoreReason::Duplicate { running_ifname } => {
                write!(f, "a duplicate event is running for {}", running_ifname)
            }
            IgnoreReason::GroupDisagrees { siblings } => {
                write!(f, "failover group siblings disagree: {}", siblings.join(", "))
            }
        }
    }
}

/// Failover errors
#[derive(Debug, Error)]
pub enum FailoverError {
    /// The event is valid but the engine chose not to act on it
    #[error("event ignored: {0}")]
    Ignored(IgnoreReason),

    /// Fencing did not reach outcome 0
    #[error("fencing failed: {0}")]
    Fencing(FencingOutcome),

    /// Every configured pool failed to import
    #[error("all pools failed to import: {}", .pools.join(", "))]
    AllPoolsFailed { pools: Vec<String> },

    /// A pool export did not finish before the demote deadline
    #[error("pool export did not finish within {elapsed:?}")]
    ExportDeadlineExceeded { elapsed: Duration },

    /// A required collaborator call failed
    #[error(transparent)]
    Call(#[from] CallError),

    /// Unrecognised event name
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Controller role change not permitted from the current role
    #[error("forbidden role transition: {from} -> {to}")]
    ForbiddenTransition { from: &'static str, to: &'static str },

    /// A pipeline phase panicked
    #[error("pipeline panicked: {0}")]
    Panicked(String),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FailoverError {
    /// Whether this error only means the event was ignored.
    pub fn is_ignored(&self) -> bool {
        matches!(self, FailoverError::Ignored(_))
    }

    /// Forbidden role transition.
    pub fn forbidden_transition(from: &'static str, to: &'static str) -> Self {
        FailoverError::ForbiddenTransition { from, to }
    }
}
