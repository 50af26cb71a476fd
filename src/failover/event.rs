//! Role Events
//!
//! A role event is `(interface, kind)`: created when the role source
//! reports a VRRP state change, discarded when its transition completes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{FailoverError, FailoverResult};

/// Kind of role-change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// The VRRP timeout elapsed; this controller should own the VIPs.
    #[serde(rename = "MASTER")]
    Master,

    /// The peer advertised a higher priority; relinquish.
    #[serde(rename = "BACKUP")]
    Backup,

    /// Operator requested takeover regardless of administrative disable.
    #[serde(rename = "forcetakeover")]
    ForceTakeover,
}

impl EventKind {
    /// Returns the wire representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Master => "MASTER",
            EventKind::Backup => "BACKUP",
            EventKind::ForceTakeover => "forcetakeover",
        }
    }

    /// Whether this event runs the promote pipeline.
    pub fn is_promote(&self) -> bool {
        matches!(self, EventKind::Master | EventKind::ForceTakeover)
    }

    /// The VRRP state siblings must agree with for this event to proceed.
    pub fn expected_role(&self) -> VrrpState {
        if self.is_promote() {
            VrrpState::Master
        } else {
            VrrpState::Backup
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = FailoverError;

    fn from_str(s: &str) -> FailoverResult<Self> {
        match s {
            "MASTER" => Ok(EventKind::Master),
            "BACKUP" => Ok(EventKind::Backup),
            "forcetakeover" | "FORCETAKEOVER" => Ok(EventKind::ForceTakeover),
            other => Err(FailoverError::InvalidEvent(other.to_string())),
        }
    }
}

/// Observed VRRP state of a single interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VrrpState {
    Master,
    Backup,
    Fault,
    /// Never reported, or reported a state the engine does not track
    Unknown,
}

impl VrrpState {
    /// Returns the state name
    pub fn as_str(&self) -> &'static str {
        match self {
            VrrpState::Master => "MASTER",
            VrrpState::Backup => "BACKUP",
            VrrpState::Fault => "FAULT",
            VrrpState::Unknown => "UNKNOWN",
        }
    }

    /// Whether the interface reported a usable role.
    pub fn is_known(&self) -> bool {
        matches!(self, VrrpState::Master | VrrpState::Backup)
    }
}

impl fmt::Display for VrrpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A role-change notification for one interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleEvent {
    /// Interface the notification was raised for
    pub ifname: String,

    /// What the role source asked for
    pub kind: EventKind,

    /// When the notification arrived
    pub received_at: DateTime<Utc>,
}

impl RoleEvent {
    /// Create a new event stamped with the current time.
    pub fn new(ifname: impl Into<String>, kind: EventKind) -> Self {
        Self {
            ifname: ifname.into(),
            kind,
            received_at: Utc::now(),
        }
    }
}
