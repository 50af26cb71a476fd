//! Controller Role State Machine and Transition State
//!
//! Roles:
//! - UNKNOWN until the first accepted event after process start
//! - BACKUP / MASTER are steady
//! - PROMOTING / DEMOTING exist only while the transition lock is held
//! - FAULTED after a promote or demote that failed part way
//!
//! Transitions consume the current role and either return the next one or
//! an explicit forbidden-transition error.
//!
//! `TransitionState` is the process-wide descriptor of the transition that
//! currently holds the lock, plus its progress label.

use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::{FailoverError, FailoverResult};
use super::event::EventKind;

/// Progress label of a transition job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Progress {
    Electing,
    Importing,
    Success,
    Ignored,
    Error,
}

impl Progress {
    /// Returns the label string
    pub fn as_str(&self) -> &'static str {
        match self {
            Progress::Electing => "ELECTING",
            Progress::Importing => "IMPORTING",
            Progress::Success => "SUCCESS",
            Progress::Ignored => "IGNORED",
            Progress::Error => "ERROR",
        }
    }

    /// Whether a job carrying this label has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Progress::Success | Progress::Ignored | Progress::Error)
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-controller role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControllerRole {
    #[default]
    Unknown,
    Backup,
    Promoting,
    Master,
    Demoting,
    Faulted,
}

impl ControllerRole {
    /// Get the role name for observability.
    pub fn state_name(&self) -> &'static str {
        match self {
            ControllerRole::Unknown => "UNKNOWN",
            ControllerRole::Backup => "BACKUP",
            ControllerRole::Promoting => "PROMOTING",
            ControllerRole::Master => "MASTER",
            ControllerRole::Demoting => "DEMOTING",
            ControllerRole::Faulted => "FAULTED",
        }
    }

    /// Whether a pipeline is running.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, ControllerRole::Promoting | ControllerRole::Demoting)
    }

    /// * → PROMOTING on an accepted MASTER / forcetakeover event
    pub fn begin_promotion(self) -> FailoverResult<Self> {
        match self {
            ControllerRole::Promoting | ControllerRole::Demoting => Err(
                FailoverError::forbidden_transition(self.state_name(), "PROMOTING"),
            ),
            _ => Ok(ControllerRole::Promoting),
        }
    }

    /// PROMOTING → MASTER
    pub fn complete_promotion(self) -> FailoverResult<Self> {
        match self {
            ControllerRole::Promoting => Ok(ControllerRole::Master),
            _ => Err(FailoverError::forbidden_transition(self.state_name(), "MASTER")),
        }
    }

    /// * → DEMOTING on an accepted BACKUP event
    pub fn begin_demotion(self) -> FailoverResult<Self> {
        match self {
            ControllerRole::Promoting | ControllerRole::Demoting => Err(
                FailoverError::forbidden_transition(self.state_name(), "DEMOTING"),
            ),
            _ => Ok(ControllerRole::Demoting),
        }
    }

    /// DEMOTING → BACKUP
    pub fn complete_demotion(self) -> FailoverResult<Self> {
        match self {
            ControllerRole::Demoting => Ok(ControllerRole::Backup),
            _ => Err(FailoverError::forbidden_transition(self.state_name(), "BACKUP")),
        }
    }

    /// PROMOTING | DEMOTING → FAULTED
    pub fn fault(self) -> FailoverResult<Self> {
        match self {
            ControllerRole::Promoting | ControllerRole::Demoting => Ok(ControllerRole::Faulted),
            _ => Err(FailoverError::forbidden_transition(self.state_name(), "FAULTED")),
        }
    }

    /// PROMOTING | DEMOTING → previous role, when the event was ignored.
    pub fn abandon(self, previous: ControllerRole) -> FailoverResult<Self> {
        match self {
            ControllerRole::Promoting | ControllerRole::Demoting if !previous.is_transitioning() => {
                Ok(previous)
            }
            _ => Err(FailoverError::forbidden_transition(
                self.state_name(),
                previous.state_name(),
            )),
        }
    }
}

impl fmt::Display for ControllerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.state_name())
    }
}

/// The transition currently holding the lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionDescriptor {
    pub job_id: Uuid,
    pub ifname: String,
    pub kind: EventKind,
    pub started_at: DateTime<Utc>,
    pub progress: Option<Progress>,
}

/// Process-wide transition slot. At most one descriptor is set at a time.
#[derive(Debug, Default)]
pub struct TransitionState {
    current: RwLock<Option<TransitionDescriptor>>,
}

impl TransitionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the descriptor of the transition that just took the lock.
    pub fn begin(&self, job_id: Uuid, ifname: &str, kind: EventKind) -> FailoverResult<()> {
        let mut current = self
            .current
            .write()
            .map_err(|_| FailoverError::Config("transition state lock poisoned".into()))?;

        if let Some(existing) = current.as_ref() {
            return Err(FailoverError::Config(format!(
                "transition {} is still registered",
                existing.job_id
            )));
        }

        *current = Some(TransitionDescriptor {
            job_id,
            ifname: ifname.to_string(),
            kind,
            started_at: Utc::now(),
            progress: None,
        });
        Ok(())
    }

    /// Update the progress label of the running transition.
    pub fn set_progress(&self, progress: Progress) {
        if let Ok(mut current) = self.current.write() {
            if let Some(descriptor) = current.as_mut() {
                descriptor.progress = Some(progress);
            }
        }
    }

    /// Clear the slot when the transition releases the lock.
    pub fn clear(&self) -> Option<TransitionDescriptor> {
        self.current.write().ok().and_then(|mut c| c.take())
    }

    /// Snapshot of the running transition.
    pub fn current(&self) -> Option<TransitionDescriptor> {
        self.current.read().ok().and_then(|c| c.clone())
    }

    /// Whether a transition is running.
    pub fn is_active(&self) -> bool {
        self.current().is_some()
    }
}
