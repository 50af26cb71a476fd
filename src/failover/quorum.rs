//! Group Quorum Evaluation
//!
//! Interfaces in one failover group transition as a unit. Before acting on
//! an interface's event, every sibling's observed VRRP state is inspected:
//! - MASTER event: a sibling in BACKUP means the peer still owns that VIP
//! - BACKUP event: a sibling in MASTER means we still own a peer VIP
//!
//! Siblings in FAULT or an unknown state do not block; they are logged.
//!
//! Evaluation has no side effects beyond the role-source queries.

use super::config::FailoverConfig;
use super::errors::IgnoreReason;
use super::event::VrrpState;
use crate::control::VrrpControl;

/// Result of group quorum evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuorumVerdict {
    /// Every sibling agrees or is indeterminate
    Proceed {
        /// Siblings whose state was unknown
        indeterminate: Vec<String>,
    },

    /// At least one sibling disagrees with the event
    Ignore {
        /// Siblings in the opposite role
        blocking: Vec<String>,
        /// Siblings whose state was unknown
        indeterminate: Vec<String>,
    },
}

impl QuorumVerdict {
    pub fn is_proceed(&self) -> bool {
        matches!(self, Self::Proceed { .. })
    }

    /// The ignore reason, if the group disagrees.
    pub fn ignore_reason(&self) -> Option<IgnoreReason> {
        match self {
            Self::Ignore { blocking, .. } => Some(IgnoreReason::GroupDisagrees {
                siblings: blocking.clone(),
            }),
            Self::Proceed { .. } => None,
        }
    }
}

/// Role a sibling must NOT be in for the event to proceed.
fn opposing(expected: VrrpState) -> Option<VrrpState> {
    match expected {
        VrrpState::Master => Some(VrrpState::Backup),
        VrrpState::Backup => Some(VrrpState::Master),
        VrrpState::Fault | VrrpState::Unknown => None,
    }
}

/// Evaluate the failover group of `ifname` against the expected role.
///
/// An interface without a group, or alone in its group, always proceeds.
pub async fn evaluate(
    vrrp: &dyn VrrpControl,
    ifname: &str,
    config: &FailoverConfig,
    expected: VrrpState,
) -> QuorumVerdict {
    let mut blocking = Vec::new();
    let mut indeterminate = Vec::new();
    let opposing = opposing(expected);

    for sibling in config.siblings(ifname) {
        let observed = vrrp.observed_state(&sibling).await;

        if Some(observed) == opposing {
            tracing::warn!(
                ifname,
                sibling = %sibling,
                observed = observed.as_str(),
                expected = expected.as_str(),
                "failover group sibling disagrees"
            );
            blocking.push(sibling);
        } else if !observed.is_known() || observed == VrrpState::Fault {
            tracing::info!(
                ifname,
                sibling = %sibling,
                observed = observed.as_str(),
                "failover group sibling state is indeterminate"
            );
            indeterminate.push(sibling);
        }
    }

    if blocking.is_empty() {
        QuorumVerdict::Proceed { indeterminate }
    } else {
        QuorumVerdict::Ignore {
            blocking,
            indeterminate,
        }
    }
}
