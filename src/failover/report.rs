//! Transition Report
//!
//! Everything a transition did that the caller, the status endpoint or a
//! test may want to inspect afterwards. Non-fatal failures (partial pool
//! import, service timeouts, peer RPC failures) live here rather than in
//! the error path.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event::EventKind;
use super::fencing::FencingOutcome;
use super::state::Progress;

/// Fencing acquisition summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FencingSummary {
    pub outcome: FencingOutcome,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub forced: bool,
}

/// A pool that failed to import
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolFailure {
    pub name: String,
    pub guid: u64,
    pub error: String,
}

/// A service dispatch that did not finish in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTimeout {
    pub service: String,
    pub after_ms: u64,
}

/// Outcome of one transition job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionReport {
    pub job_id: Uuid,
    pub ifname: String,
    pub event: EventKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Final progress label
    pub progress: Option<Progress>,

    /// Error or ignore reason that ended the pipeline
    pub reason: Option<String>,

    pub fencing: Option<FencingSummary>,
    pub imported: Vec<String>,
    pub pool_failures: Vec<PoolFailure>,
    pub exported: Vec<String>,

    /// Services dispatched, in wave order
    pub dispatched: Vec<String>,
    pub service_timeouts: Vec<ServiceTimeout>,
    pub service_failures: Vec<String>,

    /// Peer calls that failed (advisory only)
    pub peer_failures: Vec<String>,

    /// Best-effort steps that failed
    pub warnings: Vec<String>,

    /// Whether the export deadline fired the sysrq reboot
    pub sysrq_fired: bool,
}

impl TransitionReport {
    pub fn new(job_id: Uuid, ifname: &str, event: EventKind) -> Self {
        Self {
            job_id,
            ifname: ifname.to_string(),
            event,
            started_at: Utc::now(),
            finished_at: None,
            progress: None,
            reason: None,
            fencing: None,
            imported: Vec::new(),
            pool_failures: Vec::new(),
            exported: Vec::new(),
            dispatched: Vec::new(),
            service_timeouts: Vec::new(),
            service_failures: Vec::new(),
            peer_failures: Vec::new(),
            warnings: Vec::new(),
            sysrq_fired: false,
        }
    }

    /// Record the terminal label.
    pub fn finish(&mut self, progress: Progress, reason: Option<String>) {
        self.progress = Some(progress);
        self.reason = reason;
        self.finished_at = Some(Utc::now());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn record_timeout(&mut self, service: &str, after: Duration) {
        self.service_timeouts.push(ServiceTimeout {
            service: service.to_string(),
            after_ms: after.as_millis() as u64,
        });
    }

    /// Position of a service in dispatch order.
    pub fn dispatch_index(&self, service: &str) -> Option<usize> {
        self.dispatched.iter().position(|s| s == service)
    }

    /// Whether the transition ended with the given label.
    pub fn ended_with(&self, progress: Progress) -> bool {
        self.progress == Some(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_sets_terminal_label() {
        let mut report = TransitionReport::new(Uuid::new_v4(), "eth0", EventKind::Master);
        assert!(report.progress.is_none());

        report.finish(Progress::Success, None);
        assert!(report.ended_with(Progress::Success));
        assert!(report.finished_at.is_some());
    }

    #[test]
    fn test_dispatch_order_lookup() {
        let mut report = TransitionReport::new(Uuid::new_v4(), "eth0", EventKind::Master);
        report.dispatched = vec!["iscsitarget".into(), "cifs".into(), "ssh".into()];

        assert_eq!(report.dispatch_index("cifs"), Some(1));
        assert_eq!(report.dispatch_index("nfs"), None);
    }

    #[test]
    fn test_report_serializes_for_status_consumers() {
        let mut report = TransitionReport::new(Uuid::new_v4(), "eth0", EventKind::Backup);
        report.record_timeout("smartd", Duration::from_secs(60));
        report.finish(Progress::Ignored, Some("duplicate".into()));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["event"], "BACKUP");
        assert_eq!(json["progress"], "IGNORED");
        assert_eq!(json["service_timeouts"][0]["after_ms"], 60_000);
    }
}
