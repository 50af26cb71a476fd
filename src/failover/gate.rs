//! Event Gate
//!
//! Admission control in front of the transition runner:
//! 1. load the failover configuration
//! 2. administrative disable (not for forcetakeover)
//! 3. non-critical interface (not for forcetakeover)
//! 4. MASTER with every pool already imported (not for forcetakeover)
//! 5. duplicate kind already in flight, waiting or running
//! 6. hand the job to the runner queue
//! 7. schedule the status refresh, accepted or not
//!
//! An in-flight job of the other kind is not a rejection: the runner queue
//! is FIFO, so the new job simply runs after it.
//!
//! The gate never fails. Every outcome is a `GateDecision`.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use super::errors::IgnoreReason;
use super::event::EventKind;
use super::peer;
use super::report::TransitionReport;
use super::runner::TransitionRunner;
use super::state::Progress;
use crate::control::Collaborators;
use crate::observability::{log_event, Event, FailoverMetrics};

/// Observable state of one transition job
#[derive(Debug, Clone)]
pub enum JobState {
    /// Queued behind another transition
    Waiting,
    /// Holding the transition lock
    Running { progress: Option<Progress> },
    /// Done; the report carries the terminal label
    Finished(Arc<TransitionReport>),
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Finished(_))
    }
}

/// Caller side of an accepted transition job
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: Uuid,
    ifname: String,
    kind: EventKind,
    state: watch::Receiver<JobState>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn state(&self) -> JobState {
        self.state.borrow().clone()
    }

    /// Current progress label. Retained after the job finishes.
    pub fn progress(&self) -> Option<Progress> {
        match &*self.state.borrow() {
            JobState::Waiting => None,
            JobState::Running { progress } => *progress,
            JobState::Finished(report) => report.progress,
        }
    }

    /// Wait for the job to finish and return its report.
    pub async fn wait(&self) -> Arc<TransitionReport> {
        let mut state = self.state.clone();
        let finished = state
            .wait_for(JobState::is_finished)
            .await
            .map(|s| s.clone());

        match finished {
            Ok(JobState::Finished(report)) => report,
            _ => {
                // runner dropped the job without reporting
                let mut report = TransitionReport::new(self.id, &self.ifname, self.kind);
                report.finish(Progress::Error, Some("transition runner stopped".into()));
                Arc::new(report)
            }
        }
    }
}

/// Outcome of offering an event to the gate
#[derive(Debug, Clone)]
pub enum GateDecision {
    /// Queued for the runner
    Accepted(JobHandle),
    /// Valid event the engine chose not to act on
    Ignored(IgnoreReason),
    /// The gate could not evaluate the event (logged)
    Dropped { reason: String },
}

impl GateDecision {
    pub fn handle(&self) -> Option<&JobHandle> {
        match self {
            GateDecision::Accepted(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn ignore_reason(&self) -> Option<&IgnoreReason> {
        match self {
            GateDecision::Ignored(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, GateDecision::Accepted(_))
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    id: Uuid,
    ifname: String,
    kind: EventKind,
}

/// Jobs that are waiting for or holding the transition lock
#[derive(Debug, Default)]
pub(crate) struct JobTable {
    jobs: Mutex<Vec<InFlight>>,
}

impl JobTable {
    /// Register a job unless one of the same kind is in flight.
    /// Check and insert happen in one critical section.
    fn register(
        self: &Arc<Self>,
        ifname: &str,
        kind: EventKind,
    ) -> Result<(JobTicket, JobHandle), String> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = jobs.iter().find(|j| j.kind == kind) {
            return Err(existing.ifname.clone());
        }

        let id = Uuid::new_v4();
        jobs.push(InFlight {
            id,
            ifname: ifname.to_string(),
            kind,
        });

        let (tx, rx) = watch::channel(JobState::Waiting);
        let ticket = JobTicket {
            id,
            ifname: ifname.to_string(),
            kind,
            received_at: Utc::now(),
            state: tx,
            table: Arc::clone(self),
        };
        let handle = JobHandle {
            id,
            ifname: ifname.to_string(),
            kind,
            state: rx,
        };
        Ok((ticket, handle))
    }

    fn remove(&self, id: Uuid) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.retain(|j| j.id != id);
    }

    pub(crate) fn len(&self) -> usize {
        self.jobs.lock().map(|j| j.len()).unwrap_or(0)
    }
}

/// Runner side of an accepted job
pub(crate) struct JobTicket {
    pub id: Uuid,
    pub ifname: String,
    pub kind: EventKind,
    pub received_at: DateTime<Utc>,
    state: watch::Sender<JobState>,
    table: Arc<JobTable>,
}

impl JobTicket {
    pub fn set_running(&self) {
        self.state.send_replace(JobState::Running { progress: None });
    }

    pub fn set_progress(&self, progress: Progress) {
        self.state.send_modify(|state| {
            if let JobState::Running { progress: p } = state {
                *p = Some(progress);
            }
        });
    }

    /// Leave the in-flight table, then publish the report.
    pub fn finish(self, report: TransitionReport) -> Arc<TransitionReport> {
        self.table.remove(self.id);
        let report = Arc::new(report);
        self.state.send_replace(JobState::Finished(Arc::clone(&report)));
        report
    }
}

impl fmt::Debug for JobTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobTicket")
            .field("id", &self.id)
            .field("ifname", &self.ifname)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Drop for JobTicket {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

pub struct EventGate {
    collab: Collaborators,
    runner: Arc<TransitionRunner>,
    jobs: Arc<JobTable>,
    metrics: Arc<FailoverMetrics>,
}

impl EventGate {
    pub(crate) fn new(
        collab: Collaborators,
        runner: Arc<TransitionRunner>,
        metrics: Arc<FailoverMetrics>,
    ) -> Self {
        Self {
            collab,
            runner,
            jobs: Arc::new(JobTable::default()),
            metrics,
        }
    }

    /// Number of jobs waiting for or holding the transition lock.
    pub fn in_flight(&self) -> usize {
        self.jobs.len()
    }

    /// Offer a role event.
    pub async fn offer(&self, ifname: &str, kind: EventKind) -> GateDecision {
        self.metrics.increment_events_offered();

        let decision = self.decide(ifname, kind).await;
        match &decision {
            GateDecision::Accepted(handle) => {
                tracing::info!(ifname, event = kind.as_str(), job_id = %handle.id(), "event accepted");
                log_event(Event::TransitionAccepted);
            }
            GateDecision::Ignored(reason) => {
                tracing::info!(ifname, event = kind.as_str(), reason = %reason, "ignoring event");
                self.metrics.increment_events_ignored();
                log_event(Event::TransitionIgnored);
            }
            GateDecision::Dropped { reason } => {
                tracing::error!(ifname, event = kind.as_str(), reason = %reason, "failed to process event");
                self.metrics.increment_events_dropped();
            }
        }

        peer::schedule_status_refresh(
            decision.handle().cloned(),
            Arc::clone(&self.collab.platform),
            Arc::clone(&self.collab.peer),
        );

        decision
    }

    async fn decide(&self, ifname: &str, kind: EventKind) -> GateDecision {
        let config = match self.collab.config.failover_config().await {
            Ok(config) => config,
            Err(e) => {
                return GateDecision::Dropped {
                    reason: format!("failed to load failover configuration: {}", e),
                }
            }
        };

        if kind != EventKind::ForceTakeover {
            if config.disabled {
                if config.master_hint {
                    tracing::warn!(ifname, "failover is disabled but this node is marked master");
                    return GateDecision::Ignored(IgnoreReason::DisabledWithMasterHint);
                }
                return GateDecision::Ignored(IgnoreReason::Disabled);
            }

            if config.is_non_critical(ifname) {
                tracing::warn!(ifname, "ignoring state change on non-critical interface");
                return GateDecision::Ignored(IgnoreReason::NonCriticalInterface {
                    ifname: ifname.to_string(),
                });
            }

            if kind == EventKind::Master {
                match self.collab.pools.query_pools().await {
                    Ok(pools) if !pools.is_empty() && pools.iter().all(|p| p.status.is_imported()) => {
                        tracing::warn!(ifname, "received MASTER but every pool is already imported");
                        return GateDecision::Ignored(IgnoreReason::AlreadyImported);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        return GateDecision::Dropped {
                            reason: format!("failed to query pools: {}", e),
                        }
                    }
                }
            }
        }

        let (ticket, handle) = match self.jobs.register(ifname, kind) {
            Ok(registered) => registered,
            Err(running_ifname) => {
                tracing::info!(
                    ifname,
                    event = kind.as_str(),
                    running = %running_ifname,
                    "a duplicate event is already in flight"
                );
                return GateDecision::Ignored(IgnoreReason::Duplicate { running_ifname });
            }
        };

        if let Err(ticket) = self.runner.submit(ticket) {
            drop(ticket);
            return GateDecision::Dropped {
                reason: "transition runner stopped".into(),
            };
        }

        GateDecision::Accepted(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_kind_is_duplicate_while_registered() {
        let table = Arc::new(JobTable::default());

        let (first, _h1) = table.register("eth0", EventKind::Backup).unwrap();
        assert_eq!(table.register("eth1", EventKind::Backup).unwrap_err(), "eth0");

        let (_master, _h2) = table.register("eth0", EventKind::Master).unwrap();
        assert_eq!(table.len(), 2);

        drop(first);
        assert!(table.register("eth1", EventKind::Backup).is_ok());
    }

    #[tokio::test]
    async fn test_handle_retains_terminal_label() {
        let table = Arc::new(JobTable::default());
        let (ticket, handle) = table.register("eth0", EventKind::Master).unwrap();
        assert!(handle.progress().is_none());

        ticket.set_running();
        ticket.set_progress(Progress::Importing);
        assert_eq!(handle.progress(), Some(Progress::Importing));

        let mut report = TransitionReport::new(ticket.id, "eth0", EventKind::Master);
        report.finish(Progress::Success, None);
        ticket.finish(report);

        assert_eq!(handle.wait().await.progress, Some(Progress::Success));
        assert_eq!(handle.progress(), Some(Progress::Success));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_dropped_ticket_reports_error() {
        let table = Arc::new(JobTable::default());
        let (ticket, handle) = table.register("eth0", EventKind::Backup).unwrap();
        drop(ticket);

        assert!(handle.wait().await.ended_with(Progress::Error));
    }
}
