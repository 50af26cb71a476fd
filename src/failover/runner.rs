//! Transition Runner
//!
//! One worker task drains a FIFO queue of accepted jobs. The worker is the
//! `vrrp_event` transition lock: at most one pipeline runs at a time, and
//! jobs run in the order the gate accepted them.
//!
//! Per job:
//! 1. install the TransitionState descriptor, move the role to PROMOTING
//!    or DEMOTING
//! 2. re-read the failover configuration
//! 3. run the promote or demote pipeline, catching panics
//! 4. map the outcome to a terminal label and the next role
//! 5. publish the report on the job, clear the descriptor

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tracing::Instrument;

use super::config::{EngineTunables, FailoverConfig};
use super::demote;
use super::errors::{FailoverError, FailoverResult};
use super::event::EventKind;
use super::fencing::FencingController;
use super::gate::JobTicket;
use super::pools::PoolLifecycle;
use super::promote;
use super::report::TransitionReport;
use super::services::ServiceOrchestrator;
use super::state::{ControllerRole, Progress, TransitionState};
use crate::control::{CallResult, Collaborators};
use crate::observability::{log_event, Event, EventBus, FailoverMetrics};

/// Everything a pipeline phase can reach
pub(crate) struct PipelineContext<'a> {
    pub ticket: &'a JobTicket,
    pub config: FailoverConfig,
    pub collab: &'a Collaborators,
    pub tunables: &'a EngineTunables,
    pub transition: &'a TransitionState,
    pub events: &'a EventBus,
    pub fencing: FencingController,
    pub pools: PoolLifecycle,
    pub services: ServiceOrchestrator,
}

impl PipelineContext<'_> {
    pub fn ifname(&self) -> &str {
        &self.ticket.ifname
    }

    pub fn kind(&self) -> EventKind {
        self.ticket.kind
    }

    /// Update the label on both the global descriptor and the job.
    pub fn set_progress(&self, progress: Progress) {
        self.transition.set_progress(progress);
        self.ticket.set_progress(progress);
    }

    /// Run a step whose failure does not stop the pipeline.
    pub async fn best_effort<T, F>(&self, report: &mut TransitionReport, step: &str, fut: F) -> Option<T>
    where
        F: Future<Output = CallResult<T>>,
    {
        match fut.await {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(step, error = %e, "step failed, continuing");
                report.warn(format!("{}: {}", step, e));
                None
            }
        }
    }
}

/// Spawn a task the pipeline does not wait for.
pub(crate) fn spawn_background<F>(step: &'static str, fut: F)
where
    F: Future<Output = CallResult<()>> + Send + 'static,
{
    tokio::spawn(
        async move {
            match fut.await {
                Ok(()) => tracing::info!(step, "background task done"),
                Err(e) => tracing::warn!(step, error = %e, "background task failed"),
            }
        }
        .in_current_span(),
    );
}

struct RunnerCore {
    collab: Collaborators,
    tunables: EngineTunables,
    role: Mutex<ControllerRole>,
    transition: TransitionState,
    events: EventBus,
    metrics: Arc<FailoverMetrics>,
}

/// Serialises transitions behind one FIFO worker.
pub struct TransitionRunner {
    core: Arc<RunnerCore>,
    queue: mpsc::UnboundedSender<JobTicket>,
}

impl TransitionRunner {
    /// Start the worker. Must be called inside a Tokio runtime.
    pub(crate) fn start(
        collab: Collaborators,
        tunables: EngineTunables,
        events: EventBus,
        metrics: Arc<FailoverMetrics>,
    ) -> Arc<Self> {
        let core = Arc::new(RunnerCore {
            collab,
            tunables,
            role: Mutex::new(ControllerRole::default()),
            transition: TransitionState::new(),
            events,
            metrics,
        });

        let (queue, mut rx) = mpsc::unbounded_channel::<JobTicket>();
        let worker = Arc::clone(&core);
        tokio::spawn(async move {
            while let Some(ticket) = rx.recv().await {
                worker.execute(ticket).await;
            }
            tracing::debug!("transition queue closed");
        });

        Arc::new(Self { core, queue })
    }

    /// Queue a job. Hands the ticket back if the worker is gone.
    pub(crate) fn submit(&self, ticket: JobTicket) -> Result<(), JobTicket> {
        self.queue.send(ticket).map_err(|e| e.0)
    }

    pub fn role(&self) -> ControllerRole {
        *self.core.role.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn transition_state(&self) -> &TransitionState {
        &self.core.transition
    }
}

impl RunnerCore {
    fn swap_role<F>(&self, next: F) -> FailoverResult<(ControllerRole, ControllerRole)>
    where
        F: FnOnce(ControllerRole) -> FailoverResult<ControllerRole>,
    {
        let mut role = self.role.lock().unwrap_or_else(|e| e.into_inner());
        let previous = *role;
        *role = next(previous)?;
        Ok((previous, *role))
    }

    async fn execute(&self, ticket: JobTicket) {
        let span = tracing::info_span!(
            "transition",
            job_id = %ticket.id,
            ifname = %ticket.ifname,
            event = ticket.kind.as_str()
        );
        self.execute_inner(ticket).instrument(span).await;
    }

    async fn execute_inner(&self, ticket: JobTicket) {
        let kind = ticket.kind;
        let mut report = TransitionReport::new(ticket.id, &ticket.ifname, kind);
        ticket.set_running();

        if let Err(e) = self.transition.begin(ticket.id, &ticket.ifname, kind) {
            tracing::error!(error = %e, "transition slot is occupied");
            report.finish(Progress::Error, Some(e.to_string()));
            ticket.finish(report);
            return;
        }

        let begun = self.swap_role(|r| {
            if kind.is_promote() {
                r.begin_promotion()
            } else {
                r.begin_demotion()
            }
        });
        let previous = match begun {
            Ok((previous, _)) => previous,
            Err(e) => {
                tracing::error!(error = %e, "role does not permit this transition");
                report.finish(Progress::Error, Some(e.to_string()));
                self.transition.clear();
                ticket.finish(report);
                return;
            }
        };

        tracing::info!(
            waited_ms = (chrono::Utc::now() - ticket.received_at).num_milliseconds(),
            role = previous.state_name(),
            "acquired transition lock"
        );

        let outcome = AssertUnwindSafe(self.run_pipeline(&ticket, &mut report))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(FailoverError::Panicked(message))
            });

        self.conclude(outcome, previous, &mut report);

        self.metrics
            .add_service_timeouts(report.service_timeouts.len() as u64);
        if let Some(fencing) = &report.fencing {
            self.metrics
                .add_fencing_retries(u64::from(fencing.attempts.saturating_sub(1)));
        }

        self.transition.clear();
        ticket.finish(report);
    }

    async fn run_pipeline(&self, ticket: &JobTicket, report: &mut TransitionReport) -> FailoverResult<()> {
        let config = self.collab.config.failover_config().await?;

        let ctx = PipelineContext {
            ticket,
            config,
            collab: &self.collab,
            tunables: &self.tunables,
            transition: &self.transition,
            events: &self.events,
            fencing: FencingController::new(
                Arc::clone(&self.collab.fencing),
                self.tunables.fencing_attempts,
            ),
            pools: PoolLifecycle::new(
                Arc::clone(&self.collab.pools),
                Arc::clone(&self.collab.rebooter),
            ),
            services: ServiceOrchestrator::new(
                Arc::clone(&self.collab.services),
                Arc::clone(&self.collab.platform),
            ),
        };

        if ticket.kind.is_promote() {
            promote::run(&ctx, report).await
        } else {
            demote::run(&ctx, report).await
        }
    }

    /// Terminal label and next role for a pipeline outcome.
    fn conclude(
        &self,
        outcome: FailoverResult<()>,
        previous: ControllerRole,
        report: &mut TransitionReport,
    ) {
        let promote = report.event.is_promote();

        let (progress, reason, next) = match outcome {
            Ok(()) => {
                let next = if promote {
                    self.swap_role(ControllerRole::complete_promotion)
                } else {
                    self.swap_role(ControllerRole::complete_demotion)
                };
                if promote {
                    self.metrics.increment_promotions();
                } else {
                    self.metrics.increment_demotions();
                }
                log_event(Event::TransitionSucceeded);
                (Progress::Success, None, next)
            }
            Err(FailoverError::Ignored(reason)) => {
                tracing::info!(reason = %reason, "ignoring event");
                self.metrics.increment_events_ignored();
                log_event(Event::TransitionIgnored);
                (
                    Progress::Ignored,
                    Some(reason.to_string()),
                    self.swap_role(|r| r.abandon(previous)),
                )
            }
            Err(e @ FailoverError::ExportDeadlineExceeded { .. }) => {
                // the machine is going down; the role stays DEMOTING
                self.metrics.increment_sysrq_reboots();
                self.metrics.increment_transitions_failed();
                log_event(Event::SysrqFired);
                let role = self.role.lock().map(|r| *r).unwrap_or_default();
                (Progress::Error, Some(e.to_string()), Ok((role, role)))
            }
            Err(e) => {
                tracing::error!(error = %e, "transition failed");
                self.metrics.increment_transitions_failed();
                log_event(Event::TransitionFailed);
                (
                    Progress::Error,
                    Some(e.to_string()),
                    self.swap_role(ControllerRole::fault),
                )
            }
        };

        match next {
            Ok((from, to)) => {
                if from != to {
                    tracing::info!(from = from.state_name(), to = to.state_name(), "controller role changed");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to record controller role"),
        }

        self.transition.set_progress(progress);
        report.finish(progress, reason);
    }
}
