//! Failover Subsystem
//!
//! Turns VRRP role events into promote and demote transitions of a
//! dual-controller storage appliance.
//!
//! - Role events are admitted by the Event Gate
//! - Accepted jobs run one at a time, FIFO, behind the transition runner
//! - Promote takes SCSI-PR fencing before touching shared disks
//! - Demote exports pools under a hard deadline backed by sysrq reboot
//! - Service restarts are waves: critical first, everything else after
//! - Peer calls are advisory and never fail a transition
//!
//! Every collaborator (services, pools, fencing daemon, peer) is reached
//! through the traits in `crate::control`.

mod config;
mod demote;
mod errors;
mod event;
mod fencing;
mod gate;
mod peer;
mod pools;
mod promote;
mod quorum;
mod report;
mod runner;
mod services;
mod state;
mod watchdog;

use std::sync::Arc;

use tokio::sync::broadcast;

pub use config::{
    EngineTunables, FailoverConfig, FailoverDocument, FileConfigSource, ImportOptions,
    InterfaceEntry, PoolRef, PoolStatus, DEFAULT_NETIF_READY_SENTINEL, DEFAULT_WATCHDOG_SENTINEL,
};
pub use demote::PWENC_SECRET_PATH;
pub use errors::{FailoverError, FailoverResult, IgnoreReason};
pub use event::{EventKind, RoleEvent, VrrpState};
pub use fencing::{FencingController, FencingOutcome};
pub use gate::{EventGate, GateDecision, JobHandle, JobState};
pub use peer::schedule_status_refresh;
pub use pools::PoolLifecycle;
pub use quorum::{evaluate as evaluate_quorum, QuorumVerdict};
pub use report::{FencingSummary, PoolFailure, ServiceTimeout, TransitionReport};
pub use runner::TransitionRunner;
pub use services::{is_become_active, is_critical, ServiceOrchestrator, Wave, BECOME_ACTIVE_SERVICES, CRITICAL_SERVICES};
pub use state::{ControllerRole, Progress, TransitionDescriptor, TransitionState};
pub use watchdog::{
    classify_previous_boot, BootCause, Rebooter, SysrqRebooter, WatchdogSentinel,
    SYSRQ_ENABLE_PATH, SYSRQ_TRIGGER_PATH,
};

use crate::control::Collaborators;
use crate::observability::{log_event, Event, EventBus, FailoverNotice, FailoverMetrics, MetricsSnapshot};

/// The failover event engine
///
/// Owns the gate, the runner and the `failover.vrrp_event` stream.
/// Cheap to share behind an `Arc`.
pub struct Engine {
    gate: EventGate,
    runner: Arc<TransitionRunner>,
    events: EventBus,
    metrics: Arc<FailoverMetrics>,
}

impl Engine {
    /// Start the engine. Must be called inside a Tokio runtime.
    pub fn new(collab: Collaborators, tunables: EngineTunables) -> FailoverResult<Self> {
        tunables.validate()?;

        let events = EventBus::default();
        let metrics = Arc::new(FailoverMetrics::new());
        let runner = TransitionRunner::start(
            collab.clone(),
            tunables,
            events.clone(),
            Arc::clone(&metrics),
        );
        let gate = EventGate::new(collab, Arc::clone(&runner), Arc::clone(&metrics));

        log_event(Event::EngineStart);
        Ok(Self {
            gate,
            runner,
            events,
            metrics,
        })
    }

    /// Role source hook: broadcast the change, then offer it to the gate.
    pub async fn hook(&self, ifname: &str, kind: EventKind) -> GateDecision {
        log_event(Event::RoleEventReceived);
        self.events.role_changed(ifname, kind);
        self.gate.offer(ifname, kind).await
    }

    /// Offer an event to the gate without broadcasting it.
    pub async fn offer(&self, ifname: &str, kind: EventKind) -> GateDecision {
        self.gate.offer(ifname, kind).await
    }

    /// Current controller role.
    pub fn role(&self) -> ControllerRole {
        self.runner.role()
    }

    /// The transition holding the lock, if any.
    pub fn transition(&self) -> Option<TransitionDescriptor> {
        self.runner.transition_state().current()
    }

    /// Jobs waiting for or holding the transition lock.
    pub fn in_flight(&self) -> usize {
        self.gate.in_flight()
    }

    /// Subscribe to the `failover.vrrp_event` stream.
    pub fn subscribe(&self) -> broadcast::Receiver<FailoverNotice> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
