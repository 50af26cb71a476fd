//! Failover events
//!
//! Two kinds of output:
//! - `Event`: typed lifecycle log lines of the engine itself
//! - `EventBus`: the `failover.vrrp_event` stream consumers subscribe to
//!
//! Stream delivery is best-effort: no subscriber, or a lagging one, never
//! blocks or fails the engine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::failover::EventKind;

/// Name of the role-change stream
pub const VRRP_EVENT_STREAM: &str = "failover.vrrp_event";

const DEFAULT_CAPACITY: usize = 256;

/// Engine lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Engine startup begins
    EngineStart,
    /// Engine is consuming role events
    EngineReady,
    /// Previous boot classified
    BootClassified,
    /// Role FIFO opened for reading
    FifoOpened,
    /// Role FIFO writer went away
    FifoClosed,
    /// Role event parsed from the FIFO
    RoleEventReceived,
    /// Role event discarded while events are paused
    RoleEventDropped,
    /// Transition accepted by the gate
    TransitionAccepted,
    /// Transition ignored
    TransitionIgnored,
    /// Transition finished with SUCCESS
    TransitionSucceeded,
    /// Transition finished with ERROR
    TransitionFailed,
    /// Export deadline fired the violent reboot
    SysrqFired,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::EngineStart => "ENGINE_STARTUP_BEGIN",
            Event::EngineReady => "ENGINE_READY",
            Event::BootClassified => "BOOT_CLASSIFIED",
            Event::FifoOpened => "FIFO_OPENED",
            Event::FifoClosed => "FIFO_CLOSED",
            Event::RoleEventReceived => "ROLE_EVENT_RECEIVED",
            Event::RoleEventDropped => "ROLE_EVENT_DROPPED",
            Event::TransitionAccepted => "TRANSITION_ACCEPTED",
            Event::TransitionIgnored => "TRANSITION_IGNORED",
            Event::TransitionSucceeded => "TRANSITION_SUCCESS",
            Event::TransitionFailed => "TRANSITION_ERROR",
            Event::SysrqFired => "SYSRQ_REBOOT",
        }
    }

    /// Whether the event is logged at error level.
    pub fn is_failure(&self) -> bool {
        matches!(self, Event::TransitionFailed | Event::SysrqFired)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Log a lifecycle event.
pub fn log_event(event: Event) {
    if event.is_failure() {
        tracing::error!(event = event.as_str(), "{}", event);
    } else {
        tracing::info!(event = event.as_str(), "{}", event);
    }
}

/// What a stream notice reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NoticeKind {
    /// A role event arrived from the role source
    Changed,
    /// A forced takeover is preempting the peer
    ForceTakeover,
}

/// One message on the `failover.vrrp_event` stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverNotice {
    pub stream: String,
    pub kind: NoticeKind,
    pub ifname: String,
    pub event: EventKind,
    pub emitted_at: DateTime<Utc>,
}

/// Publisher side of the `failover.vrrp_event` stream
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FailoverNotice>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FailoverNotice> {
        self.tx.subscribe()
    }

    fn publish(&self, kind: NoticeKind, ifname: &str, event: EventKind) {
        let notice = FailoverNotice {
            stream: VRRP_EVENT_STREAM.to_string(),
            kind,
            ifname: ifname.to_string(),
            event,
            emitted_at: Utc::now(),
        };
        // no subscribers is fine
        let _ = self.tx.send(notice);
    }

    /// Broadcast a role event as received.
    pub fn role_changed(&self, ifname: &str, event: EventKind) {
        self.publish(NoticeKind::Changed, ifname, event);
    }

    /// Tell operators a forced takeover is preempting the peer.
    pub fn force_takeover(&self, ifname: &str) {
        self.publish(NoticeKind::ForceTakeover, ifname, EventKind::ForceTakeover);
    }
}
