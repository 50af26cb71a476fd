//! Observability subsystem
//!
//! - Log subscriber installation (`tracing-subscriber`)
//! - Phase scopes: BEGIN / COMPLETE / FAILED per pipeline phase
//! - Lifecycle events and the `failover.vrrp_event` stream
//! - Failover counters
//!
//! Observability never fails a transition: a stream without subscribers or
//! an uninstalled subscriber is silently tolerated.

mod events;
mod logger;
mod metrics;
mod scope;

pub use events::{log_event, Event, EventBus, FailoverNotice, NoticeKind, VRRP_EVENT_STREAM};
pub use logger::{init, LogFormat};
pub use metrics::{FailoverMetrics, MetricsSnapshot};
pub use scope::PhaseScope;
