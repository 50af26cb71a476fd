//! Role Source
//!
//! Watches the keepalived notify FIFO, keeps the observed VRRP state of
//! every interface, and hands MASTER/BACKUP/forcetakeover notifications to
//! the engine. `inject` is the writing side used by the `event` command.

mod errors;
mod fifo;
mod roles;

use async_trait::async_trait;

use crate::failover::{Engine, EventKind, GateDecision};

pub use errors::{VrrpError, VrrpResult};
pub use fifo::{format_line, inject, parse_line, Announcement, FifoReader, Notification, Scope};
pub use roles::RoleTable;

/// Receiver of role events read from the FIFO
#[async_trait]
pub trait RoleEventSink: Send + Sync {
    async fn deliver(&self, ifname: &str, kind: EventKind);
}

#[async_trait]
impl RoleEventSink for Engine {
    async fn deliver(&self, ifname: &str, kind: EventKind) {
        if let GateDecision::Accepted(job) = self.hook(ifname, kind).await {
            tracing::debug!(job_id = %job.id(), ifname, "role event queued");
        }
    }
}
