//! Peer status propagation
//!
//! After a job reaches its terminal label, refresh the cached failover
//! status on this controller and poke the peer so its UI and status
//! endpoint catch up. Advisory only: failures are logged and dropped, and
//! the transition never waits on this.

use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;

use super::gate::JobHandle;
use super::report::TransitionReport;
use crate::control::{PeerClient, Platform};

/// Spawn the refresh task. With no job (rejected event) it runs at once.
pub fn schedule_status_refresh(
    job: Option<JobHandle>,
    platform: Arc<dyn Platform>,
    peer: Arc<dyn PeerClient>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Some(job) = job {
            let report = job.wait().await;
            tracing::debug!(
                job_id = %job.id(),
                progress = ?report.progress,
                "job finished, refreshing failover status"
            );
        }

        if let Err(e) = platform.status_refresh().await {
            tracing::warn!(error = %e, "failed to refresh local failover status");
        }
        if let Err(e) = peer.status_refresh().await {
            tracing::warn!(error = %e, "failed to refresh failover status on the peer");
        }
    })
}

/// Call a method on the peer, recording a failure on the report.
pub(crate) async fn call_advisory(
    peer: &dyn PeerClient,
    method: &str,
    args: Value,
    report: &mut TransitionReport,
) -> Option<Value> {
    match peer.call_remote(method, args).await {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(method, error = %e, "peer call failed");
            report.peer_failures.push(method.to_string());
            None
        }
    }
}
