//! Service Orchestrator
//!
//! Restarts data services in two waves. Each dispatch in a wave runs
//! concurrently under its own timeout; a timeout or failure is recorded and
//! never cancels a sibling or aborts the wave.
//!
//! Block targets in the become-active set keep in-kernel session state and
//! are repointed with `become_active` instead of being restarted.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::Instant;

use super::report::TransitionReport;
use crate::control::{CallResult, ControlOptions, Platform, ServiceControl, ServiceOp};

/// Services restarted in the first wave, in dispatch order
pub const CRITICAL_SERVICES: [&str; 4] = ["iscsitarget", "cifs", "nfs", "nvmet"];

/// Critical services that are repointed rather than restarted
pub const BECOME_ACTIVE_SERVICES: [&str; 2] = ["iscsitarget", "nvmet"];

pub fn is_critical(service: &str) -> bool {
    CRITICAL_SERVICES.contains(&service)
}

pub fn is_become_active(service: &str) -> bool {
    BECOME_ACTIVE_SERVICES.contains(&service)
}

/// Which services a wave covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wave {
    Critical,
    NonCritical,
}

impl Wave {
    pub fn as_str(&self) -> &'static str {
        match self {
            Wave::Critical => "critical",
            Wave::NonCritical => "non-critical",
        }
    }

    /// Select this wave's services from the enabled set, in dispatch order.
    pub fn select(&self, enabled: &[String]) -> Vec<String> {
        match self {
            Wave::Critical => CRITICAL_SERVICES
                .iter()
                .filter(|s| enabled.iter().any(|e| e == *s))
                .map(|s| s.to_string())
                .collect(),
            Wave::NonCritical => enabled
                .iter()
                .filter(|s| !is_critical(s))
                .cloned()
                .collect(),
        }
    }
}

enum Dispatch {
    Done,
    Failed(String),
    TimedOut(Duration),
}

#[derive(Clone)]
pub struct ServiceOrchestrator {
    services: Arc<dyn ServiceControl>,
    platform: Arc<dyn Platform>,
}

impl ServiceOrchestrator {
    pub fn new(services: Arc<dyn ServiceControl>, platform: Arc<dyn Platform>) -> Self {
        Self { services, platform }
    }

    async fn dispatch(&self, service: &str) -> CallResult<()> {
        if is_become_active(service) {
            self.services.become_active(service).await
        } else {
            self.services
                .control(ServiceOp::Restart, service, ControlOptions::LOCAL)
                .await
        }
    }

    /// Run one wave. Dispatch order, timeouts and failures land on `report`.
    pub async fn restart_wave(&self, wave: Wave, timeout: Duration, report: &mut TransitionReport) {
        let enabled = match self.services.enabled_services().await {
            Ok(enabled) => enabled,
            Err(e) => {
                tracing::error!(wave = wave.as_str(), error = %e, "failed to list enabled services");
                report.warn(format!("{} wave skipped: {}", wave.as_str(), e));
                return;
            }
        };

        let selected = wave.select(&enabled);
        if selected.is_empty() {
            tracing::info!(wave = wave.as_str(), "no services to restart");
            return;
        }

        if let Err(e) = self.platform.dns_sync().await {
            tracing::warn!(error = %e, "failed to sync DNS configuration");
            report.warn(format!("dns sync: {}", e));
        }

        tracing::info!(wave = wave.as_str(), services = ?selected, "restarting services");
        report.dispatched.extend(selected.iter().cloned());

        let dispatches = selected.iter().map(|service| async move {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(timeout, self.dispatch(service)).await {
                Ok(Ok(())) => Dispatch::Done,
                Ok(Err(e)) => Dispatch::Failed(e.to_string()),
                Err(_) => Dispatch::TimedOut(started.elapsed()),
            };
            (service, outcome)
        });

        for (service, outcome) in join_all(dispatches).await {
            match outcome {
                Dispatch::Done => {
                    tracing::debug!(service = %service, "service dispatched");
                }
                Dispatch::Failed(error) => {
                    tracing::error!(service = %service, error = %error, "failed to restart service");
                    report.service_failures.push(service.clone());
                }
                Dispatch::TimedOut(after) => {
                    tracing::error!(
                        service = %service,
                        after_ms = after.as_millis() as u64,
                        "timed out restarting service"
                    );
                    report.record_timeout(service, after);
                }
            }
        }
    }
}
