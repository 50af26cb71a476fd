//! Fencing Controller
//!
//! Owns start/stop of the SCSI-PR fencing daemon. Only one daemon may run
//! per controller.
//!
//! A peer that has begun shutting down keeps its daemon alive for roughly
//! one reservation grace period (~11 s), during which a local start reports
//! "peer still running". That outcome is retried up to the attempt budget;
//! every other outcome is returned immediately.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::report::FencingSummary;
use crate::control::{CallResult, FencingDaemon};

/// Exit status of the fencing daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum FencingOutcome {
    /// Reservations held
    Ok,
    /// Key registration failed on the disks
    KeyRegistrationFailed,
    /// The peer's daemon still holds reservations
    PeerRunning,
    /// Too many disks failed to be reserved
    TooManyDisksFailed,
    /// The daemon hit an unexpected fatal error
    Fatal,
    /// Any code the daemon is not documented to return
    Unexpected(i32),
}

impl FencingOutcome {
    /// Map a daemon exit code.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => FencingOutcome::Ok,
            1 => FencingOutcome::KeyRegistrationFailed,
            2 => FencingOutcome::PeerRunning,
            3 => FencingOutcome::TooManyDisksFailed,
            5 => FencingOutcome::Fatal,
            other => FencingOutcome::Unexpected(other),
        }
    }

    /// The daemon exit code.
    pub fn code(&self) -> i32 {
        match self {
            FencingOutcome::Ok => 0,
            FencingOutcome::KeyRegistrationFailed => 1,
            FencingOutcome::PeerRunning => 2,
            FencingOutcome::TooManyDisksFailed => 3,
            FencingOutcome::Fatal => 5,
            FencingOutcome::Unexpected(code) => *code,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, FencingOutcome::Ok)
    }

    /// Whether another start attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FencingOutcome::PeerRunning)
    }

    pub fn description(&self) -> &'static str {
        match self {
            FencingOutcome::Ok => "reservations acquired",
            FencingOutcome::KeyRegistrationFailed => "failed to register keys on disks",
            FencingOutcome::PeerRunning => "fencing is running on the remote node",
            FencingOutcome::TooManyDisksFailed => "10% or more of the disks failed to be reserved",
            FencingOutcome::Fatal => "fencing encountered an unexpected fatal error",
            FencingOutcome::Unexpected(_) => "fencing exited with an undocumented code",
        }
    }
}

impl From<i32> for FencingOutcome {
    fn from(code: i32) -> Self {
        Self::from_code(code)
    }
}

impl From<FencingOutcome> for i32 {
    fn from(outcome: FencingOutcome) -> Self {
        outcome.code()
    }
}

impl fmt::Display for FencingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (exit code {})", self.description(), self.code())
    }
}

/// Bounded-retry wrapper around the fencing daemon
#[derive(Clone)]
pub struct FencingController {
    daemon: Arc<dyn FencingDaemon>,
    max_attempts: u32,
}

impl FencingController {
    pub fn new(daemon: Arc<dyn FencingDaemon>, max_attempts: u32) -> Self {
        Self {
            daemon,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Acquire reservations. Each attempt stops any local daemon and starts
    /// a new one; `force` preempts the peer's reservations.
    pub async fn acquire(&self, force: bool) -> CallResult<FencingSummary> {
        let started = Instant::now();
        let mut outcome = FencingOutcome::Fatal;
        let mut attempts = 0;

        for attempt in 1..=self.max_attempts {
            attempts = attempt;

            tracing::warn!(attempt, "stopping fencing");
            self.daemon.stop().await?;

            tracing::warn!(attempt, force, "starting fencing");
            outcome = FencingOutcome::from_code(self.daemon.start(force).await?);

            if !outcome.is_retryable() {
                break;
            }

            let waited = started.elapsed().as_secs();
            if attempt < self.max_attempts {
                tracing::warn!(
                    waited_secs = waited,
                    "fencing is running on remote node after waiting {} seconds, retrying",
                    waited
                );
            } else {
                tracing::warn!(
                    waited_secs = waited,
                    "fencing is running on remote node after waiting {} seconds",
                    waited
                );
            }
        }

        let elapsed = started.elapsed();
        if attempts > 1 {
            tracing::warn!(
                attempts,
                elapsed_secs = elapsed.as_secs(),
                outcome = outcome.code(),
                "fencing acquisition took {} attempts",
                attempts
            );
        }

        Ok(FencingSummary {
            outcome,
            attempts,
            elapsed_ms: elapsed.as_millis() as u64,
            forced: force,
        })
    }

    /// Release reservations. Returns whether a daemon had to be stopped.
    pub async fn release(&self) -> CallResult<bool> {
        if !self.daemon.running().await? {
            tracing::info!("fencing is not running, nothing to release");
            return Ok(false);
        }

        tracing::warn!("stopping fencing");
        self.daemon.stop().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::CallError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedDaemon {
        outcomes: Mutex<VecDeque<i32>>,
        calls: Mutex<Vec<String>>,
        running: Mutex<bool>,
        per_start: Duration,
    }

    impl ScriptedDaemon {
        fn new(outcomes: &[i32]) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.iter().copied().collect()),
                calls: Mutex::new(Vec::new()),
                running: Mutex::new(false),
                per_start: Duration::from_secs(11),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FencingDaemon for ScriptedDaemon {
        async fn start(&self, force: bool) -> CallResult<i32> {
            self.calls.lock().unwrap().push(format!("start(force={})", force));
            tokio::time::sleep(self.per_start).await;
            let code = self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| CallError::new("failover.fenced.start", "script exhausted"))?;
            *self.running.lock().unwrap() = code == 0;
            Ok(code)
        }

        async fn stop(&self) -> CallResult<()> {
            self.calls.lock().unwrap().push("stop".into());
            *self.running.lock().unwrap() = false;
            Ok(())
        }

        async fn running(&self) -> CallResult<bool> {
            Ok(*self.running.lock().unwrap())
        }
    }

    #[test]
    fn test_outcome_codes() {
        for code in [0, 1, 2, 3, 5] {
            assert_eq!(FencingOutcome::from_code(code).code(), code);
        }
        assert_eq!(FencingOutcome::from_code(4), FencingOutcome::Unexpected(4));
        assert!(FencingOutcome::PeerRunning.is_retryable());
        assert!(!FencingOutcome::TooManyDisksFailed.is_retryable());
    }

    #[test]
    fn test_outcome_serializes_as_exit_code() {
        assert_eq!(serde_json::to_string(&FencingOutcome::TooManyDisksFailed).unwrap(), "3");
        let parsed: FencingOutcome = serde_json::from_str("2").unwrap();
        assert_eq!(parsed, FencingOutcome::PeerRunning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_running_then_clear_on_last_attempt() {
        let daemon = ScriptedDaemon::new(&[2, 2, 2, 0]);
        let controller = FencingController::new(daemon.clone(), 4);

        let summary = controller.acquire(false).await.unwrap();

        assert!(summary.outcome.is_ok());
        assert_eq!(summary.attempts, 4);
        assert_eq!(summary.elapsed_ms, 44_000);
        assert_eq!(daemon.calls().iter().filter(|c| *c == "stop").count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_running_exhausts_budget() {
        let daemon = ScriptedDaemon::new(&[2, 2, 2, 2]);
        let controller = FencingController::new(daemon, 4);

        let summary = controller.acquire(false).await.unwrap();

        assert_eq!(summary.outcome, FencingOutcome::PeerRunning);
        assert_eq!(summary.attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_outcome_not_retried() {
        let daemon = ScriptedDaemon::new(&[1, 0]);
        let controller = FencingController::new(daemon.clone(), 4);

        let summary = controller.acquire(false).await.unwrap();

        assert_eq!(summary.outcome, FencingOutcome::KeyRegistrationFailed);
        assert_eq!(summary.attempts, 1);
        assert_eq!(daemon.calls(), vec!["stop", "start(force=false)"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_flag_reaches_daemon() {
        let daemon = ScriptedDaemon::new(&[0]);
        let controller = FencingController::new(daemon.clone(), 4);

        let summary = controller.acquire(true).await.unwrap();

        assert!(summary.forced);
        assert_eq!(daemon.calls(), vec!["stop", "start(force=true)"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_skips_stopped_daemon() {
        let daemon = ScriptedDaemon::new(&[0]);
        let controller = FencingController::new(daemon.clone(), 1);

        assert!(!controller.release().await.unwrap());

        controller.acquire(false).await.unwrap();
        assert!(controller.release().await.unwrap());
    }
}
