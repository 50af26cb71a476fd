//! Fencing daemon process adapter
//!
//! `start` runs the daemon binary and returns its exit code. The daemon
//! forks into the background once it holds the reservations, so a zero
//! exit means "reserved and running". `stop` signals the pid recorded in
//! the daemon's pid file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use super::{CallError, CallResult, FencingDaemon};

/// Default fencing daemon binary
pub const DEFAULT_FENCED_PATH: &str = "/usr/local/sbin/fenced";

/// Default pid file written by the daemon
pub const DEFAULT_FENCED_PIDFILE: &str = "/run/fenced.pid";

#[derive(Debug, Clone)]
pub struct FencedProcess {
    binary: PathBuf,
    pid_file: PathBuf,
}

impl Default for FencedProcess {
    fn default() -> Self {
        Self::new(DEFAULT_FENCED_PATH, DEFAULT_FENCED_PIDFILE)
    }
}

impl FencedProcess {
    pub fn new(binary: impl Into<PathBuf>, pid_file: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            pid_file: pid_file.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    async fn pid(&self) -> Option<u32> {
        let content = tokio::fs::read_to_string(&self.pid_file).await.ok()?;
        content.trim().parse().ok()
    }

    async fn alive(pid: u32) -> bool {
        tokio::fs::metadata(format!("/proc/{}", pid)).await.is_ok()
    }
}

#[async_trait]
impl FencingDaemon for FencedProcess {
    async fn start(&self, force: bool) -> CallResult<i32> {
        let mut command = Command::new(&self.binary);
        if force {
            command.arg("--force");
        }

        let status = command.status().await.map_err(|e| {
            CallError::new(
                "failover.fenced.start",
                format!("failed to run {}: {}", self.binary.display(), e),
            )
        })?;

        // killed by a signal: no exit code, treat as a fatal daemon error
        Ok(status.code().unwrap_or(4))
    }

    async fn stop(&self) -> CallResult<()> {
        let Some(pid) = self.pid().await else {
            return Ok(());
        };
        if !Self::alive(pid).await {
            return Ok(());
        }

        let status = Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .status()
            .await
            .map_err(|e| CallError::new("failover.fenced.stop", e.to_string()))?;

        if status.success() {
            Ok(())
        } else {
            Err(CallError::new(
                "failover.fenced.stop",
                format!("kill {} exited with {}", pid, status),
            ))
        }
    }

    async fn running(&self) -> CallResult<bool> {
        match self.pid().await {
            Some(pid) => Ok(Self::alive(pid).await),
            None => Ok(false),
        }
    }
}
