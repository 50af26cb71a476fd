//! PhaseScope for pipeline phase logging
//!
//! - Logs `{PHASE}_BEGIN` on creation
//! - Logs `{PHASE}_COMPLETE` with elapsed time on `complete()`
//! - Logs `{PHASE}_FAILED` on `fail()`
//! - Logs `{PHASE}_INCOMPLETE` on drop otherwise (early `?` return, panic)
//!
//! Job fields (`job_id`, `ifname`, `kind`) come from the enclosing
//! transition span.

use tokio::time::Instant;

/// A scope that logs the lifecycle of one pipeline phase
///
/// ```ignore
/// let scope = PhaseScope::new("FENCING");
/// // ... do work ...
/// scope.complete();
/// ```
pub struct PhaseScope {
    name: &'static str,
    started: Instant,
    finished: bool,
}

impl PhaseScope {
    pub fn new(name: &'static str) -> Self {
        tracing::info!(phase = name, "{}_BEGIN", name);
        Self {
            name,
            started: Instant::now(),
            finished: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn complete(mut self) {
        self.finished = true;
        tracing::info!(
            phase = self.name,
            elapsed_ms = self.elapsed_ms(),
            "{}_COMPLETE",
            self.name
        );
    }

    /// Phase had nothing to do.
    pub fn skip(mut self, reason: &str) {
        self.finished = true;
        tracing::info!(phase = self.name, reason, "{}_SKIPPED", self.name);
    }

    pub fn fail(mut self, reason: &str) {
        self.finished = true;
        tracing::error!(
            phase = self.name,
            elapsed_ms = self.elapsed_ms(),
            reason,
            "{}_FAILED",
            self.name
        );
    }
}

impl Drop for PhaseScope {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(
                phase = self.name,
                elapsed_ms = self.elapsed_ms(),
                "{}_INCOMPLETE",
                self.name
            );
        }
    }
}
