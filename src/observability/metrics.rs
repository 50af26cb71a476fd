//! Failover counters
//!
//! - Counters only, monotonic
//! - Reset only on process start
//! - Relaxed atomics; readers tolerate slightly stale values

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct FailoverMetrics {
    events_offered: AtomicU64,
    events_ignored: AtomicU64,
    events_dropped: AtomicU64,
    promotions: AtomicU64,
    demotions: AtomicU64,
    transitions_failed: AtomicU64,
    fencing_retries: AtomicU64,
    service_timeouts: AtomicU64,
    sysrq_reboots: AtomicU64,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub events_offered: u64,
    pub events_ignored: u64,
    pub events_dropped: u64,
    pub promotions: u64,
    pub demotions: u64,
    pub transitions_failed: u64,
    pub fencing_retries: u64,
    pub service_timeouts: u64,
    pub sysrq_reboots: u64,
}

impl FailoverMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_events_offered(&self) {
        self.events_offered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_events_ignored(&self) {
        self.events_ignored.fetch_add(1, Ordering::Relaxed);
    }

    /// Event read while the role source was paused
    pub fn increment_events_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_promotions(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_demotions(&self) {
        self.demotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_transitions_failed(&self) {
        self.transitions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_fencing_retries(&self, retries: u64) {
        self.fencing_retries.fetch_add(retries, Ordering::Relaxed);
    }

    pub fn add_service_timeouts(&self, timeouts: u64) {
        self.service_timeouts.fetch_add(timeouts, Ordering::Relaxed);
    }

    pub fn increment_sysrq_reboots(&self) {
        self.sysrq_reboots.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_offered: self.events_offered.load(Ordering::Relaxed),
            events_ignored: self.events_ignored.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            demotions: self.demotions.load(Ordering::Relaxed),
            transitions_failed: self.transitions_failed.load(Ordering::Relaxed),
            fencing_retries: self.fencing_retries.load(Ordering::Relaxed),
            service_timeouts: self.service_timeouts.load(Ordering::Relaxed),
            sysrq_reboots: self.sysrq_reboots.load(Ordering::Relaxed),
        }
    }
}
