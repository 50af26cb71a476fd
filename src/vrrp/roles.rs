//! Observed role table
//!
//! Last VRRP state reported for every interface, plus the pause flag the
//! pipelines flip around VRRP daemon reloads. Implements `VrrpControl` for
//! the engine.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::control::{CallResult, VrrpControl};
use crate::failover::VrrpState;

#[derive(Debug, Default)]
pub struct RoleTable {
    states: RwLock<BTreeMap<String, VrrpState>>,
    paused: AtomicBool,
}

impl RoleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest state of an interface. Returns the previous one.
    pub fn record(&self, ifname: &str, state: VrrpState) -> Option<VrrpState> {
        let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
        states.insert(ifname.to_string(), state)
    }

    pub fn get(&self, ifname: &str) -> VrrpState {
        self.states
            .read()
            .ok()
            .and_then(|s| s.get(ifname).copied())
            .unwrap_or(VrrpState::Unknown)
    }

    pub fn snapshot(&self) -> BTreeMap<String, VrrpState> {
        self.states.read().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn unpause(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VrrpControl for RoleTable {
    async fn observed_state(&self, ifname: &str) -> VrrpState {
        self.get(ifname)
    }

    async fn pause_events(&self) -> CallResult<()> {
        tracing::info!("pausing failover event processing");
        self.pause();
        Ok(())
    }

    async fn unpause_events(&self) -> CallResult<()> {
        tracing::info!("unpausing failover event processing");
        self.unpause();
        Ok(())
    }
}
