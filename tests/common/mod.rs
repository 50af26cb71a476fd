//! Shared harness for engine tests
//!
//! Builds an engine on top of a simulated appliance with its sentinels
//! rooted in a scratch directory.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use hafailover::control::{Collaborators, SimulatedAppliance};
use hafailover::failover::{
    Engine, EngineTunables, EventKind, FailoverConfig, GateDecision, JobHandle, PoolStatus,
    TransitionReport,
};
use tempfile::TempDir;

pub const CRITICAL: [&str; 4] = ["iscsitarget", "cifs", "nfs", "nvmet"];

pub struct Harness {
    pub appliance: Arc<SimulatedAppliance>,
    pub engine: Engine,
    pub tunables: EngineTunables,
    _scratch: TempDir,
}

impl Harness {
    /// Engine over an appliance prepared by `setup`.
    pub fn new(setup: impl FnOnce(&SimulatedAppliance)) -> Self {
        Self::with_tunables(setup, |_| {})
    }

    pub fn with_tunables(
        setup: impl FnOnce(&SimulatedAppliance),
        tune: impl FnOnce(&mut EngineTunables),
    ) -> Self {
        let scratch = TempDir::new().unwrap();
        let appliance = SimulatedAppliance::new();
        setup(&appliance);

        let mut tunables = EngineTunables::rooted_at(scratch.path());
        tune(&mut tunables);

        let engine = Engine::new(
            Collaborators::from_appliance(Arc::clone(&appliance)),
            tunables.clone(),
        )
        .unwrap();

        Self {
            appliance,
            engine,
            tunables,
            _scratch: scratch,
        }
    }

    /// Offer an event that must be accepted and return its handle.
    pub async fn accept(&self, ifname: &str, kind: EventKind) -> JobHandle {
        match self.engine.hook(ifname, kind).await {
            GateDecision::Accepted(handle) => handle,
            other => panic!("expected {} on {} to be accepted, got {:?}", kind, ifname, other),
        }
    }

    /// Offer an event and wait for its report.
    pub async fn run(&self, ifname: &str, kind: EventKind) -> Arc<TransitionReport> {
        self.accept(ifname, kind).await.wait().await
    }

    /// Let background tasks (status refresh, workloads) catch up.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// One interface in group 1, every critical service plus two others enabled.
pub fn single_controller(appliance: &SimulatedAppliance) {
    appliance.set_config(FailoverConfig::new().with_group_member(1, "eth0"));
    appliance.set_enabled_services(&["iscsitarget", "cifs", "nfs", "nvmet", "ftp", "snmp"]);
}

pub fn with_offline_pool(appliance: &SimulatedAppliance, name: &str, guid: u64) {
    appliance.add_pool(name, guid, PoolStatus::Offline);
}
