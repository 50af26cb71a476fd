//! Simulated appliance
//!
//! One object that plays every collaborator role against in-memory state.
//! Every call is appended to an ordered journal (`"service.restart cifs"`,
//! `"pool.import tank"`, `"fencing.start force"`, ...) so tests can assert
//! which side effects happened and in what order.
//!
//! Knobs cover the failure modes the engine must survive: pool import
//! errors, hanging exports, scripted fencing outcomes, slow services,
//! sibling VRRP states, an unreachable peer, per-call injected errors and
//! one-shot panics.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{
    AttachReport, CallError, CallResult, ConfigSource, ControlOptions, DiskControl,
    FencingDaemon, Firewall, PeerClient, Platform, PoolStore, ServiceControl, ServiceOp,
    TargetControl, UnlockReport, VrrpControl, Workload,
};
use crate::failover::{FailoverConfig, ImportOptions, PoolRef, PoolStatus, Rebooter, VrrpState};

#[derive(Debug)]
struct SimState {
    config: FailoverConfig,
    config_error: Option<String>,

    enabled_services: Vec<String>,
    running_services: BTreeSet<String>,
    service_delays: HashMap<String, Duration>,

    pools: Vec<PoolRef>,
    import_errors: HashMap<String, VecDeque<CallError>>,
    hanging_exports: HashSet<String>,
    export_delay: Duration,
    locked_datasets: HashMap<String, Vec<String>>,

    fencing_script: VecDeque<i32>,
    fencing_delay: Duration,
    fencing_running: bool,

    vrrp_states: HashMap<String, VrrpState>,
    events_paused: bool,
    firewall_open: bool,
    rebooted: bool,
    peer_reachable: bool,

    alua_enabled: bool,
    target_loaded: bool,
    target_suspended: bool,
    ana_active: bool,
    nvmet_running: bool,
    kmip_enabled: bool,
    sed_unlocked: bool,
    remote_attach_delay: Duration,

    failing: HashSet<String>,
    panicking: HashSet<String>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            config: FailoverConfig::new(),
            config_error: None,
            enabled_services: Vec::new(),
            running_services: BTreeSet::new(),
            service_delays: HashMap::new(),
            pools: Vec::new(),
            import_errors: HashMap::new(),
            hanging_exports: HashSet::new(),
            export_delay: Duration::ZERO,
            locked_datasets: HashMap::new(),
            fencing_script: VecDeque::new(),
            fencing_delay: Duration::ZERO,
            fencing_running: false,
            vrrp_states: HashMap::new(),
            events_paused: false,
            firewall_open: false,
            rebooted: false,
            peer_reachable: true,
            alua_enabled: false,
            target_loaded: false,
            target_suspended: false,
            ana_active: false,
            nvmet_running: false,
            kmip_enabled: false,
            sed_unlocked: false,
            remote_attach_delay: Duration::ZERO,
            failing: HashSet::new(),
            panicking: HashSet::new(),
        }
    }
}

/// In-memory appliance implementing every collaborator trait
#[derive(Debug, Default)]
pub struct SimulatedAppliance {
    state: Mutex<SimState>,
    journal: Mutex<Vec<String>>,
}

impl SimulatedAppliance {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Journal a call and fail it if it was marked failing.
    fn record(&self, entry: String) -> CallResult<()> {
        let failing = self.state().failing.contains(&entry);
        let panicking = self.state().panicking.remove(&entry);
        self.journal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone());
        if panicking {
            panic!("injected panic in {}", entry);
        }
        if failing {
            return Err(CallError::new(entry, "injected failure"));
        }
        Ok(())
    }

    // ---- knobs ----

    pub fn set_config(&self, config: FailoverConfig) {
        let mut state = self.state();
        state.config = config;
        state.config_error = None;
    }

    /// Make configuration reads fail.
    pub fn fail_config(&self, message: &str) {
        self.state().config_error = Some(message.to_string());
    }

    pub fn set_enabled_services(&self, services: &[&str]) {
        self.state().enabled_services = services.iter().map(|s| s.to_string()).collect();
    }

    pub fn set_service_delay(&self, service: &str, delay: Duration) {
        self.state().service_delays.insert(service.to_string(), delay);
    }

    pub fn add_pool(&self, name: &str, guid: u64, status: PoolStatus) {
        self.state().pools.push(PoolRef::new(name, guid, status));
    }

    /// Queue an error for the next import of a pool.
    pub fn fail_import(&self, pool: &str, error: CallError) {
        self.state()
            .import_errors
            .entry(pool.to_string())
            .or_default()
            .push_back(error);
    }

    /// Exports of this pool never return.
    pub fn hang_export(&self, pool: &str) {
        self.state().hanging_exports.insert(pool.to_string());
    }

    pub fn set_export_delay(&self, delay: Duration) {
        self.state().export_delay = delay;
    }

    /// Datasets that stay locked after an import of this pool.
    pub fn set_locked_datasets(&self, pool: &str, datasets: &[&str]) {
        self.state().locked_datasets.insert(
            pool.to_string(),
            datasets.iter().map(|d| d.to_string()).collect(),
        );
    }

    /// Exit codes for successive fencing starts. Exhausted script returns 0.
    pub fn script_fencing(&self, codes: &[i32]) {
        self.state().fencing_script = codes.iter().copied().collect();
    }

    /// Time each fencing start takes.
    pub fn set_fencing_delay(&self, delay: Duration) {
        self.state().fencing_delay = delay;
    }

    pub fn set_fencing_running(&self, running: bool) {
        self.state().fencing_running = running;
    }

    pub fn set_vrrp_state(&self, ifname: &str, state: VrrpState) {
        self.state().vrrp_states.insert(ifname.to_string(), state);
    }

    pub fn set_peer_reachable(&self, reachable: bool) {
        self.state().peer_reachable = reachable;
    }

    pub fn set_alua(&self, enabled: bool, target_loaded: bool) {
        let mut state = self.state();
        state.alua_enabled = enabled;
        state.target_loaded = target_loaded;
    }

    pub fn set_nvmet(&self, ana_active: bool, running: bool) {
        let mut state = self.state();
        state.ana_active = ana_active;
        state.nvmet_running = running;
    }

    pub fn set_kmip_enabled(&self, enabled: bool) {
        self.state().kmip_enabled = enabled;
    }

    pub fn set_sed_unlocked(&self, unlocked: bool) {
        self.state().sed_unlocked = unlocked;
    }

    pub fn set_remote_attach_delay(&self, delay: Duration) {
        self.state().remote_attach_delay = delay;
    }

    /// Fail every call whose journal entry equals `entry`.
    pub fn fail_call(&self, entry: &str) {
        self.state().failing.insert(entry.to_string());
    }

    /// Panic the next time `entry` is called, then behave normally.
    pub fn panic_once(&self, entry: &str) {
        self.state().panicking.insert(entry.to_string());
    }

    // ---- observations ----

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().map(|j| j.clone()).unwrap_or_default()
    }

    pub fn clear_journal(&self) {
        self.journal.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn journal_contains(&self, entry: &str) -> bool {
        self.journal_position(entry).is_some()
    }

    /// Index of the first journal entry equal to `entry`.
    pub fn journal_position(&self, entry: &str) -> Option<usize> {
        self.journal
            .lock()
            .ok()
            .and_then(|j| j.iter().position(|e| e == entry))
    }

    /// Number of journal entries starting with `prefix`.
    pub fn journal_count(&self, prefix: &str) -> usize {
        self.journal
            .lock()
            .map(|j| j.iter().filter(|e| e.starts_with(prefix)).count())
            .unwrap_or(0)
    }

    pub fn pool_status(&self, name: &str) -> Option<PoolStatus> {
        self.state()
            .pools
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.status)
    }

    pub fn pools(&self) -> Vec<PoolRef> {
        self.state().pools.clone()
    }

    pub fn firewall_open(&self) -> bool {
        self.state().firewall_open
    }

    pub fn events_paused(&self) -> bool {
        self.state().events_paused
    }

    pub fn fencing_running(&self) -> bool {
        self.state().fencing_running
    }

    pub fn service_running(&self, service: &str) -> bool {
        self.state().running_services.contains(service)
    }

    pub fn rebooted(&self) -> bool {
        self.state().rebooted
    }

    fn service_delay(&self, service: &str) -> Duration {
        self.state()
            .service_delays
            .get(service)
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl ConfigSource for SimulatedAppliance {
    async fn failover_config(&self) -> CallResult<FailoverConfig> {
        let state = self.state();
        match &state.config_error {
            Some(message) => Err(CallError::new("failover.config", message.clone())),
            None => Ok(state.config.clone()),
        }
    }
}

#[async_trait]
impl ServiceControl for SimulatedAppliance {
    async fn control(&self, op: ServiceOp, service: &str, _options: ControlOptions) -> CallResult<()> {
        self.record(format!("{} {}", op.method(), service))?;
        pause(self.service_delay(service)).await;

        let mut state = self.state();
        match op {
            ServiceOp::Start | ServiceOp::Restart | ServiceOp::Reload => {
                state.running_services.insert(service.to_string());
            }
            ServiceOp::Stop => {
                state.running_services.remove(service);
            }
        }
        Ok(())
    }

    async fn become_active(&self, service: &str) -> CallResult<()> {
        self.record(format!("service.become_active {}", service))?;
        pause(self.service_delay(service)).await;
        self.state().running_services.insert(service.to_string());
        Ok(())
    }

    async fn started_or_enabled(&self, service: &str) -> CallResult<bool> {
        let state = self.state();
        Ok(state.running_services.contains(service)
            || state.enabled_services.iter().any(|s| s == service))
    }

    async fn enabled_services(&self) -> CallResult<Vec<String>> {
        Ok(self.state().enabled_services.clone())
    }

    async fn generate(&self, key: &str) -> CallResult<()> {
        self.record(format!("etc.generate {}", key))
    }
}

#[async_trait]
impl FencingDaemon for SimulatedAppliance {
    async fn start(&self, force: bool) -> CallResult<i32> {
        self.record(if force {
            "fencing.start force".to_string()
        } else {
            "fencing.start".to_string()
        })?;

        let delay = self.state().fencing_delay;
        pause(delay).await;

        let mut state = self.state();
        let code = state.fencing_script.pop_front().unwrap_or(0);
        state.fencing_running = code == 0;
        Ok(code)
    }

    async fn stop(&self) -> CallResult<()> {
        self.record("fencing.stop".to_string())?;
        self.state().fencing_running = false;
        Ok(())
    }

    async fn running(&self) -> CallResult<bool> {
        Ok(self.fencing_running())
    }
}

#[async_trait]
impl PoolStore for SimulatedAppliance {
    async fn query_pools(&self) -> CallResult<Vec<PoolRef>> {
        Ok(self.pools())
    }

    async fn import_pool(&self, guid: u64, options: &ImportOptions) -> CallResult<()> {
        let name = self
            .state()
            .pools
            .iter()
            .find(|p| p.guid == guid)
            .map(|p| p.name.clone())
            .ok_or_else(|| CallError::new("zfs.pool.import_pool", format!("no pool with guid {}", guid)))?;

        let suffix = if options.use_cachefile { "" } else { " without cachefile" };
        self.record(format!("pool.import {}{}", name, suffix))?;

        let mut state = self.state();
        if let Some(error) = state.import_errors.get_mut(&name).and_then(|q| q.pop_front()) {
            return Err(error);
        }
        if let Some(pool) = state.pools.iter_mut().find(|p| p.guid == guid) {
            pool.status = PoolStatus::Online;
        }
        Ok(())
    }

    async fn export_pool(&self, name: &str, _force: bool) -> CallResult<()> {
        self.record(format!("pool.export {}", name))?;

        let (hang, delay) = {
            let state = self.state();
            (state.hanging_exports.contains(name), state.export_delay)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        pause(delay).await;

        if let Some(pool) = self.state().pools.iter_mut().find(|p| p.name == name) {
            pool.status = PoolStatus::Offline;
        }
        Ok(())
    }

    async fn handle_unencrypted_datasets(&self, pool: &str) -> CallResult<()> {
        self.record(format!("pool.handle_unencrypted_datasets {}", pool))
    }

    async fn unlock_datasets(&self, pool: &str) -> CallResult<UnlockReport> {
        self.record(format!("pool.unlock_datasets {}", pool))?;
        Ok(UnlockReport {
            failed: self
                .state()
                .locked_datasets
                .get(pool)
                .cloned()
                .unwrap_or_default(),
        })
    }

    async fn ddt_prefetch(&self) -> CallResult<()> {
        self.record("pool.ddt_prefetch".to_string())
    }
}

#[async_trait]
impl DiskControl for SimulatedAppliance {
    async fn attach_remote_shelves(&self, fenced_reload: bool) -> CallResult<AttachReport> {
        self.record(format!("disk.attach_remote_shelves {}", fenced_reload))?;
        let delay = self.state().remote_attach_delay;
        pause(delay).await;
        Ok(AttachReport {
            failed: false,
            message: "no remote shelves".to_string(),
        })
    }

    async fn sed_unlock_all(&self) -> CallResult<bool> {
        self.record("disk.sed_unlock_all".to_string())?;
        Ok(self.state().sed_unlocked)
    }

    async fn retaste(&self) -> CallResult<()> {
        self.record("disk.retaste".to_string())
    }

    async fn sync_all(&self) -> CallResult<()> {
        self.record("disk.sync_all".to_string())
    }
}

#[async_trait]
impl TargetControl for SimulatedAppliance {
    async fn alua_enabled(&self) -> CallResult<bool> {
        Ok(self.state().alua_enabled)
    }

    async fn suspend(&self, timeout_secs: u64) -> CallResult<bool> {
        self.record(format!("iscsi.suspend {}", timeout_secs))?;
        let mut state = self.state();
        state.target_suspended = state.target_loaded;
        Ok(state.target_loaded)
    }

    async fn clear_suspend(&self) -> CallResult<bool> {
        self.record("iscsi.clear_suspend".to_string())?;
        let mut state = self.state();
        let was = state.target_suspended;
        state.target_suspended = false;
        Ok(was)
    }

    async fn force_close_sessions(&self) -> CallResult<()> {
        self.record("iscsi.force_close_sessions".to_string())
    }

    async fn active_elected(&self) -> CallResult<()> {
        self.record("iscsi.active_elected".to_string())
    }

    async fn activate_extents(&self) -> CallResult<()> {
        self.record("iscsi.activate_extents".to_string())
    }

    async fn reset_active(&self) -> CallResult<()> {
        self.record("iscsi.reset_active".to_string())
    }

    async fn standby_write_empty_config(&self) -> CallResult<()> {
        self.record("iscsi.standby_write_empty_config".to_string())
    }

    async fn kernel_module_loaded(&self) -> CallResult<bool> {
        Ok(self.state().target_loaded)
    }

    async fn nvmet_ana_active(&self) -> CallResult<bool> {
        Ok(self.state().ana_active)
    }

    async fn nvmet_running(&self) -> CallResult<bool> {
        Ok(self.state().nvmet_running)
    }
}

#[async_trait]
impl Firewall for SimulatedAppliance {
    async fn accept_all(&self) -> CallResult<()> {
        self.record("firewall.accept_all".to_string())?;
        self.state().firewall_open = true;
        Ok(())
    }

    async fn drop_all(&self) -> CallResult<()> {
        self.record("firewall.drop_all".to_string())?;
        self.state().firewall_open = false;
        Ok(())
    }
}

#[async_trait]
impl VrrpControl for SimulatedAppliance {
    async fn observed_state(&self, ifname: &str) -> VrrpState {
        self.state()
            .vrrp_states
            .get(ifname)
            .copied()
            .unwrap_or(VrrpState::Unknown)
    }

    async fn pause_events(&self) -> CallResult<()> {
        self.record("vrrp.pause_events".to_string())?;
        self.state().events_paused = true;
        Ok(())
    }

    async fn unpause_events(&self) -> CallResult<()> {
        self.record("vrrp.unpause_events".to_string())?;
        self.state().events_paused = false;
        Ok(())
    }
}

#[async_trait]
impl PeerClient for SimulatedAppliance {
    async fn status_refresh(&self) -> CallResult<()> {
        if !self.state().peer_reachable {
            return Err(CallError::new("failover.status_refresh", "peer unreachable"));
        }
        self.record("peer.status_refresh".to_string())
    }

    async fn call_remote(&self, method: &str, _args: Value) -> CallResult<Value> {
        if !self.state().peer_reachable {
            return Err(CallError::new(method, "peer unreachable"));
        }
        self.record(format!("peer.call_remote {}", method))?;
        Ok(Value::Null)
    }
}

#[async_trait]
impl Platform for SimulatedAppliance {
    async fn status_refresh(&self) -> CallResult<()> {
        self.record("platform.status_refresh".to_string())
    }

    async fn dns_sync(&self) -> CallResult<()> {
        self.record("platform.dns_sync".to_string())
    }

    async fn system_dataset_setup(&self) -> CallResult<()> {
        self.record("platform.system_dataset_setup".to_string())
    }

    async fn directory_services_setup(&self) -> CallResult<()> {
        self.record("platform.directory_services_setup".to_string())
    }

    async fn directory_services_standby(&self) -> CallResult<()> {
        self.record("platform.directory_services_standby".to_string())
    }

    async fn update_replication_tasks(&self) -> CallResult<()> {
        self.record("platform.update_replication_tasks".to_string())
    }

    async fn block_failover_alerts(&self) -> CallResult<()> {
        self.record("platform.block_failover_alerts".to_string())
    }

    async fn initialize_alerts(&self) -> CallResult<()> {
        self.record("platform.initialize_alerts".to_string())
    }

    async fn renew_certificates(&self) -> CallResult<()> {
        self.record("platform.renew_certificates".to_string())
    }

    async fn start_support_services(&self) -> CallResult<()> {
        self.record("platform.start_support_services".to_string())
    }

    async fn stop_support_services(&self) -> CallResult<()> {
        self.record("platform.stop_support_services".to_string())
    }

    async fn discard_remote_reboot_reasons(&self) -> CallResult<()> {
        self.record("platform.discard_remote_reboot_reasons".to_string())
    }

    async fn kmip_enabled(&self) -> CallResult<bool> {
        Ok(self.state().kmip_enabled)
    }

    async fn kmip_initialize_keys(&self) -> CallResult<()> {
        self.record("platform.kmip_initialize_keys".to_string())
    }

    async fn persist_link_addresses(&self) -> CallResult<()> {
        self.record("platform.persist_link_addresses".to_string())
    }

    async fn update_reboot_info(&self) -> CallResult<()> {
        self.record("platform.update_reboot_info".to_string())
    }

    async fn start_workloads(&self, workload: Workload) -> CallResult<()> {
        self.record(format!("platform.start_workloads {}", workload.as_str()))
    }

    async fn stop_workloads(&self, workload: Workload) -> CallResult<()> {
        self.record(format!("platform.stop_workloads {}", workload.as_str()))
    }
}

impl Rebooter for SimulatedAppliance {
    fn reboot(&self) -> io::Result<()> {
        self.journal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push("sysrq.reboot".to_string());
        self.state().rebooted = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_import_and_export_move_pool_status() {
        let appliance = SimulatedAppliance::new();
        appliance.add_pool("tank", 7, PoolStatus::Offline);

        appliance
            .import_pool(7, &ImportOptions::for_failover())
            .await
            .unwrap();
        assert_eq!(appliance.pool_status("tank"), Some(PoolStatus::Online));

        appliance.export_pool("tank", true).await.unwrap();
        assert_eq!(appliance.pool_status("tank"), Some(PoolStatus::Offline));
        assert!(appliance.journal_position("pool.import tank") < appliance.journal_position("pool.export tank"));
    }

    #[tokio::test]
    async fn test_fencing_script_then_default() {
        let appliance = SimulatedAppliance::new();
        appliance.script_fencing(&[2]);

        assert_eq!(appliance.start(false).await.unwrap(), 2);
        assert!(!appliance.fencing_running());
        assert_eq!(appliance.start(true).await.unwrap(), 0);
        assert!(appliance.fencing_running());
        assert!(appliance.journal_contains("fencing.start force"));
    }

    #[tokio::test]
    async fn test_injected_failure_is_journaled() {
        let appliance = SimulatedAppliance::new();
        appliance.fail_call("platform.system_dataset_setup");

        let err = appliance.system_dataset_setup().await.unwrap_err();
        assert_eq!(err.method, "platform.system_dataset_setup");
        assert!(appliance.journal_contains("platform.system_dataset_setup"));
        assert!(appliance.dns_sync().await.is_ok());
    }

    #[tokio::test]
    async fn test_config_error() {
        let appliance = SimulatedAppliance::new();
        appliance.fail_config("datastore locked");
        assert!(appliance.failover_config().await.is_err());

        appliance.set_config(FailoverConfig::new().with_group_member(1, "eth0"));
        assert_eq!(
            appliance.failover_config().await.unwrap().group_of("eth0"),
            Some(1)
        );
    }
}
