//! Collaborator Control Interface
//!
//! The engine never imports a pool, starts SMB or talks to the fencing
//! daemon itself. It orchestrates those operations through the narrow
//! traits in this module. Production wiring uses [`CommandBridge`] and
//! [`FencedProcess`]; tests and the `simulate` command use
//! [`SimulatedAppliance`].
//!
//! Every service-control call made by the engine carries
//! `ha_propagate = false`: the engine is already running the HA transition
//! and must not ask the peer to mirror the change.

mod bridge;
mod errors;
mod fenced;
pub mod sim;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::failover::{FailoverConfig, ImportOptions, PoolRef, Rebooter, VrrpState};

pub use bridge::CommandBridge;
pub use errors::{CallError, CallResult, ENOENT, ETIMEDOUT};
pub use fenced::{FencedProcess, DEFAULT_FENCED_PATH, DEFAULT_FENCED_PIDFILE};
pub use sim::SimulatedAppliance;

/// Service lifecycle operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceOp {
    Start,
    Stop,
    Restart,
    Reload,
}

impl ServiceOp {
    /// Returns the operation name
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceOp::Start => "START",
            ServiceOp::Stop => "STOP",
            ServiceOp::Restart => "RESTART",
            ServiceOp::Reload => "RELOAD",
        }
    }

    /// Returns the service-plugin method for this operation
    pub fn method(&self) -> &'static str {
        match self {
            ServiceOp::Start => "service.start",
            ServiceOp::Stop => "service.stop",
            ServiceOp::Restart => "service.restart",
            ServiceOp::Reload => "service.reload",
        }
    }
}

impl fmt::Display for ServiceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Options attached to a service-control call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlOptions {
    /// Whether the peer controller should mirror the change
    pub ha_propagate: bool,
}

impl ControlOptions {
    /// Options used for every engine-originated call.
    pub const LOCAL: ControlOptions = ControlOptions {
        ha_propagate: false,
    };
}

/// Result of unlocking the encrypted datasets of a pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockReport {
    /// Datasets that could not be unlocked
    #[serde(default)]
    pub failed: Vec<String>,
}

/// Result of attaching remote (NVMe-oF / RDMA) shelves
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachReport {
    /// Whether the attach failed
    #[serde(default)]
    pub failed: bool,

    /// Collaborator supplied summary
    #[serde(default)]
    pub message: String,
}

/// User workloads that are started on promote and stopped on demote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Workload {
    /// Container applications
    Apps,
    /// Virtual machines and system containers
    Virt,
}

impl Workload {
    /// Returns the workload name
    pub fn as_str(&self) -> &'static str {
        match self {
            Workload::Apps => "apps",
            Workload::Virt => "virt",
        }
    }
}

/// Source of the failover configuration, read once per event.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Load the current failover configuration.
    async fn failover_config(&self) -> CallResult<FailoverConfig>;
}

/// Service table and service lifecycle control.
#[async_trait]
pub trait ServiceControl: Send + Sync {
    /// Run a lifecycle operation on a service.
    async fn control(&self, op: ServiceOp, service: &str, options: ControlOptions) -> CallResult<()>;

    /// Repoint an in-kernel target at the active view instead of restarting it.
    async fn become_active(&self, service: &str) -> CallResult<()>;

    /// Whether the service is running or enabled to run.
    async fn started_or_enabled(&self, service: &str) -> CallResult<bool>;

    /// Names of every service marked enabled in the service table, in table order.
    async fn enabled_services(&self) -> CallResult<Vec<String>>;

    /// Regenerate a configuration file group (`rc`, `cron`, `scst`, ...).
    async fn generate(&self, key: &str) -> CallResult<()>;
}

/// The SCSI-PR fencing daemon.
#[async_trait]
pub trait FencingDaemon: Send + Sync {
    /// Start the daemon and return its exit code.
    async fn start(&self, force: bool) -> CallResult<i32>;

    /// Stop the daemon if it is running.
    async fn stop(&self) -> CallResult<()>;

    /// Whether a local daemon is running.
    async fn running(&self) -> CallResult<bool>;
}

/// Storage pool operations.
#[async_trait]
pub trait PoolStore: Send + Sync {
    /// Snapshot of every configured pool.
    async fn query_pools(&self) -> CallResult<Vec<PoolRef>>;

    /// Import a pool by guid.
    async fn import_pool(&self, guid: u64, options: &ImportOptions) -> CallResult<()>;

    /// Export a pool by name.
    async fn export_pool(&self, name: &str, force: bool) -> CallResult<()>;

    /// Unmount unencrypted children that were mounted over encrypted parents.
    async fn handle_unencrypted_datasets(&self, pool: &str) -> CallResult<()>;

    /// Unlock the encrypted datasets of a pool.
    async fn unlock_datasets(&self, pool: &str) -> CallResult<UnlockReport>;

    /// Prefetch dedup tables of every imported pool.
    async fn ddt_prefetch(&self) -> CallResult<()>;
}

/// Disk and enclosure operations.
#[async_trait]
pub trait DiskControl: Send + Sync {
    /// Attach remote NVMe/RDMA shelves. May run for a long time.
    async fn attach_remote_shelves(&self, fenced_reload: bool) -> CallResult<AttachReport>;

    /// Unlock every SED disk. Returns whether any disk may have been unlocked.
    async fn sed_unlock_all(&self) -> CallResult<bool>;

    /// Re-read disk geometry and labels.
    async fn retaste(&self) -> CallResult<()>;

    /// Synchronise the disk inventory.
    async fn sync_all(&self) -> CallResult<()>;
}

/// Block protocol target (iSCSI ALUA and NVMe-oF ANA) operations.
#[async_trait]
pub trait TargetControl: Send + Sync {
    /// Whether ALUA is enabled on the iSCSI target.
    async fn alua_enabled(&self) -> CallResult<bool>;

    /// Suspend the target. Returns `false` when no target is loaded.
    async fn suspend(&self, timeout_secs: u64) -> CallResult<bool>;

    /// Clear a previous suspend.
    async fn clear_suspend(&self) -> CallResult<bool>;

    /// Close every session on the target.
    async fn force_close_sessions(&self) -> CallResult<()>;

    /// Swap the target from the standby view to the active view.
    async fn active_elected(&self) -> CallResult<()>;

    /// Activate ALUA extents once pools are imported.
    async fn activate_extents(&self) -> CallResult<()>;

    /// Clean up leftover standby targets.
    async fn reset_active(&self) -> CallResult<()>;

    /// Rewrite the target configuration to the empty standby view.
    async fn standby_write_empty_config(&self) -> CallResult<()>;

    /// Whether the target kernel module is loaded.
    async fn kernel_module_loaded(&self) -> CallResult<bool>;

    /// Whether NVMe-oF ANA is active.
    async fn nvmet_ana_active(&self) -> CallResult<bool>;

    /// Whether the NVMe-oF target is running.
    async fn nvmet_running(&self) -> CallResult<bool>;
}

/// Data-plane firewall.
#[async_trait]
pub trait Firewall: Send + Sync {
    /// Accept all data-plane traffic.
    async fn accept_all(&self) -> CallResult<()>;

    /// Drop all data-plane traffic.
    async fn drop_all(&self) -> CallResult<()>;
}

/// Query and pause interface of the role source.
#[async_trait]
pub trait VrrpControl: Send + Sync {
    /// Currently observed VRRP state of an interface.
    async fn observed_state(&self, ifname: &str) -> VrrpState;

    /// Stop dispatching role events.
    async fn pause_events(&self) -> CallResult<()>;

    /// Resume dispatching role events.
    async fn unpause_events(&self) -> CallResult<()>;
}

/// The peer controller. Every call is advisory.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Ask the peer to refresh its failover status.
    async fn status_refresh(&self) -> CallResult<()>;

    /// Call a method on the peer without raising on connect errors.
    async fn call_remote(&self, method: &str, args: Value) -> CallResult<Value>;
}

/// Everything else the transition touches on this controller.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Refresh the cached failover status of this controller.
    async fn status_refresh(&self) -> CallResult<()>;

    /// Write DNS configuration from the configuration store to the OS.
    async fn dns_sync(&self) -> CallResult<()>;

    /// Set up the shared system dataset.
    async fn system_dataset_setup(&self) -> CallResult<()>;

    /// Bring up directory services on the active controller.
    async fn directory_services_setup(&self) -> CallResult<()>;

    /// Put directory services in standby.
    async fn directory_services_standby(&self) -> CallResult<()>;

    /// Update replication task state.
    async fn update_replication_tasks(&self) -> CallResult<()>;

    /// Temporarily block failover alerts.
    async fn block_failover_alerts(&self) -> CallResult<()>;

    /// Re-initialise alerting.
    async fn initialize_alerts(&self) -> CallResult<()>;

    /// Renew certificates if required.
    async fn renew_certificates(&self) -> CallResult<()>;

    /// Start out-of-band support services.
    async fn start_support_services(&self) -> CallResult<()>;

    /// Stop out-of-band support services.
    async fn stop_support_services(&self) -> CallResult<()>;

    /// Drop reboot reasons recorded against an unreachable peer.
    async fn discard_remote_reboot_reasons(&self) -> CallResult<()>;

    /// Whether a KMIP server manages encryption keys.
    async fn kmip_enabled(&self) -> CallResult<bool>;

    /// Pull the latest keys from the KMIP server.
    async fn kmip_initialize_keys(&self) -> CallResult<()>;

    /// Persist interface link-address changes.
    async fn persist_link_addresses(&self) -> CallResult<()>;

    /// Update HA reboot information.
    async fn update_reboot_info(&self) -> CallResult<()>;

    /// Start user workloads.
    async fn start_workloads(&self, workload: Workload) -> CallResult<()>;

    /// Gracefully stop user workloads.
    async fn stop_workloads(&self, workload: Workload) -> CallResult<()>;
}

/// Every collaborator the engine needs, bundled for cheap cloning.
#[derive(Clone)]
pub struct Collaborators {
    pub config: Arc<dyn ConfigSource>,
    pub services: Arc<dyn ServiceControl>,
    pub fencing: Arc<dyn FencingDaemon>,
    pub pools: Arc<dyn PoolStore>,
    pub disks: Arc<dyn DiskControl>,
    pub targets: Arc<dyn TargetControl>,
    pub firewall: Arc<dyn Firewall>,
    pub vrrp: Arc<dyn VrrpControl>,
    pub peer: Arc<dyn PeerClient>,
    pub platform: Arc<dyn Platform>,
    pub rebooter: Arc<dyn Rebooter>,
}

impl Collaborators {
    /// Use one object for every collaborator role.
    pub fn from_appliance<A>(appliance: Arc<A>) -> Self
    where
        A: ConfigSource
            + ServiceControl
            + FencingDaemon
            + PoolStore
            + DiskControl
            + TargetControl
            + Firewall
            + VrrpControl
            + PeerClient
            + Platform
            + Rebooter
            + 'static,
    {
        Self {
            config: appliance.clone(),
            services: appliance.clone(),
            fencing: appliance.clone(),
            pools: appliance.clone(),
            disks: appliance.clone(),
            targets: appliance.clone(),
            firewall: appliance.clone(),
            vrrp: appliance.clone(),
            peer: appliance.clone(),
            platform: appliance.clone(),
            rebooter: appliance,
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
