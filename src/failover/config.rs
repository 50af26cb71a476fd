//! Failover Configuration
//!
//! `FailoverConfig` is read fresh for every event and never mutated by the
//! engine. `PoolRef` values are read-only snapshots owned by the storage
//! layer. `EngineTunables` carries the deadlines and sentinel paths of a
//! running engine.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::errors::{FailoverError, FailoverResult};
use crate::control::{CallError, CallResult, ConfigSource};

/// Default location of the watchdog sentinel
pub const DEFAULT_WATCHDOG_SENTINEL: &str = "/data/sentinels/.watchdog-alert";

/// Default location of the network-ready sentinel
pub const DEFAULT_NETIF_READY_SENTINEL: &str = "/var/run/middleware/ix-netif-complete";

/// Failover configuration snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Failover is administratively disabled
    pub disabled: bool,

    /// This controller is marked as the preferred master
    pub master_hint: bool,

    /// VRRP advertisement timeout in seconds
    pub timeout_s: u64,

    /// Failover groups: interfaces that transition as a unit
    pub groups: BTreeMap<u32, Vec<String>>,

    /// Interfaces whose events never trigger a transition
    pub non_critical_interfaces: BTreeSet<String>,

    /// Heartbeat interfaces between the controllers
    pub internal_interfaces: BTreeSet<String>,

    /// Critical interfaces with no failover group; each stands alone
    #[serde(default)]
    pub ungrouped_interfaces: BTreeSet<String>,
}

impl FailoverConfig {
    /// Create an enabled configuration with no interfaces.
    pub fn new() -> Self {
        Self {
            timeout_s: 2,
            ..Self::default()
        }
    }

    /// Add a critical interface to a failover group.
    pub fn with_group_member(mut self, group: u32, ifname: impl Into<String>) -> Self {
        self.groups.entry(group).or_default().push(ifname.into());
        self
    }

    /// Add a non-critical interface.
    pub fn with_non_critical(mut self, ifname: impl Into<String>) -> Self {
        self.non_critical_interfaces.insert(ifname.into());
        self
    }

    /// Mark failover disabled, optionally with the master hint set.
    pub fn disabled(mut self, master_hint: bool) -> Self {
        self.disabled = true;
        self.master_hint = master_hint;
        self
    }

    /// Whether events on this interface are ignored.
    pub fn is_non_critical(&self, ifname: &str) -> bool {
        self.non_critical_interfaces.contains(ifname)
    }

    /// The failover group an interface belongs to.
    pub fn group_of(&self, ifname: &str) -> Option<u32> {
        self.groups
            .iter()
            .find(|(_, members)| members.iter().any(|m| m == ifname))
            .map(|(id, _)| *id)
    }

    /// Other members of the interface's failover group.
    pub fn siblings(&self, ifname: &str) -> Vec<String> {
        self.group_of(ifname)
            .and_then(|id| self.groups.get(&id))
            .map(|members| members.iter().filter(|m| *m != ifname).cloned().collect())
            .unwrap_or_default()
    }
}

/// On-disk failover document, as administrative tools persist it
#[derive(Debug, Clone, Deserialize)]
pub struct FailoverDocument {
    #[serde(default)]
    pub disabled: bool,

    #[serde(default)]
    pub master: bool,

    #[serde(default = "default_vrrp_timeout")]
    pub timeout: u64,

    #[serde(default)]
    pub interfaces: Vec<InterfaceEntry>,

    #[serde(default)]
    pub internal_interfaces: Vec<String>,
}

/// One interface in the failover document
#[derive(Debug, Clone, Deserialize)]
pub struct InterfaceEntry {
    pub id: String,

    #[serde(default)]
    pub failover_critical: bool,

    #[serde(default)]
    pub failover_group: Option<u32>,
}

fn default_vrrp_timeout() -> u64 {
    2
}

impl From<FailoverDocument> for FailoverConfig {
    fn from(doc: FailoverDocument) -> Self {
        let mut config = FailoverConfig {
            disabled: doc.disabled,
            master_hint: doc.master,
            timeout_s: doc.timeout,
            internal_interfaces: doc.internal_interfaces.into_iter().collect(),
            ..FailoverConfig::default()
        };

        for iface in doc.interfaces {
            if !iface.failover_critical {
                config.non_critical_interfaces.insert(iface.id);
                continue;
            }
            match iface.failover_group {
                Some(group) => config.groups.entry(group).or_default().push(iface.id),
                None => {
                    tracing::warn!(ifname = %iface.id, "critical interface has no failover group");
                    config.ungrouped_interfaces.insert(iface.id);
                }
            }
        }

        config
    }
}

/// Reads the failover document from a JSON file on every event.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse a failover document.
    pub fn parse(content: &str) -> FailoverResult<FailoverConfig> {
        let doc: FailoverDocument = serde_json::from_str(content)
            .map_err(|e| FailoverError::Config(format!("invalid failover document: {}", e)))?;
        Ok(FailoverConfig::from(doc))
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn failover_config(&self) -> CallResult<FailoverConfig> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            CallError::new(
                "failover.config",
                format!("failed to read {}: {}", self.path.display(), e),
            )
        })?;
        Self::parse(&content).map_err(|e| CallError::new("failover.config", e.to_string()))
    }
}

/// Pool health as reported by the storage layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PoolStatus {
    Online,
    Offline,
    Degraded,
    Faulted,
    Unavail,
    Removed,
}

impl PoolStatus {
    /// Whether the pool is imported on this controller.
    pub fn is_imported(&self) -> bool {
        !matches!(self, PoolStatus::Offline)
    }
}

/// Read-only pool snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRef {
    pub name: String,
    pub guid: u64,
    pub status: PoolStatus,
}

impl PoolRef {
    pub fn new(name: impl Into<String>, guid: u64, status: PoolStatus) -> Self {
        Self {
            name: name.into(),
            guid,
            status,
        }
    }
}

/// Options passed to every failover import
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportOptions {
    pub altroot: String,
    pub missing_log: bool,
    pub any_host: bool,
    pub use_cachefile: bool,
}

impl ImportOptions {
    /// First import attempt: mounted under `/mnt`, tolerate a missing log
    /// device, ignore host ownership, consult the cache file.
    pub fn for_failover() -> Self {
        Self {
            altroot: "/mnt".to_string(),
            missing_log: true,
            any_host: true,
            use_cachefile: true,
        }
    }

    /// Same options, bypassing a stale cache file.
    pub fn without_cachefile(&self) -> Self {
        Self {
            use_cachefile: false,
            ..self.clone()
        }
    }
}

/// Deadlines, retry budgets and sentinel paths of a running engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineTunables {
    /// Total time allowed to export every pool on demote
    pub export_deadline: Duration,

    /// Per-service timeout of the critical wave
    pub critical_service_timeout: Duration,

    /// Per-service timeout of the non-critical wave
    pub noncritical_service_timeout: Duration,

    /// Wait for remote shelf attach (retried once)
    pub remote_attach_timeout: Duration,

    /// Cap on waiting for the network-ready sentinel
    pub netif_ready_timeout: Duration,

    /// Poll interval for the network-ready sentinel
    pub netif_poll_interval: Duration,

    /// Fencing start attempts while the peer's daemon winds down
    pub fencing_attempts: u32,

    /// Location of the watchdog sentinel
    pub watchdog_sentinel: PathBuf,

    /// Location of the network-ready sentinel, if awaited
    pub netif_ready_sentinel: Option<PathBuf>,
}

impl Default for EngineTunables {
    fn default() -> Self {
        Self {
            export_deadline: Duration::from_secs(4),
            critical_service_timeout: Duration::from_secs(15),
            noncritical_service_timeout: Duration::from_secs(60),
            remote_attach_timeout: Duration::from_secs(60),
            netif_ready_timeout: Duration::from_secs(120),
            netif_poll_interval: Duration::from_secs(1),
            fencing_attempts: 4,
            watchdog_sentinel: PathBuf::from(DEFAULT_WATCHDOG_SENTINEL),
            netif_ready_sentinel: Some(PathBuf::from(DEFAULT_NETIF_READY_SENTINEL)),
        }
    }
}

impl EngineTunables {
    /// Tunables rooted in a scratch directory (tests, simulation).
    pub fn rooted_at(dir: &Path) -> Self {
        Self {
            watchdog_sentinel: dir.join("watchdog-alert"),
            netif_ready_sentinel: None,
            ..Self::default()
        }
    }

    /// Reject values that would make the engine unsafe.
    pub fn validate(&self) -> FailoverResult<()> {
        if self.export_deadline.is_zero() {
            return Err(FailoverError::Config("export deadline must be > 0".into()));
        }
        if self.fencing_attempts == 0 {
            return Err(FailoverError::Config("fencing attempts must be > 0".into()));
        }
        if self.critical_service_timeout.is_zero() || self.noncritical_service_timeout.is_zero() {
            return Err(FailoverError::Config("service timeouts must be > 0".into()));
        }
        Ok(())
    }
}
