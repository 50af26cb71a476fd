//! CLI command implementations
//!
//! `run` is the daemon: classify the previous boot, start the engine, read
//! the keepalived FIFO until interrupted. The other commands are one-shot
//! and print a single JSON response on stdout. `event` never builds an
//! engine of its own; it writes into the daemon's FIFO so the event queues
//! behind the daemon's transition lock.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use uuid::Uuid;

use crate::control::{
    Collaborators, CommandBridge, FencedProcess, SimulatedAppliance, DEFAULT_FENCED_PATH,
    DEFAULT_FENCED_PIDFILE,
};
use crate::failover::{
    classify_previous_boot, BootCause, Engine, EngineTunables, EventKind, FailoverConfig,
    FileConfigSource, GateDecision, PoolStatus, SysrqRebooter, WatchdogSentinel,
    DEFAULT_NETIF_READY_SENTINEL, DEFAULT_WATCHDOG_SENTINEL, SYSRQ_ENABLE_PATH,
    SYSRQ_TRIGGER_PATH,
};
use crate::observability::{self, log_event, Event, LogFormat};
use crate::vrrp::{self, FifoReader, RoleTable, VrrpError};

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};
use super::io::{write_error, write_response};

/// How long `event` waits for the daemon to have the FIFO open
const INJECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon settings file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// keepalived notify FIFO
    #[serde(default = "default_fifo_path")]
    pub fifo_path: PathBuf,

    /// Helper program every collaborator call goes through
    #[serde(default = "default_control_helper")]
    pub control_helper: PathBuf,

    /// Arguments placed before `call <method>`
    #[serde(default)]
    pub control_helper_args: Vec<String>,

    #[serde(default = "default_fenced_path")]
    pub fenced_path: PathBuf,

    #[serde(default = "default_fenced_pidfile")]
    pub fenced_pidfile: PathBuf,

    #[serde(default = "default_watchdog_sentinel")]
    pub watchdog_sentinel: PathBuf,

    /// `null` skips the wait for network configuration
    #[serde(default = "default_netif_ready_sentinel")]
    pub netif_ready_sentinel: Option<PathBuf>,

    #[serde(default = "default_sysrq_enable_path")]
    pub sysrq_enable_path: PathBuf,

    #[serde(default = "default_sysrq_trigger_path")]
    pub sysrq_trigger_path: PathBuf,

    /// Failover document, re-read for every event
    #[serde(default = "default_failover_config_path")]
    pub failover_config_path: PathBuf,

    #[serde(default = "default_export_deadline_ms")]
    pub export_deadline_ms: u64,

    #[serde(default = "default_critical_timeout_secs")]
    pub critical_timeout_secs: u64,

    #[serde(default = "default_noncritical_timeout_secs")]
    pub noncritical_timeout_secs: u64,

    #[serde(default = "default_remote_attach_timeout_secs")]
    pub remote_attach_timeout_secs: u64,

    #[serde(default = "default_netif_ready_timeout_secs")]
    pub netif_ready_timeout_secs: u64,

    #[serde(default = "default_fencing_attempts")]
    pub fencing_attempts: u32,

    #[serde(default)]
    pub log_json: bool,
}

fn default_fifo_path() -> PathBuf {
    PathBuf::from("/var/run/vrrpd.fifo")
}
fn default_control_helper() -> PathBuf {
    PathBuf::from("/usr/local/libexec/hafailover-call")
}
fn default_fenced_path() -> PathBuf {
    PathBuf::from(DEFAULT_FENCED_PATH)
}
fn default_fenced_pidfile() -> PathBuf {
    PathBuf::from(DEFAULT_FENCED_PIDFILE)
}
fn default_watchdog_sentinel() -> PathBuf {
    PathBuf::from(DEFAULT_WATCHDOG_SENTINEL)
}
fn default_netif_ready_sentinel() -> Option<PathBuf> {
    Some(PathBuf::from(DEFAULT_NETIF_READY_SENTINEL))
}
fn default_sysrq_enable_path() -> PathBuf {
    PathBuf::from(SYSRQ_ENABLE_PATH)
}
fn default_sysrq_trigger_path() -> PathBuf {
    PathBuf::from(SYSRQ_TRIGGER_PATH)
}
fn default_failover_config_path() -> PathBuf {
    PathBuf::from("/etc/hafailover/failover.json")
}
fn default_export_deadline_ms() -> u64 {
    4000
}
fn default_critical_timeout_secs() -> u64 {
    15
}
fn default_noncritical_timeout_secs() -> u64 {
    60
}
fn default_remote_attach_timeout_secs() -> u64 {
    60
}
fn default_netif_ready_timeout_secs() -> u64 {
    120
}
fn default_fencing_attempts() -> u32 {
    4
}

impl EngineSettings {
    /// Load settings from file
    pub fn load(path: &Path) -> CliResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| CliError::config_error(format!("Failed to read settings: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse and validate a settings document
    pub fn parse(content: &str) -> CliResult<Self> {
        let settings: EngineSettings = serde_json::from_str(content)
            .map_err(|e| CliError::config_error(format!("Invalid settings JSON: {}", e)))?;

        settings.tunables().validate()?;
        if settings.remote_attach_timeout_secs == 0 {
            return Err(CliError::config_error("remote_attach_timeout_secs must be > 0"));
        }

        Ok(settings)
    }

    /// Deadlines and paths handed to the engine
    pub fn tunables(&self) -> EngineTunables {
        EngineTunables {
            export_deadline: Duration::from_millis(self.export_deadline_ms),
            critical_service_timeout: Duration::from_secs(self.critical_timeout_secs),
            noncritical_service_timeout: Duration::from_secs(self.noncritical_timeout_secs),
            remote_attach_timeout: Duration::from_secs(self.remote_attach_timeout_secs),
            netif_ready_timeout: Duration::from_secs(self.netif_ready_timeout_secs),
            fencing_attempts: self.fencing_attempts,
            watchdog_sentinel: self.watchdog_sentinel.clone(),
            netif_ready_sentinel: self.netif_ready_sentinel.clone(),
            ..EngineTunables::default()
        }
    }

    /// Production collaborators
    pub fn collaborators(&self, roles: Arc<RoleTable>) -> Collaborators {
        let bridge = Arc::new(
            CommandBridge::new(&self.control_helper).with_args(self.control_helper_args.clone()),
        );

        Collaborators {
            config: Arc::new(FileConfigSource::new(&self.failover_config_path)),
            services: bridge.clone(),
            fencing: Arc::new(FencedProcess::new(&self.fenced_path, &self.fenced_pidfile)),
            pools: bridge.clone(),
            disks: bridge.clone(),
            targets: bridge.clone(),
            firewall: bridge.clone(),
            vrrp: roles,
            peer: bridge.clone(),
            platform: bridge,
            rebooter: Arc::new(SysrqRebooter::new(
                &self.sysrq_enable_path,
                &self.sysrq_trigger_path,
            )),
        }
    }
}

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    run_command(cli)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cli: Cli) -> CliResult<()> {
    let runtime = tokio::runtime::Runtime::new()?;

    match cli.command {
        Command::Run { config } => {
            let settings = EngineSettings::load(&config)?;
            init_logging(cli.log_json || settings.log_json);
            runtime.block_on(serve(settings))
        }
        Command::Event {
            config,
            ifname,
            event,
        } => {
            let settings = EngineSettings::load(&config)?;
            init_logging(cli.log_json || settings.log_json);
            let kind: EventKind = event.parse()?;
            runtime.block_on(inject_event(&settings, &ifname, kind))
        }
        Command::Simulate {
            ifname,
            event,
            pools,
            imported,
            fencing,
            services,
        } => {
            init_logging(cli.log_json);
            let kind: EventKind = event.parse()?;
            let scenario = Scenario {
                pools,
                imported,
                fencing,
                services,
            };
            runtime.block_on(simulate(&ifname, kind, scenario))
        }
        Command::CheckBoot { config } => {
            let settings = EngineSettings::load(&config)?;
            init_logging(cli.log_json || settings.log_json);
            check_boot(&settings)
        }
    }
}

fn init_logging(json: bool) {
    observability::init(LogFormat::from_json_flag(json), "info");
}

/// Run the engine until interrupted
async fn serve(settings: EngineSettings) -> CliResult<()> {
    let sentinel = WatchdogSentinel::new(&settings.watchdog_sentinel);
    report_boot(&sentinel)?;

    let roles = Arc::new(RoleTable::new());
    let engine = Arc::new(Engine::new(
        settings.collaborators(Arc::clone(&roles)),
        settings.tunables(),
    )?);

    let reader = FifoReader::new(&settings.fifo_path, roles, engine);
    let (shutdown, stop) = watch::channel(false);
    let reading = tokio::spawn(async move { reader.run(stop).await });

    log_event(Event::EngineReady);
    tracing::info!(fifo = %settings.fifo_path.display(), "listening for role events");

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupted, stopping role source");
    let _ = shutdown.send(true);

    reading
        .await
        .map_err(|e| CliError::boot_failed(format!("role source task failed: {}", e)))??;
    Ok(())
}

/// Log and return what the previous boot was.
fn report_boot(sentinel: &WatchdogSentinel) -> CliResult<BootCause> {
    let cause = classify_previous_boot(sentinel)
        .map_err(|e| CliError::boot_failed(format!("failed to read watchdog sentinel: {}", e)))?;

    log_event(Event::BootClassified);
    match &cause {
        BootCause::WatchdogDuringDemotion { armed_at } => tracing::warn!(
            armed_at = ?armed_at,
            alert = cause.alert_text(),
            "previous boot ended in a watchdog reboot during demotion"
        ),
        BootCause::NotEngineInitiated => tracing::info!("previous boot was not ended by the engine"),
    }
    Ok(cause)
}

/// Hand one event to the running daemon through its FIFO.
async fn inject_event(settings: &EngineSettings, ifname: &str, kind: EventKind) -> CliResult<()> {
    match vrrp::inject(&settings.fifo_path, ifname, kind, INJECT_TIMEOUT).await {
        Ok(()) => {
            tracing::info!(ifname, event = kind.as_str(), "event handed to the daemon");
            write_response(json!({
                "queued": true,
                "ifname": ifname,
                "event": kind.as_str(),
                "fifo": settings.fifo_path,
            }))
        }
        Err(e @ VrrpError::NoReader(_)) => write_error("HA_NO_ROLE_SOURCE", &e.to_string()),
        Err(e) => Err(e.into()),
    }
}

/// Inputs of a simulated run
#[derive(Debug, Clone, Default)]
pub struct Scenario {
    pub pools: Vec<String>,
    pub imported: bool,
    pub fencing: Vec<i32>,
    pub services: Vec<String>,
}

impl Scenario {
    fn appliance(&self, ifname: &str) -> Arc<SimulatedAppliance> {
        let appliance = SimulatedAppliance::new();
        appliance.set_config(FailoverConfig::new().with_group_member(1, ifname));

        let status = if self.imported {
            PoolStatus::Online
        } else {
            PoolStatus::Offline
        };
        for (guid, name) in self.pools.iter().enumerate() {
            appliance.add_pool(name, guid as u64 + 1, status);
        }

        appliance.script_fencing(&self.fencing);
        let services: Vec<&str> = self.services.iter().map(String::as_str).collect();
        appliance.set_enabled_services(&services);
        appliance
    }
}

/// Run one event against a simulated appliance.
async fn simulate(ifname: &str, kind: EventKind, scenario: Scenario) -> CliResult<()> {
    let appliance = scenario.appliance(ifname);
    let tunables = EngineTunables {
        watchdog_sentinel: std::env::temp_dir()
            .join(format!("hafailover-sim-{}.watchdog", Uuid::new_v4())),
        netif_ready_sentinel: None,
        ..EngineTunables::default()
    };

    let engine = Engine::new(Collaborators::from_appliance(Arc::clone(&appliance)), tunables)?;
    let decision = engine.hook(ifname, kind).await;

    let report = match &decision {
        GateDecision::Accepted(job) => Some(job.wait().await),
        _ => None,
    };

    write_response(json!({
        "decision": match &decision {
            GateDecision::Accepted(_) => "ACCEPTED".to_string(),
            GateDecision::Ignored(reason) => reason.code().to_string(),
            GateDecision::Dropped { reason } => reason.clone(),
        },
        "report": report.as_deref(),
        "role": engine.role(),
        "pools": appliance.pools(),
        "journal": appliance.journal(),
    }))
}

/// Classify the previous boot and print the alert it calls for.
fn check_boot(settings: &EngineSettings) -> CliResult<()> {
    let cause = report_boot(&WatchdogSentinel::new(&settings.watchdog_sentinel))?;
    write_response(json!({
        "cause": cause,
        "alert": cause.alert_text(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_settings_defaults() {
        let settings = EngineSettings::parse("{}").unwrap();

        assert_eq!(settings.export_deadline_ms, 4000);
        assert_eq!(settings.fencing_attempts, 4);
        assert!(!settings.log_json);

        let tunables = settings.tunables();
        assert_eq!(tunables.export_deadline, Duration::from_secs(4));
        assert_eq!(tunables.critical_service_timeout, Duration::from_secs(15));
        assert_eq!(tunables.noncritical_service_timeout, Duration::from_secs(60));
        assert_eq!(
            tunables.netif_ready_sentinel,
            Some(PathBuf::from(DEFAULT_NETIF_READY_SENTINEL))
        );
    }

    #[test]
    fn test_settings_reject_zero_deadline() {
        let err = EngineSettings::parse(r#"{"export_deadline_ms": 0}"#).unwrap_err();
        assert_eq!(err.code_str(), "HA_CLI_CONFIG_ERROR");

        assert!(EngineSettings::parse(r#"{"fencing_attempts": 0}"#).is_err());
        assert!(EngineSettings::parse(r#"{"remote_attach_timeout_secs": 0}"#).is_err());
    }

    #[test]
    fn test_null_netif_sentinel_disables_wait() {
        let settings = EngineSettings::parse(r#"{"netif_ready_sentinel": null}"#).unwrap();
        assert!(settings.tunables().netif_ready_sentinel.is_none());
    }

    #[test]
    fn test_load_missing_file() {
        let tmp = TempDir::new().unwrap();
        let err = EngineSettings::load(&tmp.path().join("missing.json")).unwrap_err();
        assert!(err.message().contains("Failed to read settings"));
    }

    #[test]
    fn test_boot_report_clears_sentinel() {
        let tmp = TempDir::new().unwrap();
        let sentinel = WatchdogSentinel::new(tmp.path().join("watchdog-alert"));
        sentinel.arm().unwrap();

        let cause = report_boot(&sentinel).unwrap();
        assert!(matches!(cause, BootCause::WatchdogDuringDemotion { .. }));
        assert!(!sentinel.is_armed());
        assert_eq!(report_boot(&sentinel).unwrap(), BootCause::NotEngineInitiated);
    }

    #[tokio::test]
    async fn test_event_writes_into_daemon_fifo() {
        let tmp = TempDir::new().unwrap();
        let fifo = tmp.path().join("vrrpd.fifo");
        std::fs::write(&fifo, "").unwrap();
        let settings = EngineSettings {
            fifo_path: fifo.clone(),
            ..EngineSettings::parse("{}").unwrap()
        };

        inject_event(&settings, "eth0", EventKind::ForceTakeover).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(&fifo).unwrap(),
            "INSTANCE \"eth0\" forcetakeover\n"
        );
    }

    #[test]
    fn test_scenario_builds_appliance() {
        let scenario = Scenario {
            pools: vec!["tank".into()],
            imported: false,
            fencing: vec![2, 0],
            services: vec!["cifs".into()],
        };
        let appliance = scenario.appliance("eth0");

        assert_eq!(appliance.pool_status("tank"), Some(PoolStatus::Offline));
    }
}
