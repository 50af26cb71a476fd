//! Command bridge to the appliance management layer
//!
//! Every collaborator call becomes one invocation of a helper program:
//!
//! ```text
//! <helper> call <method>        stdin:  JSON array of arguments
//!                               stdout: {"result": <value>}
//!                                    or {"error": {"message": "...", "errno": 2}}
//! ```
//!
//! A non-zero exit with no parsable error body is reported with the
//! helper's stderr. Method names are the management layer's own
//! (`zfs.pool.import_pool`, `service.control`, ...).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{
    AttachReport, CallError, CallResult, ControlOptions, DiskControl, Firewall, PeerClient,
    Platform, PoolStore, ServiceControl, ServiceOp, TargetControl, UnlockReport, Workload,
};
use crate::failover::{ImportOptions, PoolRef};

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ReplyError>,
}

#[derive(Debug, Deserialize)]
struct ReplyError {
    message: String,
    #[serde(default)]
    errno: Option<i32>,
}

/// The part of `kmip.config` the engine reads
#[derive(Debug, Deserialize)]
struct KmipConfig {
    #[serde(default)]
    enabled: bool,
}

/// Process-backed implementation of the collaborator traits
#[derive(Debug, Clone)]
pub struct CommandBridge {
    helper: PathBuf,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandBridge {
    pub fn new(helper: impl Into<PathBuf>) -> Self {
        Self {
            helper: helper.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    /// Arguments placed before `call <method>`.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Bound every call. Unbounded by default: imports can take minutes.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn helper(&self) -> &Path {
        &self.helper
    }

    /// Invoke one method and return its raw result.
    pub async fn call(&self, method: &str, args: Value) -> CallResult<Value> {
        tracing::trace!(method, "calling helper");
        let invocation = self.invoke(method, args);
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, invocation)
                .await
                .map_err(|_| CallError::timed_out(method, limit.as_secs()))?,
            None => invocation.await,
        }
    }

    /// Invoke one method and decode its result.
    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, args: Value) -> CallResult<T> {
        let value = self.call(method, args).await?;
        serde_json::from_value(value)
            .map_err(|e| CallError::new(method, format!("unexpected result: {}", e)))
    }

    async fn call_unit(&self, method: &str, args: Value) -> CallResult<()> {
        self.call(method, args).await.map(|_| ())
    }

    async fn invoke(&self, method: &str, args: Value) -> CallResult<Value> {
        let mut child = Command::new(&self.helper)
            .args(&self.args)
            .arg("call")
            .arg(method)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CallError::new(method, format!("failed to spawn {}: {}", self.helper.display(), e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let body = serde_json::to_vec(&args)
                .map_err(|e| CallError::new(method, format!("failed to encode arguments: {}", e)))?;
            stdin
                .write_all(&body)
                .await
                .map_err(|e| CallError::new(method, format!("failed to write arguments: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CallError::new(method, format!("helper failed: {}", e)))?;

        let reply: Option<Reply> = serde_json::from_slice(&output.stdout).ok();
        match reply {
            Some(Reply { error: Some(err), .. }) => Err(CallError {
                method: method.to_string(),
                errno: err.errno,
                message: err.message,
            }),
            Some(Reply { result, .. }) if output.status.success() => Ok(result.unwrap_or(Value::Null)),
            _ => Err(CallError::new(
                method,
                format!(
                    "helper exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            )),
        }
    }
}

#[async_trait]
impl ServiceControl for CommandBridge {
    async fn control(&self, op: ServiceOp, service: &str, options: ControlOptions) -> CallResult<()> {
        self.call_unit(
            "service.control",
            json!([op, service, {"ha_propagate": options.ha_propagate}]),
        )
        .await
    }

    async fn become_active(&self, service: &str) -> CallResult<()> {
        self.call_unit(&format!("{}.become_active", service), json!([])).await
    }

    async fn started_or_enabled(&self, service: &str) -> CallResult<bool> {
        self.call_as("service.started_or_enabled", json!([service])).await
    }

    async fn enabled_services(&self) -> CallResult<Vec<String>> {
        self.call_as("service.enabled_services", json!([])).await
    }

    async fn generate(&self, key: &str) -> CallResult<()> {
        self.call_unit("etc.generate", json!([key])).await
    }
}

#[async_trait]
impl PoolStore for CommandBridge {
    async fn query_pools(&self) -> CallResult<Vec<PoolRef>> {
        self.call_as("pool.query", json!([])).await
    }

    async fn import_pool(&self, guid: u64, options: &ImportOptions) -> CallResult<()> {
        self.call_unit(
            "zfs.pool.import_pool",
            json!([guid.to_string(), {
                "altroot": options.altroot,
                "missing_log": options.missing_log,
                "any_host": options.any_host,
                "cachefile": options.use_cachefile,
            }]),
        )
        .await
    }

    async fn export_pool(&self, name: &str, force: bool) -> CallResult<()> {
        self.call_unit("zfs.pool.export", json!([name, {"force": force}])).await
    }

    async fn handle_unencrypted_datasets(&self, pool: &str) -> CallResult<()> {
        self.call_unit("pool.handle_unencrypted_datasets_on_import", json!([pool]))
            .await
    }

    async fn unlock_datasets(&self, pool: &str) -> CallResult<UnlockReport> {
        self.call_as("failover.unlock_zfs_datasets", json!([pool])).await
    }

    async fn ddt_prefetch(&self) -> CallResult<()> {
        self.call_unit("zfs.pool.ddt_prefetch_all", json!([])).await
    }
}

#[async_trait]
impl DiskControl for CommandBridge {
    async fn attach_remote_shelves(&self, fenced_reload: bool) -> CallResult<AttachReport> {
        self.call_as("jbof.configure_job", json!([fenced_reload])).await
    }

    async fn sed_unlock_all(&self) -> CallResult<bool> {
        self.call_as("disk.sed_unlock_all", json!([true])).await
    }

    async fn retaste(&self) -> CallResult<()> {
        self.call_unit("disk.retaste", json!([])).await
    }

    async fn sync_all(&self) -> CallResult<()> {
        self.call_unit("disk.sync_all", json!([])).await
    }
}

#[async_trait]
impl TargetControl for CommandBridge {
    async fn alua_enabled(&self) -> CallResult<bool> {
        self.call_as("iscsi.global.alua_enabled", json!([])).await
    }

    async fn suspend(&self, timeout_secs: u64) -> CallResult<bool> {
        self.call_as("iscsi.scst.suspend", json!([timeout_secs])).await
    }

    async fn clear_suspend(&self) -> CallResult<bool> {
        self.call_as("iscsi.scst.clear_suspend", json!([])).await
    }

    async fn force_close_sessions(&self) -> CallResult<()> {
        self.call_unit("iscsi.target.force_close_sessions", json!([])).await
    }

    async fn active_elected(&self) -> CallResult<()> {
        self.call_unit("iscsi.alua.active_elected", json!([])).await
    }

    async fn activate_extents(&self) -> CallResult<()> {
        self.call_unit("iscsi.alua.activate_extents", json!([])).await
    }

    async fn reset_active(&self) -> CallResult<()> {
        self.call_unit("iscsi.alua.reset_active", json!([])).await
    }

    async fn standby_write_empty_config(&self) -> CallResult<()> {
        self.call_unit("iscsi.alua.standby_write_empty_config", json!([true]))
            .await
    }

    async fn kernel_module_loaded(&self) -> CallResult<bool> {
        self.call_as("iscsi.scst.is_kernel_module_loaded", json!([])).await
    }

    async fn nvmet_ana_active(&self) -> CallResult<bool> {
        self.call_as("nvmet.global.ana_active", json!([])).await
    }

    async fn nvmet_running(&self) -> CallResult<bool> {
        self.call_as("nvmet.global.running", json!([])).await
    }
}

#[async_trait]
impl Firewall for CommandBridge {
    async fn accept_all(&self) -> CallResult<()> {
        self.call_unit("failover.firewall.accept_all", json!([])).await
    }

    async fn drop_all(&self) -> CallResult<()> {
        self.call_unit("failover.firewall.drop_all", json!([])).await
    }
}

#[async_trait]
impl PeerClient for CommandBridge {
    async fn status_refresh(&self) -> CallResult<()> {
        self.call_unit(
            "failover.call_remote",
            json!(["failover.status_refresh", [], {"raise_connect_error": false}]),
        )
        .await
    }

    async fn call_remote(&self, method: &str, args: Value) -> CallResult<Value> {
        self.call(
            "failover.call_remote",
            json!([method, args, {"raise_connect_error": false}]),
        )
        .await
    }
}

#[async_trait]
impl Platform for CommandBridge {
    async fn status_refresh(&self) -> CallResult<()> {
        self.call_unit("failover.status_refresh", json!([])).await
    }

    async fn dns_sync(&self) -> CallResult<()> {
        self.call_unit("dns.sync", json!([])).await
    }

    async fn system_dataset_setup(&self) -> CallResult<()> {
        self.call_unit("systemdataset.setup", json!([])).await
    }

    async fn directory_services_setup(&self) -> CallResult<()> {
        self.call_unit("directoryservices.setup", json!([])).await
    }

    async fn directory_services_standby(&self) -> CallResult<()> {
        self.call_unit("directoryservices.become_passive", json!([])).await
    }

    async fn update_replication_tasks(&self) -> CallResult<()> {
        self.call_unit("zettarepl.update_tasks", json!([])).await
    }

    async fn block_failover_alerts(&self) -> CallResult<()> {
        self.call_unit("alert.block_failover_alerts", json!([])).await
    }

    async fn initialize_alerts(&self) -> CallResult<()> {
        self.call_unit("alert.initialize", json!([false])).await
    }

    async fn renew_certificates(&self) -> CallResult<()> {
        self.call_unit("certificate.renew_certs", json!([])).await
    }

    async fn start_support_services(&self) -> CallResult<()> {
        self.call_unit("truecommand.start_truecommand_service", json!([]))
            .await
    }

    async fn stop_support_services(&self) -> CallResult<()> {
        self.call_unit("truecommand.stop_truecommand_service", json!([]))
            .await
    }

    async fn discard_remote_reboot_reasons(&self) -> CallResult<()> {
        self.call_unit("failover.reboot.discard_unbound_remote_reboot_reasons", json!([]))
            .await
    }

    async fn kmip_enabled(&self) -> CallResult<bool> {
        let config: KmipConfig = self.call_as("kmip.config", json!([])).await?;
        Ok(config.enabled)
    }

    async fn kmip_initialize_keys(&self) -> CallResult<()> {
        self.call_unit("kmip.initialize_keys", json!([])).await
    }

    async fn persist_link_addresses(&self) -> CallResult<()> {
        self.call_unit("interface.persist_link_addresses", json!([])).await
    }

    async fn update_reboot_info(&self) -> CallResult<()> {
        self.call_unit("failover.reboot.info", json!([])).await
    }

    async fn start_workloads(&self, workload: Workload) -> CallResult<()> {
        let method = match workload {
            Workload::Apps => "docker.state.start_service",
            Workload::Virt => "virt.global.setup",
        };
        self.call_unit(method, json!([])).await
    }

    async fn stop_workloads(&self, workload: Workload) -> CallResult<()> {
        let method = match workload {
            Workload::Apps => "docker.state.before_stop_service",
            Workload::Virt => "virt.global.reset",
        };
        self.call_unit(method, json!([])).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn helper(body: &str) -> CommandBridge {
        let script = format!("cat > /dev/null\n{}", body);
        CommandBridge::new("/bin/sh").with_args(["-c".to_string(), script, "helper".to_string()])
    }

    #[tokio::test]
    async fn test_result_is_decoded() {
        let bridge = helper(r#"echo '{"result": true}'"#);

        assert!(bridge.alua_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn test_error_body_carries_errno() {
        let bridge = helper(r#"echo '{"error": {"message": "no such pool", "errno": 2}}'; exit 1"#);

        let err = bridge
            .import_pool(42, &ImportOptions::for_failover())
            .await
            .unwrap_err();
        assert!(err.is_enoent());
        assert_eq!(err.method, "zfs.pool.import_pool");
    }

    #[tokio::test]
    async fn test_exit_without_body_reports_stderr() {
        let bridge = helper("echo boom >&2; exit 3");

        let err = bridge.retaste().await.unwrap_err();
        assert!(err.message.contains("boom"));
    }

    #[tokio::test]
    async fn test_kmip_enabled_reads_config() {
        let enabled = helper(
            r#"[ "$2" = "kmip.config" ] && echo '{"result": {"enabled": true, "server": "kmip.lan"}}'"#,
        );
        assert!(enabled.kmip_enabled().await.unwrap());

        let disabled = helper(r#"[ "$2" = "kmip.config" ] && echo '{"result": {"enabled": false}}'"#);
        assert!(!disabled.kmip_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn test_method_is_passed_after_prefix() {
        let bridge = helper(r#"[ "$2" = "disk.sync_all" ] && echo '{"result": null}'"#);

        assert!(bridge.sync_all().await.is_ok());
    }
}
