//! Demote Pipeline
//!
//! Runs on BACKUP while the transition lock is held. The goal is to get off
//! the shared disks fast: traffic is dropped, VIPs move to the peer, pools
//! are exported under a hard deadline backed by an immediate reboot, and
//! only then are reservations released.
//!
//! After the export every phase is best-effort. If releasing storage fails
//! short of the export deadline, the sentinel is disarmed, the VRRP daemon is
//! restarted and role events are unpaused before the error is returned. A
//! missed deadline leaves all three alone because the reboot is already
//! underway.

use std::sync::Arc;

use serde_json::json;

use super::errors::{FailoverError, FailoverResult};
use super::peer::call_advisory;
use super::quorum::{self, QuorumVerdict};
use super::report::TransitionReport;
use super::runner::{spawn_background, PipelineContext};
use super::watchdog::WatchdogSentinel;
use crate::control::{ControlOptions, ServiceOp, Workload};
use crate::observability::PhaseScope;

/// Password-encryption seed, pulled from the active controller if it drifted
pub const PWENC_SECRET_PATH: &str = "/data/pwenc_secret";

pub(crate) async fn run(ctx: &PipelineContext<'_>, report: &mut TransitionReport) -> FailoverResult<()> {
    check_group(ctx).await?;

    tracing::warn!("entering BACKUP");

    stop_workloads(ctx);

    quiesce(ctx, report).await?;

    let sentinel = WatchdogSentinel::new(&ctx.tunables.watchdog_sentinel);
    if let Err(e) = release_storage(ctx, &sentinel, report).await {
        if !matches!(e, FailoverError::ExportDeadlineExceeded { .. }) {
            recover_vrrp(ctx, &sentinel, report).await;
        }
        return Err(e);
    }

    standby_services(ctx, report).await;

    standby_targets(ctx, report).await;

    rejoin_vrrp(ctx, report).await;

    ctx.best_effort(report, "retaste disks", ctx.collab.disks.retaste()).await;
    ctx.best_effort(
        report,
        "directory services standby",
        ctx.collab.platform.directory_services_standby(),
    )
    .await;

    tracing::info!("successfully became the BACKUP node");
    Ok(())
}

/// Phase 1
async fn check_group(ctx: &PipelineContext<'_>) -> FailoverResult<()> {
    let verdict = quorum::evaluate(
        ctx.collab.vrrp.as_ref(),
        ctx.ifname(),
        &ctx.config,
        ctx.kind().expected_role(),
    )
    .await;
    if let QuorumVerdict::Ignore { blocking, .. } = &verdict {
        tracing::warn!(
            siblings = ?blocking,
            "received BACKUP but other interfaces are still MASTER"
        );
    }
    match verdict.ignore_reason() {
        Some(reason) => Err(FailoverError::Ignored(reason)),
        None => Ok(()),
    }
}

/// Phase 2: give workloads a head start before pools go away.
fn stop_workloads(ctx: &PipelineContext<'_>) {
    for workload in [Workload::Apps, Workload::Virt] {
        let platform = Arc::clone(&ctx.collab.platform);
        spawn_background("stop workloads", async move {
            platform.stop_workloads(workload).await
        });
    }
}

/// Phases 3 to 5: metrics off, traffic off, VIPs off.
async fn quiesce(ctx: &PipelineContext<'_>, report: &mut TransitionReport) -> FailoverResult<()> {
    let collab = ctx.collab;

    tracing::info!("stopping reporting metrics");
    collab
        .services
        .control(ServiceOp::Stop, "netdata", ControlOptions::LOCAL)
        .await?;

    let scope = PhaseScope::new("FIREWALL_DROP");
    match collab.firewall.drop_all().await {
        Ok(()) => scope.complete(),
        Err(e) => {
            tracing::error!(error = %e, "error blocking network traffic");
            report.warn(format!("firewall drop: {}", e));
            scope.fail(&e.to_string());
        }
    }

    // a stopped VRRP daemon advertises priority 0 and the VIPs move
    let scope = PhaseScope::new("VIP_RELEASE");
    collab.vrrp.pause_events().await?;
    if let Err(e) = collab
        .services
        .control(ServiceOp::Stop, "keepalived", ControlOptions::LOCAL)
        .await
    {
        scope.fail(&e.to_string());
        if let Err(unpause) = collab.vrrp.unpause_events().await {
            tracing::error!(error = %unpause, "failed to unpause role events");
        }
        return Err(e.into());
    }
    scope.complete();
    Ok(())
}

/// Phases 6 to 11: sentinel, export under deadline, fencing release.
async fn release_storage(
    ctx: &PipelineContext<'_>,
    sentinel: &WatchdogSentinel,
    report: &mut TransitionReport,
) -> FailoverResult<()> {
    let collab = ctx.collab;

    match sentinel.arm() {
        Ok(at) => tracing::debug!(armed_at = at, path = %sentinel.path().display(), "watchdog sentinel armed"),
        Err(e) => tracing::warn!(error = %e, "failed to arm watchdog sentinel"),
    }

    let pools = collab.pools.query_pools().await?;
    let scope = PhaseScope::new("EXPORT");
    if let Err(e) = ctx
        .pools
        .export_with_deadline(&pools, ctx.tunables.export_deadline, report)
        .await
    {
        scope.fail(&e.to_string());
        return Err(e);
    }
    scope.complete();

    let scope = PhaseScope::new("FENCING_RELEASE");
    ctx.fencing.release().await?;
    scope.complete();

    call_advisory(
        collab.peer.as_ref(),
        "failover.send_small_file",
        json!([PWENC_SECRET_PATH]),
        report,
    )
    .await;

    let disks = Arc::clone(&collab.disks);
    spawn_background("attach remote shelves", async move {
        disks.attach_remote_shelves(false).await.map(|attach| {
            if attach.failed {
                tracing::error!(message = %attach.message, "failed to attach remote shelves");
            }
        })
    });

    // nothing left to export, so a boot into BACKUP honours the deadline
    if let Err(e) = sentinel.disarm() {
        tracing::warn!(error = %e, "failed to remove watchdog sentinel");
    }
    Ok(())
}

/// Undo the quiesce after a failed release so the node keeps hearing VRRP.
async fn recover_vrrp(
    ctx: &PipelineContext<'_>,
    sentinel: &WatchdogSentinel,
    report: &mut TransitionReport,
) {
    tracing::error!("failed to release storage, rejoining VRRP");
    if let Err(e) = sentinel.disarm() {
        tracing::warn!(error = %e, "failed to remove watchdog sentinel");
    }
    ctx.best_effort(
        report,
        "start keepalived",
        ctx.collab
            .services
            .control(ServiceOp::Start, "keepalived", ControlOptions::LOCAL),
    )
    .await;
    ctx.best_effort(report, "unpause role events", ctx.collab.vrrp.unpause_events())
        .await;
}

/// Phase 12
async fn standby_services(ctx: &PipelineContext<'_>, report: &mut TransitionReport) {
    let collab = ctx.collab;
    let services = &collab.services;

    ctx.best_effort(report, "refresh failover status", collab.platform.status_refresh())
        .await;
    ctx.best_effort(report, "set up system dataset", collab.platform.system_dataset_setup())
        .await;
    ctx.best_effort(report, "regenerate cron", services.generate("cron")).await;
    ctx.best_effort(report, "stop support services", collab.platform.stop_support_services())
        .await;
    ctx.best_effort(
        report,
        "stop mountd",
        services.control(ServiceOp::Stop, "mountd", ControlOptions::LOCAL),
    )
    .await;

    // SSH stays up on both controllers when the user enabled it
    let enabled = ctx
        .best_effort(report, "query enabled services", services.enabled_services())
        .await
        .unwrap_or_default();
    if enabled.iter().any(|s| s == "ssh") {
        ctx.best_effort(
            report,
            "restart ssh",
            services.control(ServiceOp::Restart, "ssh", ControlOptions::LOCAL),
        )
        .await;
    }
}

/// Phase 13: iSCSI ALUA standby view and NVMe-oF ANA.
async fn standby_targets(ctx: &PipelineContext<'_>, report: &mut TransitionReport) {
    let services = &ctx.collab.services;
    let targets = &ctx.collab.targets;
    let scope = PhaseScope::new("STANDBY_TARGETS");

    let alua = ctx.best_effort(report, "check ALUA", targets.alua_enabled()).await == Some(true);
    if alua
        && ctx
            .best_effort(report, "check iSCSI", services.started_or_enabled("iscsitarget"))
            .await
            == Some(true)
    {
        tracing::info!("starting iSCSI for ALUA");
        ctx.best_effort(report, "write empty target config", targets.standby_write_empty_config())
            .await;
        ctx.best_effort(report, "regenerate scst", services.generate("scst")).await;

        let op = match ctx
            .best_effort(report, "check target module", targets.kernel_module_loaded())
            .await
        {
            Some(true) => ServiceOp::Restart,
            _ => ServiceOp::Start,
        };
        ctx.best_effort(
            report,
            "iscsitarget for ALUA",
            services.control(op, "iscsitarget", ControlOptions::LOCAL),
        )
        .await;
    }

    let ana = ctx.best_effort(report, "check ANA", targets.nvmet_ana_active()).await == Some(true);
    let nvmet_wanted = ana
        && ctx
            .best_effort(report, "check NVMe-oF", services.started_or_enabled("nvmet"))
            .await
            == Some(true);
    let running = ctx
        .best_effort(report, "check NVMe-oF running", targets.nvmet_running())
        .await
        == Some(true);

    let op = match (nvmet_wanted, running) {
        (true, true) => Some(ServiceOp::Reload),
        (true, false) => Some(ServiceOp::Start),
        (false, true) => Some(ServiceOp::Stop),
        (false, false) => None,
    };
    match op {
        Some(op) => {
            tracing::info!(op = op.as_str(), "updating NVMe-oF target");
            ctx.best_effort(
                report,
                "nvmet for ANA",
                services.control(op, "nvmet", ControlOptions::LOCAL),
            )
            .await;
        }
        None => tracing::info!("no changes required for NVMe-oF target"),
    }

    scope.complete();
}

/// Phase 14: keys from the active node, then back into the VRRP group.
async fn rejoin_vrrp(ctx: &PipelineContext<'_>, report: &mut TransitionReport) {
    let collab = ctx.collab;

    tracing::info!("syncing encryption keys from MASTER node");
    call_advisory(
        collab.peer.as_ref(),
        "failover.sync_keys_to_remote_node",
        json!([]),
        report,
    )
    .await;
    call_advisory(
        collab.peer.as_ref(),
        "interface.persist_link_addresses",
        json!([]),
        report,
    )
    .await;

    let scope = PhaseScope::new("VRRP_REJOIN");
    ctx.best_effort(
        report,
        "start keepalived",
        collab
            .services
            .control(ServiceOp::Start, "keepalived", ControlOptions::LOCAL),
    )
    .await;
    ctx.best_effort(report, "unpause role events", collab.vrrp.unpause_events())
        .await;
    scope.complete();
}
