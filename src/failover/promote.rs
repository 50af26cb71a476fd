//! Promote Pipeline
//!
//! Runs on MASTER or forcetakeover while the transition lock is held.
//! Phases are strictly ordered. Everything up to and including the critical
//! service wave is required; a failure there ends the job with ERROR.
//! Everything after the firewall opens is best-effort housekeeping.
//!
//! Fencing is the point of no return: nothing that touches shared disks
//! runs before outcome 0.

use std::sync::Arc;

use serde_json::json;
use tokio::time::Instant;

use super::config::PoolRef;
use super::errors::{FailoverError, FailoverResult};
use super::event::EventKind;
use super::peer::call_advisory;
use super::quorum::{self, QuorumVerdict};
use super::report::TransitionReport;
use super::runner::{spawn_background, PipelineContext};
use super::services::Wave;
use super::state::Progress;
use crate::control::{ControlOptions, ServiceOp, Workload};
use crate::observability::PhaseScope;

const ISCSI_SUSPEND_SECS: u64 = 30;

/// State carried from the iSCSI pre-quiesce to the later phases
#[derive(Debug, Default, Clone, Copy)]
struct AluaState {
    handled: bool,
    suspended: bool,
    cleaned: bool,
}

pub(crate) async fn run(ctx: &PipelineContext<'_>, report: &mut TransitionReport) -> FailoverResult<()> {
    wait_for_network(ctx).await;

    ctx.set_progress(Progress::Electing);

    attach_remote_shelves(ctx).await;

    check_group(ctx).await?;

    acquire_fencing(ctx, report).await?;

    assert_vip_ownership(ctx).await?;

    let alua = prequiesce_targets(ctx).await;

    let pools = ctx.collab.pools.query_pools().await?;
    if pools.is_empty() {
        tracing::warn!("no pools to import, skipping to non-critical services");
    } else {
        activate_storage(ctx, report, &pools, alua).await?;
    }

    restart_noncritical(ctx, report).await;

    housekeeping(ctx, report, alua).await;

    start_workloads(ctx);

    tracing::info!("failover event complete");
    Ok(())
}

/// Phase 0: the network layer must finish configuring interfaces first.
async fn wait_for_network(ctx: &PipelineContext<'_>) {
    let Some(sentinel) = ctx.tunables.netif_ready_sentinel.as_ref() else {
        return;
    };

    let scope = PhaseScope::new("NETIF_READY");
    let started = Instant::now();
    while !sentinel.exists() {
        if started.elapsed() >= ctx.tunables.netif_ready_timeout {
            tracing::warn!(
                path = %sentinel.display(),
                "network interfaces not ready after {:?}, continuing",
                ctx.tunables.netif_ready_timeout
            );
            scope.fail("timed out");
            return;
        }
        tokio::time::sleep(ctx.tunables.netif_poll_interval).await;
    }
    scope.complete();
}

/// Phase 2: bring up NVMe/RDMA shelves. Waited on twice, never fatal.
async fn attach_remote_shelves(ctx: &PipelineContext<'_>) {
    let scope = PhaseScope::new("REMOTE_ATTACH");
    let disks = Arc::clone(&ctx.collab.disks);
    let mut job = tokio::spawn(async move { disks.attach_remote_shelves(true).await });
    let limit = ctx.tunables.remote_attach_timeout;

    for attempt in 1..=2 {
        match tokio::time::timeout(limit, &mut job).await {
            Ok(Ok(Ok(attach))) if attach.failed => {
                tracing::error!(message = %attach.message, "failed to attach remote shelves");
                scope.fail(&attach.message);
                return;
            }
            Ok(Ok(Ok(attach))) => {
                tracing::info!(message = %attach.message, "remote shelves attached");
                scope.complete();
                return;
            }
            Ok(Ok(Err(e))) => {
                scope.fail(&e.to_string());
                return;
            }
            Ok(Err(e)) => {
                scope.fail(&e.to_string());
                return;
            }
            Err(_) if attempt == 1 => {
                tracing::error!("timed out attaching remote shelves, retrying");
            }
            Err(_) => {
                tracing::error!("timed out attaching remote shelves");
                scope.fail("timed out");
                return;
            }
        }
    }
}

/// Phase 3: siblings in the failover group must agree.
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
            "received MASTER but other interfaces are still working on the peer"
        );
    }
    match verdict.ignore_reason() {
        Some(reason) => {
            ctx.set_progress(Progress::Ignored);
            Err(FailoverError::Ignored(reason))
        }
        None => Ok(()),
    }
}

/// Phase 4: SCSI-PR reservations.
async fn acquire_fencing(ctx: &PipelineContext<'_>, report: &mut TransitionReport) -> FailoverResult<()> {
    let force = ctx.kind() == EventKind::ForceTakeover;
    if force {
        tracing::warn!("forcefully taking over as the MASTER node, preempting peer reservations");
        ctx.events.force_takeover(ctx.ifname());
    } else {
        tracing::warn!("entering MASTER");
    }

    let scope = PhaseScope::new("FENCING");
    let summary = ctx.fencing.acquire(force).await?;
    let outcome = summary.outcome;
    report.fencing = Some(summary);

    if !outcome.is_ok() {
        tracing::error!(code = outcome.code(), "{}, exiting", outcome.description());
        scope.fail(outcome.description());
        ctx.set_progress(Progress::Error);
        return Err(FailoverError::Fencing(outcome));
    }
    scope.complete();
    Ok(())
}

/// Phase 5: reload the VRRP daemon so every VIP floats back here.
async fn assert_vip_ownership(ctx: &PipelineContext<'_>) -> FailoverResult<()> {
    let scope = PhaseScope::new("VIP_ASSERT");
    ctx.collab.vrrp.pause_events().await?;
    let reloaded = ctx
        .collab
        .services
        .control(ServiceOp::Reload, "keepalived", ControlOptions::LOCAL)
        .await;
    let unpaused = ctx.collab.vrrp.unpause_events().await;

    if let Err(e) = reloaded.and(unpaused) {
        scope.fail(&e.to_string());
        return Err(e.into());
    }
    scope.complete();
    Ok(())
}

/// Phase 6: quiesce the iSCSI target and swap it to the active view.
async fn prequiesce_targets(ctx: &PipelineContext<'_>) -> AluaState {
    let mut alua = AluaState::default();
    let services = &ctx.collab.services;
    let targets = &ctx.collab.targets;

    match services.started_or_enabled("iscsitarget").await {
        Ok(true) => {}
        Ok(false) => return alua,
        Err(e) => {
            tracing::error!(error = %e, "failed to verify iSCSI service");
            return alua;
        }
    }

    alua.handled = match targets.alua_enabled().await {
        Ok(enabled) => enabled,
        Err(e) => {
            tracing::error!(error = %e, "failed to check ALUA");
            false
        }
    };
    if !alua.handled {
        return alua;
    }

    let scope = PhaseScope::new("ISCSI_PREQUIESCE");
    match targets.suspend(ISCSI_SUSPEND_SECS).await {
        Ok(true) => alua.suspended = true,
        Ok(false) => {
            // booting straight into ACTIVE, nothing loaded yet
            tracing::info!("did not suspend iSCSI");
            scope.skip("target not loaded");
            return alua;
        }
        Err(e) => {
            scope.fail(&e.to_string());
            return alua;
        }
    }

    let swapped = async {
        targets.force_close_sessions().await?;
        targets.active_elected().await
    }
    .await;
    match swapped {
        Ok(()) => {
            alua.cleaned = true;
            scope.complete();
        }
        Err(e) => scope.fail(&e.to_string()),
    }
    alua
}

/// Phases 8 to 15: disks, pools, system dataset, critical wave, firewall.
async fn activate_storage(
    ctx: &PipelineContext<'_>,
    report: &mut TransitionReport,
    pools: &[PoolRef],
    alua: AluaState,
) -> FailoverResult<()> {
    let collab = ctx.collab;

    let scope = PhaseScope::new("SED_UNLOCK");
    match collab.disks.sed_unlock_all().await {
        Ok(maybe_unlocked) => {
            scope.complete();
            if maybe_unlocked {
                call_advisory(collab.peer.as_ref(), "disk.retaste", json!([]), report).await;
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to unlock SED disks");
            scope.fail(&e.to_string());
        }
    }

    ctx.set_progress(Progress::Importing);
    let scope = PhaseScope::new("IMPORT");
    if let Err(e) = ctx.pools.import_all(pools, report).await {
        scope.fail(&e.to_string());
        ctx.set_progress(Progress::Error);
        return Err(e);
    }
    scope.complete();

    if alua.handled && alua.cleaned {
        ctx.best_effort(report, "activate ALUA extents", collab.targets.activate_extents())
            .await;
    }

    let scope = PhaseScope::new("SYSTEM_DATASET");
    collab.platform.status_refresh().await?;
    collab.services.generate("rc").await?;
    collab.platform.system_dataset_setup().await?;
    scope.complete();

    let scope = PhaseScope::new("CRITICAL_SERVICES");
    ctx.services
        .restart_wave(Wave::Critical, ctx.tunables.critical_service_timeout, report)
        .await;
    scope.complete();

    let platform = Arc::clone(&collab.platform);
    spawn_background("directory services setup", async move {
        platform.directory_services_setup().await
    });
    let store = Arc::clone(&collab.pools);
    spawn_background("ddt prefetch", async move { store.ddt_prefetch().await });

    let scope = PhaseScope::new("FIREWALL_OPEN");
    match collab.firewall.accept_all().await {
        Ok(()) => scope.complete(),
        Err(e) => {
            tracing::error!(error = %e, "failed to allow network traffic");
            report.warn(format!("firewall accept: {}", e));
            scope.fail(&e.to_string());
        }
    }

    tracing::info!("critical portion of failover is now complete");
    Ok(())
}

/// Phase 16
async fn restart_noncritical(ctx: &PipelineContext<'_>, report: &mut TransitionReport) {
    let scope = PhaseScope::new("NONCRITICAL_SERVICES");
    ctx.services
        .restart_wave(Wave::NonCritical, ctx.tunables.noncritical_service_timeout, report)
        .await;
    scope.complete();
}

/// Phase 17, in order, each step best-effort.
async fn housekeeping(ctx: &PipelineContext<'_>, report: &mut TransitionReport, alua: AluaState) {
    let scope = PhaseScope::new("HOUSEKEEPING");
    let collab = ctx.collab;
    let services = &collab.services;
    let platform = &collab.platform;

    ctx.best_effort(report, "regenerate cron", services.generate("cron")).await;
    ctx.best_effort(report, "sync disks", collab.disks.sync_all()).await;

    if alua.handled {
        if alua.suspended
            && ctx
                .best_effort(report, "clear iSCSI suspend", collab.targets.clear_suspend())
                .await
                == Some(true)
        {
            tracing::info!("cleared iSCSI suspend");
        }
        ctx.best_effort(report, "reset ALUA", collab.targets.reset_active()).await;
    }

    ctx.best_effort(
        report,
        "restart metrics collector",
        services.control(ServiceOp::Restart, "netdata", ControlOptions::LOCAL),
    )
    .await;
    ctx.best_effort(report, "update replication tasks", platform.update_replication_tasks())
        .await;
    ctx.best_effort(report, "block failover alerts", platform.block_failover_alerts())
        .await;
    ctx.best_effort(report, "initialize alerts", platform.initialize_alerts()).await;

    let renew = Arc::clone(platform);
    spawn_background("renew certificates", async move { renew.renew_certificates().await });

    ctx.best_effort(report, "start support services", platform.start_support_services())
        .await;
    ctx.best_effort(
        report,
        "discard remote reboot reasons",
        platform.discard_remote_reboot_reasons(),
    )
    .await;

    if ctx.best_effort(report, "query KMIP", platform.kmip_enabled()).await == Some(true) {
        tracing::info!("syncing encryption keys with KMIP server");
        ctx.best_effort(report, "sync KMIP keys", platform.kmip_initialize_keys()).await;
    }

    ctx.best_effort(report, "persist link addresses", platform.persist_link_addresses())
        .await;
    ctx.best_effort(report, "update reboot info", platform.update_reboot_info()).await;

    scope.complete();
}

/// Phase 18: user workloads, not awaited.
fn start_workloads(ctx: &PipelineContext<'_>) {
    for workload in [Workload::Apps, Workload::Virt] {
        let platform = Arc::clone(&ctx.collab.platform);
        spawn_background("start workloads", async move {
            platform.start_workloads(workload).await
        });
    }
}
