//! End-to-end failover scenarios
//!
//! Each test drives the engine through the gate exactly as the role source
//! would and inspects the simulated appliance afterwards.

mod common;

use std::time::Duration;

use common::{single_controller, with_offline_pool, Harness, CRITICAL};
use hafailover::control::CallError;
use hafailover::failover::{
    classify_previous_boot, ControllerRole, EventKind, FailoverConfig, FencingOutcome,
    IgnoreReason, PoolStatus, Progress, VrrpState, WatchdogSentinel,
};

// =============================================================================
// Cold boot
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_cold_boot_single_pool_promotes() {
    let h = Harness::new(|a| {
        single_controller(a);
        with_offline_pool(a, "tank", 1);
    });

    let report = h.run("eth0", EventKind::Master).await;

    assert!(report.ended_with(Progress::Success), "reason: {:?}", report.reason);
    assert_eq!(report.fencing.as_ref().unwrap().outcome, FencingOutcome::Ok);
    assert_eq!(report.fencing.as_ref().unwrap().attempts, 1);
    assert_eq!(report.imported, vec!["tank".to_string()]);
    assert_eq!(h.appliance.pool_status("tank"), Some(PoolStatus::Online));

    assert_eq!(report.dispatched[..4], CRITICAL);
    assert!(h.appliance.journal_contains("service.become_active iscsitarget"));
    assert!(h.appliance.journal_contains("service.restart cifs"));
    assert!(h.appliance.journal_contains("service.restart nfs"));
    assert!(h.appliance.journal_contains("service.become_active nvmet"));

    assert!(h.appliance.firewall_open());
    assert!(h.appliance.fencing_running());
    assert!(!h.appliance.events_paused());
    assert_eq!(h.engine.role(), ControllerRole::Master);
    assert!(h.engine.transition().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_promote_without_pools_skips_to_non_critical() {
    let h = Harness::new(single_controller);

    let report = h.run("eth0", EventKind::Master).await;

    assert!(report.ended_with(Progress::Success), "reason: {:?}", report.reason);
    assert!(h.appliance.journal_contains("fencing.start"));
    assert!(report.imported.is_empty());
    assert!(!h.appliance.journal_contains("disk.sed_unlock_all"));
    assert!(!h.appliance.journal_contains("firewall.accept_all"));
    for service in CRITICAL {
        assert!(report.dispatch_index(service).is_none(), "{} dispatched", service);
    }
    assert!(h.appliance.journal_contains("service.restart ftp"));
    assert!(h.appliance.journal_contains("service.restart snmp"));
    assert_eq!(h.engine.role(), ControllerRole::Master);
}

#[tokio::test(start_paused = true)]
async fn test_fencing_precedes_every_disk_operation() {
    let h = Harness::new(|a| {
        single_controller(a);
        with_offline_pool(a, "tank", 1);
    });

    h.run("eth0", EventKind::Master).await;

    let fenced = h.appliance.journal_position("fencing.start").unwrap();
    let vip = h.appliance.journal_position("service.reload keepalived").unwrap();
    let import = h.appliance.journal_position("pool.import tank").unwrap();
    let firewall = h.appliance.journal_position("firewall.accept_all").unwrap();

    assert!(fenced < vip);
    assert!(vip < import);
    assert!(import < firewall);
}

// =============================================================================
// Group quorum
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_peer_still_owns_sibling_vip() {
    let h = Harness::new(|a| {
        a.set_config(
            FailoverConfig::new()
                .with_group_member(1, "eth0")
                .with_group_member(1, "eth1"),
        );
        a.set_vrrp_state("eth1", VrrpState::Backup);
        with_offline_pool(a, "tank", 1);
    });

    let handle = h.accept("eth0", EventKind::Master).await;
    let report = handle.wait().await;

    assert!(report.ended_with(Progress::Ignored));
    assert_eq!(handle.progress(), Some(Progress::Ignored));
    assert_eq!(h.appliance.journal_count("fencing."), 0);
    assert_eq!(h.appliance.journal_count("pool.import"), 0);
    assert_eq!(h.appliance.pool_status("tank"), Some(PoolStatus::Offline));
    assert_eq!(h.engine.role(), ControllerRole::Unknown);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_sibling_does_not_block() {
    let h = Harness::new(|a| {
        a.set_config(
            FailoverConfig::new()
                .with_group_member(1, "eth0")
                .with_group_member(1, "eth1"),
        );
        a.set_vrrp_state("eth1", VrrpState::Fault);
        with_offline_pool(a, "tank", 1);
    });

    let report = h.run("eth0", EventKind::Master).await;

    assert!(report.ended_with(Progress::Success));
}

// =============================================================================
// Startup flurry
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_duplicate_backup_during_startup_flurry() {
    let h = Harness::new(|a| {
        single_controller(a);
        with_offline_pool(a, "tank", 1);
    });

    let first = h.accept("eth0", EventKind::Backup).await;

    let second = h.engine.hook("eth0", EventKind::Backup).await;
    assert_eq!(
        second.ignore_reason(),
        Some(&IgnoreReason::Duplicate {
            running_ifname: "eth0".to_string()
        })
    );

    let master = h.accept("eth0", EventKind::Master).await;
    assert_eq!(h.engine.in_flight(), 2);

    let demoted = first.wait().await;
    let promoted = master.wait().await;

    assert!(demoted.ended_with(Progress::Success));
    assert!(promoted.ended_with(Progress::Success));
    assert!(demoted.finished_at.unwrap() <= promoted.started_at);

    // the demote's VIP release happens before the promote fences
    let released = h.appliance.journal_position("service.stop keepalived").unwrap();
    let fenced = h.appliance.journal_position("fencing.start").unwrap();
    assert!(released < fenced);

    assert_eq!(h.engine.role(), ControllerRole::Master);
    assert_eq!(h.engine.in_flight(), 0);
}

// =============================================================================
// Export deadline
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_hanging_export_fires_sysrq() {
    let h = Harness::new(|a| {
        single_controller(a);
        a.add_pool("tank", 1, PoolStatus::Online);
        a.hang_export("tank");
        a.set_fencing_running(true);
    });

    let started = tokio::time::Instant::now();
    let report = h.run("eth0", EventKind::Backup).await;
    let elapsed = started.elapsed();

    assert!(report.ended_with(Progress::Error));
    assert!(report.sysrq_fired);
    assert!(h.appliance.rebooted());
    assert!(elapsed >= Duration::from_secs(4));
    assert!(elapsed < Duration::from_secs(5));

    // no further code ran after the reboot request
    assert!(!h.appliance.journal_contains("fencing.stop"));
    assert!(h.appliance.fencing_running());
    assert_eq!(h.engine.role(), ControllerRole::Demoting);

    let sentinel = WatchdogSentinel::new(&h.tunables.watchdog_sentinel);
    assert!(sentinel.is_armed());

    let cause = classify_previous_boot(&sentinel).unwrap();
    assert_eq!(cause.alert_text(), "watchdog reboot");
    assert!(!sentinel.is_armed());
}

// =============================================================================
// Partial import
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_partial_pool_import_succeeds() {
    let h = Harness::new(|a| {
        single_controller(a);
        with_offline_pool(a, "tank", 1);
        with_offline_pool(a, "data", 2);
        a.fail_import("data", CallError::new("zfs.pool.import_pool", "I/O error"));
    });

    let report = h.run("eth0", EventKind::Master).await;

    assert!(report.ended_with(Progress::Success));
    assert_eq!(report.imported, vec!["tank".to_string()]);
    assert_eq!(report.pool_failures.len(), 1);
    assert_eq!(report.pool_failures[0].name, "data");
    assert_eq!(h.appliance.journal_count("pool.import data"), 1);

    assert_eq!(h.appliance.pool_status("tank"), Some(PoolStatus::Online));
    assert_eq!(h.appliance.pool_status("data"), Some(PoolStatus::Offline));
    assert_eq!(report.dispatched[..4], CRITICAL);
}

#[tokio::test(start_paused = true)]
async fn test_every_pool_failing_is_an_error() {
    let h = Harness::new(|a| {
        single_controller(a);
        with_offline_pool(a, "tank", 1);
        a.fail_import("tank", CallError::new("zfs.pool.import_pool", "I/O error"));
    });

    let report = h.run("eth0", EventKind::Master).await;

    assert!(report.ended_with(Progress::Error));
    assert!(report.dispatched.is_empty());
    assert!(!h.appliance.firewall_open());
    assert_eq!(h.engine.role(), ControllerRole::Faulted);
}

#[tokio::test(start_paused = true)]
async fn test_enoent_import_retries_without_cachefile() {
    let h = Harness::new(|a| {
        single_controller(a);
        with_offline_pool(a, "tank", 1);
        a.fail_import(
            "tank",
            CallError::with_errno("zfs.pool.import_pool", hafailover::control::ENOENT, "no such device"),
        );
    });

    let report = h.run("eth0", EventKind::Master).await;

    assert!(report.ended_with(Progress::Success));
    assert!(h.appliance.journal_contains("pool.import tank without cachefile"));
    assert_eq!(h.appliance.pool_status("tank"), Some(PoolStatus::Online));
}

// =============================================================================
// Fencing retries
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_fencing_peer_running_eventually_clears() {
    let h = Harness::new(|a| {
        single_controller(a);
        with_offline_pool(a, "tank", 1);
        a.script_fencing(&[2, 2, 0]);
        a.set_fencing_delay(Duration::from_secs(11));
    });

    let report = h.run("eth0", EventKind::Master).await;

    assert!(report.ended_with(Progress::Success));
    let fencing = report.fencing.as_ref().unwrap();
    assert_eq!(fencing.attempts, 3);
    assert!(fencing.elapsed_ms >= 22_000);
    assert_eq!(h.appliance.journal_count("fencing.start"), 3);
    assert_eq!(h.engine.metrics().fencing_retries, 2);
}

// =============================================================================
// Panics
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_panicking_phase_ends_in_error_and_runner_survives() {
    let h = Harness::new(|a| {
        single_controller(a);
        with_offline_pool(a, "tank", 1);
        a.panic_once("fencing.start");
    });

    let report = h.run("eth0", EventKind::Master).await;

    assert!(report.ended_with(Progress::Error));
    assert!(report.reason.as_deref().unwrap().contains("panicked"));
    assert_eq!(h.engine.role(), ControllerRole::Faulted);
    assert!(h.engine.transition().is_none());
    assert_eq!(h.engine.in_flight(), 0);
    assert_eq!(h.engine.metrics().transitions_failed, 1);

    let retried = h.run("eth0", EventKind::Master).await;

    assert!(retried.ended_with(Progress::Success), "reason: {:?}", retried.reason);
    assert_eq!(h.appliance.pool_status("tank"), Some(PoolStatus::Online));
    assert_eq!(h.engine.role(), ControllerRole::Master);
}
