//! Boundary behaviour of the gate, the fencing retry budget and the
//! export deadline.

mod common;

use std::time::Duration;

use common::{single_controller, with_offline_pool, Harness};
use hafailover::failover::{
    ControllerRole, EventKind, FailoverConfig, FencingOutcome, GateDecision, IgnoreReason,
    PoolStatus, Progress, WatchdogSentinel,
};

// =============================================================================
// Export deadline
// =============================================================================

async fn demote_with_export_taking(delay: Duration) -> Harness {
    let h = Harness::new(|a| {
        single_controller(a);
        a.add_pool("tank", 1, PoolStatus::Online);
        a.set_export_delay(delay);
        a.set_fencing_running(true);
    });
    h.run("eth0", EventKind::Backup).await;
    h
}

#[tokio::test(start_paused = true)]
async fn test_export_exactly_at_deadline_fires_sysrq() {
    let h = demote_with_export_taking(Duration::from_secs(4)).await;

    assert!(h.appliance.rebooted());
    assert!(h.appliance.journal_contains("sysrq.reboot"));
    assert!(!h.appliance.journal_contains("fencing.stop"));
    assert_eq!(h.engine.metrics().sysrq_reboots, 1);
}

#[tokio::test(start_paused = true)]
async fn test_export_just_inside_deadline_completes() {
    let h = demote_with_export_taking(Duration::from_millis(3_999)).await;

    assert!(!h.appliance.rebooted());
    assert!(h.appliance.journal_contains("fencing.stop"));
    assert!(!h.appliance.fencing_running());
    assert_eq!(h.appliance.pool_status("tank"), Some(PoolStatus::Offline));
    assert!(!WatchdogSentinel::new(&h.tunables.watchdog_sentinel).is_armed());
    assert_eq!(h.engine.role(), ControllerRole::Backup);
}

#[tokio::test(start_paused = true)]
async fn test_shorter_deadline_is_honoured() {
    let h = Harness::with_tunables(
        |a| {
            single_controller(a);
            a.add_pool("tank", 1, PoolStatus::Online);
            a.set_export_delay(Duration::from_secs(2));
        },
        |t| t.export_deadline = Duration::from_secs(1),
    );

    let report = h.run("eth0", EventKind::Backup).await;

    assert!(report.sysrq_fired);
    assert!(report.ended_with(Progress::Error));
}

#[tokio::test(start_paused = true)]
async fn test_failed_fencing_release_rejoins_vrrp() {
    let h = Harness::new(|a| {
        single_controller(a);
        a.add_pool("tank", 1, PoolStatus::Online);
        a.set_fencing_running(true);
        a.fail_call("fencing.stop");
    });

    let report = h.run("eth0", EventKind::Backup).await;

    assert!(report.ended_with(Progress::Error));
    assert!(!report.sysrq_fired);
    assert_eq!(h.appliance.pool_status("tank"), Some(PoolStatus::Offline));
    assert!(!h.appliance.events_paused());
    assert!(h.appliance.journal_contains("service.start keepalived"));
    assert!(!WatchdogSentinel::new(&h.tunables.watchdog_sentinel).is_armed());
    assert_eq!(h.engine.role(), ControllerRole::Faulted);

    // a later event is still heard
    h.appliance.clear_journal();
    let decision = h.engine.hook("eth0", EventKind::Master).await;
    assert!(matches!(decision, GateDecision::Accepted(_)));
}

#[tokio::test(start_paused = true)]
async fn test_missed_deadline_leaves_vrrp_down() {
    let h = demote_with_export_taking(Duration::from_secs(5)).await;

    assert!(h.appliance.rebooted());
    assert!(h.appliance.events_paused());
    assert!(!h.appliance.journal_contains("service.start keepalived"));
    assert!(WatchdogSentinel::new(&h.tunables.watchdog_sentinel).is_armed());
}

// =============================================================================
// Fencing retry budget
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_fencing_clears_on_last_attempt() {
    let h = Harness::new(|a| {
        single_controller(a);
        with_offline_pool(a, "tank", 1);
        a.script_fencing(&[2, 2, 2, 0]);
    });

    let report = h.run("eth0", EventKind::Master).await;

    assert!(report.ended_with(Progress::Success));
    assert_eq!(report.fencing.as_ref().unwrap().attempts, 4);
}

#[tokio::test(start_paused = true)]
async fn test_fencing_never_clears_aborts() {
    let h = Harness::new(|a| {
        single_controller(a);
        with_offline_pool(a, "tank", 1);
        a.script_fencing(&[2, 2, 2, 2]);
    });

    let report = h.run("eth0", EventKind::Master).await;

    assert!(report.ended_with(Progress::Error));
    let fencing = report.fencing.as_ref().unwrap();
    assert_eq!(fencing.outcome, FencingOutcome::PeerRunning);
    assert_eq!(fencing.attempts, 4);

    // nothing past fencing ran
    assert!(!h.appliance.journal_contains("service.reload keepalived"));
    assert_eq!(h.appliance.journal_count("pool.import"), 0);
    assert_eq!(h.appliance.pool_status("tank"), Some(PoolStatus::Offline));
    assert_eq!(h.engine.role(), ControllerRole::Faulted);
}

#[tokio::test(start_paused = true)]
async fn test_key_registration_failure_is_not_retried() {
    let h = Harness::new(|a| {
        single_controller(a);
        with_offline_pool(a, "tank", 1);
        a.script_fencing(&[1]);
    });

    let report = h.run("eth0", EventKind::Master).await;

    assert!(report.ended_with(Progress::Error));
    assert_eq!(report.fencing.as_ref().unwrap().attempts, 1);
    assert_eq!(
        report.fencing.as_ref().unwrap().outcome,
        FencingOutcome::KeyRegistrationFailed
    );
}

// =============================================================================
// Gate rejections
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_non_critical_interface_has_no_side_effects() {
    let h = Harness::new(|a| {
        a.set_config(
            FailoverConfig::new()
                .with_group_member(1, "eth0")
                .with_non_critical("eth9"),
        );
        with_offline_pool(a, "tank", 1);
    });

    for kind in [EventKind::Master, EventKind::Backup] {
        let decision = h.engine.hook("eth9", kind).await;
        assert_eq!(
            decision.ignore_reason(),
            Some(&IgnoreReason::NonCriticalInterface {
                ifname: "eth9".to_string()
            })
        );
    }
    h.settle().await;

    // only the status refresh that follows every offer
    assert!(h
        .appliance
        .journal()
        .iter()
        .all(|entry| entry.ends_with("status_refresh")));
    assert_eq!(h.engine.role(), ControllerRole::Unknown);
}

#[tokio::test(start_paused = true)]
async fn test_master_with_every_pool_imported_is_ignored() {
    let h = Harness::new(|a| {
        single_controller(a);
        a.add_pool("tank", 1, PoolStatus::Online);
        a.add_pool("data", 2, PoolStatus::Degraded);
    });

    for _ in 0..3 {
        let decision = h.engine.hook("eth0", EventKind::Master).await;
        assert_eq!(decision.ignore_reason(), Some(&IgnoreReason::AlreadyImported));
    }
    assert_eq!(h.appliance.journal_count("fencing."), 0);
    assert_eq!(h.engine.metrics().events_ignored, 3);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_parks_until_forcetakeover() {
    let h = Harness::new(|a| {
        a.set_config(FailoverConfig::new().with_group_member(1, "eth0").disabled(false));
        with_offline_pool(a, "tank", 1);
    });

    let decision = h.engine.hook("eth0", EventKind::Master).await;
    assert_eq!(decision.ignore_reason(), Some(&IgnoreReason::Disabled));

    let report = h.run("eth0", EventKind::ForceTakeover).await;
    assert!(report.ended_with(Progress::Success));
    assert!(report.fencing.as_ref().unwrap().forced);
    assert!(h.appliance.journal_contains("fencing.start force"));
}

#[tokio::test(start_paused = true)]
async fn test_disabled_with_master_hint_is_ignored() {
    let h = Harness::new(|a| {
        a.set_config(FailoverConfig::new().with_group_member(1, "eth0").disabled(true));
    });

    let decision = h.engine.hook("eth0", EventKind::Backup).await;

    assert_eq!(
        decision.ignore_reason(),
        Some(&IgnoreReason::DisabledWithMasterHint)
    );
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_config_drops_event() {
    let h = Harness::new(|a| a.fail_config("datastore locked"));

    let decision = h.engine.hook("eth0", EventKind::Master).await;

    assert!(matches!(decision, GateDecision::Dropped { .. }));
    assert_eq!(h.engine.metrics().events_dropped, 1);
}

// =============================================================================
// Idempotent demote
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_backup_on_backup_without_pools() {
    let h = Harness::new(single_controller);

    assert!(h.run("eth0", EventKind::Backup).await.ended_with(Progress::Success));
    assert_eq!(h.engine.role(), ControllerRole::Backup);
    h.appliance.clear_journal();

    let report = h.run("eth0", EventKind::Backup).await;

    assert!(report.ended_with(Progress::Success));
    assert!(!report.sysrq_fired);
    assert!(!h.appliance.journal_contains("fencing.stop"));
    assert!(!h.appliance.journal_contains("sysrq.reboot"));
    assert!(h.appliance.journal_contains("vrrp.unpause_events"));
    assert_eq!(h.engine.role(), ControllerRole::Backup);
}
