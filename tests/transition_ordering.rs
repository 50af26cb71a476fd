//! Ordering guarantees across and within transitions

mod common;

use std::time::Duration;

use common::{single_controller, with_offline_pool, Harness, CRITICAL};
use hafailover::failover::{ControllerRole, EventKind, PoolStatus, Progress};
use hafailover::observability::{NoticeKind, VRRP_EVENT_STREAM};

#[tokio::test(start_paused = true)]
async fn test_critical_services_dispatch_first() {
    let h = Harness::new(|a| {
        single_controller(a);
        with_offline_pool(a, "tank", 1);
    });

    let report = h.run("eth0", EventKind::Master).await;
    assert!(report.ended_with(Progress::Success));

    let last_critical = CRITICAL
        .iter()
        .map(|s| report.dispatch_index(s).unwrap())
        .max()
        .unwrap();
    for other in ["ftp", "snmp"] {
        assert!(report.dispatch_index(other).unwrap() > last_critical);
    }

    // same order on the appliance side
    let journal_critical = [
        "service.become_active iscsitarget",
        "service.restart cifs",
        "service.restart nfs",
        "service.become_active nvmet",
    ]
    .iter()
    .map(|e| h.appliance.journal_position(e).unwrap())
    .max()
    .unwrap();
    let first_other = ["service.restart ftp", "service.restart snmp"]
        .iter()
        .map(|e| h.appliance.journal_position(e).unwrap())
        .min()
        .unwrap();
    assert!(journal_critical < first_other);
    assert!(h.appliance.journal_position("firewall.accept_all").unwrap() < first_other);
}

#[tokio::test(start_paused = true)]
async fn test_slow_service_times_out_without_failing() {
    let h = Harness::new(|a| {
        single_controller(a);
        with_offline_pool(a, "tank", 1);
        a.set_service_delay("cifs", Duration::from_secs(20));
    });

    let report = h.run("eth0", EventKind::Master).await;

    assert!(report.ended_with(Progress::Success));
    assert_eq!(report.service_timeouts.len(), 1);
    assert_eq!(report.service_timeouts[0].service, "cifs");
    assert!(h.appliance.service_running("nfs"));
    assert!(h.appliance.journal_contains("service.restart ftp"));
    assert_eq!(h.engine.metrics().service_timeouts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_promote_demote_promote_matches_cold_boot() {
    let h = Harness::new(|a| {
        single_controller(a);
        with_offline_pool(a, "tank", 1);
    });

    assert!(h.run("eth0", EventKind::Master).await.ended_with(Progress::Success));
    assert_eq!(h.engine.role(), ControllerRole::Master);

    let demoted = h.run("eth0", EventKind::Backup).await;
    assert!(demoted.ended_with(Progress::Success));
    assert_eq!(demoted.exported, vec!["tank".to_string()]);
    assert_eq!(h.appliance.pool_status("tank"), Some(PoolStatus::Offline));
    assert!(!h.appliance.fencing_running());
    assert!(!h.appliance.firewall_open());
    assert_eq!(h.engine.role(), ControllerRole::Backup);

    let promoted = h.run("eth0", EventKind::Master).await;
    assert!(promoted.ended_with(Progress::Success));

    assert_eq!(h.appliance.pool_status("tank"), Some(PoolStatus::Online));
    for service in CRITICAL {
        assert!(h.appliance.service_running(service), "{} not running", service);
    }
    assert!(h.appliance.firewall_open());
    assert!(h.appliance.fencing_running());
    assert!(!h.appliance.events_paused());
    assert_eq!(h.engine.role(), ControllerRole::Master);

    let metrics = h.engine.metrics();
    assert_eq!(metrics.promotions, 2);
    assert_eq!(metrics.demotions, 1);
}

#[tokio::test(start_paused = true)]
async fn test_demote_phase_order() {
    let h = Harness::new(|a| {
        single_controller(a);
        a.add_pool("tank", 1, PoolStatus::Online);
        a.set_fencing_running(true);
        a.set_enabled_services(&["cifs", "ssh"]);
    });

    let report = h.run("eth0", EventKind::Backup).await;
    assert!(report.ended_with(Progress::Success));

    let order = [
        "service.stop netdata",
        "firewall.drop_all",
        "vrrp.pause_events",
        "service.stop keepalived",
        "pool.export tank",
        "fencing.stop",
        "service.stop mountd",
        "service.restart ssh",
        "service.start keepalived",
        "vrrp.unpause_events",
    ];
    let positions: Vec<usize> = order
        .iter()
        .map(|e| {
            h.appliance
                .journal_position(e)
                .unwrap_or_else(|| panic!("{} missing from journal", e))
        })
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "{:?}", h.appliance.journal());
}

#[tokio::test(start_paused = true)]
async fn test_status_refresh_follows_every_job() {
    let h = Harness::new(|a| {
        single_controller(a);
        with_offline_pool(a, "tank", 1);
    });

    h.run("eth0", EventKind::Master).await;
    h.settle().await;

    let refreshed = h.appliance.journal_position("peer.status_refresh").unwrap();
    let opened = h.appliance.journal_position("firewall.accept_all").unwrap();
    assert!(opened < refreshed);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_peer_never_fails_demote() {
    let h = Harness::new(|a| {
        single_controller(a);
        a.add_pool("tank", 1, PoolStatus::Online);
        a.set_peer_reachable(false);
    });

    let report = h.run("eth0", EventKind::Backup).await;

    assert!(report.ended_with(Progress::Success));
    assert!(report
        .peer_failures
        .contains(&"failover.send_small_file".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_role_changes_are_broadcast() {
    let h = Harness::new(|a| {
        single_controller(a);
        with_offline_pool(a, "tank", 1);
    });
    let mut rx = h.engine.subscribe();

    h.run("eth0", EventKind::ForceTakeover).await;

    let changed = rx.recv().await.unwrap();
    assert_eq!(changed.stream, VRRP_EVENT_STREAM);
    assert_eq!(changed.kind, NoticeKind::Changed);
    assert_eq!(changed.ifname, "eth0");
    assert_eq!(changed.event, EventKind::ForceTakeover);

    let forced = rx.recv().await.unwrap();
    assert_eq!(forced.kind, NoticeKind::ForceTakeover);
}
