// Heartbeat-timeout detection and the reboot cycle against a fake billing provider

mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use common::{FakeCost, sample, ts};
use fleetwatch::health::{
    CycleOutcome, DEFAULT_SIGNATURE, HealthConfig, HealthMonitor, InstanceOutcome,
    detect_sustained_failure, parse_log_timestamp,
};
use fleetwatch::models::{ChannelClass, Notification, Sample};
use fleetwatch::providers::BillingInstance;
use fleetwatch::store::MetricsStore;
use tokio::sync::{mpsc, watch};

fn line(at: DateTime<Utc>, text: &str) -> String {
    format!(
        "[worker]: {} {}",
        at.to_rfc3339_opts(SecondsFormat::Millis, true),
        text
    )
}

/// Heartbeat timeouts 30s, 90s and 150s before `now`, plus unrelated noise.
fn failing_log(now: DateTime<Utc>) -> String {
    [
        line(now - Duration::seconds(150), DEFAULT_SIGNATURE),
        line(now - Duration::seconds(120), "Processing request"),
        line(now - Duration::seconds(90), DEFAULT_SIGNATURE),
        line(now - Duration::seconds(30), DEFAULT_SIGNATURE),
    ]
    .join("\n")
}

fn healthy_log(now: DateTime<Utc>) -> String {
    [
        line(now - Duration::seconds(90), "Processing request"),
        line(now - Duration::seconds(30), DEFAULT_SIGNATURE),
    ]
    .join("\n")
}

fn config(log_ready_delay: StdDuration) -> HealthConfig {
    HealthConfig {
        interval: StdDuration::from_secs(300),
        log_ready_delay,
        reboot_cooldown: Duration::seconds(900),
        signature: DEFAULT_SIGNATURE.into(),
    }
}

fn store_with_fleet(running: u64) -> Arc<MetricsStore> {
    let store = Arc::new(MetricsStore::default());
    store.window().append(fleet_sample(Utc::now(), running));
    store
}

fn fleet_sample(at: DateTime<Utc>, running: u64) -> Sample {
    Sample {
        running_instances: running,
        ..sample(at, 100)
    }
}

fn monitor(
    cost: Arc<FakeCost>,
    store: Arc<MetricsStore>,
    delay: StdDuration,
) -> (Arc<HealthMonitor>, mpsc::Receiver<Notification>) {
    let (tx, rx) = mpsc::channel(16);
    (
        Arc::new(HealthMonitor::new(cost, store, tx, config(delay))),
        rx,
    )
}

#[test]
fn parses_timestamp_after_tag() {
    let t = parse_log_timestamp("[worker]: 2025-02-26T18:07:58.305Z Failed to send heartbeat");
    assert_eq!(t, Some(ts("2025-02-26T18:07:58.305Z")));
    assert_eq!(parse_log_timestamp("no tag here"), None);
    assert_eq!(parse_log_timestamp("[worker]: yesterday at noon"), None);
}

#[test]
fn detects_signature_in_three_consecutive_minutes() {
    let now = ts("2025-03-01T10:00:00Z");
    assert!(detect_sustained_failure(&failing_log(now), DEFAULT_SIGNATURE, now));
}

#[test]
fn missing_minute_bucket_is_not_sustained() {
    let now = ts("2025-03-01T10:00:00Z");
    assert!(!detect_sustained_failure(&healthy_log(now), DEFAULT_SIGNATURE, now));
}

#[test]
fn burst_within_one_minute_is_not_sustained() {
    let now = ts("2025-03-01T10:00:00Z");
    let log = [10, 20, 30, 40, 50]
        .iter()
        .map(|s| line(now - Duration::seconds(*s), DEFAULT_SIGNATURE))
        .collect::<Vec<_>>()
        .join("\n");
    assert!(!detect_sustained_failure(&log, DEFAULT_SIGNATURE, now));
}

#[test]
fn future_and_stale_lines_are_ignored() {
    let now = ts("2025-03-01T10:00:00Z");
    let log = [
        line(now + Duration::seconds(30), DEFAULT_SIGNATURE),
        line(now - Duration::seconds(90), DEFAULT_SIGNATURE),
        line(now - Duration::seconds(150), DEFAULT_SIGNATURE),
        line(now - Duration::seconds(400), DEFAULT_SIGNATURE),
    ]
    .join("\n");
    assert!(!detect_sustained_failure(&log, DEFAULT_SIGNATURE, now));
}

#[tokio::test]
async fn zero_fleet_skips_whole_cycle() {
    let cost = Arc::new(FakeCost::default());
    cost.add_instance(1, &failing_log(Utc::now()));
    let (m, mut rx) = monitor(cost.clone(), store_with_fleet(0), StdDuration::ZERO);

    assert_eq!(m.run_cycle().await, CycleOutcome::SkippedZeroFleet);
    assert!(cost.reboots().is_empty());
    assert!(rx.try_recv().is_err());

    // No samples yet counts as zero too.
    let (m, _rx) = monitor(cost.clone(), Arc::new(MetricsStore::default()), StdDuration::ZERO);
    assert_eq!(m.run_cycle().await, CycleOutcome::SkippedZeroFleet);
}

#[tokio::test]
async fn reboots_only_failing_instance() {
    let cost = Arc::new(FakeCost::default());
    cost.add_instance(1, &failing_log(Utc::now()));
    cost.add_instance(2, &healthy_log(Utc::now()));
    let (m, mut rx) = monitor(cost.clone(), store_with_fleet(10), StdDuration::ZERO);

    assert_eq!(
        m.run_cycle().await,
        CycleOutcome::Completed(vec![
            (1, InstanceOutcome::Rebooted),
            (2, InstanceOutcome::Healthy)
        ])
    );
    assert_eq!(cost.reboots(), vec![1]);

    let n = rx.try_recv().unwrap();
    assert_eq!(n.channel, ChannelClass::Status);
    assert!(n.text.contains("Instance ID: 1 was restarted."));
    assert!(n.text.contains("Fleet running instances: 10"));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn recently_rebooted_instance_is_left_alone() {
    let cost = Arc::new(FakeCost::default());
    cost.add_instance(1, &failing_log(Utc::now()));
    let (m, _rx) = monitor(cost.clone(), store_with_fleet(10), StdDuration::ZERO);

    m.run_cycle().await;
    assert_eq!(
        m.run_cycle().await,
        CycleOutcome::Completed(vec![(1, InstanceOutcome::CoolingDown)])
    );
    assert_eq!(cost.reboots(), vec![1]);
}

#[tokio::test]
async fn one_instance_failing_does_not_stop_the_others() {
    let cost = Arc::new(FakeCost::default());
    cost.instances.lock().unwrap().push(BillingInstance {
        id: 3,
        status: Some("running".into()),
    });
    cost.add_instance(4, &failing_log(Utc::now()));
    let (m, _rx) = monitor(cost.clone(), store_with_fleet(10), StdDuration::ZERO);

    let CycleOutcome::Completed(outcomes) = m.run_cycle().await else {
        panic!("cycle did not complete");
    };
    assert!(matches!(outcomes[0], (3, InstanceOutcome::LogsUnavailable(_))));
    assert_eq!(outcomes[1], (4, InstanceOutcome::Rebooted));
}

#[tokio::test]
async fn failed_reboot_is_reported_to_error_channel() {
    let cost = Arc::new(FakeCost::default());
    cost.add_instance(7, &failing_log(Utc::now()));
    cost.reboot_fails.lock().unwrap().insert(7);
    let (m, mut rx) = monitor(cost.clone(), store_with_fleet(10), StdDuration::ZERO);

    let CycleOutcome::Completed(outcomes) = m.run_cycle().await else {
        panic!("cycle did not complete");
    };
    assert!(matches!(outcomes[0], (7, InstanceOutcome::RebootFailed(_))));
    let n = rx.try_recv().unwrap();
    assert_eq!(n.channel, ChannelClass::Error);
    assert!(n.text.contains("Instance Reboot Failed"));
    assert!(n.text.contains("reboot refused"));

    // No cooldown is recorded for a failed reboot.
    cost.reboot_fails.lock().unwrap().clear();
    assert_eq!(
        m.run_cycle().await,
        CycleOutcome::Completed(vec![(7, InstanceOutcome::Rebooted)])
    );
}

#[tokio::test(start_paused = true)]
async fn fleet_scaling_to_zero_mid_cycle_skips_reboot() {
    let cost = Arc::new(FakeCost::default());
    cost.add_instance(1, &failing_log(Utc::now()));
    let store = store_with_fleet(10);
    let (m, mut rx) = monitor(cost.clone(), store.clone(), StdDuration::from_secs(5));

    let cycle = tokio::spawn({
        let m = m.clone();
        async move { m.run_cycle().await }
    });
    // The cycle is now waiting for the log bundle.
    tokio::time::sleep(StdDuration::from_secs(1)).await;
    store
        .window()
        .append(fleet_sample(Utc::now() + Duration::seconds(1), 0));

    assert_eq!(
        cycle.await.unwrap(),
        CycleOutcome::Completed(vec![(1, InstanceOutcome::SkippedZeroFleet)])
    );
    assert!(cost.reboots().is_empty());
    let n = rx.try_recv().unwrap();
    assert_eq!(n.channel, ChannelClass::Error);
    assert!(n.text.contains("Reboot Skipped"));
}

#[tokio::test(start_paused = true)]
async fn spawned_monitor_runs_first_cycle_and_stops() {
    let cost = Arc::new(FakeCost::default());
    cost.add_instance(1, &failing_log(Utc::now()));
    let (m, mut rx) = monitor(cost.clone(), store_with_fleet(10), StdDuration::from_secs(5));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = m.spawn(shutdown_rx);
    let n = rx.recv().await.unwrap();
    assert!(n.text.contains("Instance Reboot Success"));

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
    assert_eq!(cost.reboots(), vec![1]);
}
