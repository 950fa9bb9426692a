// Scheduler tasks under paused tokio time: cadence, no overlap, graceful stop, reports

mod common;

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{FakeFleet, builder, instance, report, sample, ts, worker};
use fleetwatch::models::{ChannelClass, Notification};
use fleetwatch::scheduler::{
    SchedulerConfig, SchedulerDeps, next_fire_delay, run_daily_tick, spawn, spawn_hourly_task,
    spawn_minute_task,
};
use fleetwatch::snapshot::report::report_offset;
use fleetwatch::store::MetricsStore;
use tokio::sync::{broadcast, mpsc, watch};

fn healthy_fleet() -> FakeFleet {
    FakeFleet::new(report(
        10,
        vec![worker("w1", 10_000, vec![instance("0.2.3", "RTX 4090")])],
    ))
}

#[tokio::test(start_paused = true)]
async fn first_tick_runs_immediately_then_every_period() {
    let fleet = Arc::new(healthy_fleet());
    let store = Arc::new(MetricsStore::default());
    let b = Arc::new(builder(fleet.clone(), None, false, store.clone()));
    let (snapshot_tx, mut snapshot_rx) = broadcast::channel(16);
    let (events_tx, _events_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = spawn_minute_task(
        b,
        snapshot_tx,
        events_tx,
        shutdown_rx,
        Duration::from_secs(60),
    );

    let first = snapshot_rx.recv().await.unwrap();
    assert_eq!(first.general.running_instances, 10);
    assert_eq!(fleet.fetches.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(fleet.fetches.load(Ordering::SeqCst), 2);
    assert_eq!(store.window().len(), 2);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn slow_tick_delays_the_next_instead_of_overlapping() {
    let fleet = Arc::new(healthy_fleet().with_delay(Duration::from_secs(150)));
    let b = Arc::new(builder(
        fleet.clone(),
        None,
        false,
        Arc::new(MetricsStore::default()),
    ));
    let (snapshot_tx, _) = broadcast::channel(16);
    let (events_tx, _events_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = spawn_minute_task(
        b,
        snapshot_tx,
        events_tx,
        shutdown_rx,
        Duration::from_secs(60),
    );
    tokio::time::sleep(Duration::from_secs(400)).await;

    assert_eq!(fleet.max_in_flight.load(Ordering::SeqCst), 1);
    let fetches = fleet.fetches.load(Ordering::SeqCst);
    assert!((2..=3).contains(&fetches), "fetches = {}", fetches);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_lets_in_flight_tick_finish() {
    let fleet = Arc::new(healthy_fleet().with_delay(Duration::from_secs(150)));
    let store = Arc::new(MetricsStore::default());
    let b = Arc::new(builder(fleet.clone(), None, false, store.clone()));
    let (snapshot_tx, _) = broadcast::channel(16);
    let (events_tx, _events_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = spawn_minute_task(
        b,
        snapshot_tx,
        events_tx,
        shutdown_rx,
        Duration::from_secs(60),
    );
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(store.latest().is_none());

    let started = tokio::time::Instant::now();
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(140));
    assert!(store.latest().is_some(), "in-flight tick was not completed");
    assert_eq!(fleet.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn collection_failure_notifies_once_then_recovery() {
    let fleet = Arc::new(healthy_fleet());
    fleet.fail();
    let b = Arc::new(builder(
        fleet.clone(),
        None,
        false,
        Arc::new(MetricsStore::default()),
    ));
    let (snapshot_tx, _) = broadcast::channel(16);
    let (events_tx, mut events_rx) = mpsc::channel::<Notification>(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = spawn_minute_task(
        b,
        snapshot_tx,
        events_tx,
        shutdown_rx,
        Duration::from_secs(60),
    );

    let failed = events_rx.recv().await.unwrap();
    assert_eq!(failed.channel, ChannelClass::Error);
    assert!(failed.text.contains("Metrics Collection Failed"));
    assert!(failed.text.contains("502"));

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(fleet.fetches.load(Ordering::SeqCst), 2);
    assert!(events_rx.try_recv().is_err(), "second failure must not notify");

    fleet.set_report(report(10, vec![]));
    let recovered = events_rx.recv().await.unwrap();
    assert!(recovered.text.contains("Metrics Collection Recovered"));

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn hourly_report_waits_one_period_and_reports_window() {
    let store = Arc::new(MetricsStore::default());
    let t = ts("2025-03-01T10:00:00Z");
    store.window().append(sample(t, 4));
    store
        .window()
        .append(sample(t + chrono::Duration::minutes(1), 8));
    let (events_tx, mut events_rx) = mpsc::channel::<Notification>(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = spawn_hourly_task(
        store,
        events_tx,
        shutdown_rx,
        Duration::from_secs(3600),
        report_offset(0),
    );
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(events_rx.try_recv().is_err(), "no report at startup");

    let n = events_rx.recv().await.unwrap();
    assert_eq!(n.channel, ChannelClass::Hourly);
    assert!(n.text.contains("(2 samples)"));
    assert!(n.text.contains("RPM: min 4 / avg 6.0 / max 8 / current 8"));

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn hourly_report_includes_changes_after_first_report() {
    let fleet = Arc::new(healthy_fleet());
    let store = Arc::new(MetricsStore::default());
    let b = builder(fleet.clone(), None, false, store.clone());
    let t = ts("2025-03-01T10:00:00Z");
    b.build_at(t).await.unwrap();
    let (events_tx, mut events_rx) = mpsc::channel::<Notification>(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = spawn_hourly_task(
        store,
        events_tx,
        shutdown_rx,
        Duration::from_secs(3600),
        report_offset(0),
    );
    let first = events_rx.recv().await.unwrap();
    assert!(!first.text.contains("Changes since last report"));

    let mut next = report(
        10,
        vec![worker("w1", 12_000, vec![instance("0.2.3", "RTX 4090")])],
    );
    next.user.generations_last_24h = 430;
    fleet.set_report(next);
    b.build_at(t + chrono::Duration::hours(1)).await.unwrap();

    let second = events_rx.recv().await.unwrap();
    assert!(second.text.contains("User generations: 400 → 430 (Δ30)"));
    assert!(second.text.contains("worker-w1 tokens: 10000 → 12000 (Δ2000)"));

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn daily_tick_emits_summary_to_daily_channel() {
    let fleet = Arc::new(healthy_fleet());
    let b = builder(fleet.clone(), None, false, Arc::new(MetricsStore::default()));
    let (events_tx, mut events_rx) = mpsc::channel::<Notification>(16);

    run_daily_tick(&b, &events_tx, report_offset(0)).await;
    let n = events_rx.try_recv().unwrap();
    assert_eq!(n.channel, ChannelClass::Daily);
    assert!(n.text.contains("Points: 10000"));
    assert!(n.text.contains("Share: 1.00%"));

    fleet.fail();
    run_daily_tick(&b, &events_tx, report_offset(0)).await;
    assert!(events_rx.try_recv().is_err(), "failed daily tick sends nothing");
}

#[test]
fn next_fire_delay_follows_cron_schedule() {
    let midnight = cron::Schedule::from_str("0 0 0 * * *").unwrap();
    assert_eq!(
        next_fire_delay(&midnight, ts("2025-03-01T23:59:00Z")),
        Some(Duration::from_secs(60))
    );
    assert_eq!(
        next_fire_delay(&midnight, ts("2025-03-02T00:00:00Z")),
        Some(Duration::from_secs(24 * 3600))
    );
}

#[tokio::test(start_paused = true)]
async fn spawned_scheduler_stops_on_shutdown() {
    let fleet = Arc::new(healthy_fleet());
    let store = Arc::new(MetricsStore::default());
    let b = Arc::new(builder(fleet.clone(), None, false, store.clone()));
    let (snapshot_tx, _) = broadcast::channel(16);
    let (events_tx, _events_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handles = spawn(
        SchedulerDeps {
            builder: b,
            store: store.clone(),
            snapshot_tx,
            events: events_tx,
            shutdown_rx,
        },
        SchedulerConfig {
            minute_interval: Duration::from_secs(60),
            daily_schedule: cron::Schedule::from_str("0 0 0 * * *").unwrap(),
            hourly_report_interval: Some(Duration::from_secs(3600)),
            report_offset: report_offset(0),
        },
    );
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(store.latest().is_some());

    shutdown_tx.send(true).unwrap();
    handles.join().await;
}
