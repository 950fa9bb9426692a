// Collection scheduler: minute tick, daily tick and hourly window report, each its own task.
// A tick runs to completion inside its select arm, so shutdown is only observed between ticks
// and a slow tick delays the next one instead of stacking.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior, interval, interval_at};
use tracing::{Instrument, debug, info, instrument, warn};

use crate::alerts::{Latch, Transition, code_block};
use crate::models::{ChannelClass, Notification, Snapshot};
use crate::snapshot::SnapshotBuilder;
use crate::snapshot::report::{daily_message, hourly_deltas, hourly_message};
use crate::store::MetricsStore;

/// Rate limit for the "no receivers" debug line on the snapshot broadcast.
const NO_RECEIVERS_WARN_INTERVAL: Duration = Duration::from_secs(60);

pub struct SchedulerDeps {
    pub builder: Arc<SnapshotBuilder>,
    pub store: Arc<MetricsStore>,
    pub snapshot_tx: broadcast::Sender<Arc<Snapshot>>,
    pub events: mpsc::Sender<Notification>,
    pub shutdown_rx: watch::Receiver<bool>,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub minute_interval: Duration,
    /// Cron schedule for the daily summary, evaluated in UTC.
    pub daily_schedule: cron::Schedule,
    /// `None` disables the hourly window report.
    pub hourly_report_interval: Option<Duration>,
    pub report_offset: FixedOffset,
}

pub struct SchedulerHandles {
    pub minute: JoinHandle<()>,
    pub daily: JoinHandle<()>,
    pub hourly: Option<JoinHandle<()>>,
}

impl SchedulerHandles {
    /// Waits for every task to exit.
    pub async fn join(self) {
        let _ = self.minute.await;
        let _ = self.daily.await;
        if let Some(h) = self.hourly {
            let _ = h.await;
        }
    }
}

/// Resolves once the shutdown flag is set or its sender is gone.
pub(crate) async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn emit(events: &mpsc::Sender<Notification>, notification: Notification) {
    if events.send(notification).await.is_err() {
        debug!(operation = "emit_notification", "event channel closed");
    }
}

pub fn spawn(deps: SchedulerDeps, config: SchedulerConfig) -> SchedulerHandles {
    let SchedulerDeps {
        builder,
        store,
        snapshot_tx,
        events,
        shutdown_rx,
    } = deps;

    let minute = spawn_minute_task(
        Arc::clone(&builder),
        snapshot_tx,
        events.clone(),
        shutdown_rx.clone(),
        config.minute_interval,
    );
    let daily = spawn_daily_task(
        builder,
        events.clone(),
        shutdown_rx.clone(),
        config.daily_schedule.clone(),
        config.report_offset,
    );
    let hourly = config.hourly_report_interval.map(|period| {
        spawn_hourly_task(store, events, shutdown_rx, period, config.report_offset)
    });
    SchedulerHandles {
        minute,
        daily,
        hourly,
    }
}

pub fn spawn_minute_task(
    builder: Arc<SnapshotBuilder>,
    snapshot_tx: broadcast::Sender<Arc<Snapshot>>,
    events: mpsc::Sender<Notification>,
    mut shutdown_rx: watch::Receiver<bool>,
    period: Duration,
) -> JoinHandle<()> {
    let span = tracing::debug_span!("minute_tick", period_secs = period.as_secs());
    tokio::spawn(
        async move {
            // First tick completes immediately.
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut collection_failing = Latch::new();
            let mut last_no_receivers_warn: Option<Instant> = None;

            loop {
                tokio::select! {
                    biased;
                    _ = stopped(&mut shutdown_rx) => {
                        debug!("Minute tick shutting down");
                        break;
                    }
                    _ = tick.tick() => {
                        run_minute_tick(
                            &builder,
                            &snapshot_tx,
                            &events,
                            &mut collection_failing,
                            &mut last_no_receivers_warn,
                        )
                        .await;
                    }
                }
            }
        }
        .instrument(span),
    )
}

async fn run_minute_tick(
    builder: &SnapshotBuilder,
    snapshot_tx: &broadcast::Sender<Arc<Snapshot>>,
    events: &mpsc::Sender<Notification>,
    collection_failing: &mut Latch,
    last_no_receivers_warn: &mut Option<Instant>,
) {
    let now = Utc::now();
    match builder.build_at(now).await {
        Ok(outcome) => {
            if collection_failing.observe(false, now) == Some(Transition::Cleared) {
                info!("metrics collection recovered");
                emit(
                    events,
                    Notification::new(
                        ChannelClass::Error,
                        format!(
                            "✅ Metrics Collection Recovered\n{}",
                            code_block("Snapshots are being published again.")
                        ),
                    ),
                )
                .await;
            }
            for notification in outcome.notifications {
                emit(events, notification).await;
            }
            if snapshot_tx.send(outcome.snapshot).is_err() {
                let should_warn = last_no_receivers_warn
                    .is_none_or(|t| t.elapsed() >= NO_RECEIVERS_WARN_INTERVAL);
                if should_warn {
                    debug!(
                        operation = "broadcast_snapshot",
                        "No active subscribers; broadcast channel has no receivers"
                    );
                    *last_no_receivers_warn = Some(Instant::now());
                }
            }
        }
        Err(e) => {
            warn!(
                error = %e,
                operation = "build_snapshot",
                "minute tick failed; previous snapshot kept"
            );
            if collection_failing.observe(true, now) == Some(Transition::Raised) {
                emit(
                    events,
                    Notification::new(
                        ChannelClass::Error,
                        format!(
                            "⚠️ Metrics Collection Failed\n{}",
                            code_block(&e.to_string())
                        ),
                    ),
                )
                .await;
            }
        }
    }
}

/// Delay from `now` until the schedule's next fire time.
pub fn next_fire_delay(schedule: &cron::Schedule, now: DateTime<Utc>) -> Option<Duration> {
    let next = schedule.after(&now).next()?;
    Some((next - now).to_std().unwrap_or(Duration::from_secs(1)))
}

pub fn spawn_daily_task(
    builder: Arc<SnapshotBuilder>,
    events: mpsc::Sender<Notification>,
    mut shutdown_rx: watch::Receiver<bool>,
    schedule: cron::Schedule,
    report_offset: FixedOffset,
) -> JoinHandle<()> {
    let span = tracing::debug_span!("daily_tick");
    tokio::spawn(
        async move {
            loop {
                let Some(delay) = next_fire_delay(&schedule, Utc::now()) else {
                    warn!("daily schedule has no upcoming fire time; daily summary disabled");
                    break;
                };
                debug!(delay_secs = delay.as_secs(), "next daily summary scheduled");
                tokio::select! {
                    biased;
                    _ = stopped(&mut shutdown_rx) => {
                        debug!("Daily tick shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {
                        run_daily_tick(&builder, &events, report_offset).await;
                    }
                }
            }
        }
        .instrument(span),
    )
}

/// Rebuilds the daily figures and emits the summary to the daily channel.
#[instrument(skip_all, fields(operation = "daily_summary"))]
pub async fn run_daily_tick(
    builder: &SnapshotBuilder,
    events: &mpsc::Sender<Notification>,
    report_offset: FixedOffset,
) {
    match builder.daily_summary_at(Utc::now()).await {
        Ok(summary) => {
            info!(
                share = summary.share,
                total_daily_cost = summary.total_daily_cost,
                "daily summary computed"
            );
            emit(
                events,
                Notification::new(ChannelClass::Daily, daily_message(&summary, report_offset)),
            )
            .await;
        }
        Err(e) => warn!(error = %e, operation = "daily_summary", "daily tick failed"),
    }
}

pub fn spawn_hourly_task(
    store: Arc<MetricsStore>,
    events: mpsc::Sender<Notification>,
    mut shutdown_rx: watch::Receiver<bool>,
    period: Duration,
    report_offset: FixedOffset,
) -> JoinHandle<()> {
    let span = tracing::debug_span!("hourly_report", period_secs = period.as_secs());
    tokio::spawn(
        async move {
            // No report at startup: the window is still empty.
            let mut tick = interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut baseline: Option<Arc<Snapshot>> = None;
            loop {
                tokio::select! {
                    biased;
                    _ = stopped(&mut shutdown_rx) => {
                        debug!("Hourly report shutting down");
                        break;
                    }
                    _ = tick.tick() => {
                        let stats = store.window_stats();
                        let current = store.latest();
                        let deltas = baseline
                            .as_deref()
                            .zip(current.as_deref())
                            .map(|(prev, cur)| hourly_deltas(prev, cur));
                        emit(
                            &events,
                            Notification::new(
                                ChannelClass::Hourly,
                                hourly_message(&stats, deltas.as_ref(), report_offset),
                            ),
                        )
                        .await;
                        if current.is_some() {
                            baseline = current;
                        }
                    }
                }
            }
        }
        .instrument(span),
    )
}
