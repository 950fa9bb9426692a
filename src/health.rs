// Log-pattern health monitor: scans each rented instance's logs for a sustained heartbeat
// timeout and reboots the instance. Gated on a non-zero fleet and a per-instance cooldown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{Instrument, debug, info, instrument, warn};

use crate::models::{ChannelClass, Notification};
use crate::providers::{BillingInstance, CostProvider};
use crate::scheduler::stopped;
use crate::store::MetricsStore;

pub const DEFAULT_SIGNATURE: &str = "Failed to send heartbeat: TimeoutError: timeout";

/// Number of consecutive one-minute buckets that must each contain the signature.
pub const SUSTAINED_BUCKETS: i64 = 3;

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: std::time::Duration,
    /// Fixed wait between requesting a log bundle and downloading it.
    pub log_ready_delay: std::time::Duration,
    pub reboot_cooldown: Duration,
    pub signature: String,
}

/// What happened to one instance during a cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceOutcome {
    Healthy,
    Rebooted,
    RebootFailed(String),
    /// Failure detected but the fleet count dropped to 0 before the reboot.
    SkippedZeroFleet,
    /// Failure detected but the instance was rebooted recently.
    CoolingDown,
    /// Log request or download failed.
    LogsUnavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Fleet-wide running count was 0 (or unknown); nothing was checked.
    SkippedZeroFleet,
    /// The instance list could not be fetched.
    Failed(String),
    Completed(Vec<(u64, InstanceOutcome)>),
}

/// Timestamp of a log line shaped like `[tag]: 2025-02-26T18:07:58.305Z message...`.
pub fn parse_log_timestamp(line: &str) -> Option<DateTime<Utc>> {
    let token = line.split(": ").nth(1)?.split_whitespace().next()?;
    DateTime::parse_from_rfc3339(token)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// True when the signature appears in each of the last three one-minute buckets before `now`
/// (0-1, 1-2 and 2-3 minutes ago). Lines without a parseable timestamp and future-dated
/// lines are ignored.
pub fn detect_sustained_failure(log: &str, signature: &str, now: DateTime<Utc>) -> bool {
    let mut seen = [false; SUSTAINED_BUCKETS as usize];
    for line in log.lines().filter(|l| l.contains(signature)) {
        let Some(ts) = parse_log_timestamp(line) else {
            continue;
        };
        let elapsed = now - ts;
        if elapsed < Duration::zero() {
            continue;
        }
        let bucket = elapsed.num_seconds() / 60;
        if bucket < SUSTAINED_BUCKETS {
            seen[bucket as usize] = true;
        }
    }
    seen.iter().all(|b| *b)
}

pub struct HealthMonitor {
    cost: Arc<dyn CostProvider>,
    store: Arc<MetricsStore>,
    events: mpsc::Sender<Notification>,
    config: HealthConfig,
    last_reboot: Mutex<HashMap<u64, DateTime<Utc>>>,
}

impl HealthMonitor {
    pub fn new(
        cost: Arc<dyn CostProvider>,
        store: Arc<MetricsStore>,
        events: mpsc::Sender<Notification>,
        config: HealthConfig,
    ) -> Self {
        Self {
            cost,
            store,
            events,
            config,
            last_reboot: Mutex::new(HashMap::new()),
        }
    }

    fn fleet_running(&self) -> u64 {
        self.store.fleet_running_instances().unwrap_or(0)
    }

    async fn emit(&self, channel: ChannelClass, text: String) {
        if self.events.send(Notification::new(channel, text)).await.is_err() {
            debug!(operation = "emit_notification", "event channel closed");
        }
    }

    fn cooling_down(&self, instance_id: u64, now: DateTime<Utc>) -> bool {
        let last = self.last_reboot.lock().unwrap_or_else(|e| e.into_inner());
        last.get(&instance_id)
            .is_some_and(|at| now - *at < self.config.reboot_cooldown)
    }

    #[instrument(skip(self), fields(operation = "health_cycle"))]
    pub async fn run_cycle(&self) -> CycleOutcome {
        if self.fleet_running() == 0 {
            debug!("fleet running instance count is 0; skipping health cycle");
            return CycleOutcome::SkippedZeroFleet;
        }
        let instances = match self.cost.instances().await {
            Ok(i) => i,
            Err(e) => {
                warn!(error = %e, operation = "list_instances", "health cycle aborted");
                return CycleOutcome::Failed(e.to_string());
            }
        };
        let mut outcomes = Vec::with_capacity(instances.len());
        for instance in &instances {
            let outcome = self.check_instance(instance).await;
            outcomes.push((instance.id, outcome));
        }
        CycleOutcome::Completed(outcomes)
    }

    async fn check_instance(&self, instance: &BillingInstance) -> InstanceOutcome {
        let id = instance.id;
        debug!(
            instance_id = id,
            status = instance.status.as_deref().unwrap_or("unknown"),
            "requesting instance logs"
        );
        let url = match self.cost.request_instance_logs(id).await {
            Ok(u) => u,
            Err(e) => {
                warn!(error = %e, instance_id = id, operation = "request_logs", "log request failed");
                return InstanceOutcome::LogsUnavailable(e.to_string());
            }
        };
        // The bundle is produced asynchronously; there is no readiness signal to poll.
        tokio::time::sleep(self.config.log_ready_delay).await;
        let log = match self.cost.download_logs(&url).await {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, instance_id = id, operation = "download_logs", "log download failed");
                return InstanceOutcome::LogsUnavailable(e.to_string());
            }
        };

        let now = Utc::now();
        if !detect_sustained_failure(&log, &self.config.signature, now) {
            return InstanceOutcome::Healthy;
        }
        if self.cooling_down(id, now) {
            info!(instance_id = id, "sustained heartbeat timeout, but instance was rebooted recently");
            return InstanceOutcome::CoolingDown;
        }

        // The fleet may have scaled to zero while the logs were being fetched.
        let fleet_running = self.fleet_running();
        if fleet_running == 0 {
            info!(instance_id = id, "fleet running instance count is 0; reboot skipped");
            self.emit(
                ChannelClass::Error,
                format!(
                    "⚠️ Reboot Skipped\nInstance ID: {}\nReason: fleet running instance count is 0",
                    id
                ),
            )
            .await;
            return InstanceOutcome::SkippedZeroFleet;
        }

        info!(instance_id = id, fleet_running, "sustained heartbeat timeout; rebooting");
        match self.cost.reboot_instance(id).await {
            Ok(()) => {
                self.last_reboot
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(id, Utc::now());
                self.emit(
                    ChannelClass::Status,
                    format!(
                        "✅ Instance Reboot Success\nInstance ID: {} was restarted.\nFleet running instances: {}",
                        id, fleet_running
                    ),
                )
                .await;
                InstanceOutcome::Rebooted
            }
            Err(e) => {
                warn!(error = %e, instance_id = id, operation = "reboot_instance", "reboot failed");
                self.emit(
                    ChannelClass::Error,
                    format!("⚠️ Instance Reboot Failed\nInstance ID: {}\nError: {}", id, e),
                )
                .await;
                InstanceOutcome::RebootFailed(e.to_string())
            }
        }
    }

    /// Runs a cycle immediately, then every `interval`, until shutdown.
    pub fn spawn(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let span = tracing::debug_span!(
            "health_monitor",
            interval_secs = self.config.interval.as_secs()
        );
        tokio::spawn(
            async move {
                let mut tick = interval(self.config.interval);
                tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = stopped(&mut shutdown_rx) => {
                            debug!("Health monitor shutting down");
                            break;
                        }
                        _ = tick.tick() => {
                            if let CycleOutcome::Completed(outcomes) = self.run_cycle().await {
                                let rebooted = outcomes
                                    .iter()
                                    .filter(|(_, o)| *o == InstanceOutcome::Rebooted)
                                    .count();
                                debug!(checked = outcomes.len(), rebooted, "health cycle complete");
                            }
                        }
                    }
                }
            }
            .instrument(span),
        )
    }
}
