// Snapshot builder: one tick = fetch primary -> fetch secondary -> derive -> alert check
// -> worker diff -> publish.
// A primary failure aborts the tick; secondary failures only blank the fields they feed.

pub mod report;

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, instrument, warn};

use crate::alerts::AlertMonitor;
use crate::changes::WorkerChangeTracker;
use crate::fleet::{GpuPriceTable, compare_versions, normalize_gpu_name};
pub use crate::models::CostSource;
use crate::models::{
    CreditBalance, DailySummary, FleetTotals, InstanceSnapshot, Notification, Sample, Snapshot,
    UserTotals, WorkerSnapshot,
};
use crate::providers::{
    CostProvider, Credentials, FleetMetricsProvider, FleetReport, InstanceReport, ProviderError,
    Session, WorkerReport,
};
use crate::store::MetricsStore;

/// Figures fetched from the optional cost provider. `None` means "not configured" or "fetch failed".
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CostFigures {
    pub instance_count: Option<u64>,
    pub billed_daily_cost: Option<f64>,
    pub credit: Option<CreditBalance>,
}

/// Result of one minute tick.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub snapshot: Arc<Snapshot>,
    pub notifications: Vec<Notification>,
}

pub struct SnapshotBuilderConfig {
    pub credentials: Credentials,
    /// Re-login once the cached session is older than this.
    pub session_refresh: Duration,
    /// Fetch credit + billed cost from the cost provider and use the billed cost as total.
    pub include_cost: bool,
}

struct CachedSession {
    session: Session,
    created_at: DateTime<Utc>,
}

pub struct SnapshotBuilder {
    fleet: Arc<dyn FleetMetricsProvider>,
    cost: Option<Arc<dyn CostProvider>>,
    prices: GpuPriceTable,
    store: Arc<MetricsStore>,
    alerts: Mutex<AlertMonitor>,
    worker_changes: Mutex<WorkerChangeTracker>,
    session: Mutex<Option<CachedSession>>,
    config: SnapshotBuilderConfig,
}

impl SnapshotBuilder {
    pub fn new(
        fleet: Arc<dyn FleetMetricsProvider>,
        cost: Option<Arc<dyn CostProvider>>,
        prices: GpuPriceTable,
        store: Arc<MetricsStore>,
        alerts: AlertMonitor,
        config: SnapshotBuilderConfig,
    ) -> Self {
        Self {
            fleet,
            cost,
            prices,
            store,
            alerts: Mutex::new(alerts),
            worker_changes: Mutex::new(WorkerChangeTracker::new()),
            session: Mutex::new(None),
            config,
        }
    }

    pub fn store(&self) -> &Arc<MetricsStore> {
        &self.store
    }

    pub fn cost_configured(&self) -> bool {
        self.cost.is_some()
    }

    fn cost_source(&self) -> CostSource {
        if self.cost.is_some() && self.config.include_cost {
            CostSource::Billed
        } else {
            CostSource::Estimate
        }
    }

    pub async fn build(&self) -> Result<TickOutcome, ProviderError> {
        self.build_at(Utc::now()).await
    }

    /// Runs one full tick anchored at `now`. On error nothing is published.
    #[instrument(skip(self), fields(operation = "build_snapshot"))]
    pub async fn build_at(&self, now: DateTime<Utc>) -> Result<TickOutcome, ProviderError> {
        let report = self.fetch_primary(now).await?;
        let figures = self.fetch_cost_figures(now, true).await;

        let mut snapshot = assemble(
            &report,
            &figures,
            &self.prices,
            self.cost_source(),
            now,
        );

        let mut notifications = {
            let mut monitor = self.alerts.lock().unwrap_or_else(|e| e.into_inner());
            let out = monitor.evaluate(&snapshot, self.cost_configured(), now);
            snapshot.alerts = monitor.status();
            out
        };
        notifications.extend(
            self.worker_changes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .observe(&snapshot.workers),
        );

        let sample = Sample {
            timestamp: now,
            rpm: snapshot.general.rpm,
            running_instances: snapshot.general.running_instances,
            general_generations: snapshot.general.generations_last_hour,
            user_generations: snapshot.user.generations_last_hour,
        };
        let snapshot = Arc::new(snapshot);
        self.store.publish(Arc::clone(&snapshot), sample);

        debug!(
            running_instances = snapshot.general.running_instances,
            workers = snapshot.workers.len(),
            notifications = notifications.len(),
            "snapshot published"
        );
        Ok(TickOutcome {
            snapshot,
            notifications,
        })
    }

    /// Fresh cost/share/efficiency figures for the daily report. Does not touch the store
    /// or the alert latches.
    #[instrument(skip(self), fields(operation = "daily_summary"))]
    pub async fn daily_summary_at(&self, now: DateTime<Utc>) -> Result<DailySummary, ProviderError> {
        let report = self.fetch_primary(now).await?;
        let figures = self.fetch_cost_figures(now, false).await;
        let snapshot = assemble(&report, &figures, &self.prices, self.cost_source(), now);
        let user = snapshot.user;
        Ok(DailySummary {
            taken_at: now,
            tokens_last_24h: user.tokens_last_24h,
            share: user.share,
            efficiency: user.efficiency,
            estimated_daily_cost: user.estimated_daily_cost,
            billed_daily_cost: user.billed_daily_cost,
            total_daily_cost: user.total_daily_cost,
            credit: user.credit,
        })
    }

    async fn fetch_primary(&self, now: DateTime<Utc>) -> Result<FleetReport, ProviderError> {
        let session = self.session(now).await?;
        match self.fleet.fetch_report(&session).await {
            Ok(report) => Ok(report),
            Err(e) => {
                if matches!(
                    e,
                    ProviderError::Auth(_) | ProviderError::Status { status: 401 | 403, .. }
                ) {
                    // Force a fresh login on the next attempt.
                    *self.session.lock().unwrap_or_else(|p| p.into_inner()) = None;
                }
                Err(e)
            }
        }
    }

    /// Cached session, logging in again when missing or older than the refresh period.
    async fn session(&self, now: DateTime<Utc>) -> Result<Session, ProviderError> {
        {
            let cached = self.session.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(c) = cached.as_ref()
                && now - c.created_at < self.config.session_refresh
            {
                return Ok(c.session.clone());
            }
        }
        let session = self.fleet.login(&self.config.credentials).await?;
        debug!(user_id = %session.user_id, "relay session refreshed");
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(CachedSession {
            session: session.clone(),
            created_at: now,
        });
        Ok(session)
    }

    /// Each figure is fetched independently; a failure is logged and leaves that figure `None`.
    async fn fetch_cost_figures(&self, now: DateTime<Utc>, with_count: bool) -> CostFigures {
        let Some(cost) = self.cost.as_ref() else {
            return CostFigures::default();
        };
        let mut figures = CostFigures::default();

        if with_count {
            match cost.instance_count().await {
                Ok(n) => figures.instance_count = Some(n),
                Err(e) => warn!(error = %e, operation = "instance_count", "cost provider fetch failed"),
            }
        }
        if self.config.include_cost {
            match cost.daily_cost(now).await {
                Ok(c) => figures.billed_daily_cost = Some(c),
                Err(e) => warn!(error = %e, operation = "daily_cost", "cost provider fetch failed"),
            }
            match cost.credit().await {
                Ok(c) => figures.credit = Some(c),
                Err(e) => warn!(error = %e, operation = "credit", "cost provider fetch failed"),
            }
        }
        figures
    }
}

/// Builds the merged snapshot from raw provider data. Alert flags are left at their defaults.
pub fn assemble(
    report: &FleetReport,
    figures: &CostFigures,
    prices: &GpuPriceTable,
    cost_source: CostSource,
    now: DateTime<Utc>,
) -> Snapshot {
    let general = FleetTotals {
        running_instances: report.general.running_instances,
        rpm: report.general.rpm,
        tokens_last_24h: report.general.tokens_last_24h,
        tokens_all_time: report.general.tokens_all_time,
        generations_last_24h: report.general.generations_last_24h,
        generations_last_hour: report.general.generations_last_hour.unwrap_or(0),
        cli_version: report.general.cli_version.clone(),
    };

    let workers: Vec<WorkerSnapshot> = report
        .workers
        .iter()
        .map(|w| derive_worker(w, &general.cli_version, prices))
        .collect();

    let actual_instances: u64 = workers.iter().map(|w| w.instance_count).sum();
    let estimated_daily_cost: f64 = workers.iter().map(|w| w.daily_cost).sum();
    let reported_instances = figures.instance_count.unwrap_or(actual_instances);
    let instances_mismatch = figures
        .instance_count
        .is_some_and(|n| n != actual_instances);

    let total_daily_cost = match cost_source {
        CostSource::Billed => figures.billed_daily_cost.unwrap_or(0.0),
        CostSource::Estimate => estimated_daily_cost,
    };

    let u = &report.user;
    let share = share_of(u.tokens_last_24h, general.tokens_last_24h);
    let user = UserTotals {
        tokens_last_24h: u.tokens_last_24h,
        tokens_all_time: u.tokens_all_time,
        generations_last_24h: u.generations_last_24h,
        generations_last_hour: u.generations_last_hour.unwrap_or(0),
        reported_instances,
        billed_instances: figures.instance_count,
        actual_instances,
        instances_mismatch,
        estimated_daily_cost,
        billed_daily_cost: figures.billed_daily_cost,
        total_daily_cost,
        cost_source,
        tokens_per_instance: per_instance(u.tokens_last_24h, actual_instances),
        share,
        efficiency: efficiency(total_daily_cost, share),
        credit: figures.credit,
    };

    Snapshot {
        taken_at: now,
        general,
        user,
        workers,
        alerts: Default::default(),
    }
}

/// User tokens / fleet tokens as a fraction; 0 when the fleet total is 0.
pub fn share_of(user_tokens: u64, general_tokens: u64) -> f64 {
    if general_tokens == 0 {
        0.0
    } else {
        user_tokens as f64 / general_tokens as f64
    }
}

/// Daily cost per 1% of fleet share; 0 when the share is 0.
pub fn efficiency(total_daily_cost: f64, share: f64) -> f64 {
    if share > 0.0 {
        total_daily_cost / (share * 100.0)
    } else {
        0.0
    }
}

fn per_instance(tokens: u64, instances: u64) -> Option<u64> {
    (instances > 0).then(|| tokens / instances)
}

fn derive_worker(w: &WorkerReport, cli_version: &str, prices: &GpuPriceTable) -> WorkerSnapshot {
    let instances: Vec<InstanceSnapshot> = w
        .instances
        .iter()
        .map(|i| derive_instance(i, cli_version))
        .collect();
    let daily_cost = instances
        .iter()
        .map(|i| prices.daily_price(&i.gpu_model))
        .sum();
    let instance_count = instances.len() as u64;
    WorkerSnapshot {
        id: w.id.clone(),
        name: w.name.clone(),
        instance_count,
        daily_cost,
        tokens_per_instance: per_instance(w.tokens_last_24h, instance_count),
        tokens_last_24h: w.tokens_last_24h,
        tokens_all_time: w.tokens_all_time,
        generations_last_24h: w.generations_last_24h,
        generations_last_hour: w.generations_last_hour.unwrap_or(0),
        instances,
    }
}

fn derive_instance(i: &InstanceReport, cli_version: &str) -> InstanceSnapshot {
    let (version, version_mismatch) = match i.version.as_deref() {
        Some(raw) => {
            let diff = compare_versions(raw, cli_version);
            if diff.is_mismatch() {
                (format!("{} ({})", raw, diff), true)
            } else {
                (raw.to_string(), false)
            }
        }
        None => (String::new(), false),
    };
    InstanceSnapshot {
        id: i.id.clone(),
        name: i.name.clone(),
        status: i.status.clone(),
        model: i.runtime.clone().unwrap_or_default(),
        lane: i.lane.clone().unwrap_or_default(),
        ip: i.ip.clone().unwrap_or_default(),
        gpu_model: i.gpu_name.as_deref().map(normalize_gpu_name).unwrap_or_default(),
        version,
        version_mismatch,
    }
}
