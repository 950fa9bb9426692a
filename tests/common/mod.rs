// Shared test helpers: fake providers, a recording sink and report builders.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetwatch::alerts::AlertMonitor;
use fleetwatch::fleet::GpuPriceTable;
use fleetwatch::models::{ChannelClass, CreditBalance, Sample};
use fleetwatch::notify::{NotificationSink, NotifyError};
use fleetwatch::providers::{
    BillingInstance, CostProvider, Credentials, FleetMetricsProvider, FleetReport, GeneralReport,
    InstanceReport, ProviderError, Session, UserReport, WorkerReport,
};
use fleetwatch::snapshot::{SnapshotBuilder, SnapshotBuilderConfig};
use fleetwatch::store::MetricsStore;

pub fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

pub fn sample(at: DateTime<Utc>, rpm: u64) -> Sample {
    Sample {
        timestamp: at,
        rpm,
        running_instances: 10,
        general_generations: 100,
        user_generations: 5,
    }
}

pub fn instance(version: &str, gpu: &str) -> InstanceReport {
    InstanceReport {
        id: format!("inst-{}-{}", version, gpu),
        name: "gpu-0".into(),
        status: "running".into(),
        runtime: Some("ollama".into()),
        lane: Some("lane-a".into()),
        ip: Some("10.0.0.1".into()),
        gpu_name: Some(gpu.into()),
        version: Some(version.into()),
    }
}

pub fn worker(id: &str, tokens_last_24h: u64, instances: Vec<InstanceReport>) -> WorkerReport {
    WorkerReport {
        id: id.into(),
        name: format!("worker-{}", id),
        tokens_last_24h,
        tokens_all_time: tokens_last_24h * 10,
        generations_last_24h: tokens_last_24h / 100,
        generations_last_hour: Some(7),
        instances,
    }
}

/// Fleet of `running` instances on CLI 0.2.3; user owns 1% of the tokens.
pub fn report(running: u64, workers: Vec<WorkerReport>) -> FleetReport {
    FleetReport {
        general: GeneralReport {
            cli_version: "0.2.3".into(),
            running_instances: running,
            rpm: 1200,
            tokens_last_24h: 1_000_000,
            tokens_all_time: 50_000_000,
            generations_last_24h: 40_000,
            generations_last_hour: Some(2000),
        },
        user: UserReport {
            tokens_last_24h: 10_000,
            tokens_all_time: 90_000,
            generations_last_24h: 400,
            generations_last_hour: Some(20),
        },
        workers,
    }
}

pub fn prices() -> GpuPriceTable {
    GpuPriceTable::from_hourly([("RTX 4090".to_string(), 0.5)], 0.24)
}

/// Relay stand-in. `report = None` makes `fetch_report` fail.
pub struct FakeFleet {
    report: Mutex<Option<FleetReport>>,
    delay: Option<Duration>,
    pub logins: AtomicUsize,
    pub fetches: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeFleet {
    pub fn new(report: FleetReport) -> Self {
        Self {
            report: Mutex::new(Some(report)),
            delay: None,
            logins: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Every fetch sleeps this long (tokio time).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_report(&self, report: FleetReport) {
        *self.report.lock().unwrap() = Some(report);
    }

    pub fn fail(&self) {
        *self.report.lock().unwrap() = None;
    }
}

#[async_trait]
impl FleetMetricsProvider for FakeFleet {
    async fn login(&self, credentials: &Credentials) -> Result<Session, ProviderError> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        Ok(Session {
            token: format!("token-{}", credentials.email),
            user_id: "user-1".into(),
        })
    }

    async fn fetch_report(&self, _session: &Session) -> Result<FleetReport, ProviderError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.report
            .lock()
            .unwrap()
            .clone()
            .ok_or(ProviderError::Status {
                status: 502,
                body: "bad gateway".into(),
            })
    }
}

/// Billing stand-in. A `None` figure makes that call fail.
#[derive(Default)]
pub struct FakeCost {
    pub instance_count: Mutex<Option<u64>>,
    pub daily_cost: Mutex<Option<f64>>,
    pub credit: Mutex<Option<f64>>,
    pub instances: Mutex<Vec<BillingInstance>>,
    /// Log text per instance; a missing entry makes the log request fail.
    pub logs: Mutex<HashMap<u64, String>>,
    pub reboot_fails: Mutex<HashSet<u64>>,
    pub reboots: Mutex<Vec<u64>>,
}

impl FakeCost {
    pub fn with_figures(instance_count: u64, daily_cost: f64, credit: f64) -> Self {
        let fake = Self::default();
        *fake.instance_count.lock().unwrap() = Some(instance_count);
        *fake.daily_cost.lock().unwrap() = Some(daily_cost);
        *fake.credit.lock().unwrap() = Some(credit);
        fake
    }

    pub fn add_instance(&self, id: u64, log: &str) {
        self.instances.lock().unwrap().push(BillingInstance {
            id,
            status: Some("running".into()),
        });
        self.logs.lock().unwrap().insert(id, log.to_string());
    }

    pub fn reboots(&self) -> Vec<u64> {
        self.reboots.lock().unwrap().clone()
    }
}

fn unavailable(what: &'static str) -> ProviderError {
    ProviderError::Empty(what)
}

#[async_trait]
impl CostProvider for FakeCost {
    async fn instances(&self) -> Result<Vec<BillingInstance>, ProviderError> {
        Ok(self.instances.lock().unwrap().clone())
    }

    async fn instance_count(&self) -> Result<u64, ProviderError> {
        self.instance_count
            .lock()
            .unwrap()
            .ok_or(unavailable("instances"))
    }

    async fn daily_cost(&self, _now: DateTime<Utc>) -> Result<f64, ProviderError> {
        self.daily_cost.lock().unwrap().ok_or(unavailable("invoices"))
    }

    async fn credit(&self) -> Result<CreditBalance, ProviderError> {
        let amount = self.credit.lock().unwrap().ok_or(unavailable("credit"))?;
        Ok(CreditBalance {
            amount,
            as_of: Utc::now(),
        })
    }

    async fn request_instance_logs(&self, instance_id: u64) -> Result<String, ProviderError> {
        if self.logs.lock().unwrap().contains_key(&instance_id) {
            Ok(format!("fake://logs/{}", instance_id))
        } else {
            Err(unavailable("request_logs"))
        }
    }

    async fn download_logs(&self, url: &str) -> Result<String, ProviderError> {
        let id: u64 = url
            .rsplit('/')
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(unavailable("download"))?;
        self.logs
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(unavailable("download"))
    }

    async fn reboot_instance(&self, instance_id: u64) -> Result<(), ProviderError> {
        if self.reboot_fails.lock().unwrap().contains(&instance_id) {
            return Err(ProviderError::Status {
                status: 500,
                body: "reboot refused".into(),
            });
        }
        self.reboots.lock().unwrap().push(instance_id);
        Ok(())
    }
}

pub fn credentials() -> Credentials {
    Credentials {
        email: "ops@example.com".into(),
        password: "secret".into(),
    }
}

/// Builder with a 5-minute instance-mismatch grace and hourly session refresh.
pub fn builder(
    fleet: Arc<FakeFleet>,
    cost: Option<Arc<FakeCost>>,
    include_cost: bool,
    store: Arc<MetricsStore>,
) -> SnapshotBuilder {
    SnapshotBuilder::new(
        fleet,
        cost.map(|c| c as Arc<dyn CostProvider>),
        prices(),
        store,
        AlertMonitor::new(true, chrono::Duration::minutes(5)),
        SnapshotBuilderConfig {
            credentials: credentials(),
            session_refresh: chrono::Duration::hours(1),
            include_cost,
        },
    )
}

/// Sink that records every message; `fail_on` makes sends containing that text fail.
#[derive(Default)]
pub struct RecordingSink {
    pub sent: Mutex<Vec<(ChannelClass, String)>>,
    pub fail_on: Option<String>,
}

impl RecordingSink {
    pub fn failing_on(text: &str) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_on: Some(text.to_string()),
        }
    }

    pub fn sent(&self) -> Vec<(ChannelClass, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, channel: ChannelClass, text: &str) -> Result<(), NotifyError> {
        if self.fail_on.as_deref().is_some_and(|f| text.contains(f)) {
            return Err(NotifyError::Rejected {
                status: 400,
                description: "rejected".into(),
            });
        }
        self.sent.lock().unwrap().push((channel, text.to_string()));
        Ok(())
    }
}
