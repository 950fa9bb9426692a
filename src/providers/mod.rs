// Upstream data providers: the relay (fleet + user metrics) and the GPU billing API.
// The core only sees the traits; the reqwest adapters live in the submodules.

pub mod billing;
pub mod relay;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Deserialize;

use crate::models::CreditBalance;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error (HTTP {status}): {body}")]
    Status { status: u16, body: String },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("empty response received from {0}")]
    Empty(&'static str),
    #[error("invalid response format from {endpoint}: {detail}")]
    Shape {
        endpoint: &'static str,
        detail: String,
    },
    #[error("invalid URL: {0}")]
    Url(String),
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

/// Bearer token + account id returned by a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub user_id: String,
}

/// Fleet-wide numbers as reported by the relay.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneralReport {
    pub cli_version: String,
    pub running_instances: u64,
    pub rpm: u64,
    pub tokens_last_24h: u64,
    pub tokens_all_time: u64,
    pub generations_last_24h: u64,
    /// Most recent hourly generations bucket, if the history was non-empty.
    pub generations_last_hour: Option<u64>,
}

/// Monitored user's numbers as reported by the relay.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserReport {
    pub tokens_last_24h: u64,
    pub tokens_all_time: u64,
    pub generations_last_24h: u64,
    pub generations_last_hour: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceReport {
    pub id: String,
    pub name: String,
    pub status: String,
    pub runtime: Option<String>,
    pub lane: Option<String>,
    pub ip: Option<String>,
    /// Raw nvidia-smi product name of the first GPU.
    pub gpu_name: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerReport {
    pub id: String,
    pub name: String,
    pub tokens_last_24h: u64,
    pub tokens_all_time: u64,
    pub generations_last_24h: u64,
    pub generations_last_hour: Option<u64>,
    pub instances: Vec<InstanceReport>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FleetReport {
    pub general: GeneralReport,
    pub user: UserReport,
    pub workers: Vec<WorkerReport>,
}

#[async_trait]
pub trait FleetMetricsProvider: Send + Sync {
    async fn login(&self, credentials: &Credentials) -> Result<Session, ProviderError>;

    /// Fleet, user and per-worker metrics in one consistent fetch.
    async fn fetch_report(&self, session: &Session) -> Result<FleetReport, ProviderError>;
}

/// Lookback used to sum billed charges into a daily cost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostWindow {
    /// `[yesterday 00:00, today 00:00)` UTC.
    #[default]
    UtcDay,
    /// `[now - 24h, now)`.
    #[serde(rename = "trailing_24h")]
    Trailing24h,
}

impl CostWindow {
    /// `(start, end)` bounds for the window as of `now`.
    pub fn bounds(self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        match self {
            CostWindow::UtcDay => {
                let today = Utc.from_utc_datetime(
                    &now.date_naive().and_hms_opt(0, 0, 0).unwrap_or_default(),
                );
                (today - Duration::days(1), today)
            }
            CostWindow::Trailing24h => (now - Duration::hours(24), now),
        }
    }
}

/// One rented instance as known to the billing provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BillingInstance {
    pub id: u64,
    #[serde(rename = "actual_status", default)]
    pub status: Option<String>,
}

#[async_trait]
pub trait CostProvider: Send + Sync {
    async fn instances(&self) -> Result<Vec<BillingInstance>, ProviderError>;

    /// Independently reported instance count (authoritative fleet size).
    async fn instance_count(&self) -> Result<u64, ProviderError>;

    async fn daily_cost(&self, now: DateTime<Utc>) -> Result<f64, ProviderError>;

    async fn credit(&self) -> Result<CreditBalance, ProviderError>;

    /// Asks for a log bundle; returns a short-lived download URL.
    async fn request_instance_logs(&self, instance_id: u64) -> Result<String, ProviderError>;

    async fn download_logs(&self, url: &str) -> Result<String, ProviderError>;

    async fn reboot_instance(&self, instance_id: u64) -> Result<(), ProviderError>;
}

/// Turns a non-2xx response into `ProviderError::Status` with the body text.
pub(crate) async fn check_status(
    resp: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ProviderError::Status {
        status: status.as_u16(),
        body,
    })
}
