use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::health::DEFAULT_SIGNATURE;
use crate::notify::DEFAULT_MAX_MESSAGE_LEN;
use crate::providers::CostWindow;
use crate::providers::billing::DEFAULT_BILLING_URL;
use crate::providers::relay::DEFAULT_RELAY_URL;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub relay: RelayConfig,
    /// Absent: no instance-count/credit alerts, no billed cost, no health monitor.
    pub billing: Option<BillingConfig>,
    #[serde(default)]
    pub pricing: PricingConfig,
    /// Absent: notifications go to the log.
    pub telegram: Option<TelegramConfig>,
    #[serde(default)]
    pub collection: CollectionConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_relay_url")]
    pub base_url: String,
    pub email: String,
    pub password: String,
    #[serde(default = "default_session_refresh_secs")]
    pub session_refresh_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_relay_url() -> String {
    DEFAULT_RELAY_URL.into()
}

fn default_session_refresh_secs() -> u64 {
    3600
}

fn default_request_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillingConfig {
    #[serde(default = "default_billing_url")]
    pub base_url: String,
    pub token: String,
    /// Fetch credit + billed daily cost, and use the billed cost as the total.
    #[serde(default = "default_true")]
    pub include_cost: bool,
    #[serde(default)]
    pub cost_window: CostWindow,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_billing_url() -> String {
    DEFAULT_BILLING_URL.into()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct PricingConfig {
    /// JSON list of `{"Gpu": "...", "Price": <hourly>}`; without it every GPU costs 0.
    pub gpu_prices_path: Option<String>,
    #[serde(default = "default_disk_cost_per_day")]
    pub disk_cost_per_day: f64,
}

fn default_disk_cost_per_day() -> f64 {
    crate::fleet::DEFAULT_DISK_COST_PER_DAY
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            gpu_prices_path: None,
            disk_cost_per_day: default_disk_cost_per_day(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    #[serde(default = "default_telegram_url")]
    pub api_url: String,
    pub token: String,
    pub chat_id: String,
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
    #[serde(default)]
    pub threads: TelegramThreads,
}

fn default_telegram_url() -> String {
    crate::notify::telegram::DEFAULT_API_URL.into()
}

fn default_max_message_len() -> usize {
    DEFAULT_MAX_MESSAGE_LEN
}

/// Forum thread per channel class; 0 posts to the main thread.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct TelegramThreads {
    pub daily: i64,
    pub hourly: i64,
    pub error: i64,
    pub status: i64,
    pub worker: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    pub minute_interval_secs: u64,
    pub window_minutes: u64,
    /// Six-field cron expression (with seconds), evaluated in UTC.
    pub daily_schedule: String,
    /// 0 disables the hourly window report.
    pub hourly_report_secs: u64,
    /// Offset used for dates and times in reports.
    pub report_utc_offset_hours: i32,
    /// Snapshots kept in the broadcast channel for slow subscribers.
    pub broadcast_capacity: usize,
    /// Pending notifications before producers wait on the dispatcher.
    pub event_capacity: usize,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            minute_interval_secs: 60,
            window_minutes: crate::window::DEFAULT_WINDOW_MINUTES as u64,
            daily_schedule: "0 0 0 * * *".into(),
            hourly_report_secs: 3600,
            report_utc_offset_hours: 0,
            broadcast_capacity: 16,
            event_capacity: 256,
        }
    }
}

impl CollectionConfig {
    pub fn daily_schedule(&self) -> anyhow::Result<cron::Schedule> {
        cron::Schedule::from_str(&self.daily_schedule).map_err(|e| {
            anyhow::anyhow!(
                "collection.daily_schedule is not a valid cron expression ({}): {}",
                self.daily_schedule,
                e
            )
        })
    }

    pub fn minute_interval(&self) -> Duration {
        Duration::from_secs(self.minute_interval_secs)
    }

    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.window_minutes as i64)
    }

    pub fn hourly_report_interval(&self) -> Option<Duration> {
        (self.hourly_report_secs > 0).then(|| Duration::from_secs(self.hourly_report_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Gates the instance-count and low-credit alerts.
    pub enabled: bool,
    pub instance_mismatch_grace_secs: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            instance_mismatch_grace_secs: crate::alerts::DEFAULT_INSTANCE_MISMATCH_GRACE_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub enabled: bool,
    pub interval_secs: u64,
    pub log_ready_delay_secs: u64,
    pub reboot_cooldown_secs: u64,
    pub signature: String,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            log_ready_delay_secs: 5,
            reboot_cooldown_secs: 900,
            signature: DEFAULT_SIGNATURE.into(),
        }
    }
}

impl HealthSection {
    pub fn to_health_config(&self) -> crate::health::HealthConfig {
        crate::health::HealthConfig {
            interval: Duration::from_secs(self.interval_secs),
            log_ready_delay: Duration::from_secs(self.log_ready_delay_secs),
            reboot_cooldown: chrono::Duration::seconds(self.reboot_cooldown_secs as i64),
            signature: self.signature.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".into(),
            port: 8090,
        }
    }
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".into());
        let s = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {}", path, e))?;
        Self::load_from_str(&s)
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.relay.email.trim().is_empty(),
            "relay.email must be non-empty"
        );
        anyhow::ensure!(
            !self.relay.password.is_empty(),
            "relay.password must be non-empty"
        );
        anyhow::ensure!(
            self.relay.session_refresh_secs > 0,
            "relay.session_refresh_secs must be > 0, got {}",
            self.relay.session_refresh_secs
        );
        anyhow::ensure!(
            self.relay.request_timeout_secs > 0,
            "relay.request_timeout_secs must be > 0, got {}",
            self.relay.request_timeout_secs
        );
        if let Some(billing) = &self.billing {
            anyhow::ensure!(
                !billing.token.trim().is_empty(),
                "billing.token must be non-empty"
            );
            anyhow::ensure!(
                billing.request_timeout_secs > 0,
                "billing.request_timeout_secs must be > 0, got {}",
                billing.request_timeout_secs
            );
        }
        anyhow::ensure!(
            self.pricing.disk_cost_per_day >= 0.0,
            "pricing.disk_cost_per_day must be >= 0, got {}",
            self.pricing.disk_cost_per_day
        );
        if let Some(telegram) = &self.telegram {
            anyhow::ensure!(
                !telegram.token.trim().is_empty(),
                "telegram.token must be non-empty"
            );
            anyhow::ensure!(
                !telegram.chat_id.trim().is_empty(),
                "telegram.chat_id must be non-empty"
            );
            anyhow::ensure!(
                telegram.max_message_len > 0,
                "telegram.max_message_len must be > 0, got {}",
                telegram.max_message_len
            );
        }
        let c = &self.collection;
        anyhow::ensure!(
            c.minute_interval_secs > 0,
            "collection.minute_interval_secs must be > 0, got {}",
            c.minute_interval_secs
        );
        anyhow::ensure!(
            c.window_minutes > 0,
            "collection.window_minutes must be > 0, got {}",
            c.window_minutes
        );
        c.daily_schedule()?;
        anyhow::ensure!(
            (-14..=14).contains(&c.report_utc_offset_hours),
            "collection.report_utc_offset_hours must be between -14 and 14, got {}",
            c.report_utc_offset_hours
        );
        anyhow::ensure!(
            c.broadcast_capacity > 0,
            "collection.broadcast_capacity must be > 0, got {}",
            c.broadcast_capacity
        );
        anyhow::ensure!(
            c.event_capacity > 0,
            "collection.event_capacity must be > 0, got {}",
            c.event_capacity
        );
        if self.health.enabled {
            anyhow::ensure!(
                self.health.interval_secs > 0,
                "health.interval_secs must be > 0, got {}",
                self.health.interval_secs
            );
            anyhow::ensure!(
                !self.health.signature.is_empty(),
                "health.signature must be non-empty"
            );
        }
        if self.server.enabled {
            anyhow::ensure!(
                self.server.port > 0,
                "server.port must be between 1 and 65535, got {}",
                self.server.port
            );
        }
        Ok(())
    }
}
