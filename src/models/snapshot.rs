// Merged point-in-time view produced by one snapshot build, plus the daily summary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fleet-wide totals (all users of the relay).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetTotals {
    pub running_instances: u64,
    pub rpm: u64,
    pub tokens_last_24h: u64,
    pub tokens_all_time: u64,
    pub generations_last_24h: u64,
    pub generations_last_hour: u64,
    pub cli_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditBalance {
    pub amount: f64,
    pub as_of: DateTime<Utc>,
}

/// How the total daily cost was chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostSource {
    /// Price-table estimate over the relay's instance list.
    #[default]
    Estimate,
    /// Charges billed by the cost provider.
    Billed,
}

/// The monitored user's totals. Instance counts come from two independent sources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTotals {
    pub tokens_last_24h: u64,
    pub tokens_all_time: u64,
    pub generations_last_24h: u64,
    pub generations_last_hour: u64,
    /// Count reported by the billing provider (falls back to `actual_instances`).
    pub reported_instances: u64,
    /// The billing provider's count as fetched this tick; `None` when unavailable.
    pub billed_instances: Option<u64>,
    /// Count summed from the relay's worker list.
    pub actual_instances: u64,
    pub instances_mismatch: bool,
    /// Estimate from the GPU price table.
    pub estimated_daily_cost: f64,
    /// Billed cost from the billing provider, when fetched.
    pub billed_daily_cost: Option<f64>,
    pub total_daily_cost: f64,
    pub cost_source: CostSource,
    pub tokens_per_instance: Option<u64>,
    pub share: f64,
    pub efficiency: f64,
    pub credit: Option<CreditBalance>,
}

impl UserTotals {
    /// False when the billed cost is the total but could not be fetched this tick.
    pub fn daily_cost_known(&self) -> bool {
        self.cost_source == CostSource::Estimate || self.billed_daily_cost.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    pub id: String,
    pub name: String,
    pub status: String,
    pub model: String,
    pub lane: String,
    pub ip: String,
    pub gpu_model: String,
    pub version: String,
    pub version_mismatch: bool,
}

impl InstanceSnapshot {
    /// Identity across ticks: the provider id, or the IP when the id is missing.
    pub fn key(&self) -> &str {
        if self.id.is_empty() { &self.ip } else { &self.id }
    }

    /// Display name, falling back to the id.
    pub fn label(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub id: String,
    pub name: String,
    pub instance_count: u64,
    pub daily_cost: f64,
    pub tokens_per_instance: Option<u64>,
    pub tokens_last_24h: u64,
    pub tokens_all_time: u64,
    pub generations_last_24h: u64,
    pub generations_last_hour: u64,
    pub instances: Vec<InstanceSnapshot>,
}

impl WorkerSnapshot {
    pub fn mismatched_instances(&self) -> impl Iterator<Item = &InstanceSnapshot> {
        self.instances.iter().filter(|i| i.version_mismatch)
    }
}

/// Latch flags as seen right after the tick's alert evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertStatus {
    pub version_mismatch_active: bool,
    pub instance_mismatch_active: bool,
    pub low_credit_active: bool,
    pub instance_mismatch_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub general: FleetTotals,
    pub user: UserTotals,
    pub workers: Vec<WorkerSnapshot>,
    pub alerts: AlertStatus,
}

impl Snapshot {
    pub fn has_version_mismatch(&self) -> bool {
        self.workers
            .iter()
            .any(|w| w.mismatched_instances().next().is_some())
    }
}

/// Output of the daily tick: cost/share/efficiency rebuilt from fresh provider data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySummary {
    pub taken_at: DateTime<Utc>,
    pub tokens_last_24h: u64,
    pub share: f64,
    pub efficiency: f64,
    pub estimated_daily_cost: f64,
    pub billed_daily_cost: Option<f64>,
    pub total_daily_cost: f64,
    pub credit: Option<CreditBalance>,
}
