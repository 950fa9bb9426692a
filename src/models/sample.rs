// Per-tick samples and the rolling-window summary computed from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One minute tick's raw numbers. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub rpm: u64,
    pub running_instances: u64,
    /// Generations in the fleet-wide most recent hour bucket.
    pub general_generations: u64,
    /// Generations attributed to the monitored user in the same bucket.
    pub user_generations: u64,
}

/// min / max / avg / current over one tracked metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSummary {
    pub min: u64,
    pub max: u64,
    pub avg: f64,
    pub current: u64,
    pub count: usize,
    pub sum: u64,
}

/// Generation totals across the window. `ratio` is user / general × 100 (0 when general is 0).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationSummary {
    pub general: u64,
    pub user: u64,
    pub ratio: f64,
}

/// Derived view over the rolling window; never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowStats {
    pub rpm: MetricSummary,
    pub running_instances: MetricSummary,
    pub general_generations: MetricSummary,
    pub user_generations: MetricSummary,
    pub generations: GenerationSummary,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl WindowStats {
    /// Zero-valued stats anchored at `now` (empty window).
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            rpm: MetricSummary::default(),
            running_instances: MetricSummary::default(),
            general_generations: MetricSummary::default(),
            user_generations: MetricSummary::default(),
            generations: GenerationSummary::default(),
            start_time: now,
            end_time: now,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rpm.count == 0
    }
}
