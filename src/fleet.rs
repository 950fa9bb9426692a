// Worker/instance derivations: agent version comparison, GPU name normalization, price table.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

/// $0.01 per hour of disk, per instance.
pub const DEFAULT_DISK_COST_PER_DAY: f64 = 0.01 * 24.0;

/// Result of comparing an instance's agent version against the installed CLI version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionDiff {
    Same,
    Newer { instance: String, cli: String },
    Older { instance: String, cli: String },
}

impl VersionDiff {
    pub fn is_mismatch(&self) -> bool {
        !matches!(self, VersionDiff::Same)
    }
}

impl std::fmt::Display for VersionDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionDiff::Same => write!(f, "same"),
            VersionDiff::Newer { instance, cli } => write!(f, "newer ({} > {})", instance, cli),
            VersionDiff::Older { instance, cli } => write!(f, "older ({} < {})", instance, cli),
        }
    }
}

/// Strips any build suffix ("0.2.3-fe4d73f" -> "0.2.3").
fn numeric_prefix(version: &str) -> &str {
    version.split('-').next().unwrap_or(version)
}

/// Compares dotted numeric prefixes component by component. The first differing component
/// decides; a component that fails to parse on either side counts as equal.
pub fn compare_versions(instance: &str, cli: &str) -> VersionDiff {
    let a = numeric_prefix(instance);
    let b = numeric_prefix(cli);
    for (x, y) in a.split('.').zip(b.split('.')) {
        let (Ok(x), Ok(y)) = (x.trim().parse::<u64>(), y.trim().parse::<u64>()) else {
            continue;
        };
        match x.cmp(&y) {
            Ordering::Greater => {
                return VersionDiff::Newer {
                    instance: a.to_string(),
                    cli: b.to_string(),
                };
            }
            Ordering::Less => {
                return VersionDiff::Older {
                    instance: a.to_string(),
                    cli: b.to_string(),
                };
            }
            Ordering::Equal => {}
        }
    }
    VersionDiff::Same
}

/// Maps a raw nvidia-smi product name onto the price table's naming.
pub fn normalize_gpu_name(raw: &str) -> String {
    let name = raw.trim();
    let name = name
        .strip_prefix("NVIDIA GeForce ")
        .or_else(|| name.strip_prefix("NVIDIA "))
        .unwrap_or(name);
    match name {
        "RTX 4080" => "RTX 4080S".to_string(),
        "A4000" => "RTX A4000".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct GpuPriceEntry {
    #[serde(rename = "Gpu")]
    gpu: String,
    /// Hourly rate.
    #[serde(rename = "Price")]
    price: f64,
}

/// GPU model -> price per day (hourly × 24 + disk cost per day).
#[derive(Debug, Clone, Default)]
pub struct GpuPriceTable {
    daily: HashMap<String, f64>,
}

impl GpuPriceTable {
    pub fn load(path: impl AsRef<Path>, disk_cost_per_day: f64) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&s, disk_cost_per_day)
    }

    /// Parses `[{"Gpu": "RTX 3090", "Price": 0.2}, ...]`.
    pub fn from_json(s: &str, disk_cost_per_day: f64) -> anyhow::Result<Self> {
        let entries: Vec<GpuPriceEntry> = serde_json::from_str(s)?;
        Ok(Self::from_hourly(
            entries.into_iter().map(|e| (e.gpu, e.price)),
            disk_cost_per_day,
        ))
    }

    pub fn from_hourly(
        rates: impl IntoIterator<Item = (String, f64)>,
        disk_cost_per_day: f64,
    ) -> Self {
        let daily = rates
            .into_iter()
            .map(|(gpu, hourly)| (gpu, hourly * 24.0 + disk_cost_per_day))
            .collect();
        Self { daily }
    }

    /// Price per day for a normalized GPU name; unmapped names cost nothing.
    pub fn daily_price(&self, gpu_model: &str) -> f64 {
        self.daily.get(gpu_model).copied().unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.daily.len()
    }

    pub fn is_empty(&self) -> bool {
        self.daily.is_empty()
    }
}
