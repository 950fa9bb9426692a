// Rolling window store: time-bounded per-tick samples + on-demand summary.
// Eviction happens on append (relative to the newest sample), never lazily on read.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::models::{GenerationSummary, MetricSummary, Sample, WindowStats};

/// Default trailing duration covered by the window, in minutes.
pub const DEFAULT_WINDOW_MINUTES: i64 = 60;

pub struct RollingWindow {
    duration: Duration,
    samples: Mutex<VecDeque<Sample>>,
}

impl RollingWindow {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Inserts `sample`, then drops every sample older than the window relative to the newest one.
    pub fn append(&self, sample: Sample) {
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        let newest = samples
            .back()
            .map_or(sample.timestamp, |last| last.timestamp.max(sample.timestamp));
        samples.push_back(sample);
        let cutoff = newest - self.duration;
        samples.retain(|s| s.timestamp >= cutoff);
    }

    /// Copy of the stored samples in insertion order.
    pub fn samples(&self) -> Vec<Sample> {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        samples.iter().copied().collect()
    }

    /// Most recent sample, if any.
    pub fn latest(&self) -> Option<Sample> {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        samples.back().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> WindowStats {
        self.stats_at(Utc::now())
    }

    /// Summary of the current contents; an empty window is anchored at `now`.
    pub fn stats_at(&self, now: DateTime<Utc>) -> WindowStats {
        let copy = self.samples();
        summarize(&copy, now)
    }
}

impl Default for RollingWindow {
    fn default() -> Self {
        Self::new(Duration::minutes(DEFAULT_WINDOW_MINUTES))
    }
}

/// Pure summary over chronologically ordered samples.
pub fn summarize(samples: &[Sample], now: DateTime<Utc>) -> WindowStats {
    let (Some(first), Some(last)) = (samples.first(), samples.last()) else {
        return WindowStats::empty(now);
    };

    let rpm = summarize_metric(samples.iter().map(|s| s.rpm));
    let running_instances = summarize_metric(samples.iter().map(|s| s.running_instances));
    let general_generations = summarize_metric(samples.iter().map(|s| s.general_generations));
    let user_generations = summarize_metric(samples.iter().map(|s| s.user_generations));

    let ratio = if general_generations.sum > 0 {
        user_generations.sum as f64 / general_generations.sum as f64 * 100.0
    } else {
        0.0
    };

    WindowStats {
        rpm,
        running_instances,
        general_generations,
        user_generations,
        generations: GenerationSummary {
            general: general_generations.sum,
            user: user_generations.sum,
            ratio,
        },
        start_time: first.timestamp,
        end_time: last.timestamp,
    }
}

fn summarize_metric(values: impl Iterator<Item = u64>) -> MetricSummary {
    let mut out = MetricSummary::default();
    for v in values {
        if out.count == 0 {
            out.min = v;
            out.max = v;
        } else {
            out.min = out.min.min(v);
            out.max = out.max.max(v);
        }
        out.current = v;
        out.sum += v;
        out.count += 1;
    }
    if out.count > 0 {
        out.avg = out.sum as f64 / out.count as f64;
    }
    out
}
