// Shared state written by the minute tick and read by everything else:
// the latest snapshot and the rolling window of samples.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

use crate::models::{Sample, Snapshot, WindowStats};
use crate::window::RollingWindow;

pub struct MetricsStore {
    latest: RwLock<Option<Arc<Snapshot>>>,
    window: RollingWindow,
}

impl MetricsStore {
    pub fn new(window_duration: Duration) -> Self {
        Self {
            latest: RwLock::new(None),
            window: RollingWindow::new(window_duration),
        }
    }

    /// Latest published snapshot; `None` until the first successful tick.
    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.latest
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn window(&self) -> &RollingWindow {
        &self.window
    }

    pub fn window_stats(&self) -> WindowStats {
        self.window.stats()
    }

    pub fn window_stats_at(&self, now: DateTime<Utc>) -> WindowStats {
        self.window.stats_at(now)
    }

    /// Fleet-wide running instance count of the newest window sample.
    pub fn fleet_running_instances(&self) -> Option<u64> {
        self.window.latest().map(|s| s.running_instances)
    }

    /// Replaces the latest snapshot and appends the tick's sample.
    pub fn publish(&self, snapshot: Arc<Snapshot>, sample: Sample) {
        {
            let mut latest = self.latest.write().unwrap_or_else(|e| e.into_inner());
            *latest = Some(snapshot);
        }
        self.window.append(sample);
    }
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self {
            latest: RwLock::new(None),
            window: RollingWindow::default(),
        }
    }
}
