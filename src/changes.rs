// Worker/instance change detection: each tick's worker list is diffed against the previous one.

use std::collections::{HashMap, HashSet};

use crate::models::{ChannelClass, InstanceSnapshot, Notification, WorkerSnapshot};

/// Holds the previous tick's workers. Only successful ticks move the baseline.
#[derive(Debug, Default)]
pub struct WorkerChangeTracker {
    previous: Option<Vec<WorkerSnapshot>>,
}

impl WorkerChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the baseline with `workers` and returns one batched notification for
    /// everything that changed. The first call only records the baseline.
    pub fn observe(&mut self, workers: &[WorkerSnapshot]) -> Option<Notification> {
        let previous = self.previous.replace(workers.to_vec())?;
        let changes = diff_workers(&previous, workers);
        if changes.is_empty() {
            return None;
        }
        Some(Notification::new(
            ChannelClass::Worker,
            format!("🔔 Worker Status Changes:\n\n{}", changes.join("\n\n")),
        ))
    }
}

/// One entry per change, in current-list order; removals come last.
pub fn diff_workers(previous: &[WorkerSnapshot], current: &[WorkerSnapshot]) -> Vec<String> {
    let previous_by_id: HashMap<&str, &WorkerSnapshot> =
        previous.iter().map(|w| (w.id.as_str(), w)).collect();
    let current_ids: HashSet<&str> = current.iter().map(|w| w.id.as_str()).collect();
    let mut changes = Vec::new();

    for worker in current {
        match previous_by_id.get(worker.id.as_str()) {
            Some(before) => diff_instances(before, worker, &mut changes),
            None => {
                changes.push(format!(
                    "🆕 New Worker Detected:\n  Worker: {}\n  Instances: {}",
                    worker.name, worker.instance_count
                ));
                for i in &worker.instances {
                    changes.push(format!(
                        "    • Instance: {}\n      Status: {}\n      IP: {}\n      GPU: {}",
                        i.label(),
                        i.status,
                        i.ip,
                        i.gpu_model
                    ));
                }
            }
        }
    }

    for gone in previous
        .iter()
        .filter(|w| !current_ids.contains(w.id.as_str()))
    {
        changes.push(format!(
            "❌ Worker Removed:\n  Worker: {}\n  Last Instance Count: {}",
            gone.name, gone.instance_count
        ));
    }
    changes
}

fn diff_instances(before: &WorkerSnapshot, now: &WorkerSnapshot, changes: &mut Vec<String>) {
    if before.instance_count != now.instance_count {
        changes.push(format!(
            "📊 Worker '{}' Instance Count Changed: {} → {}",
            now.name, before.instance_count, now.instance_count
        ));
    }

    let previous_by_key: HashMap<&str, &InstanceSnapshot> =
        before.instances.iter().map(|i| (i.key(), i)).collect();
    let current_keys: HashSet<&str> = now.instances.iter().map(InstanceSnapshot::key).collect();

    for inst in &now.instances {
        let Some(prev) = previous_by_key.get(inst.key()) else {
            changes.push(format!(
                "➕ New Instance Added:\n  Worker: {}\n  Instance: {}\n  Status: {}\n  IP: {}\n  GPU: {}",
                now.name,
                inst.label(),
                inst.status,
                inst.ip,
                inst.gpu_model
            ));
            continue;
        };
        if prev.status != inst.status {
            changes.push(format!(
                "🔄 Instance Status Changed:\n  Worker: {}\n  Instance: {}\n  Status: {} → {}\n  IP: {}\n  GPU: {}",
                now.name,
                inst.label(),
                prev.status,
                inst.status,
                inst.ip,
                inst.gpu_model
            ));
        }
        if prev.ip != inst.ip {
            changes.push(format!(
                "🌐 Instance IP Changed:\n  Worker: {}\n  Instance: {}\n  IP: {} → {}",
                now.name,
                inst.label(),
                prev.ip,
                inst.ip
            ));
        }
    }

    for gone in before
        .instances
        .iter()
        .filter(|i| !current_keys.contains(i.key()))
    {
        changes.push(format!(
            "➖ Instance Removed:\n  Worker: {}\n  Instance: {}\n  Last Status: {}\n  Last IP: {}\n  GPU: {}",
            now.name,
            gone.label(),
            gone.status,
            gone.ip,
            gone.gpu_model
        ));
    }
}
