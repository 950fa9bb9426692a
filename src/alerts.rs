// Edge-triggered alert latches: one "problem" notification when a condition starts holding,
// one "resolved" notification when it clears, nothing on the ticks in between.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::models::{AlertStatus, ChannelClass, Notification, Snapshot};

/// Default grace period for the instance-count mismatch alert.
pub const DEFAULT_INSTANCE_MISMATCH_GRACE_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Raised,
    Cleared,
}

/// Boolean latch with an optional grace period before raising.
#[derive(Debug, Clone)]
pub struct Latch {
    active: bool,
    condition_since: Option<DateTime<Utc>>,
    grace: Duration,
}

impl Latch {
    pub fn new() -> Self {
        Self::with_grace(Duration::zero())
    }

    /// The condition must hold continuously for `grace` before the latch raises.
    pub fn with_grace(grace: Duration) -> Self {
        Self {
            active: false,
            condition_since: None,
            grace,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn condition_since(&self) -> Option<DateTime<Utc>> {
        self.condition_since
    }

    /// Feeds one observation. Returns the transition to notify about, if any.
    pub fn observe(&mut self, holds: bool, now: DateTime<Utc>) -> Option<Transition> {
        if holds {
            let since = *self.condition_since.get_or_insert(now);
            if !self.active && now - since >= self.grace {
                self.active = true;
                return Some(Transition::Raised);
            }
            None
        } else {
            self.condition_since = None;
            if self.active {
                self.active = false;
                return Some(Transition::Cleared);
            }
            None
        }
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps text in a markdown code block for the chat sink.
pub fn code_block(text: &str) -> String {
    format!("```\n{}\n```", text)
}

/// The three alert conditions evaluated on every minute tick.
pub struct AlertMonitor {
    /// Gates the instance-count and credit alerts; version mismatch is always evaluated.
    enabled: bool,
    version_mismatch: Latch,
    instance_mismatch: Latch,
    low_credit: Latch,
}

impl AlertMonitor {
    pub fn new(enabled: bool, instance_mismatch_grace: Duration) -> Self {
        Self {
            enabled,
            version_mismatch: Latch::new(),
            instance_mismatch: Latch::with_grace(instance_mismatch_grace),
            low_credit: Latch::new(),
        }
    }

    pub fn status(&self) -> AlertStatus {
        AlertStatus {
            version_mismatch_active: self.version_mismatch.is_active(),
            instance_mismatch_active: self.instance_mismatch.is_active(),
            low_credit_active: self.low_credit.is_active(),
            instance_mismatch_since: self.instance_mismatch.condition_since(),
        }
    }

    /// Runs every condition independently and collects the resulting notifications.
    /// `billing_configured` tells whether the cost/fleet provider exists for this account.
    pub fn evaluate(
        &mut self,
        snapshot: &Snapshot,
        billing_configured: bool,
        now: DateTime<Utc>,
    ) -> Vec<Notification> {
        let mut out = Vec::new();
        out.extend(self.check_version_mismatch(snapshot, now));
        if self.enabled && billing_configured {
            out.extend(self.check_instance_mismatch(snapshot, now));
        }
        if self.enabled {
            out.extend(self.check_low_credit(snapshot, now));
        }
        out
    }

    fn check_version_mismatch(
        &mut self,
        snapshot: &Snapshot,
        now: DateTime<Utc>,
    ) -> Option<Notification> {
        let mismatched: Vec<String> = snapshot
            .workers
            .iter()
            .flat_map(|w| {
                w.mismatched_instances()
                    .map(move |i| format!("{} (IP: {}) {}", w.name, i.ip, i.version))
            })
            .collect();

        let text = match self.version_mismatch.observe(!mismatched.is_empty(), now)? {
            Transition::Raised => format!(
                "⚠️ Version Mismatch Alert\n{}",
                code_block(&format!(
                    "CLI version: {}\nThe following workers have version mismatches:\n{}",
                    snapshot.general.cli_version,
                    mismatched.join("\n")
                ))
            ),
            Transition::Cleared => format!(
                "✅ Version Mismatch Resolved\n{}",
                code_block("All workers are now running the correct version.")
            ),
        };
        Some(Notification::new(ChannelClass::Error, text))
    }

    fn check_instance_mismatch(
        &mut self,
        snapshot: &Snapshot,
        now: DateTime<Utc>,
    ) -> Option<Notification> {
        if snapshot.general.running_instances == 0 {
            debug!("fleet running instance count is 0; skipping instance mismatch check");
            return None;
        }
        let user = &snapshot.user;
        // An unavailable count says nothing about agreement; leave the latch and timer alone.
        let Some(billed) = user.billed_instances else {
            debug!("billed instance count unavailable; skipping instance mismatch check");
            return None;
        };
        let body = code_block(&format!(
            "Billed instances: {}\nActual instances: {}",
            billed, user.actual_instances
        ));
        let text = match self
            .instance_mismatch
            .observe(billed != user.actual_instances, now)?
        {
            Transition::Raised => format!("⚠️ Instance Count Mismatch Alert\n{}", body),
            Transition::Cleared => format!("✅ Instance Count Mismatch Resolved\n{}", body),
        };
        Some(Notification::new(ChannelClass::Status, text))
    }

    fn check_low_credit(&mut self, snapshot: &Snapshot, now: DateTime<Utc>) -> Option<Notification> {
        let credit = snapshot.user.credit?;
        if !snapshot.user.daily_cost_known() {
            debug!("billed daily cost unavailable; skipping credit check");
            return None;
        }
        let daily_cost = snapshot.user.total_daily_cost;
        let body = code_block(&format!(
            "Balance: ${:.2}\nDaily cost: ${:.2}",
            credit.amount, daily_cost
        ));
        let text = match self.low_credit.observe(credit.amount <= daily_cost, now)? {
            Transition::Raised => format!("⚠️ Credit Alert\n{}", body),
            Transition::Cleared => format!("✅ Credit Balance Recovered\n{}", body),
        };
        Some(Notification::new(ChannelClass::Status, text))
    }
}
