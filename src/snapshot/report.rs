// Plain-text reports for the notification sink.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, FixedOffset, Offset, Utc};

use crate::alerts::code_block;
use crate::models::{DailySummary, MetricSummary, Snapshot, WindowStats};

/// Fixed report offset; out-of-range hours fall back to UTC.
pub fn report_offset(hours: i32) -> FixedOffset {
    FixedOffset::east_opt(hours * 3600).unwrap_or(Utc.fix())
}

fn local(ts: DateTime<Utc>, offset: FixedOffset) -> DateTime<FixedOffset> {
    ts.with_timezone(&offset)
}

/// Daily summary message:
///
/// ```text
/// 2025-03-01
///
/// Points: 123456
/// Share: 1.23%
/// Cost: $45.67
/// Efficiency (1%): $37
/// Balance: $120.00
/// ```
pub fn daily_message(summary: &DailySummary, offset: FixedOffset) -> String {
    let mut msg = format!(
        "{}\n\nPoints: {}\nShare: {:.2}%\nCost: ${:.2}\nEfficiency (1%): ${}",
        local(summary.taken_at, offset).format("%Y-%m-%d"),
        summary.tokens_last_24h,
        summary.share * 100.0,
        summary.total_daily_cost,
        summary.efficiency as i64,
    );
    if let Some(credit) = summary.credit {
        msg.push_str(&format!("\nBalance: ${:.2}", credit.amount));
    }
    msg
}

fn metric_line(label: &str, m: &MetricSummary) -> String {
    format!(
        "{}: min {} / avg {:.1} / max {} / current {}",
        label, m.min, m.avg, m.max, m.current
    )
}

/// A 24h counter read at two hourly ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterChange {
    pub before: u64,
    pub after: u64,
}

impl CounterChange {
    pub fn new(before: u64, after: u64) -> Self {
        Self { before, after }
    }

    /// Signed: rolling 24h counters can shrink.
    pub fn delta(&self) -> i64 {
        self.after as i64 - self.before as i64
    }
}

impl fmt::Display for CounterChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} → {} (Δ{})", self.before, self.after, self.delta())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerChange {
    pub name: String,
    pub generations: CounterChange,
    pub tokens: CounterChange,
}

/// Counter changes between the snapshots seen by two consecutive hourly reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HourlyDeltas {
    pub fleet_tokens: CounterChange,
    pub user_generations: CounterChange,
    pub user_tokens: CounterChange,
    /// Workers present in both snapshots whose counters moved.
    pub workers: Vec<WorkerChange>,
}

pub fn hourly_deltas(previous: &Snapshot, current: &Snapshot) -> HourlyDeltas {
    let before: HashMap<&str, _> = previous
        .workers
        .iter()
        .map(|w| (w.id.as_str(), w))
        .collect();
    let workers = current
        .workers
        .iter()
        .filter_map(|w| {
            let prev = before.get(w.id.as_str())?;
            let change = WorkerChange {
                name: w.name.clone(),
                generations: CounterChange::new(prev.generations_last_24h, w.generations_last_24h),
                tokens: CounterChange::new(prev.tokens_last_24h, w.tokens_last_24h),
            };
            (change.generations.delta() != 0 || change.tokens.delta() != 0).then_some(change)
        })
        .collect();
    HourlyDeltas {
        fleet_tokens: CounterChange::new(
            previous.general.tokens_last_24h,
            current.general.tokens_last_24h,
        ),
        user_generations: CounterChange::new(
            previous.user.generations_last_24h,
            current.user.generations_last_24h,
        ),
        user_tokens: CounterChange::new(previous.user.tokens_last_24h, current.user.tokens_last_24h),
        workers,
    }
}

fn delta_lines(deltas: &HourlyDeltas) -> Vec<String> {
    let mut lines = vec![
        "Changes since last report:".to_string(),
        format!("Fleet tokens: {}", deltas.fleet_tokens),
        format!("User generations: {}", deltas.user_generations),
        format!("User tokens: {}", deltas.user_tokens),
    ];
    for w in &deltas.workers {
        lines.push(format!("{} generations: {}", w.name, w.generations));
        lines.push(format!("{} tokens: {}", w.name, w.tokens));
    }
    lines
}

/// Rolling-window summary for the hourly channel, followed by the counter changes since
/// the previous report when there is one.
pub fn hourly_message(
    stats: &WindowStats,
    deltas: Option<&HourlyDeltas>,
    offset: FixedOffset,
) -> String {
    let mut lines = if stats.is_empty() {
        vec!["No samples collected in the current window.".to_string()]
    } else {
        vec![
            format!(
                "{} ~ {} ({} samples)",
                local(stats.start_time, offset).format("%H:%M"),
                local(stats.end_time, offset).format("%H:%M"),
                stats.rpm.count
            ),
            metric_line("RPM", &stats.rpm),
            metric_line("Running instances", &stats.running_instances),
            format!(
                "Generations: general {} / user {} ({:.2}%)",
                stats.generations.general, stats.generations.user, stats.generations.ratio
            ),
        ]
    };
    if let Some(deltas) = deltas {
        lines.push(String::new());
        lines.extend(delta_lines(deltas));
    }
    format!("⏰ Hourly Report\n{}", code_block(&lines.join("\n")))
}
