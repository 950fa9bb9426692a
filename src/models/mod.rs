// Domain models: samples, snapshots, notifications

mod notification;
mod sample;
mod snapshot;

pub use notification::{ChannelClass, Notification};
pub use sample::{GenerationSummary, MetricSummary, Sample, WindowStats};
pub use snapshot::{
    AlertStatus, CostSource, CreditBalance, DailySummary, FleetTotals, InstanceSnapshot, Snapshot,
    UserTotals, WorkerSnapshot,
};
