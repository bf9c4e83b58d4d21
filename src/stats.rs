//! 统计数据采集
//!
//! 核心只负责产生计数，保存与导出由外部`StatsSink`实现决定。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// 统计项名称
pub mod labels {
    pub const JOB_ADDED: &str = "job.added";
    pub const JOB_REMOVED: &str = "job.removed";
    pub const JOB_TASKS: &str = "job.tasks";
    pub const JOB_TIME: &str = "job.time.ms";
    pub const BUNDLE_TASKS: &str = "bundle.tasks";
    pub const BUNDLE_ELAPSED: &str = "bundle.elapsed.ms";
    pub const BUNDLE_QUEUE_WAIT: &str = "bundle.queue.wait.ms";
    pub const TASKS_COMPLETED: &str = "tasks.completed";
    pub const TASKS_REQUEUED: &str = "tasks.requeued";
    pub const TASKS_DROPPED: &str = "tasks.dropped";
    pub const CHANNEL_FAILURES: &str = "channel.failures";
    pub const DRONE_BUNDLES: &str = "drone.bundles";
    pub const DRONE_TASK_ELAPSED: &str = "drone.task.elapsed.ms";
}

/// 统计汇聚接口
pub trait StatsSink: Send + Sync {
    fn add_value(&self, label: &str, value: f64);

    /// 一次性累加`count`个值，其总和为`sum`
    fn add_values(&self, label: &str, sum: f64, count: u64);
}

/// 不做任何记录的实现
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl StatsSink for NoopStats {
    fn add_value(&self, _label: &str, _value: f64) {}
    fn add_values(&self, _label: &str, _sum: f64, _count: u64) {}
}

/// 单个统计项的快照
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    pub total: f64,
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub latest: f64,
}

impl Snapshot {
    fn empty() -> Self {
        Self {
            total: 0.0,
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            latest: 0.0,
        }
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }

    fn record(&mut self, sum: f64, count: u64) {
        if count == 0 {
            return;
        }
        let value = sum / count as f64;
        self.total += sum;
        self.count += count;
        self.latest = value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }
}

/// 内存累计统计
#[derive(Debug, Default)]
pub struct JobStatistics {
    snapshots: RwLock<HashMap<String, Snapshot>>,
}

impl JobStatistics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self, label: &str) -> Option<Snapshot> {
        self.snapshots.read().get(label).copied()
    }

    /// 指定项的累计总量，不存在时为0
    pub fn total(&self, label: &str) -> f64 {
        self.snapshot(label).map_or(0.0, |s| s.total)
    }

    pub fn labels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshots.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn reset(&self) {
        self.snapshots.write().clear();
    }
}

impl StatsSink for JobStatistics {
    fn add_value(&self, label: &str, value: f64) {
        self.add_values(label, value, 1);
    }

    fn add_values(&self, label: &str, sum: f64, count: u64) {
        let mut snapshots = self.snapshots.write();
        snapshots
            .entry(label.to_string())
            .or_insert_with(Snapshot::empty)
            .record(sum, count);
    }
}

/// 转发到`metrics`门面的实现，供外部导出器(Prometheus等)采集
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsSink;

impl StatsSink for MetricsSink {
    fn add_value(&self, label: &str, value: f64) {
        metrics::histogram!(label.to_string()).record(value);
    }

    fn add_values(&self, label: &str, sum: f64, count: u64) {
        metrics::counter!(format!("{}.count", label)).increment(count);
        metrics::histogram!(label.to_string()).record(sum);
    }
}

/// 同时写入多个汇聚端
pub struct FanoutStats {
    sinks: Vec<Arc<dyn StatsSink>>,
}

impl FanoutStats {
    pub fn new(sinks: Vec<Arc<dyn StatsSink>>) -> Self {
        Self { sinks }
    }
}

impl StatsSink for FanoutStats {
    fn add_value(&self, label: &str, value: f64) {
        for sink in &self.sinks {
            sink.add_value(label, value);
        }
    }

    fn add_values(&self, label: &str, sum: f64, count: u64) {
        for sink in &self.sinks {
            sink.add_values(label, sum, count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn snapshot_tracks_min_max_avg() {
        let stats = JobStatistics::default();
        stats.add_value("x", 2.0);
        stats.add_value("x", 6.0);
        stats.add_values("x", 12.0, 3);

        let snap = stats.snapshot("x").unwrap();
        assert_eq!(snap.count, 5);
        assert_relative_eq!(snap.total, 20.0);
        assert_relative_eq!(snap.avg(), 4.0);
        assert_relative_eq!(snap.min, 2.0);
        assert_relative_eq!(snap.max, 6.0);
        assert_relative_eq!(snap.latest, 4.0);
    }

    #[test]
    fn zero_count_batch_is_ignored() {
        let stats = JobStatistics::default();
        stats.add_values("y", 10.0, 0);
        assert_eq!(stats.snapshot("y").map(|s| s.count), Some(0));
        assert_eq!(stats.total("missing"), 0.0);
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = JobStatistics::new();
        let b = JobStatistics::new();
        let fanout = FanoutStats::new(vec![a.clone(), b.clone()]);
        fanout.add_value(labels::JOB_ADDED, 1.0);
        assert_eq!(a.total(labels::JOB_ADDED), 1.0);
        assert_eq!(b.total(labels::JOB_ADDED), 1.0);
    }
}
