//! 负载均衡(任务包大小)算法
//!
//! 每次向某个Drone派发前，由`Bundler`决定任务包中放多少个任务；
//! 结果返回后，把观测到的耗时作为`Feedback`回灌给算法。
//!
//! 可用算法:
//! - `manual`: 固定大小
//! - `proportional`: 按各节点平均耗时的比例分配
//! - `autotuned`: 模拟退火自动调优
//! - `rl`: 基于性能变化方向的强化学习

pub mod autotuned;
pub mod ema;
pub mod factory;
pub mod manual;
pub mod proportional;
pub mod rl;

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::WorkerId;

pub use autotuned::AutoTunedBundler;
pub use ema::Ema;
pub use factory::{BundlerConstructor, BundlerFactory};
pub use manual::ManualBundler;
pub use proportional::ProportionalBundler;
pub use rl::RlBundler;

#[derive(thiserror::Error, Debug)]
pub enum BundlerError {
    #[error("未知的负载均衡算法: {0}")]
    UnknownAlgorithm(String),
    #[error("参数`{key}`的值`{value}`无效: {reason}")]
    InvalidParameter {
        key: String,
        value: String,
        reason: String,
    },
    #[error("状态编码错误: {0}")]
    State(#[from] bincode::Error),
}

/// 一个任务包执行完成后的性能反馈
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Feedback {
    /// 任务包实际包含的任务数
    pub size: usize,
    /// 从派发到结果读完的墙钟时间
    pub elapsed: Duration,
    /// 估算的每任务传输/调度开销
    pub overhead_per_task: Duration,
}

impl Feedback {
    pub fn new(size: usize, elapsed: Duration) -> Self {
        Self {
            size,
            elapsed,
            overhead_per_task: Duration::ZERO,
        }
    }

    pub fn with_overhead(mut self, overhead_per_task: Duration) -> Self {
        self.overhead_per_task = overhead_per_task;
        self
    }

    /// 每任务平均耗时(纳秒)
    pub fn nanos_per_task(&self) -> f64 {
        if self.size == 0 {
            0.0
        } else {
            self.elapsed.as_nanos() as f64 / self.size as f64
        }
    }
}

/// 算法可查询的调度环境
pub trait BundlerContext: Send + Sync {
    /// 当前排队作业中剩余任务数的最大值，队列为空时为0
    fn max_bundle_size(&self) -> usize;
}

/// 固定值上下文，用于测试和独立使用
#[derive(Debug, Default)]
pub struct FixedContext(AtomicUsize);

impl FixedContext {
    pub fn new(max: usize) -> Self {
        Self(AtomicUsize::new(max))
    }

    pub fn set(&self, max: usize) {
        self.0.store(max, Ordering::Relaxed);
    }
}

impl BundlerContext for FixedContext {
    fn max_bundle_size(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// 不可变的算法参数集
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    algorithm: String,
    params: BTreeMap<String, String>,
}

impl Profile {
    pub fn new(algorithm: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(key.into(), value.to_string());
        self
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// 读取并解析参数，缺省时返回`default`
    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T, BundlerError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.params.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map_err(|e| BundlerError::InvalidParameter {
                    key: key.to_string(),
                    value: raw.clone(),
                    reason: e.to_string(),
                }),
        }
    }

    /// 读取正整数参数
    pub fn positive_or(&self, key: &str, default: usize) -> Result<usize, BundlerError> {
        let value = self.parse_or(key, default)?;
        if value == 0 {
            return Err(BundlerError::InvalidParameter {
                key: key.to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(value)
    }
}

/// 任务包大小算法
///
/// 同一个实例被所有WorkerChannel共享：反馈来自反应器线程，
/// 替换发生在管理线程，因此实现必须自行加锁保护共享状态。
pub trait Bundler: Send + Sync {
    fn algorithm(&self) -> &str;

    fn profile(&self) -> &Profile;

    /// 下一个发往`worker`的任务包大小，至少为1
    fn next_size(&self, worker: WorkerId) -> usize;

    /// 回灌`worker`上一个任务包的执行结果
    fn feedback(&self, worker: WorkerId, feedback: &Feedback);

    /// 通道销毁时释放该节点的状态
    fn release(&self, _worker: WorkerId) {}

    /// 导出节点状态用于持久化
    fn save_state(&self, _worker: WorkerId) -> Option<Vec<u8>> {
        None
    }

    /// 恢复先前持久化的节点状态
    fn restore_state(&self, _worker: WorkerId, _state: &[u8]) -> Result<(), BundlerError> {
        Ok(())
    }
}

/// 滚动性能窗口，按任务数加权计算每任务平均耗时
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceHistory {
    capacity: usize,
    samples: VecDeque<(usize, f64)>,
    total_size: usize,
    total_nanos: f64,
}

impl PerformanceHistory {
    /// # 参数
    /// - capacity: 窗口保留的任务数上限
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::new(),
            total_size: 0,
            total_nanos: 0.0,
        }
    }

    pub fn add(&mut self, feedback: &Feedback) {
        if feedback.size == 0 {
            return;
        }
        let nanos = feedback.elapsed.as_nanos() as f64;
        self.samples.push_back((feedback.size, nanos));
        self.total_size += feedback.size;
        self.total_nanos += nanos;
        while self.total_size > self.capacity && self.samples.len() > 1 {
            if let Some((size, nanos)) = self.samples.pop_front() {
                self.total_size -= size;
                self.total_nanos -= nanos;
            }
        }
    }

    /// 每任务平均耗时(纳秒)，无样本时为None
    pub fn mean(&self) -> Option<f64> {
        if self.total_size == 0 {
            None
        } else {
            Some(self.total_nanos / self.total_size as f64)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn task_count(&self) -> usize {
        self.total_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn profile_parses_typed_values() {
        let profile = Profile::new("x").with("size", 7).with("ratio", "0.25");
        assert_eq!(profile.parse_or("size", 1usize).unwrap(), 7);
        assert_relative_eq!(profile.parse_or("ratio", 1.0f64).unwrap(), 0.25);
        assert_eq!(profile.parse_or("missing", 3usize).unwrap(), 3);
    }

    #[test]
    fn profile_reports_bad_values() {
        let profile = Profile::new("x").with("size", "ten").with("zero", 0);
        assert!(matches!(
            profile.parse_or("size", 1usize),
            Err(BundlerError::InvalidParameter { .. })
        ));
        assert!(profile.positive_or("zero", 1).is_err());
    }

    #[test]
    fn history_is_weighted_by_task_count() {
        let mut history = PerformanceHistory::new(100);
        assert!(history.mean().is_none());
        history.add(&Feedback::new(1, Duration::from_nanos(100)));
        history.add(&Feedback::new(3, Duration::from_nanos(900)));
        assert_relative_eq!(history.mean().unwrap(), 250.0);
    }

    #[test]
    fn history_evicts_oldest_samples() {
        let mut history = PerformanceHistory::new(4);
        history.add(&Feedback::new(2, Duration::from_nanos(2_000)));
        history.add(&Feedback::new(2, Duration::from_nanos(200)));
        history.add(&Feedback::new(2, Duration::from_nanos(200)));
        assert_eq!(history.task_count(), 4);
        assert_relative_eq!(history.mean().unwrap(), 100.0);
    }

    #[test]
    fn feedback_per_task_time() {
        let fb = Feedback::new(4, Duration::from_micros(4));
        assert_relative_eq!(fb.nanos_per_task(), 1_000.0);
        assert_eq!(Feedback::new(0, Duration::from_secs(1)).nanos_per_task(), 0.0);
    }
}
