//! 强化学习算法
//!
//! 动作是对任务包大小的增减。性能变好则沿上一个动作的方向继续，
//! 变差则反向，变化在阈值内则保持不动。步长与性能变化的幅度成正比，
//! 最大不超过`maxActionRange`。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{Bundler, BundlerContext, BundlerError, Feedback, PerformanceHistory, Profile};
use crate::WorkerId;

pub const NAME: &str = "rl";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LearnerState {
    size: usize,
    history: PerformanceHistory,
    prev_mean: Option<f64>,
    action: i64,
}

pub struct RlBundler {
    profile: Profile,
    ctx: Arc<dyn BundlerContext>,
    initial_size: usize,
    cache_size: usize,
    threshold: f64,
    max_action: i64,
    nodes: Mutex<HashMap<WorkerId, LearnerState>>,
}

impl RlBundler {
    pub fn new(profile: Profile, ctx: Arc<dyn BundlerContext>) -> Result<Self, BundlerError> {
        let initial_size = profile.positive_or("size", 5)?;
        let cache_size = profile.positive_or("performanceCacheSize", 2000)?;
        let threshold: f64 = profile.parse_or("performanceVariationThreshold", 0.0001)?;
        let max_action = profile.positive_or("maxActionRange", 10)? as i64;
        Ok(Self {
            profile,
            ctx,
            initial_size,
            cache_size,
            threshold: threshold.abs(),
            max_action,
            nodes: Mutex::new(HashMap::new()),
        })
    }

    pub fn construct(
        profile: &Profile,
        ctx: Arc<dyn BundlerContext>,
    ) -> Result<Arc<dyn Bundler>, BundlerError> {
        Ok(Arc::new(Self::new(profile.clone(), ctx)?))
    }

    fn choose_action(&self, state: &LearnerState, mean: f64, prev: f64) -> i64 {
        let variation = (mean - prev) / prev.max(1.0);
        if variation.abs() <= self.threshold {
            return 0;
        }
        let direction = if state.action < 0 { -1 } else { 1 };
        let step = ((variation.abs() * self.max_action as f64).round() as i64)
            .clamp(1, self.max_action);
        if variation < 0.0 {
            direction * step
        } else {
            -direction * step
        }
    }
}

impl Bundler for RlBundler {
    fn algorithm(&self) -> &str {
        NAME
    }

    fn profile(&self) -> &Profile {
        &self.profile
    }

    fn next_size(&self, worker: WorkerId) -> usize {
        self.nodes
            .lock()
            .get(&worker)
            .map_or(self.initial_size, |s| s.size)
    }

    fn feedback(&self, worker: WorkerId, feedback: &Feedback) {
        let mut nodes = self.nodes.lock();
        let state = nodes.entry(worker).or_insert_with(|| LearnerState {
            size: self.initial_size,
            history: PerformanceHistory::new(self.cache_size),
            prev_mean: None,
            action: 0,
        });
        state.history.add(feedback);
        let Some(mean) = state.history.mean() else {
            return;
        };
        if let Some(prev) = state.prev_mean {
            let action = self.choose_action(state, mean, prev);
            let mut size = (state.size as i64 + action).max(1) as usize;
            let max = self.ctx.max_bundle_size();
            if max > 0 {
                size = size.min(max);
            }
            state.action = action;
            state.size = size;
        }
        state.prev_mean = Some(mean);
    }

    fn release(&self, worker: WorkerId) {
        self.nodes.lock().remove(&worker);
    }

    fn save_state(&self, worker: WorkerId) -> Option<Vec<u8>> {
        self.nodes
            .lock()
            .get(&worker)
            .and_then(|s| bincode::serialize(s).ok())
    }

    fn restore_state(&self, worker: WorkerId, state: &[u8]) -> Result<(), BundlerError> {
        let state: LearnerState = bincode::deserialize(state)?;
        self.nodes.lock().insert(worker, state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::FixedContext;
    use std::time::Duration;

    fn bundler(max: usize) -> RlBundler {
        let profile = Profile::new(NAME)
            .with("size", 5)
            .with("performanceCacheSize", 1)
            .with("maxActionRange", 4);
        RlBundler::new(profile, Arc::new(FixedContext::new(max))).unwrap()
    }

    fn feed(b: &RlBundler, size: usize, nanos: u64) -> usize {
        b.feedback(WorkerId(1), &Feedback::new(size, Duration::from_nanos(nanos)));
        b.next_size(WorkerId(1))
    }

    #[test]
    fn follows_improvement_and_reverses_on_regression() {
        let b = bundler(100);
        // 第一个样本只建立基线
        assert_eq!(feed(&b, 5, 5_000), 5);
        // 1000 -> 500 ns/task，提升50%，向上走2步
        assert_eq!(feed(&b, 5, 2_500), 7);
        // 500 -> 1000 ns/task，变差100%，反向走满4步
        assert_eq!(feed(&b, 7, 7_000), 3);
        // 持平
        assert_eq!(feed(&b, 3, 3_000), 3);
    }

    #[test]
    fn size_is_capped_by_queue() {
        let b = bundler(6);
        feed(&b, 5, 50_000);
        assert_eq!(feed(&b, 5, 500), 6);
    }

    #[test]
    fn size_never_drops_below_one() {
        let b = bundler(0);
        let mut size = 5;
        let mut nanos = 1_000;
        for _ in 0..10 {
            nanos *= 2;
            size = feed(&b, size, size as u64 * nanos);
            assert!(size >= 1);
        }
    }
}
