//! 比例分配算法
//!
//! 所有节点共享一份性能表。每次反馈后按
//! `(最慢平均耗时 / 节点平均耗时)^factor`的权重，
//! 把当前最大任务包预算按比例分给各节点。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{Bundler, BundlerContext, BundlerError, Feedback, PerformanceHistory, Profile};
use crate::WorkerId;

pub const NAME: &str = "proportional";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodePerformance {
    history: PerformanceHistory,
    size: usize,
}

pub struct ProportionalBundler {
    profile: Profile,
    ctx: Arc<dyn BundlerContext>,
    initial_size: usize,
    cache_size: usize,
    factor: f64,
    initial_mean: f64,
    nodes: Mutex<HashMap<WorkerId, NodePerformance>>,
}

impl ProportionalBundler {
    /// 参数:
    /// - `initialSize` 首个任务包大小(默认10)
    /// - `performanceCacheSize` 性能窗口任务数(默认2000)
    /// - `proportionalityFactor` 权重指数(默认1)
    /// - `initialMeanTime` 无样本节点的假定每任务耗时，纳秒(默认1e9)
    pub fn new(profile: Profile, ctx: Arc<dyn BundlerContext>) -> Result<Self, BundlerError> {
        let initial_size = profile.positive_or("initialSize", 10)?;
        let cache_size = profile.positive_or("performanceCacheSize", 2000)?;
        let factor: f64 = profile.parse_or("proportionalityFactor", 1.0)?;
        let initial_mean: f64 = profile.parse_or("initialMeanTime", 1e9)?;
        if factor <= 0.0 || initial_mean <= 0.0 {
            return Err(BundlerError::InvalidParameter {
                key: "proportionalityFactor/initialMeanTime".to_string(),
                value: format!("{}/{}", factor, initial_mean),
                reason: "must be positive".to_string(),
            });
        }
        Ok(Self {
            profile,
            ctx,
            initial_size,
            cache_size,
            factor,
            initial_mean,
            nodes: Mutex::new(HashMap::new()),
        })
    }

    pub fn construct(
        profile: &Profile,
        ctx: Arc<dyn BundlerContext>,
    ) -> Result<Arc<dyn Bundler>, BundlerError> {
        Ok(Arc::new(Self::new(profile.clone(), ctx)?))
    }

    fn new_node(&self) -> NodePerformance {
        NodePerformance {
            history: PerformanceHistory::new(self.cache_size),
            size: self.initial_size,
        }
    }

    fn rebalance(&self, nodes: &mut HashMap<WorkerId, NodePerformance>) {
        let budget = self.ctx.max_bundle_size();
        if budget == 0 || nodes.is_empty() {
            return;
        }
        let means: Vec<(WorkerId, f64)> = nodes
            .iter()
            .map(|(id, node)| {
                let mean = node.history.mean().unwrap_or(self.initial_mean).max(1.0);
                (*id, mean)
            })
            .collect();
        let slowest = means.iter().map(|(_, m)| *m).fold(f64::MIN, f64::max);
        let weights: Vec<(WorkerId, f64)> = means
            .iter()
            .map(|(id, mean)| (*id, (slowest / mean).powf(self.factor)))
            .collect();
        let total: f64 = weights.iter().map(|(_, w)| w).sum();

        let mut assigned = 0usize;
        let mut fastest: Option<(WorkerId, f64)> = None;
        for (id, weight) in &weights {
            let size = ((budget as f64 * weight / total).floor() as usize).max(1);
            assigned += size;
            if let Some(node) = nodes.get_mut(id) {
                node.size = size;
            }
            if fastest.map_or(true, |(_, w)| *weight > w) {
                fastest = Some((*id, *weight));
            }
        }
        if assigned < budget {
            if let Some(node) = fastest.and_then(|(id, _)| nodes.get_mut(&id)) {
                node.size += budget - assigned;
            }
        }
    }
}

impl Bundler for ProportionalBundler {
    fn algorithm(&self) -> &str {
        NAME
    }

    fn profile(&self) -> &Profile {
        &self.profile
    }

    fn next_size(&self, worker: WorkerId) -> usize {
        let mut nodes = self.nodes.lock();
        if !nodes.contains_key(&worker) {
            nodes.insert(worker, self.new_node());
            self.rebalance(&mut nodes);
        }
        nodes.get(&worker).map_or(self.initial_size, |n| n.size.max(1))
    }

    fn feedback(&self, worker: WorkerId, feedback: &Feedback) {
        let mut nodes = self.nodes.lock();
        let node = nodes.entry(worker).or_insert_with(|| self.new_node());
        node.history.add(feedback);
        self.rebalance(&mut nodes);
    }

    fn release(&self, worker: WorkerId) {
        let mut nodes = self.nodes.lock();
        if nodes.remove(&worker).is_some() {
            self.rebalance(&mut nodes);
        }
    }

    fn save_state(&self, worker: WorkerId) -> Option<Vec<u8>> {
        let nodes = self.nodes.lock();
        nodes
            .get(&worker)
            .and_then(|node| bincode::serialize(node).ok())
    }

    fn restore_state(&self, worker: WorkerId, state: &[u8]) -> Result<(), BundlerError> {
        let node: NodePerformance = bincode::deserialize(state)?;
        let mut nodes = self.nodes.lock();
        nodes.insert(worker, node);
        self.rebalance(&mut nodes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::FixedContext;
    use std::time::Duration;

    fn bundler(budget: usize) -> (ProportionalBundler, Arc<FixedContext>) {
        let ctx = Arc::new(FixedContext::new(budget));
        let profile = Profile::new(NAME).with("initialSize", 5);
        (ProportionalBundler::new(profile, ctx.clone()).unwrap(), ctx)
    }

    #[test]
    fn unknown_nodes_split_budget_evenly() {
        let (b, _) = bundler(100);
        assert_eq!(b.next_size(WorkerId(1)), 100);
        b.next_size(WorkerId(2));
        assert_eq!(b.next_size(WorkerId(1)), 50);
        assert_eq!(b.next_size(WorkerId(2)), 50);
    }

    #[test]
    fn faster_node_gets_proportionally_more() {
        let (b, _) = bundler(90);
        b.feedback(WorkerId(1), &Feedback::new(10, Duration::from_millis(10)));
        b.feedback(WorkerId(2), &Feedback::new(10, Duration::from_millis(20)));
        let fast = b.next_size(WorkerId(1));
        let slow = b.next_size(WorkerId(2));
        assert_eq!(fast + slow, 90);
        assert_eq!(fast, 60);
        assert_eq!(slow, 30);
    }

    #[test]
    fn empty_queue_keeps_previous_sizes() {
        let (b, ctx) = bundler(0);
        assert_eq!(b.next_size(WorkerId(1)), 5);
        ctx.set(40);
        b.feedback(WorkerId(1), &Feedback::new(5, Duration::from_millis(5)));
        assert_eq!(b.next_size(WorkerId(1)), 40);
    }

    #[test]
    fn release_returns_share_to_survivors() {
        let (b, _) = bundler(10);
        b.next_size(WorkerId(1));
        b.next_size(WorkerId(2));
        b.release(WorkerId(2));
        b.feedback(WorkerId(1), &Feedback::new(5, Duration::from_millis(1)));
        assert_eq!(b.next_size(WorkerId(1)), 10);
    }

    #[test]
    fn state_survives_save_and_restore() {
        let (a, _) = bundler(10);
        a.feedback(WorkerId(1), &Feedback::new(10, Duration::from_millis(3)));
        let saved = a.save_state(WorkerId(1)).unwrap();

        let (b, _) = bundler(10);
        b.restore_state(WorkerId(7), &saved).unwrap();
        assert_eq!(b.next_size(WorkerId(7)), 10);
        assert!(b.restore_state(WorkerId(8), b"garbage").is_err());
    }
}
