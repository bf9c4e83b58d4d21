//! 模拟退火自动调优算法
//!
//! 每个节点独立调优：记录每种任务包大小的每任务平均耗时，
//! 采样足够后以当前最优大小为中心随机扰动，扰动幅度随已尝试
//! 大小的数量指数衰减。连续猜测`maxGuessToStable`次后进入稳定态，
//! 稳定态下若性能偏离超过`maxDeviation`则重新开始探索。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{Bundler, BundlerContext, BundlerError, Feedback, Profile};
use crate::WorkerId;

pub const NAME: &str = "autotuned";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct SizeStats {
    tasks: usize,
    nanos: f64,
}

impl SizeStats {
    fn add(&mut self, tasks: usize, nanos: f64) {
        self.tasks += tasks;
        self.nanos += nanos;
    }

    fn mean(&self) -> Option<f64> {
        (self.tasks > 0).then(|| self.nanos / self.tasks as f64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TunerState {
    size: usize,
    stats: BTreeMap<usize, SizeStats>,
    window: SizeStats,
    guesses: usize,
    stable_mean: Option<f64>,
}

impl TunerState {
    fn new(size: usize) -> Self {
        Self {
            size,
            stats: BTreeMap::new(),
            window: SizeStats::default(),
            guesses: 0,
            stable_mean: None,
        }
    }

    fn best(&self) -> Option<(usize, f64)> {
        self.stats
            .iter()
            .filter_map(|(size, s)| s.mean().map(|m| (*size, m)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    fn is_stable(&self) -> bool {
        self.stable_mean.is_some()
    }
}

#[derive(Debug, Clone, Copy)]
struct Tuning {
    initial_size: usize,
    min_samples_to_analyse: usize,
    min_samples_to_check_convergence: usize,
    max_deviation: f64,
    max_guess_to_stable: usize,
    size_ratio_deviation: f64,
    decrease_ratio: f64,
}

struct Inner {
    nodes: HashMap<WorkerId, TunerState>,
    rng: StdRng,
}

pub struct AutoTunedBundler {
    profile: Profile,
    tuning: Tuning,
    inner: Mutex<Inner>,
}

impl AutoTunedBundler {
    pub fn new(profile: Profile) -> Result<Self, BundlerError> {
        let tuning = Tuning {
            initial_size: profile.positive_or("size", 5)?,
            min_samples_to_analyse: profile.positive_or("minSamplesToAnalyse", 500)?,
            min_samples_to_check_convergence: profile
                .positive_or("minSamplesToCheckConvergence", 300)?,
            max_deviation: profile.parse_or("maxDeviation", 0.2)?,
            max_guess_to_stable: profile.positive_or("maxGuessToStable", 50)?,
            size_ratio_deviation: profile.parse_or("sizeRatioDeviation", 1.5)?,
            decrease_ratio: profile.parse_or("decreaseRatio", 0.2)?,
        };
        if tuning.size_ratio_deviation < 1.0 {
            return Err(BundlerError::InvalidParameter {
                key: "sizeRatioDeviation".to_string(),
                value: tuning.size_ratio_deviation.to_string(),
                reason: "must be at least 1.0".to_string(),
            });
        }
        let rng = match profile.get("seed") {
            Some(_) => StdRng::seed_from_u64(profile.parse_or("seed", 0u64)?),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            profile,
            tuning,
            inner: Mutex::new(Inner {
                nodes: HashMap::new(),
                rng,
            }),
        })
    }

    pub fn construct(
        profile: &Profile,
        _ctx: Arc<dyn BundlerContext>,
    ) -> Result<Arc<dyn Bundler>, BundlerError> {
        Ok(Arc::new(Self::new(profile.clone())?))
    }

    /// 当前温度，已尝试的大小越多越低
    fn temperature(&self, distinct_sizes: usize) -> f64 {
        (-(distinct_sizes as f64) * self.tuning.decrease_ratio).exp()
    }

    fn analyse(&self, state: &mut TunerState, rng: &mut StdRng) {
        let Some((best_size, best_mean)) = state.best() else {
            return;
        };
        if state.guesses >= self.tuning.max_guess_to_stable {
            log::debug!(
                "autotuned: settled on size {} ({:.0} ns/task)",
                best_size,
                best_mean
            );
            state.size = best_size;
            state.stable_mean = Some(best_mean);
            return;
        }
        let temperature = self.temperature(state.stats.len());
        let spread = best_size as f64 * (self.tuning.size_ratio_deviation - 1.0) * temperature;
        let delta = spread * rng.random_range(-1.0..=1.0);
        state.size = ((best_size as f64 + delta).round() as i64).max(1) as usize;
        state.guesses += 1;
    }

    fn check_convergence(&self, state: &mut TunerState) {
        let (Some(reference), Some(observed)) = (state.stable_mean, state.window.mean()) else {
            return;
        };
        let deviation = (observed - reference).abs() / reference.max(1.0);
        if deviation > self.tuning.max_deviation {
            log::info!(
                "autotuned: performance drifted by {:.1}%, restarting exploration",
                deviation * 100.0
            );
            let size = state.size;
            *state = TunerState::new(size);
        }
    }
}

impl Bundler for AutoTunedBundler {
    fn algorithm(&self) -> &str {
        NAME
    }

    fn profile(&self) -> &Profile {
        &self.profile
    }

    fn next_size(&self, worker: WorkerId) -> usize {
        let inner = self.inner.lock();
        inner
            .nodes
            .get(&worker)
            .map_or(self.tuning.initial_size, |s| s.size.max(1))
    }

    fn feedback(&self, worker: WorkerId, feedback: &Feedback) {
        if feedback.size == 0 {
            return;
        }
        let mut guard = self.inner.lock();
        let Inner { nodes, rng } = &mut *guard;
        let state = nodes
            .entry(worker)
            .or_insert_with(|| TunerState::new(self.tuning.initial_size));
        let nanos = feedback.elapsed.as_nanos() as f64;
        state
            .stats
            .entry(feedback.size)
            .or_default()
            .add(feedback.size, nanos);
        state.window.add(feedback.size, nanos);

        if state.is_stable() {
            if state.window.tasks >= self.tuning.min_samples_to_check_convergence {
                self.check_convergence(state);
                state.window = SizeStats::default();
            }
        } else if state.window.tasks >= self.tuning.min_samples_to_analyse {
            self.analyse(state, rng);
            state.window = SizeStats::default();
        }
    }

    fn release(&self, worker: WorkerId) {
        self.inner.lock().nodes.remove(&worker);
    }

    fn save_state(&self, worker: WorkerId) -> Option<Vec<u8>> {
        let inner = self.inner.lock();
        inner
            .nodes
            .get(&worker)
            .and_then(|s| bincode::serialize(s).ok())
    }

    fn restore_state(&self, worker: WorkerId, state: &[u8]) -> Result<(), BundlerError> {
        let state: TunerState = bincode::deserialize(state)?;
        self.inner.lock().nodes.insert(worker, state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn profile() -> Profile {
        Profile::new(NAME)
            .with("size", 8)
            .with("minSamplesToAnalyse", 1)
            .with("minSamplesToCheckConvergence", 1)
            .with("maxGuessToStable", 10)
            .with("seed", 42)
    }

    /// 每任务耗时在大小为12时最低
    fn cost(size: usize) -> Duration {
        let diff = size as i64 - 12;
        Duration::from_nanos(size as u64 * (1_000 + (diff * diff) as u64 * 50))
    }

    #[test]
    fn initial_size_until_enough_samples() {
        let bundler = AutoTunedBundler::new(
            Profile::new(NAME).with("size", 3).with("seed", 1),
        )
        .unwrap();
        assert_eq!(bundler.next_size(WorkerId(1)), 3);
        bundler.feedback(WorkerId(1), &Feedback::new(3, Duration::from_millis(3)));
        assert_eq!(bundler.next_size(WorkerId(1)), 3);
    }

    #[test]
    fn settles_on_best_observed_size() {
        let bundler = AutoTunedBundler::new(profile()).unwrap();
        let worker = WorkerId(1);
        for _ in 0..11 {
            let size = bundler.next_size(worker);
            assert!(size >= 1);
            bundler.feedback(worker, &Feedback::new(size, cost(size)));
        }
        let inner = bundler.inner.lock();
        let state = inner.nodes.get(&worker).unwrap();
        assert!(state.is_stable());
        assert_eq!(state.size, state.best().unwrap().0);
    }

    #[test]
    fn drift_restarts_exploration() {
        let bundler = AutoTunedBundler::new(profile()).unwrap();
        let worker = WorkerId(2);
        for _ in 0..11 {
            let size = bundler.next_size(worker);
            bundler.feedback(worker, &Feedback::new(size, cost(size)));
        }
        let size = bundler.next_size(worker);
        bundler.feedback(worker, &Feedback::new(size, cost(size) * 10));
        let inner = bundler.inner.lock();
        let state = inner.nodes.get(&worker).unwrap();
        assert!(!state.is_stable());
        assert_eq!(state.guesses, 0);
        assert_eq!(state.size, size);
    }

    #[test]
    fn temperature_decays_with_explored_sizes() {
        let bundler = AutoTunedBundler::new(profile()).unwrap();
        assert!(bundler.temperature(1) > bundler.temperature(5));
        assert!((bundler.temperature(0) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_shrinking_ratio() {
        let profile = Profile::new(NAME).with("sizeRatioDeviation", 0.5);
        assert!(AutoTunedBundler::new(profile).is_err());
    }
}
