//! 负载均衡器测试模块

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use approx::assert_relative_eq;
use zerg_grid::balancer::{
    BundlerContext, BundlerFactory, FixedContext, PerformanceHistory, Profile,
};
use zerg_grid::config::LoadBalancingConfig;
use zerg_grid::persistence::{BundlerStore, MemoryBundlerStore, StateKey};
use zerg_grid::{Feedback, WorkerId};

fn ctx(max: usize) -> Arc<FixedContext> {
    Arc::new(FixedContext::new(max))
}

#[test]
fn test_feedback_per_task_time() {
    let fb = Feedback::new(4, Duration::from_millis(10));
    assert_relative_eq!(fb.nanos_per_task(), 2_500_000.0, epsilon = 0.001);
    assert_relative_eq!(Feedback::new(0, Duration::from_secs(1)).nanos_per_task(), 0.0);
}

#[test]
fn test_history_is_weighted_by_task_count() {
    let mut history = PerformanceHistory::new(100);
    history.add(&Feedback::new(10, Duration::from_micros(10)));
    history.add(&Feedback::new(30, Duration::from_micros(90)));
    // (10us + 90us) / 40 tasks
    assert_relative_eq!(history.mean().unwrap(), 2_500.0, epsilon = 0.001);
    assert_eq!(history.task_count(), 40);
}

#[test]
fn test_history_window_drops_oldest_samples() {
    let mut history = PerformanceHistory::new(10);
    history.add(&Feedback::new(10, Duration::from_micros(100)));
    history.add(&Feedback::new(10, Duration::from_micros(20)));
    assert_relative_eq!(history.mean().unwrap(), 2_000.0, epsilon = 0.001);
}

#[test]
fn test_proportionality_factor_sharpens_split() {
    let factory = BundlerFactory::with_builtin();
    let profile = Profile::new("proportional").with("proportionalityFactor", 2);
    let bundler = factory.create("proportional", &profile, ctx(100)).unwrap();
    bundler.feedback(WorkerId(1), &Feedback::new(10, Duration::from_millis(10)));
    bundler.feedback(WorkerId(2), &Feedback::new(10, Duration::from_millis(20)));
    // 权重(2/1)^2 : (2/2)^2 = 4 : 1
    assert_eq!(bundler.next_size(WorkerId(1)), 80);
    assert_eq!(bundler.next_size(WorkerId(2)), 20);
}

#[test]
fn test_proportional_follows_queue_budget() {
    let budget = ctx(40);
    let dyn_ctx: Arc<dyn BundlerContext> = budget.clone();
    let bundler = BundlerFactory::with_builtin()
        .create("proportional", &Profile::new("proportional"), dyn_ctx)
        .unwrap();
    assert_eq!(bundler.next_size(WorkerId(7)), 40);
    budget.set(12);
    bundler.feedback(WorkerId(7), &Feedback::new(40, Duration::from_millis(40)));
    assert_eq!(bundler.next_size(WorkerId(7)), 12);
}

#[test]
fn test_rl_moves_towards_better_throughput() {
    let profile = Profile::new("rl")
        .with("size", 10)
        .with("performanceCacheSize", 1)
        .with("maxActionRange", 5);
    let bundler = BundlerFactory::with_builtin()
        .create("rl", &profile, ctx(0))
        .unwrap();
    let w = WorkerId(1);
    bundler.feedback(w, &Feedback::new(10, Duration::from_micros(1000)));
    assert_eq!(bundler.next_size(w), 10);
    // 每任务耗时下降40%: 保持方向(默认向上)，步长round(0.4*5)=2
    bundler.feedback(w, &Feedback::new(10, Duration::from_micros(600)));
    assert_eq!(bundler.next_size(w), 12);
}

#[test]
fn test_config_properties_select_algorithm() {
    let config = LoadBalancingConfig::new("manual").with_param("size", 42);
    let bundler = BundlerFactory::with_builtin().from_config(&config, ctx(0));
    assert_eq!(bundler.algorithm(), "manual");
    assert_eq!(bundler.next_size(WorkerId(3)), 42);
}

#[test]
fn test_invalid_profile_falls_back_to_single_task_bundles() {
    let config = LoadBalancingConfig::new("autotuned").with_param("sizeRatioDeviation", 0.5);
    let bundler = BundlerFactory::with_builtin().from_config(&config, ctx(0));
    assert_eq!(bundler.algorithm(), "manual");
    assert_eq!(bundler.next_size(WorkerId(1)), 1);
}

#[test]
fn test_profile_prefix_is_stripped() {
    let mut props = HashMap::new();
    props.insert("zerg.load.balancing.profile.rl.size".to_string(), "9".to_string());
    props.insert("zerg.load.balancing.profile.manual.size".to_string(), "3".to_string());
    let profile =
        BundlerFactory::profile_from_properties("rl", &props, "zerg.load.balancing.profile.rl.");
    assert_eq!(profile.get("size"), Some("9"));
    assert_eq!(profile.params().len(), 1);
}

#[test]
fn test_state_survives_store_round_trip() {
    let factory = BundlerFactory::with_builtin();
    let profile = Profile::new("proportional").with("initialSize", 4);
    let first = factory.create("proportional", &profile, ctx(60)).unwrap();
    first.feedback(WorkerId(1), &Feedback::new(10, Duration::from_millis(10)));
    first.feedback(WorkerId(2), &Feedback::new(10, Duration::from_millis(20)));

    let store = MemoryBundlerStore::new();
    let key = StateKey::new(BundlerFactory::algorithm_hash("proportional"), "drone-a");
    store
        .store(&key, &first.save_state(WorkerId(1)).unwrap())
        .unwrap();

    let second = factory.create("proportional", &profile, ctx(60)).unwrap();
    let blob = store.load(&key).unwrap().unwrap();
    second.restore_state(WorkerId(9), &blob).unwrap();
    second.feedback(WorkerId(10), &Feedback::new(10, Duration::from_millis(20)));
    // 恢复的节点保留了更快的历史
    assert_eq!(second.next_size(WorkerId(9)), 40);
    assert_eq!(second.next_size(WorkerId(10)), 20);
}

#[test]
fn test_algorithm_hash_is_stable_hex() {
    let a = BundlerFactory::algorithm_hash("autotuned");
    assert_eq!(a.len(), 64);
    assert_eq!(a, BundlerFactory::algorithm_hash("autotuned"));
    assert_ne!(a, BundlerFactory::algorithm_hash("rl"));
}
