//! 算法注册表
//!
//! 按算法名查找构造函数。启动时注册内置算法，之后可随时追加。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use super::{autotuned, manual, proportional, rl};
use super::{Bundler, BundlerContext, BundlerError, ManualBundler, Profile};
use crate::config::LoadBalancingConfig;

/// 由参数集和调度上下文构造算法实例
pub type BundlerConstructor = Arc<
    dyn Fn(&Profile, Arc<dyn BundlerContext>) -> Result<Arc<dyn Bundler>, BundlerError>
        + Send
        + Sync,
>;

#[derive(Default)]
pub struct BundlerFactory {
    constructors: RwLock<HashMap<String, BundlerConstructor>>,
}

impl BundlerFactory {
    /// 空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册了全部内置算法的注册表
    pub fn with_builtin() -> Self {
        let factory = Self::new();
        factory.register(manual::NAME, Arc::new(ManualBundler::construct));
        factory.register(
            proportional::NAME,
            Arc::new(proportional::ProportionalBundler::construct),
        );
        factory.register(
            autotuned::NAME,
            Arc::new(autotuned::AutoTunedBundler::construct),
        );
        factory.register(rl::NAME, Arc::new(rl::RlBundler::construct));
        factory
    }

    /// 注册算法，同名则替换
    pub fn register(&self, name: impl Into<String>, constructor: BundlerConstructor) {
        let name = name.into();
        log::debug!("Registering load-balancing algorithm {}", name);
        self.constructors.write().insert(name, constructor);
    }

    /// 已注册的算法名，按字母序
    pub fn algorithms(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.constructors.read().contains_key(name)
    }

    /// 从扁平属性中取出以`prefix`开头的键，去掉前缀后组成参数集
    pub fn profile_from_properties(
        algorithm: &str,
        properties: &HashMap<String, String>,
        prefix: &str,
    ) -> Profile {
        properties
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(prefix)
                    .filter(|name| !name.is_empty())
                    .map(|name| (name, value))
            })
            .fold(Profile::new(algorithm), |profile, (name, value)| {
                profile.with(name, value)
            })
    }

    pub fn create(
        &self,
        algorithm: &str,
        profile: &Profile,
        ctx: Arc<dyn BundlerContext>,
    ) -> Result<Arc<dyn Bundler>, BundlerError> {
        // 构造函数可能较慢，先克隆出来再释放读锁
        let constructor = self
            .constructors
            .read()
            .get(algorithm)
            .cloned()
            .ok_or_else(|| BundlerError::UnknownAlgorithm(algorithm.to_string()))?;
        constructor(profile, ctx)
    }

    /// 按配置构造算法；失败时退回大小为1的固定算法，保证调度总能推进
    pub fn from_config(
        &self,
        config: &LoadBalancingConfig,
        ctx: Arc<dyn BundlerContext>,
    ) -> Arc<dyn Bundler> {
        let algorithm = config.algorithm.trim();
        let profile = Self::profile_from_properties(algorithm, &config.properties, &config.prefix());
        match self.create(algorithm, &profile, ctx) {
            Ok(bundler) => {
                log::info!(
                    "Load balancing algorithm {} active with {:?}",
                    algorithm,
                    profile.params()
                );
                bundler
            }
            Err(e) => {
                log::error!(
                    "Failed to create load balancing algorithm {}: {}, falling back to manual size 1",
                    algorithm,
                    e
                );
                Arc::new(ManualBundler::fixed(1))
            }
        }
    }

    /// 算法名的稳定哈希(SHA-256十六进制)，用于关联持久化状态
    pub fn algorithm_hash(name: &str) -> String {
        let digest = Sha256::digest(name.as_bytes());
        format!("{digest:x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::FixedContext;
    use crate::WorkerId;

    fn ctx() -> Arc<dyn BundlerContext> {
        Arc::new(FixedContext::new(0))
    }

    #[test]
    fn builtin_algorithms_are_registered() {
        let factory = BundlerFactory::with_builtin();
        assert_eq!(
            factory.algorithms(),
            vec!["autotuned", "manual", "proportional", "rl"]
        );
    }

    #[test]
    fn profile_strips_namespace() {
        let config = LoadBalancingConfig::new("manual")
            .with_param("size", 7)
            .with_param("other", "x");
        let mut properties = config.properties.clone();
        properties.insert("unrelated.size".into(), "3".into());
        let profile =
            BundlerFactory::profile_from_properties("manual", &properties, &config.prefix());
        assert_eq!(profile.algorithm(), "manual");
        assert_eq!(profile.get("size"), Some("7"));
        assert_eq!(profile.get("other"), Some("x"));
        assert_eq!(profile.params().len(), 2);
    }

    #[test]
    fn from_config_builds_requested_algorithm() {
        let factory = BundlerFactory::with_builtin();
        let config = LoadBalancingConfig::new("manual").with_param("size", 9);
        let bundler = factory.from_config(&config, ctx());
        assert_eq!(bundler.algorithm(), "manual");
        assert_eq!(bundler.next_size(WorkerId(1)), 9);
    }

    #[test]
    fn unknown_or_invalid_falls_back_to_size_one() {
        let factory = BundlerFactory::with_builtin();
        let unknown = factory.from_config(&LoadBalancingConfig::new("nope"), ctx());
        assert_eq!(unknown.algorithm(), "manual");
        assert_eq!(unknown.next_size(WorkerId(1)), 1);

        let invalid = LoadBalancingConfig::new("proportional").with_param("initialSize", "-3");
        let bundler = factory.from_config(&invalid, ctx());
        assert_eq!(bundler.algorithm(), "manual");
        assert_eq!(bundler.next_size(WorkerId(1)), 1);
    }

    #[test]
    fn custom_constructor_can_be_registered() {
        let factory = BundlerFactory::new();
        factory.register(
            "eight",
            Arc::new(
                |_: &Profile, _: Arc<dyn BundlerContext>| -> Result<Arc<dyn Bundler>, BundlerError> {
                    Ok(Arc::new(ManualBundler::fixed(8)))
                },
            ),
        );
        assert!(factory.is_registered("eight"));
        let b = factory
            .create("eight", &Profile::new("eight"), ctx())
            .unwrap();
        assert_eq!(b.next_size(WorkerId(3)), 8);
        assert!(matches!(
            factory.create("manual", &Profile::new("manual"), ctx()),
            Err(BundlerError::UnknownAlgorithm(_))
        ));
    }

    #[test]
    fn algorithm_hash_is_stable_hex() {
        let a = BundlerFactory::algorithm_hash("proportional");
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a, BundlerFactory::algorithm_hash("proportional"));
        assert_ne!(a, BundlerFactory::algorithm_hash("rl"));
    }
}
