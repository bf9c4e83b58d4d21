//! 代码解析服务
//!
//! 按应用标识把原始字节解码为可执行任务。解码器被缓存；
//! 当解析服务报告任务代码已变更时，丢弃缓存并且只重试一次。

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::drone::Task;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("task code for application `{0}` changed, reload required")]
    ClassChanged(String),
    #[error("unknown application `{0}`")]
    UnknownApplication(String),
    #[error("task decode failed: {0}")]
    Decode(String),
}

/// 把单个任务负载解码为任务对象
pub trait TaskDecoder: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<Arc<dyn Task>, ResolveError>;
}

impl<F> TaskDecoder for F
where
    F: Fn(&[u8]) -> Result<Arc<dyn Task>, ResolveError> + Send + Sync,
{
    fn decode(&self, payload: &[u8]) -> Result<Arc<dyn Task>, ResolveError> {
        self(payload)
    }
}

/// 外部代码解析服务
pub trait CodeResolver: Send + Sync {
    fn resolve(&self, app_id: &str) -> Result<Arc<dyn TaskDecoder>, ResolveError>;
}

/// 按应用标识注册解码器的简单实现
#[derive(Default)]
pub struct DecoderRegistry {
    decoders: RwLock<HashMap<String, Arc<dyn TaskDecoder>>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册或替换某应用的解码器
    pub fn register(&self, app_id: impl Into<String>, decoder: Arc<dyn TaskDecoder>) {
        self.decoders.write().insert(app_id.into(), decoder);
    }

    pub fn unregister(&self, app_id: &str) -> bool {
        self.decoders.write().remove(app_id).is_some()
    }
}

impl CodeResolver for DecoderRegistry {
    fn resolve(&self, app_id: &str) -> Result<Arc<dyn TaskDecoder>, ResolveError> {
        self.decoders
            .read()
            .get(app_id)
            .cloned()
            .ok_or_else(|| ResolveError::UnknownApplication(app_id.to_string()))
    }
}

/// 带缓存的解析器
pub struct ResolverCache {
    resolver: Arc<dyn CodeResolver>,
    cache: Mutex<HashMap<String, Arc<dyn TaskDecoder>>>,
}

impl ResolverCache {
    pub fn new(resolver: Arc<dyn CodeResolver>) -> Self {
        Self {
            resolver,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn decoder(&self, app_id: &str) -> Result<Arc<dyn TaskDecoder>, ResolveError> {
        if let Some(decoder) = self.cache.lock().get(app_id) {
            return Ok(decoder.clone());
        }
        // 解析可能较慢，不持锁调用
        let decoder = self.resolver.resolve(app_id)?;
        self.cache
            .lock()
            .insert(app_id.to_string(), decoder.clone());
        Ok(decoder)
    }

    pub fn invalidate(&self, app_id: &str) {
        self.cache.lock().remove(app_id);
    }

    pub fn is_cached(&self, app_id: &str) -> bool {
        self.cache.lock().contains_key(app_id)
    }

    /// 解码一个任务包的全部任务
    ///
    /// 遇到`ClassChanged`时丢弃缓存的解码器并重试一次，第二次失败原样返回。
    pub fn decode_all(
        &self,
        app_id: &str,
        payloads: &[Bytes],
    ) -> Result<Vec<Arc<dyn Task>>, ResolveError> {
        match self.try_decode_all(app_id, payloads) {
            Err(ResolveError::ClassChanged(_)) => {
                log::warn!(
                    "Task code for application {} changed, reloading decoder",
                    app_id
                );
                self.invalidate(app_id);
                self.try_decode_all(app_id, payloads)
            }
            other => other,
        }
    }

    fn try_decode_all(
        &self,
        app_id: &str,
        payloads: &[Bytes],
    ) -> Result<Vec<Arc<dyn Task>>, ResolveError> {
        let decoder = self.decoder(app_id)?;
        payloads.iter().map(|p| decoder.decode(p)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drone::{TaskContext, TaskError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo(Bytes);

    impl Task for Echo {
        fn run(&self, _ctx: &TaskContext) -> Result<Bytes, TaskError> {
            Ok(self.0.clone())
        }
    }

    fn echo_decoder() -> Arc<dyn TaskDecoder> {
        Arc::new(|payload: &[u8]| -> Result<Arc<dyn Task>, ResolveError> {
            Ok(Arc::new(Echo(Bytes::copy_from_slice(payload))))
        })
    }

    fn stale_decoder() -> Arc<dyn TaskDecoder> {
        Arc::new(|_: &[u8]| -> Result<Arc<dyn Task>, ResolveError> {
            Err(ResolveError::ClassChanged("app".into()))
        })
    }

    /// 前`stale`次解析返回过期解码器
    struct Flaky {
        calls: AtomicUsize,
        stale: usize,
    }

    impl CodeResolver for Flaky {
        fn resolve(&self, _app_id: &str) -> Result<Arc<dyn TaskDecoder>, ResolveError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.stale {
                Ok(stale_decoder())
            } else {
                Ok(echo_decoder())
            }
        }
    }

    #[test]
    fn registry_resolves_registered_apps_only() {
        let registry = DecoderRegistry::new();
        registry.register("echo", echo_decoder());
        assert!(registry.resolve("echo").is_ok());
        assert_eq!(
            registry.resolve("other").err(),
            Some(ResolveError::UnknownApplication("other".into()))
        );
        assert!(registry.unregister("echo"));
        assert!(registry.resolve("echo").is_err());
    }

    #[test]
    fn decoder_is_cached_between_calls() {
        let flaky = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            stale: 0,
        });
        let cache = ResolverCache::new(flaky.clone());
        cache.decode_all("app", &[Bytes::from_static(b"a")]).unwrap();
        cache.decode_all("app", &[Bytes::from_static(b"b")]).unwrap();
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
        assert!(cache.is_cached("app"));
    }

    #[test]
    fn class_change_triggers_exactly_one_reload() {
        let flaky = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            stale: 1,
        });
        let cache = ResolverCache::new(flaky.clone());
        let tasks = cache
            .decode_all("app", &[Bytes::from_static(b"x"), Bytes::from_static(b"y")])
            .unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn second_class_change_is_reported() {
        let flaky = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            stale: usize::MAX,
        });
        let cache = ResolverCache::new(flaky.clone());
        let err = cache
            .decode_all("app", &[Bytes::from_static(b"x")])
            .err();
        assert_eq!(err, Some(ResolveError::ClassChanged("app".into())));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    }
}
