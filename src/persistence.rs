//! 负载均衡器状态持久化接口
//!
//! 以`(算法哈希, 通道标识)`为键保存各通道的Bundler状态，仅用于重启后的热启动。
//! 未配置存储时调度结果不受影响。

use std::collections::HashMap;

use parking_lot::Mutex;

#[derive(thiserror::Error, Debug)]
pub enum PersistenceError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("state encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

/// 持久化存储键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
    pub algorithm_hash: String,
    pub channel_identity: String,
}

impl StateKey {
    pub fn new(algorithm_hash: impl Into<String>, channel_identity: impl Into<String>) -> Self {
        Self {
            algorithm_hash: algorithm_hash.into(),
            channel_identity: channel_identity.into(),
        }
    }
}

pub trait BundlerStore: Send + Sync {
    fn load(&self, key: &StateKey) -> Result<Option<Vec<u8>>, PersistenceError>;
    fn store(&self, key: &StateKey, state: &[u8]) -> Result<(), PersistenceError>;
}

/// 进程内存储，主要用于测试
#[derive(Debug, Default)]
pub struct MemoryBundlerStore {
    entries: Mutex<HashMap<StateKey, Vec<u8>>>,
}

impl MemoryBundlerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl BundlerStore for MemoryBundlerStore {
    fn load(&self, key: &StateKey) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn store(&self, key: &StateKey, state: &[u8]) -> Result<(), PersistenceError> {
        self.entries.lock().insert(key.clone(), state.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_scoped_by_algorithm_and_channel() {
        let store = MemoryBundlerStore::new();
        let a = StateKey::new("h1", "drone-a");
        let b = StateKey::new("h2", "drone-a");
        store.store(&a, b"one").unwrap();

        assert_eq!(store.load(&a).unwrap().as_deref(), Some(&b"one"[..]));
        assert!(store.load(&b).unwrap().is_none());
        assert_eq!(store.len(), 1);
    }
}
