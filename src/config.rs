//! 网格配置
//!
//! 所有配置项均可从JSON加载，缺省字段取默认值。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 默认最大帧长度(64 MiB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// 负载均衡属性的命名空间前缀
pub const LOAD_BALANCING_PREFIX: &str = "zerg.load.balancing.profile";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Queen(协调端)配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueenConfig {
    pub listen_addr: SocketAddr,
    /// 单帧负载上限，超过即视为协议错误
    pub max_frame_len: usize,
    /// 反应器轮询超时，同时也是SLA过期检查的周期
    pub poll_interval_ms: u64,
    pub events_capacity: usize,
}

impl Default for QueenConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 11111)),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            poll_interval_ms: 100,
            events_capacity: 1024,
        }
    }
}

impl QueenConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Drone(工作端)配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DroneConfig {
    pub queen_addr: String,
    /// 执行线程数，默认取CPU核心数
    pub threads: usize,
    pub max_frame_len: usize,
    /// 持久化关联用的节点标识，不设置则每次启动随机生成
    pub worker_uuid: Option<String>,
}

impl Default for DroneConfig {
    fn default() -> Self {
        Self {
            queen_addr: "127.0.0.1:11111".to_string(),
            threads: num_cpus::get(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            worker_uuid: None,
        }
    }
}

impl DroneConfig {
    pub fn new(queen_addr: impl Into<String>) -> Self {
        Self {
            queen_addr: queen_addr.into(),
            ..Default::default()
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_worker_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.worker_uuid = Some(uuid.into());
        self
    }
}

/// 负载均衡配置
///
/// `properties`为扁平键值对，键形如
/// `zerg.load.balancing.profile.<algorithm>.<param>`。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancingConfig {
    pub algorithm: String,
    pub properties: HashMap<String, String>,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            algorithm: "manual".to_string(),
            properties: HashMap::new(),
        }
    }
}

impl LoadBalancingConfig {
    pub fn new(algorithm: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            properties: HashMap::new(),
        }
    }

    /// 为当前算法设置一个参数，自动补全命名空间前缀
    pub fn with_param(mut self, name: &str, value: impl ToString) -> Self {
        let key = format!("{}.{}.{}", LOAD_BALANCING_PREFIX, self.algorithm, name);
        self.properties.insert(key, value.to_string());
        self
    }

    /// 当前算法的属性前缀
    pub fn prefix(&self) -> String {
        format!("{}.{}.", LOAD_BALANCING_PREFIX, self.algorithm)
    }
}

/// 网格完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub queen: QueenConfig,
    pub drone: DroneConfig,
    pub load_balancing: LoadBalancingConfig,
}

impl GridConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: GridConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.drone.threads == 0 {
            return Err(ConfigError::Invalid {
                key: "drone.threads",
                reason: "must be at least 1".to_string(),
            });
        }
        for (key, len) in [
            ("queen.max_frame_len", self.queen.max_frame_len),
            ("drone.max_frame_len", self.drone.max_frame_len),
        ] {
            if len < 1024 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: format!("{} is below the 1024 byte minimum", len),
                });
            }
        }
        if self.load_balancing.algorithm.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "load_balancing.algorithm",
                reason: "empty algorithm name".to_string(),
            });
        }
        Ok(())
    }
}
