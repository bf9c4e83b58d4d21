//! ZergGrid 核心库入口
//!
//! Queen(协调端)负责作业排队、按负载均衡算法切分任务包并分发给Drone；
//! Drone(工作端)在线程池中执行任务包并批量回传结果。

pub mod balancer;
pub mod codec;
pub mod config;
pub mod drone;
pub mod persistence;
pub mod proto;
pub mod queen;
pub mod stats;

use std::fmt;

/// 作业标识类型
pub type JobId = uuid::Uuid;

/// 任务包标识类型(协调端内单调递增)
pub type BundleId = u64;

/// 工作节点连接标识
///
/// 由Dispatcher在接受连接时分配，连接断开后不会复用。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "drone-{}", self.0)
    }
}

use crate::balancer::BundlerError;
use crate::codec::ResolveError;
use crate::config::ConfigError;
use crate::proto::FrameError;
use crate::queen::QueueError;

/// 通用错误类型
#[derive(thiserror::Error, Debug)]
pub enum GridError {
    #[error("网络通信错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("协议帧错误: {0}")]
    Frame(#[from] FrameError),

    #[error("作业队列错误: {0}")]
    Queue(#[from] QueueError),

    #[error("负载均衡配置错误: {0}")]
    Bundler(#[from] BundlerError),

    #[error("代码解析错误: {0}")]
    Resolve(#[from] ResolveError),

    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    #[error("调度器已关闭")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, GridError>;

// 公开导出模块的公共接口
pub use balancer::{Bundler, BundlerFactory, Feedback, Profile};
pub use config::{DroneConfig, GridConfig, LoadBalancingConfig, QueenConfig};
pub use drone::{DroneNode, ExecutionManager, Task, TaskContext, TaskOutcome};
pub use queen::{Dispatcher, DispatcherHandle, JobHandle, JobQueue, JobSubmission, WorkerChannel};
pub use stats::{JobStatistics, StatsSink};
