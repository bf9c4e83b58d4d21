//! 工蜂(Drone)节点实现模块

pub mod execution;
pub mod network;
pub mod pool;
pub mod task;
pub mod timer;

pub use execution::{
    BundleKey, BundleResult, BundleState, ExecutionManager, MaterializedBundle, ResultSink,
};
pub use network::{DroneNode, DroneSession, DroneStopper};
pub use pool::{PoolError, ThreadPool};
pub use task::{Task, TaskContext, TaskError, TaskOutcome};
pub use timer::{TimerHandle, TimerService, TokioTimer};
