//! Queen(协调端)
//!
//! `JobQueue`保存作业，`Dispatcher`在单个反应器线程上驱动所有
//! `WorkerChannel`，按负载均衡算法把作业切成任务包派发给Drone。

pub mod channel;
pub mod dispatcher;
pub mod job;
pub mod queue;

pub use channel::{ChannelEvent, ChannelState, ReadBatch, WorkerChannel};
pub use dispatcher::{Dispatcher, DispatcherHandle};
pub use job::{
    Bundle, JobHandle, JobInfo, JobResults, JobSla, JobSubmission, TaskAccounting, TaskPayload,
};
pub use queue::{BundleCompletion, CancelReport, JobQueue, QueueError, QueueEvent, QueueListener};
