//! 任务抽象与执行结果

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::JobId;

/// 单个任务执行失败的原因
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(String),
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("task code could not be resolved: {0}")]
    Resolve(String),
    #[error("drone returned no result for this task")]
    Missing,
}

impl TaskError {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskError::Failed(_) => "failed",
            TaskError::Panicked(_) => "panicked",
            TaskError::Resolve(_) => "resolve",
            TaskError::Missing => "missing",
        }
    }

    pub fn message(&self) -> String {
        match self {
            TaskError::Failed(m) | TaskError::Panicked(m) | TaskError::Resolve(m) => m.clone(),
            TaskError::Missing => String::new(),
        }
    }

    pub fn from_parts(kind: &str, message: &str) -> Self {
        match kind {
            "panicked" => TaskError::Panicked(message.to_string()),
            "resolve" => TaskError::Resolve(message.to_string()),
            "missing" => TaskError::Missing,
            _ => TaskError::Failed(message.to_string()),
        }
    }
}

/// 任务的最终结果
///
/// 取消与超时不是错误，与抛出异常的失败分开表示。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed(Bytes),
    Failed(TaskError),
    Cancelled,
    TimedOut,
}

impl TaskOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskOutcome::Cancelled)
    }

    pub fn output(&self) -> Option<&Bytes> {
        match self {
            TaskOutcome::Completed(output) => Some(output),
            _ => None,
        }
    }
}

/// 任务运行时上下文
#[derive(Debug, Clone)]
pub struct TaskContext {
    job_id: JobId,
    position: u32,
    data_provider: Bytes,
    interrupted: Arc<AtomicBool>,
}

impl TaskContext {
    pub fn new(job_id: JobId, position: u32, data_provider: Bytes) -> Self {
        Self {
            job_id,
            position,
            data_provider,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupted = flag;
        self
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    /// 作业内所有任务共享的只读数据
    pub fn data_provider(&self) -> &Bytes {
        &self.data_provider
    }

    /// 可中断任务应定期检查此标志并尽快返回
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }
}

/// 可在Drone上执行的任务
///
/// 回调方法以`&self`调用：取消回调可能在任务运行的同时从其他线程触发。
pub trait Task: Send + Sync {
    fn run(&self, ctx: &TaskContext) -> Result<Bytes, TaskError>;

    /// 取消时的清理钩子
    fn on_cancel(&self) {}

    /// 超时时的清理钩子
    fn on_timeout(&self) {}

    /// 为false时取消不会设置中断标志，任务运行到结束
    fn interruptible(&self) -> bool {
        true
    }

    fn timeout(&self) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_parts_survive_the_wire_shape() {
        for err in [
            TaskError::Failed("boom".into()),
            TaskError::Panicked("index out of bounds".into()),
            TaskError::Resolve("class changed".into()),
            TaskError::Missing,
        ] {
            assert_eq!(TaskError::from_parts(err.kind(), &err.message()), err);
        }
    }

    #[test]
    fn context_interrupt_flag_is_shared() {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = TaskContext::new(JobId::nil(), 3, Bytes::new()).with_interrupt(flag.clone());
        assert!(!ctx.is_interrupted());
        flag.store(true, Ordering::Release);
        assert!(ctx.is_interrupted());
        assert_eq!(ctx.position(), 3);
    }
}
