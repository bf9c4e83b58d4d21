//! 延时回调服务
//!
//! 任务超时由此触发。默认实现基于tokio运行时的定时器，
//! 回调在定时器线程上同步执行，应当尽快返回。

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Runtime};
use tokio::task::AbortHandle;

/// 已安排回调的句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

pub type TimerAction = Box<dyn FnOnce() + Send + 'static>;

pub trait TimerService: Send + Sync {
    fn schedule(&self, delay: Duration, action: TimerAction) -> TimerHandle;

    /// 取消尚未触发的回调；已触发或已取消时返回false
    fn cancel(&self, handle: TimerHandle) -> bool;
}

/// 基于tokio的定时器
pub struct TokioTimer {
    runtime: Option<Runtime>,
    pending: Arc<Mutex<HashMap<u64, AbortHandle>>>,
    next_id: AtomicU64,
}

impl TokioTimer {
    pub fn new() -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("zerg-timer")
            .enable_time()
            .build()?;
        Ok(Self {
            runtime: Some(runtime),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl TimerService for TokioTimer {
    fn schedule(&self, delay: Duration, action: TimerAction) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = TimerHandle(id);
        let Some(runtime) = self.runtime.as_ref() else {
            return handle;
        };
        // 持锁直到登记完成，避免回调先于登记触发而被当作已取消
        let mut pending = self.pending.lock();
        let registry = self.pending.clone();
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if registry.lock().remove(&id).is_some() {
                action();
            }
        });
        pending.insert(id, task.abort_handle());
        handle
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        match self.pending.lock().remove(&handle.0) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// 手动触发的定时器，测试用
#[cfg(test)]
#[derive(Default)]
pub(crate) struct ManualTimer {
    pending: Mutex<Vec<(u64, Duration, TimerAction)>>,
    next_id: AtomicU64,
}

#[cfg(test)]
impl ManualTimer {
    pub(crate) fn scheduled(&self) -> Vec<Duration> {
        self.pending.lock().iter().map(|(_, d, _)| *d).collect()
    }

    /// 触发所有已安排的回调
    pub(crate) fn fire_all(&self) -> usize {
        let due: Vec<_> = self.pending.lock().drain(..).collect();
        let fired = due.len();
        for (_, _, action) in due {
            action();
        }
        fired
    }
}

#[cfg(test)]
impl TimerService for ManualTimer {
    fn schedule(&self, delay: Duration, action: TimerAction) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().push((id, delay, action));
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|(id, _, _)| *id != handle.0);
        pending.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn fires_after_delay() {
        let timer = TokioTimer::new().unwrap();
        let (tx, rx) = bounded(1);
        timer.schedule(
            Duration::from_millis(20),
            Box::new(move || tx.send("fired").unwrap()),
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "fired");
        assert_eq!(timer.pending_count(), 0);
    }

    #[test]
    fn cancelled_action_never_runs() {
        let timer = TokioTimer::new().unwrap();
        let (tx, rx) = bounded::<()>(1);
        let handle = timer.schedule(
            Duration::from_millis(50),
            Box::new(move || tx.send(()).unwrap()),
        );
        assert!(timer.cancel(handle));
        assert!(!timer.cancel(handle));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn manual_timer_fires_on_demand() {
        let timer = ManualTimer::default();
        let hits = Arc::new(AtomicU64::new(0));
        let h = hits.clone();
        timer.schedule(Duration::from_secs(1), Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        let cancelled = timer.schedule(Duration::from_secs(2), Box::new(|| unreachable!()));
        assert!(timer.cancel(cancelled));
        assert_eq!(timer.scheduled(), vec![Duration::from_secs(1)]);
        assert_eq!(timer.fire_all(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
