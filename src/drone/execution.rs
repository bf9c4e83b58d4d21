//! Drone端任务包执行管理
//!
//! 每个任务包拆成独立任务提交到线程池；全部任务结束(完成、失败、取消或超时)后
//! 一次性把整包结果交给`ResultSink`。任务状态只能从未开始/运行中单向进入结束，
//! 完成、取消、超时三条路径通过CAS竞争，只有胜者记录结果。

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::Sender;
use parking_lot::Mutex;

use super::pool::{panic_message, ThreadPool};
use super::task::{Task, TaskContext, TaskError, TaskOutcome};
use super::timer::{TimerHandle, TimerService, TokioTimer};
use crate::proto::{ResultsFrame, TaskResult};
use crate::stats::{labels, NoopStats, StatsSink};
use crate::{BundleId, JobId};

const NOT_STARTED: u8 = 0;
const RUNNING: u8 = 1;
const ENDED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BundleKey {
    pub job_id: JobId,
    pub bundle_id: BundleId,
}

impl BundleKey {
    pub fn new(job_id: JobId, bundle_id: BundleId) -> Self {
        Self { job_id, bundle_id }
    }
}

impl fmt::Display for BundleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.job_id, self.bundle_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleState {
    /// 已收到包头，任务尚在解析
    Pending,
    Running,
    Completed,
    Cancelled,
}

/// 一个任务包的完整结果
#[derive(Debug, Clone)]
pub struct BundleResult {
    pub key: BundleKey,
    pub state: BundleState,
    /// 按任务位置排列
    pub outcomes: Vec<(u32, TaskOutcome)>,
    /// 被取消的任务应回到协调端队列
    pub requeue: bool,
    pub elapsed: Duration,
}

impl BundleResult {
    pub fn to_frame(&self) -> ResultsFrame {
        ResultsFrame {
            job_uuid: self.key.job_id.to_string(),
            bundle_id: self.key.bundle_id,
            results: self
                .outcomes
                .iter()
                .map(|(position, outcome)| TaskResult::new(*position, outcome))
                .collect(),
            requeue: self.requeue,
            execution_nanos: u64::try_from(self.elapsed.as_nanos()).unwrap_or(u64::MAX),
            failure: None,
        }
    }
}

/// 整包结果的接收方
pub trait ResultSink: Send + Sync {
    fn bundle_finished(&self, result: BundleResult);
}

impl ResultSink for Sender<BundleResult> {
    fn bundle_finished(&self, result: BundleResult) {
        let key = result.key;
        if self.send(result).is_err() {
            log::warn!("Result channel closed, dropping results of bundle {}", key);
        }
    }
}

/// 已解码、可执行的任务包
pub struct MaterializedBundle {
    pub key: BundleKey,
    pub data_provider: Bytes,
    pub tasks: Vec<(u32, Arc<dyn Task>)>,
}

impl fmt::Debug for MaterializedBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaterializedBundle")
            .field("key", &self.key)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct CancelRequest {
    call_on_cancel: bool,
    requeue: bool,
}

struct TaskSlot {
    position: u32,
    task: Arc<dyn Task>,
    state: AtomicU8,
    interrupted: Arc<AtomicBool>,
    outcome: Mutex<Option<TaskOutcome>>,
    timer: Mutex<Option<TimerHandle>>,
}

struct BundleEntry {
    key: BundleKey,
    data_provider: Bytes,
    slots: Vec<Arc<TaskSlot>>,
    remaining: AtomicUsize,
    cancelled: AtomicBool,
    requeue: AtomicBool,
    started: Instant,
}

#[derive(Default)]
struct Registry {
    /// 已收到包头、尚未开始执行；值为执行前到达的取消请求
    pending: HashMap<BundleKey, Option<CancelRequest>>,
    entries: HashMap<BundleKey, Arc<BundleEntry>>,
}

struct Shared {
    registry: Mutex<Registry>,
    sink: Arc<dyn ResultSink>,
    timer: Arc<dyn TimerService>,
    stats: Arc<dyn StatsSink>,
}

/// 任务包执行管理器
pub struct ExecutionManager {
    shared: Arc<Shared>,
    pool: ThreadPool,
}

impl ExecutionManager {
    /// 使用tokio定时器和空统计
    pub fn new(threads: usize, sink: Arc<dyn ResultSink>) -> io::Result<Self> {
        let timer = Arc::new(TokioTimer::new()?);
        Ok(Self::with_services(threads, sink, timer, Arc::new(NoopStats)))
    }

    pub fn with_services(
        threads: usize,
        sink: Arc<dyn ResultSink>,
        timer: Arc<dyn TimerService>,
        stats: Arc<dyn StatsSink>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                sink,
                timer,
                stats,
            }),
            pool: ThreadPool::new(threads),
        }
    }

    /// 登记一个刚收到、尚在解析的任务包，使其可被取消
    pub fn add_pending_entry(&self, key: BundleKey) {
        self.shared.registry.lock().pending.entry(key).or_insert(None);
    }

    /// 任务代码无法解析时以同一错误结束包内所有任务
    pub fn fail_pending(&self, key: BundleKey, positions: &[u32], error: TaskError) {
        self.shared.registry.lock().pending.remove(&key);
        log::warn!("Bundle {} failed before execution: {}", key, error);
        self.shared.sink.bundle_finished(BundleResult {
            key,
            state: BundleState::Completed,
            outcomes: positions
                .iter()
                .map(|p| (*p, TaskOutcome::Failed(error.clone())))
                .collect(),
            requeue: false,
            elapsed: Duration::ZERO,
        });
    }

    pub fn execute(&self, bundle: MaterializedBundle) {
        let MaterializedBundle {
            key,
            data_provider,
            tasks,
        } = bundle;
        let slots: Vec<Arc<TaskSlot>> = tasks
            .into_iter()
            .map(|(position, task)| {
                Arc::new(TaskSlot {
                    position,
                    task,
                    state: AtomicU8::new(NOT_STARTED),
                    interrupted: Arc::new(AtomicBool::new(false)),
                    outcome: Mutex::new(None),
                    timer: Mutex::new(None),
                })
            })
            .collect();
        let entry = Arc::new(BundleEntry {
            key,
            data_provider,
            remaining: AtomicUsize::new(slots.len()),
            slots,
            cancelled: AtomicBool::new(false),
            requeue: AtomicBool::new(false),
            started: Instant::now(),
        });

        if entry.slots.is_empty() {
            self.shared.registry.lock().pending.remove(&key);
            self.shared.complete_bundle(&entry);
            return;
        }

        let early_cancel = {
            let mut registry = self.shared.registry.lock();
            let request = registry.pending.remove(&key).flatten();
            registry.entries.insert(key, entry.clone());
            request
        };
        log::debug!("Executing bundle {} with {} tasks", key, entry.slots.len());

        if let Some(request) = early_cancel {
            self.shared.cancel_entry(&entry, request);
            return;
        }

        for slot in &entry.slots {
            let shared = self.shared.clone();
            let job_entry = entry.clone();
            let job_slot = slot.clone();
            let submitted = self
                .pool
                .execute(move || shared.run_slot(&job_entry, &job_slot));
            if submitted.is_err() {
                let reason = TaskError::Failed("execution thread pool is shut down".to_string());
                self.shared
                    .end_slot(&entry, slot, NOT_STARTED, || TaskOutcome::Failed(reason));
            }
        }
    }

    /// 取消某作业在本节点上的全部任务包，返回受影响的包数
    ///
    /// 重复取消没有额外效果。
    pub fn cancel_job(&self, job_id: JobId, call_on_cancel: bool, requeue: bool) -> usize {
        let request = CancelRequest {
            call_on_cancel,
            requeue,
        };
        let (entries, pending) = {
            let mut registry = self.shared.registry.lock();
            let mut pending = 0;
            for (key, slot) in registry.pending.iter_mut() {
                if key.job_id == job_id && slot.is_none() {
                    *slot = Some(request);
                    pending += 1;
                }
            }
            let entries: Vec<Arc<BundleEntry>> = registry
                .entries
                .values()
                .filter(|e| e.key.job_id == job_id)
                .cloned()
                .collect();
            (entries, pending)
        };
        // 结束任务可能触发整包完成，而完成会再次获取登记表锁
        let mut affected = pending;
        for entry in entries {
            if self.shared.cancel_entry(&entry, request) {
                affected += 1;
            }
        }
        if affected > 0 {
            log::info!("Cancelled {} bundles of job {}", affected, job_id);
        }
        affected
    }

    pub fn set_thread_pool_size(&self, size: usize) {
        self.pool.resize(size);
    }

    pub fn thread_pool_size(&self) -> usize {
        self.pool.size()
    }

    pub fn state(&self, key: &BundleKey) -> Option<BundleState> {
        let registry = self.shared.registry.lock();
        if registry.pending.contains_key(key) {
            return Some(BundleState::Pending);
        }
        registry.entries.get(key).map(|entry| {
            if entry.cancelled.load(Ordering::Acquire) {
                BundleState::Cancelled
            } else {
                BundleState::Running
            }
        })
    }

    /// 尚未回报结果的任务包数(含解析中的)
    pub fn active_bundles(&self) -> usize {
        let registry = self.shared.registry.lock();
        registry.pending.len() + registry.entries.len()
    }

    /// 停止线程池并等待正在执行的任务结束
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

impl Shared {
    fn run_slot(self: &Arc<Self>, entry: &Arc<BundleEntry>, slot: &Arc<TaskSlot>) {
        if slot
            .state
            .compare_exchange(NOT_STARTED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if let Some(timeout) = slot.task.timeout() {
            let handle = self.schedule_timeout(entry, slot, timeout);
            *slot.timer.lock() = Some(handle);
        }
        let ctx = TaskContext::new(entry.key.job_id, slot.position, entry.data_provider.clone())
            .with_interrupt(slot.interrupted.clone());
        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| slot.task.run(&ctx)));
        self.stats.add_value(
            labels::DRONE_TASK_ELAPSED,
            started.elapsed().as_secs_f64() * 1000.0,
        );
        let outcome = match result {
            Ok(Ok(output)) => TaskOutcome::Completed(output),
            Ok(Err(err)) => TaskOutcome::Failed(err),
            Err(cause) => {
                let message = panic_message(&cause);
                log::error!(
                    "Task {} of bundle {} panicked: {}",
                    slot.position,
                    entry.key,
                    message
                );
                TaskOutcome::Failed(TaskError::Panicked(message))
            }
        };
        self.end_slot(entry, slot, RUNNING, move || outcome);
    }

    fn schedule_timeout(
        self: &Arc<Self>,
        entry: &Arc<BundleEntry>,
        slot: &Arc<TaskSlot>,
        timeout: Duration,
    ) -> TimerHandle {
        let shared: Weak<Shared> = Arc::downgrade(self);
        let entry = entry.clone();
        let slot = slot.clone();
        self.timer.schedule(
            timeout,
            Box::new(move || {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                let timed_out = slot.clone();
                shared.end_slot(&entry, &slot, RUNNING, move || {
                    log::warn!("Task {} timed out", timed_out.position);
                    timed_out.task.on_timeout();
                    if timed_out.task.interruptible() {
                        timed_out.interrupted.store(true, Ordering::Release);
                    }
                    TaskOutcome::TimedOut
                });
            }),
        )
    }

    /// 把任务从`from`状态结束；只有赢得CAS的一方执行`outcome`并记录结果
    fn end_slot<F>(&self, entry: &Arc<BundleEntry>, slot: &TaskSlot, from: u8, outcome: F) -> bool
    where
        F: FnOnce() -> TaskOutcome,
    {
        if slot
            .state
            .compare_exchange(from, ENDED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Some(handle) = slot.timer.lock().take() {
            self.timer.cancel(handle);
        }
        let outcome = outcome();
        *slot.outcome.lock() = Some(outcome);
        if entry.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.complete_bundle(entry);
        }
        true
    }

    /// 返回false表示该包此前已被取消
    fn cancel_entry(&self, entry: &Arc<BundleEntry>, request: CancelRequest) -> bool {
        if entry.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        entry.requeue.store(request.requeue, Ordering::Release);
        for slot in &entry.slots {
            // 未开始的任务直接结束，不调用任务体
            if self.end_slot(entry, slot, NOT_STARTED, || TaskOutcome::Cancelled) {
                continue;
            }
            self.end_slot(entry, slot, RUNNING, || {
                if request.call_on_cancel {
                    slot.task.on_cancel();
                }
                if slot.task.interruptible() {
                    slot.interrupted.store(true, Ordering::Release);
                }
                TaskOutcome::Cancelled
            });
        }
        true
    }

    fn complete_bundle(&self, entry: &Arc<BundleEntry>) {
        self.registry.lock().entries.remove(&entry.key);
        let cancelled = entry.cancelled.load(Ordering::Acquire);
        let outcomes: Vec<(u32, TaskOutcome)> = entry
            .slots
            .iter()
            .map(|slot| {
                let outcome = slot
                    .outcome
                    .lock()
                    .take()
                    .unwrap_or(TaskOutcome::Failed(TaskError::Missing));
                (slot.position, outcome)
            })
            .collect();
        let elapsed = entry.started.elapsed();
        self.stats.add_value(labels::DRONE_BUNDLES, 1.0);
        log::debug!(
            "Bundle {} finished in {:?} (cancelled: {})",
            entry.key,
            elapsed,
            cancelled
        );
        self.sink.bundle_finished(BundleResult {
            key: entry.key,
            state: if cancelled {
                BundleState::Cancelled
            } else {
                BundleState::Completed
            },
            outcomes,
            requeue: cancelled && entry.requeue.load(Ordering::Acquire),
            elapsed,
        });
    }
}

impl fmt::Debug for ExecutionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionManager")
            .field("pool", &self.pool)
            .field("active_bundles", &self.active_bundles())
            .finish()
    }
}
