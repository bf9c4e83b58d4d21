//! 作业、任务包与任务计数
//!
//! `ServerJob`由`JobQueue`独占；`Bundle`只携带作业UUID作为非拥有的回引。

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};

use crate::drone::TaskOutcome;
use crate::proto::{BundleFrame, TaskEnvelope};
use crate::{BundleId, JobId, WorkerId};

/// 作业的服务等级约束
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobSla {
    /// 同时持有该作业任务包的节点数上限
    pub max_nodes: Option<usize>,
    /// 调度窗口起点，之前不派发
    pub start_at: Option<DateTime<Utc>>,
    /// 到期后自动取消
    pub expires_at: Option<DateTime<Utc>>,
    pub suspended: bool,
}

impl JobSla {
    pub fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = Some(max_nodes.max(1));
        self
    }

    pub fn with_start_at(mut self, start_at: DateTime<Utc>) -> Self {
        self.start_at = Some(start_at);
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn suspended(mut self, suspended: bool) -> Self {
        self.suspended = suspended;
        self
    }

    /// 当前时刻是否允许派发
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        !self.suspended && self.start_at.map_or(true, |start| now >= start)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |end| now >= end)
    }
}

/// 客户端提交的作业(或同UUID作业的追加部分)
#[derive(Debug, Clone)]
pub struct JobSubmission {
    pub id: JobId,
    pub name: String,
    pub app_id: String,
    pub priority: i32,
    pub sla: JobSla,
    pub data_provider: Bytes,
    pub tasks: Vec<Bytes>,
}

impl JobSubmission {
    pub fn new(name: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            id: JobId::new_v4(),
            name: name.into(),
            app_id: app_id.into(),
            priority: 0,
            sla: JobSla::default(),
            data_provider: Bytes::new(),
            tasks: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_sla(mut self, sla: JobSla) -> Self {
        self.sla = sla;
        self
    }

    pub fn with_data_provider(mut self, data: impl Into<Bytes>) -> Self {
        self.data_provider = data.into();
        self
    }

    pub fn with_task(mut self, task: impl Into<Bytes>) -> Self {
        self.tasks.push(task.into());
        self
    }

    pub fn with_tasks<I, T>(mut self, tasks: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        self.tasks.extend(tasks.into_iter().map(Into::into));
        self
    }
}

/// 队列中的单个任务
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPayload {
    /// 任务在作业内的位置，追加提交时继续编号
    pub position: u32,
    pub data: Bytes,
}

/// 从作业头部切出、派发给单个节点的连续任务
#[derive(Debug, Clone)]
pub struct Bundle {
    pub id: BundleId,
    pub job_id: JobId,
    pub job_name: String,
    pub app_id: String,
    pub priority: i32,
    pub data_provider: Bytes,
    pub tasks: Vec<TaskPayload>,
    pub worker: WorkerId,
    pub dispatched_at: Instant,
    /// 任务在队列中等待的时间
    pub queue_wait: Duration,
}

impl Bundle {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn positions(&self) -> impl Iterator<Item = u32> + '_ {
        self.tasks.iter().map(|t| t.position)
    }

    pub fn elapsed(&self) -> Duration {
        self.dispatched_at.elapsed()
    }

    pub fn to_frame(&self) -> BundleFrame {
        BundleFrame {
            job_uuid: self.job_id.to_string(),
            bundle_id: self.id,
            app_id: self.app_id.clone(),
            job_name: self.job_name.clone(),
            data_provider: self.data_provider.clone(),
            tasks: self
                .tasks
                .iter()
                .map(|t| TaskEnvelope {
                    position: t.position,
                    payload: t.data.clone(),
                })
                .collect(),
            priority: self.priority,
        }
    }
}

/// 作业的任务计数，任何时刻都满足
/// `queued + dispatched + completed + cancelled == submitted`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskAccounting {
    pub submitted: usize,
    pub queued: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub cancelled: usize,
}

impl TaskAccounting {
    pub fn is_balanced(&self) -> bool {
        self.queued + self.dispatched + self.completed + self.cancelled == self.submitted
    }

    /// 没有排队也没有在途的任务
    pub fn is_settled(&self) -> bool {
        self.queued == 0 && self.dispatched == 0
    }
}

/// 作业的最终结果
#[derive(Debug, Clone)]
pub struct JobResults {
    pub job_id: JobId,
    pub name: String,
    /// 按任务位置排序
    pub outcomes: BTreeMap<u32, TaskOutcome>,
    pub accounting: TaskAccounting,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl JobResults {
    pub fn outcome(&self, position: u32) -> Option<&TaskOutcome> {
        self.outcomes.get(&position)
    }

    pub fn outputs(&self) -> impl Iterator<Item = (u32, &Bytes)> + '_ {
        self.outcomes
            .iter()
            .filter_map(|(pos, outcome)| outcome.output().map(|o| (*pos, o)))
    }
}

type CompletionCallback = Box<dyn FnOnce(&JobResults) + Send>;

#[derive(Default)]
struct CompletionState {
    results: Option<Arc<JobResults>>,
    callbacks: Vec<CompletionCallback>,
}

/// 作业完成通知，多个`JobHandle`共享
#[derive(Default)]
pub(crate) struct JobCompletion {
    state: Mutex<CompletionState>,
    done: Condvar,
}

impl JobCompletion {
    /// 只生效一次；回调在锁外按注册顺序执行
    pub(crate) fn complete(&self, results: JobResults) {
        let results = Arc::new(results);
        let callbacks = {
            let mut state = self.state.lock();
            if state.results.is_some() {
                return;
            }
            state.results = Some(results.clone());
            std::mem::take(&mut state.callbacks)
        };
        self.done.notify_all();
        for callback in callbacks {
            callback(&results);
        }
    }
}

/// 提交者持有的作业句柄
#[derive(Clone)]
pub struct JobHandle {
    id: JobId,
    completion: Arc<JobCompletion>,
}

impl JobHandle {
    pub(crate) fn new(id: JobId, completion: Arc<JobCompletion>) -> Self {
        Self { id, completion }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn is_done(&self) -> bool {
        self.completion.state.lock().results.is_some()
    }

    pub fn results(&self) -> Option<Arc<JobResults>> {
        self.completion.state.lock().results.clone()
    }

    /// 阻塞直到作业完成或被取消
    pub fn wait(&self) -> Arc<JobResults> {
        let mut state = self.completion.state.lock();
        loop {
            if let Some(results) = &state.results {
                return results.clone();
            }
            self.completion.done.wait(&mut state);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Arc<JobResults>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.completion.state.lock();
        loop {
            if let Some(results) = &state.results {
                return Some(results.clone());
            }
            if self
                .completion
                .done
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.results.clone();
            }
        }
    }

    /// 注册完成回调；作业已完成时立即在当前线程执行
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&JobResults) + Send + 'static,
    {
        let mut state = self.completion.state.lock();
        match state.results.clone() {
            Some(results) => {
                drop(state);
                callback(&results);
            }
            None => state.callbacks.push(Box::new(callback)),
        }
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("done", &self.is_done())
            .finish()
    }
}

/// 作业状态快照
#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub priority: i32,
    pub sla: JobSla,
    pub cancelled: bool,
    pub accounting: TaskAccounting,
    /// 在途任务包所在的节点
    pub workers: Vec<WorkerId>,
    /// 作业进入队列至今的时间
    pub age: Duration,
}

/// 在途任务包
#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pub worker: WorkerId,
    pub tasks: Vec<TaskPayload>,
}

/// 队列内部的作业
pub(crate) struct ServerJob {
    pub id: JobId,
    pub name: String,
    pub app_id: String,
    pub priority: i32,
    pub sla: JobSla,
    pub data_provider: Bytes,
    pub queued: VecDeque<TaskPayload>,
    pub in_flight: HashMap<BundleId, InFlight>,
    pub outcomes: BTreeMap<u32, TaskOutcome>,
    pub accounting: TaskAccounting,
    pub cancelled: bool,
    pub next_position: u32,
    /// 所在的优先级桶，被完全取出时为None
    pub bucket: Option<i32>,
    /// 最大任务包统计中登记的排队数
    pub tracked_len: usize,
    pub created_at: Instant,
    /// 最近一次有任务进入队列的时间
    pub enqueued_at: Instant,
    pub completion: Arc<JobCompletion>,
}

impl ServerJob {
    pub fn new(submission: JobSubmission) -> Self {
        let now = Instant::now();
        let mut job = Self {
            id: submission.id,
            name: submission.name,
            app_id: submission.app_id,
            priority: submission.priority,
            sla: submission.sla,
            data_provider: submission.data_provider,
            queued: VecDeque::new(),
            in_flight: HashMap::new(),
            outcomes: BTreeMap::new(),
            accounting: TaskAccounting::default(),
            cancelled: false,
            next_position: 0,
            bucket: None,
            tracked_len: 0,
            created_at: now,
            enqueued_at: now,
            completion: Arc::new(JobCompletion::default()),
        };
        job.append(submission.tasks);
        job
    }

    /// 追加任务；作业已取消时新任务直接记为取消。返回追加数量
    pub fn append(&mut self, tasks: Vec<Bytes>) -> usize {
        let count = tasks.len();
        self.accounting.submitted += count;
        for data in tasks {
            let position = self.next_position;
            self.next_position += 1;
            if self.cancelled {
                self.outcomes.insert(position, TaskOutcome::Cancelled);
                self.accounting.cancelled += 1;
            } else {
                self.queued.push_back(TaskPayload { position, data });
                self.accounting.queued += 1;
            }
        }
        if count > 0 && !self.cancelled {
            self.enqueued_at = Instant::now();
        }
        count
    }

    /// 从头部取出最多`count`个任务
    pub fn take_front(&mut self, count: usize) -> Vec<TaskPayload> {
        let count = count.min(self.queued.len());
        let tasks: Vec<TaskPayload> = self.queued.drain(..count).collect();
        self.accounting.queued -= tasks.len();
        self.accounting.dispatched += tasks.len();
        tasks
    }

    /// 把任务放回队列头部，保持原有顺序
    pub fn push_front(&mut self, tasks: Vec<TaskPayload>) {
        let count = tasks.len();
        for task in tasks.into_iter().rev() {
            self.queued.push_front(task);
        }
        self.accounting.queued += count;
        self.enqueued_at = Instant::now();
    }

    /// 清空排队任务并记为取消
    pub fn cancel_queued(&mut self) -> usize {
        let drained: Vec<TaskPayload> = self.queued.drain(..).collect();
        self.accounting.queued -= drained.len();
        self.record_cancelled(&drained);
        drained.len()
    }

    pub fn record_cancelled(&mut self, tasks: &[TaskPayload]) {
        for task in tasks {
            self.outcomes.insert(task.position, TaskOutcome::Cancelled);
        }
        self.accounting.cancelled += tasks.len();
    }

    pub fn record(&mut self, position: u32, outcome: TaskOutcome) {
        if outcome.is_cancelled() {
            self.accounting.cancelled += 1;
        } else {
            self.accounting.completed += 1;
        }
        self.outcomes.insert(position, outcome);
    }

    /// 持有在途任务包的节点，去重
    pub fn workers(&self) -> Vec<WorkerId> {
        let set: HashSet<WorkerId> = self.in_flight.values().map(|f| f.worker).collect();
        let mut workers: Vec<WorkerId> = set.into_iter().collect();
        workers.sort();
        workers
    }

    /// `worker`能否再领取该作业的任务包
    pub fn accepts(&self, worker: WorkerId, now: DateTime<Utc>) -> bool {
        if self.cancelled || self.queued.is_empty() || !self.sla.is_ready(now) {
            return false;
        }
        match self.sla.max_nodes {
            None => true,
            Some(max) => {
                let workers = self.workers();
                workers.contains(&worker) || workers.len() < max
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.queued.is_empty() && self.in_flight.is_empty()
    }

    pub fn info(&self) -> JobInfo {
        JobInfo {
            id: self.id,
            name: self.name.clone(),
            priority: self.priority,
            sla: self.sla.clone(),
            cancelled: self.cancelled,
            accounting: self.accounting,
            workers: self.workers(),
            age: self.created_at.elapsed(),
        }
    }

    pub fn into_results(self) -> (Arc<JobCompletion>, JobResults) {
        let results = JobResults {
            job_id: self.id,
            name: self.name,
            outcomes: self.outcomes,
            accounting: self.accounting,
            cancelled: self.cancelled,
            elapsed: self.created_at.elapsed(),
        };
        (self.completion, results)
    }
}
