//! 优先级作业队列
//!
//! 优先级桶按降序排列，桶内先进先出。作业被部分取出后移到所在桶的末尾，
//! 使同优先级作业轮流获得派发；被完全取出的作业离开桶结构，直到有任务回队。
//! 所有修改都在一把队列锁内完成，监听器通知与作业完成回调在锁外执行。

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, RwLock};

use super::job::{
    Bundle, InFlight, JobCompletion, JobHandle, JobInfo, JobResults, JobSubmission, ServerJob,
    TaskAccounting,
};
use crate::balancer::BundlerContext;
use crate::drone::{TaskError, TaskOutcome};
use crate::stats::{labels, NoopStats, StatsSink};
use crate::{BundleId, JobId, WorkerId};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("job {0} is not in the queue")]
    UnknownJob(JobId),
    #[error("bundle {bundle} of job {job} is not in flight")]
    UnknownBundle { job: JobId, bundle: BundleId },
    #[error("job {job} was cancelled, {dropped} returned tasks dropped")]
    JobCancelled { job: JobId, dropped: usize },
    #[error("job {job} still has {dispatched} dispatched tasks")]
    JobBusy { job: JobId, dispatched: usize },
}

/// 队列状态变化通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    JobAdded { job: JobId, priority: i32 },
    /// 有新任务可派发或作业属性变化
    JobUpdated { job: JobId },
    /// `in_flight`为仍持有该作业任务包的节点
    JobCancelled { job: JobId, in_flight: Vec<WorkerId> },
    /// `in_flight`为需要召回任务包的节点
    JobSuspended { job: JobId, in_flight: Vec<WorkerId> },
    JobRemoved { job: JobId, cancelled: bool },
}

pub trait QueueListener: Send + Sync {
    fn on_event(&self, event: &QueueEvent);
}

/// 处理一个任务包结果后的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BundleCompletion {
    pub completed: usize,
    pub cancelled: usize,
    pub requeued: usize,
    /// 作业因此完成并已移出队列
    pub finished: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancelReport {
    /// 作业之前已被取消，本次调用没有任何效果
    pub already_cancelled: bool,
    /// 从队列中直接取消的任务数
    pub dropped: usize,
    pub in_flight: Vec<WorkerId>,
}

/// 锁外执行的后续动作
#[derive(Default)]
struct Deferred {
    events: Vec<QueueEvent>,
    stats: Vec<(&'static str, f64)>,
    finished: Vec<ServerJob>,
}

type Buckets = BTreeMap<Reverse<i32>, VecDeque<JobId>>;

#[derive(Default)]
struct QueueInner {
    jobs: HashMap<JobId, ServerJob>,
    buckets: Buckets,
    /// 已移出但结果尚未定稿的作业
    removing: HashSet<JobId>,
    next_bundle_id: BundleId,
    /// 各作业排队任务数的多重集合
    sizes: BTreeMap<usize, usize>,
}

fn unbucket(buckets: &mut Buckets, job: &mut ServerJob) {
    if let Some(priority) = job.bucket.take() {
        if let Some(list) = buckets.get_mut(&Reverse(priority)) {
            list.retain(|id| *id != job.id);
            if list.is_empty() {
                buckets.remove(&Reverse(priority));
            }
        }
    }
}

/// 按当前优先级重新放入桶，`front`为true时插到桶头
fn rebucket(buckets: &mut Buckets, job: &mut ServerJob, front: bool) {
    unbucket(buckets, job);
    if job.queued.is_empty() || job.cancelled {
        return;
    }
    let list = buckets.entry(Reverse(job.priority)).or_default();
    if front {
        list.push_front(job.id);
    } else {
        list.push_back(job.id);
    }
    job.bucket = Some(job.priority);
}

fn track(sizes: &mut BTreeMap<usize, usize>, job: &mut ServerJob) {
    let len = if job.cancelled { 0 } else { job.queued.len() };
    if len == job.tracked_len {
        return;
    }
    if job.tracked_len > 0 {
        if let Some(count) = sizes.get_mut(&job.tracked_len) {
            *count -= 1;
            if *count == 0 {
                sizes.remove(&job.tracked_len);
            }
        }
    }
    if len > 0 {
        *sizes.entry(len).or_insert(0) += 1;
    }
    job.tracked_len = len;
}

impl QueueInner {
    fn job_mut(&mut self, id: &JobId) -> Result<&mut ServerJob, QueueError> {
        self.jobs.get_mut(id).ok_or(QueueError::UnknownJob(*id))
    }

    fn max_len(&self) -> usize {
        self.sizes.keys().next_back().copied().unwrap_or(0)
    }

    /// 把作业移出队列，完成通知在锁外进行
    fn finish(&mut self, id: &JobId, deferred: &mut Deferred) {
        if let Some(mut job) = self.jobs.remove(id) {
            unbucket(&mut self.buckets, &mut job);
            job.cancel_queued();
            track(&mut self.sizes, &mut job);
            self.removing.insert(*id);
            deferred.finished.push(job);
        }
    }

    fn carve(&mut self, id: &JobId, desired: usize, worker: WorkerId) -> Option<Bundle> {
        let bundle_id = self.next_bundle_id;
        let job = self.jobs.get_mut(id)?;
        let queue_wait = job.enqueued_at.elapsed();
        let tasks = job.take_front(desired.max(1));
        if !tasks.is_empty() {
            job.in_flight.insert(
                bundle_id,
                InFlight {
                    worker,
                    tasks: tasks.clone(),
                },
            );
        }
        rebucket(&mut self.buckets, job, false);
        track(&mut self.sizes, job);
        let bundle = Bundle {
            id: bundle_id,
            job_id: job.id,
            job_name: job.name.clone(),
            app_id: job.app_id.clone(),
            priority: job.priority,
            data_provider: job.data_provider.clone(),
            tasks,
            worker,
            dispatched_at: std::time::Instant::now(),
            queue_wait,
        };
        self.next_bundle_id += 1;
        Some(bundle)
    }

    fn cancel(&mut self, id: &JobId, deferred: &mut Deferred) -> Result<CancelReport, QueueError> {
        let job = self.jobs.get_mut(id).ok_or(QueueError::UnknownJob(*id))?;
        if job.cancelled {
            return Ok(CancelReport {
                already_cancelled: true,
                ..Default::default()
            });
        }
        job.cancelled = true;
        let dropped = job.cancel_queued();
        unbucket(&mut self.buckets, job);
        track(&mut self.sizes, job);
        let in_flight = job.workers();
        let finished = job.is_finished();
        log::info!(
            "Job {} cancelled: {} queued tasks dropped, {} drones holding bundles",
            id,
            dropped,
            in_flight.len()
        );
        deferred.events.push(QueueEvent::JobCancelled {
            job: *id,
            in_flight: in_flight.clone(),
        });
        if finished {
            self.finish(id, deferred);
        }
        Ok(CancelReport {
            already_cancelled: false,
            dropped,
            in_flight,
        })
    }
}

pub struct JobQueue {
    inner: Mutex<QueueInner>,
    removed: Condvar,
    listeners: RwLock<Vec<Arc<dyn QueueListener>>>,
    stats: Arc<dyn StatsSink>,
    max_bundle_size: AtomicUsize,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_stats(Arc::new(NoopStats))
    }

    pub fn with_stats(stats: Arc<dyn StatsSink>) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            removed: Condvar::new(),
            listeners: RwLock::new(Vec::new()),
            stats,
            max_bundle_size: AtomicUsize::new(0),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn QueueListener>) {
        self.listeners.write().push(listener);
    }

    pub fn stats(&self) -> &Arc<dyn StatsSink> {
        &self.stats
    }

    /// 加入作业，或把任务追加到同UUID的已有作业
    ///
    /// 同UUID作业正在移出时阻塞，直到其结果定稿并离开队列。
    pub fn add_bundle(&self, submission: JobSubmission) -> JobHandle {
        let id = submission.id;
        let mut deferred = Deferred::default();
        let handle = {
            let mut guard = self.inner.lock();
            while guard.removing.contains(&id) {
                log::debug!("Job {} is being removed, waiting before merge", id);
                self.removed.wait(&mut guard);
            }
            let inner = &mut *guard;
            let handle = match inner.jobs.get_mut(&id) {
                Some(job) => {
                    let added = job.append(submission.tasks);
                    log::info!("Merged {} tasks into job {} ({})", added, id, job.name);
                    if job.bucket.is_none() {
                        rebucket(&mut inner.buckets, job, false);
                    }
                    track(&mut inner.sizes, job);
                    deferred.stats.push((labels::JOB_TASKS, added as f64));
                    deferred.events.push(QueueEvent::JobUpdated { job: id });
                    JobHandle::new(id, job.completion.clone())
                }
                None => {
                    let mut job = ServerJob::new(submission);
                    log::info!(
                        "Job {} ({}) queued with {} tasks at priority {}",
                        id,
                        job.name,
                        job.accounting.submitted,
                        job.priority
                    );
                    rebucket(&mut inner.buckets, &mut job, false);
                    track(&mut inner.sizes, &mut job);
                    deferred.stats.push((labels::JOB_ADDED, 1.0));
                    deferred
                        .stats
                        .push((labels::JOB_TASKS, job.accounting.submitted as f64));
                    deferred.events.push(QueueEvent::JobAdded {
                        job: id,
                        priority: job.priority,
                    });
                    let handle = JobHandle::new(id, job.completion.clone());
                    let empty = job.accounting.submitted == 0;
                    inner.jobs.insert(id, job);
                    if empty {
                        inner.finish(&id, &mut deferred);
                    }
                    handle
                }
            };
            self.refresh_max(inner);
            handle
        };
        self.flush(deferred);
        handle
    }

    /// 选出`worker`可领取的最高优先级作业并切出任务包
    ///
    /// 选择与切分在同一次加锁内完成。`size`只在选中作业后调用一次。
    pub fn poll_bundle<F>(&self, worker: WorkerId, size: F) -> Option<Bundle>
    where
        F: FnOnce() -> usize,
    {
        let now = Utc::now();
        let mut deferred = Deferred::default();
        let bundle = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let id = inner
                .buckets
                .values()
                .flat_map(|list| list.iter())
                .find(|id| {
                    inner
                        .jobs
                        .get(id)
                        .map_or(false, |job| job.accepts(worker, now))
                })
                .copied()?;
            let bundle = inner.carve(&id, size(), worker);
            self.refresh_max(inner);
            bundle
        };
        if let Some(bundle) = &bundle {
            log::debug!(
                "Bundle {} of job {} carved for {}: {} tasks",
                bundle.id,
                bundle.job_id,
                worker,
                bundle.len()
            );
            deferred.stats.push((
                labels::BUNDLE_QUEUE_WAIT,
                bundle.queue_wait.as_secs_f64() * 1000.0,
            ));
        }
        self.flush(deferred);
        bundle
    }

    /// 从作业头部取出最多`desired`个任务
    ///
    /// 取完全部剩余任务时作业离开优先级结构，否则移到所在桶末尾。
    ///
    /// # Panics
    /// 作业不在队列中时panic，这意味着任务计数已被破坏。
    pub fn next_bundle(&self, job: &JobId, desired: usize, worker: WorkerId) -> Bundle {
        let mut guard = self.inner.lock();
        let bundle = match guard.carve(job, desired, worker) {
            Some(bundle) => bundle,
            None => panic!("next_bundle called for job {} which is not in the queue", job),
        };
        self.refresh_max(&guard);
        bundle
    }

    /// 处理任务包结果
    ///
    /// 缺失结果的任务记为`TaskError::Missing`。`requeue_cancelled`为true时，
    /// 被取消的任务回到作业头部且作业被挂起。
    pub fn bundle_completed(
        &self,
        job_id: &JobId,
        bundle_id: BundleId,
        results: Vec<(u32, TaskOutcome)>,
        requeue_cancelled: bool,
    ) -> Result<BundleCompletion, QueueError> {
        let mut deferred = Deferred::default();
        let report = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let report =
                Self::complete_locked(inner, job_id, bundle_id, results, requeue_cancelled, &mut deferred);
            self.refresh_max(inner);
            report
        };
        self.flush(deferred);
        report
    }

    fn complete_locked(
        inner: &mut QueueInner,
        job_id: &JobId,
        bundle_id: BundleId,
        results: Vec<(u32, TaskOutcome)>,
        requeue_cancelled: bool,
        deferred: &mut Deferred,
    ) -> Result<BundleCompletion, QueueError> {
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or(QueueError::UnknownJob(*job_id))?;
        let flight = job
            .in_flight
            .remove(&bundle_id)
            .ok_or(QueueError::UnknownBundle {
                job: *job_id,
                bundle: bundle_id,
            })?;
        let size = flight.tasks.len();
        job.accounting.dispatched -= size;

        let mut outcomes: HashMap<u32, TaskOutcome> = results.into_iter().collect();
        let mut report = BundleCompletion::default();
        let mut requeue = Vec::new();
        for task in flight.tasks {
            let outcome = outcomes
                .remove(&task.position)
                .unwrap_or(TaskOutcome::Failed(TaskError::Missing));
            if outcome.is_cancelled() && requeue_cancelled && !job.cancelled {
                requeue.push(task);
                continue;
            }
            if outcome.is_cancelled() {
                report.cancelled += 1;
            } else {
                report.completed += 1;
            }
            job.record(task.position, outcome);
        }
        if !outcomes.is_empty() {
            log::warn!(
                "Bundle {} of job {} returned {} results for unknown positions",
                bundle_id,
                job_id,
                outcomes.len()
            );
        }
        if !requeue.is_empty() {
            report.requeued = requeue.len();
            job.push_front(requeue);
            job.sla.suspended = true;
            rebucket(&mut inner.buckets, job, true);
            log::warn!(
                "Drone asked to requeue {} cancelled tasks of job {}, job suspended",
                report.requeued,
                job_id
            );
            deferred
                .stats
                .push((labels::TASKS_REQUEUED, report.requeued as f64));
            deferred.events.push(QueueEvent::JobSuspended {
                job: *job_id,
                in_flight: Vec::new(),
            });
        }
        track(&mut inner.sizes, job);
        deferred.stats.push((labels::BUNDLE_TASKS, size as f64));
        deferred
            .stats
            .push((labels::TASKS_COMPLETED, report.completed as f64));
        if job.is_finished() {
            report.finished = true;
            inner.finish(job_id, deferred);
        }
        Ok(report)
    }

    /// 节点故障时把在途任务包放回作业头部
    ///
    /// 作业已取消时任务被丢弃并计入取消数，返回`JobCancelled`。
    pub fn requeue_bundle(&self, job_id: &JobId, bundle_id: BundleId) -> Result<usize, QueueError> {
        let mut deferred = Deferred::default();
        let result = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let result = Self::requeue_locked(inner, job_id, bundle_id, &mut deferred);
            self.refresh_max(inner);
            result
        };
        self.flush(deferred);
        result
    }

    fn requeue_locked(
        inner: &mut QueueInner,
        job_id: &JobId,
        bundle_id: BundleId,
        deferred: &mut Deferred,
    ) -> Result<usize, QueueError> {
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or(QueueError::UnknownJob(*job_id))?;
        let flight = job
            .in_flight
            .remove(&bundle_id)
            .ok_or(QueueError::UnknownBundle {
                job: *job_id,
                bundle: bundle_id,
            })?;
        let count = flight.tasks.len();
        job.accounting.dispatched -= count;
        if job.cancelled {
            job.record_cancelled(&flight.tasks);
            deferred.stats.push((labels::TASKS_DROPPED, count as f64));
            if job.is_finished() {
                inner.finish(job_id, deferred);
            }
            return Err(QueueError::JobCancelled {
                job: *job_id,
                dropped: count,
            });
        }
        job.push_front(flight.tasks);
        rebucket(&mut inner.buckets, job, true);
        track(&mut inner.sizes, job);
        log::warn!(
            "Requeued {} tasks of job {} from bundle {}",
            count,
            job_id,
            bundle_id
        );
        deferred.stats.push((labels::TASKS_REQUEUED, count as f64));
        deferred.events.push(QueueEvent::JobUpdated { job: *job_id });
        Ok(count)
    }

    /// 移除没有在途任务的作业，剩余排队任务记为取消
    pub fn remove_bundle(&self, job_id: &JobId) -> Result<(), QueueError> {
        let mut deferred = Deferred::default();
        let result = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let result = match inner.job_mut(job_id) {
                Err(e) => Err(e),
                Ok(job) if job.accounting.dispatched > 0 => Err(QueueError::JobBusy {
                    job: *job_id,
                    dispatched: job.accounting.dispatched,
                }),
                Ok(job) => {
                    if !job.queued.is_empty() {
                        job.cancelled = true;
                    }
                    inner.finish(job_id, &mut deferred);
                    Ok(())
                }
            };
            self.refresh_max(inner);
            result
        };
        self.flush(deferred);
        result
    }

    /// 取消作业，重复调用没有额外效果
    pub fn cancel_job(&self, job_id: &JobId) -> Result<CancelReport, QueueError> {
        let mut deferred = Deferred::default();
        let result = {
            let mut guard = self.inner.lock();
            let result = guard.cancel(job_id, &mut deferred);
            self.refresh_max(&guard);
            result
        };
        self.flush(deferred);
        result
    }

    /// 在桶之间移动作业；已被完全取出的作业只更新优先级
    pub fn update_priority(&self, job_id: &JobId, priority: i32) -> Result<(), QueueError> {
        let mut deferred = Deferred::default();
        let result = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let QueueInner { jobs, buckets, .. } = inner;
            jobs.get_mut(job_id).ok_or(QueueError::UnknownJob(*job_id)).map(|job| {
                if job.priority != priority {
                    log::info!(
                        "Job {} priority {} -> {}",
                        job_id,
                        job.priority,
                        priority
                    );
                    job.priority = priority;
                    if job.bucket.is_some() {
                        rebucket(buckets, job, false);
                    }
                    deferred.events.push(QueueEvent::JobUpdated { job: *job_id });
                }
            })
        };
        self.flush(deferred);
        result
    }

    pub fn set_suspended(&self, job_id: &JobId, suspended: bool) -> Result<(), QueueError> {
        let mut deferred = Deferred::default();
        let result = {
            let mut guard = self.inner.lock();
            guard.job_mut(job_id).map(|job| {
                if job.sla.suspended != suspended {
                    job.sla.suspended = suspended;
                    log::info!(
                        "Job {} {}",
                        job_id,
                        if suspended { "suspended" } else { "resumed" }
                    );
                    deferred.events.push(QueueEvent::JobUpdated { job: *job_id });
                }
            })
        };
        self.flush(deferred);
        result
    }

    /// 挂起作业；`recall`为true时通知持有任务包的节点取消并回队
    pub fn suspend_job(&self, job_id: &JobId, recall: bool) -> Result<Vec<WorkerId>, QueueError> {
        let mut deferred = Deferred::default();
        let result = {
            let mut guard = self.inner.lock();
            guard.job_mut(job_id).map(|job| {
                job.sla.suspended = true;
                let workers = if recall { job.workers() } else { Vec::new() };
                log::info!(
                    "Job {} suspended, recalling bundles from {} drones",
                    job_id,
                    workers.len()
                );
                deferred.events.push(QueueEvent::JobSuspended {
                    job: *job_id,
                    in_flight: workers.clone(),
                });
                workers
            })
        };
        self.flush(deferred);
        result
    }

    /// 取消所有在`now`之前到期的作业，返回被取消的作业
    pub fn expire_jobs(&self, now: DateTime<Utc>) -> Vec<JobId> {
        let mut deferred = Deferred::default();
        let expired = {
            let mut guard = self.inner.lock();
            let expired: Vec<JobId> = guard
                .jobs
                .values()
                .filter(|job| !job.cancelled && job.sla.is_expired(now))
                .map(|job| job.id)
                .collect();
            for id in &expired {
                log::info!("Job {} expired", id);
                if let Err(e) = guard.cancel(id, &mut deferred) {
                    log::error!("Failed to cancel expired job {}: {}", id, e);
                }
            }
            self.refresh_max(&guard);
            expired
        };
        self.flush(deferred);
        expired
    }

    pub fn accounting(&self, job_id: &JobId) -> Option<TaskAccounting> {
        self.inner.lock().jobs.get(job_id).map(|job| job.accounting)
    }

    pub fn job_info(&self, job_id: &JobId) -> Option<JobInfo> {
        self.inner.lock().jobs.get(job_id).map(ServerJob::info)
    }

    /// 所有作业中仍在排队的任务数
    pub fn pending_task_count(&self) -> usize {
        self.inner
            .lock()
            .jobs
            .values()
            .map(|job| job.accounting.queued)
            .sum()
    }

    /// 按派发顺序列出有排队任务的作业
    pub fn queued_job_ids(&self) -> Vec<JobId> {
        self.inner
            .lock()
            .buckets
            .values()
            .flat_map(|list| list.iter().copied())
            .collect()
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.inner.lock().jobs.contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().jobs.is_empty()
    }

    /// 排队作业中剩余任务数的最大值
    pub fn max_bundle_size(&self) -> usize {
        self.max_bundle_size.load(Ordering::Acquire)
    }

    fn refresh_max(&self, inner: &QueueInner) {
        self.max_bundle_size.store(inner.max_len(), Ordering::Release);
    }

    fn flush(&self, deferred: Deferred) {
        let Deferred {
            events,
            stats,
            finished,
        } = deferred;
        for (label, value) in stats {
            self.stats.add_value(label, value);
        }
        let removed: Vec<(bool, Arc<JobCompletion>, JobResults)> = finished
            .into_iter()
            .map(|job| {
                let cancelled = job.cancelled;
                let (completion, results) = job.into_results();
                (cancelled, completion, results)
            })
            .collect();
        // 结果已定稿，先解除移出标记，监听器与回调里重新提交同UUID作业不会阻塞
        if !removed.is_empty() {
            let mut inner = self.inner.lock();
            for (_, _, results) in &removed {
                inner.removing.remove(&results.job_id);
            }
            drop(inner);
            self.removed.notify_all();
        }
        let listeners = self.listeners.read().clone();
        let notify = |event: &QueueEvent| {
            for listener in &listeners {
                listener.on_event(event);
            }
        };
        for event in &events {
            notify(event);
        }
        for (cancelled, completion, results) in removed {
            let id = results.job_id;
            log::info!(
                "Job {} removed: {} completed, {} cancelled in {:?}",
                id,
                results.accounting.completed,
                results.accounting.cancelled,
                results.elapsed
            );
            self.stats.add_value(labels::JOB_REMOVED, 1.0);
            self.stats
                .add_value(labels::JOB_TIME, results.elapsed.as_secs_f64() * 1000.0);
            completion.complete(results);
            notify(&QueueEvent::JobRemoved { job: id, cancelled });
        }
    }
}

impl BundlerContext for JobQueue {
    fn max_bundle_size(&self) -> usize {
        JobQueue::max_bundle_size(self)
    }
}
