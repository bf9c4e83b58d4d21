//! 可调整大小的执行线程池
//!
//! 所有工作线程共享同一个任务通道；每个线程另有一个控制通道，
//! 缩容时只向被裁撤的线程发送`Terminate`，队列中的任务不会丢失也不会重复执行。

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use parking_lot::Mutex;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// 工作线程控制消息
enum Message {
    Terminate,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("thread pool is shut down")]
    Closed,
}

/// 工作线程
struct Worker {
    id: usize,
    control: Sender<Message>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn spawn(id: usize, jobs: Receiver<Job>, active: Arc<AtomicUsize>) -> Worker {
        let (control, signals) = bounded(1);
        let thread = thread::Builder::new()
            .name(format!("zerg-exec-{id}"))
            .spawn(move || loop {
                select! {
                    recv(signals) -> _ => {
                        log::debug!("Worker {} received terminate signal", id);
                        break;
                    }
                    recv(jobs) -> job => match job {
                        Ok(job) => {
                            active.fetch_add(1, Ordering::AcqRel);
                            let start = std::time::Instant::now();
                            if let Err(cause) = panic::catch_unwind(AssertUnwindSafe(job)) {
                                log::error!("Worker {} job panicked: {}", id, panic_message(&cause));
                            }
                            active.fetch_sub(1, Ordering::AcqRel);
                            log::trace!("Worker {} finished job in {:?}", id, start.elapsed());
                        }
                        // 任务通道关闭且已排空
                        Err(_) => break,
                    },
                }
            });
        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::error!("Failed to spawn worker {}: {}", id, e);
                None
            }
        };
        Worker {
            id,
            control,
            thread,
        }
    }

    fn is_alive(&self) -> bool {
        self.thread.is_some()
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker").field("id", &self.id).finish()
    }
}

/// 线程池
pub struct ThreadPool {
    jobs: Mutex<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
    workers: Mutex<Vec<Worker>>,
    next_id: AtomicUsize,
    active: Arc<AtomicUsize>,
}

impl ThreadPool {
    /// 创建线程池，`size`为0时按1处理
    pub fn new(size: usize) -> Self {
        let (sender, receiver) = unbounded();
        let pool = Self {
            jobs: Mutex::new(Some(sender)),
            receiver,
            workers: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            active: Arc::new(AtomicUsize::new(0)),
        };
        pool.resize(size);
        pool
    }

    pub fn execute<F>(&self, f: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.jobs.lock();
        let sender = guard.as_ref().ok_or(PoolError::Closed)?;
        sender.send(Box::new(f)).map_err(|_| PoolError::Closed)
    }

    /// 调整线程数
    ///
    /// 缩容时被裁撤的线程完成当前任务后退出，不等待。
    pub fn resize(&self, size: usize) {
        let size = size.max(1);
        let mut workers = self.workers.lock();
        workers.retain(Worker::is_alive);
        let current = workers.len();
        if size > current {
            for _ in current..size {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let worker = Worker::spawn(id, self.receiver.clone(), self.active.clone());
                workers.push(worker);
            }
        } else {
            for mut worker in workers.drain(size..) {
                let _ = worker.control.send(Message::Terminate);
                // 分离线程
                worker.thread.take();
            }
        }
        log::info!("Thread pool resized from {} to {} threads", current, size);
    }

    pub fn size(&self) -> usize {
        self.workers.lock().len()
    }

    /// 正在执行任务的线程数
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// 排队等待执行的任务数
    pub fn queued_count(&self) -> usize {
        self.receiver.len()
    }

    /// 停止接收新任务，排空队列后等待所有线程退出
    pub fn shutdown(&self) {
        self.jobs.lock().take();
        let workers: Vec<Worker> = self.workers.lock().drain(..).collect();
        for mut worker in workers {
            if let Some(thread) = worker.thread.take() {
                if thread.thread().id() == thread::current().id() {
                    continue;
                }
                if thread.join().is_err() {
                    log::error!("Worker {} terminated abnormally", worker.id);
                }
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("size", &self.size())
            .field("active", &self.active_count())
            .field("queued", &self.queued_count())
            .finish()
    }
}

pub(crate) fn panic_message(cause: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = cause.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn runs_every_job_once() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn shrinking_keeps_queued_jobs() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter = counter.clone();
            pool.execute(move || {
                thread::sleep(Duration::from_millis(1));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.resize(1);
        assert_eq!(pool.size(), 1);
        pool.resize(3);
        assert_eq!(pool.size(), 3);
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn panicking_job_does_not_kill_worker() {
        let pool = ThreadPool::new(1);
        pool.execute(|| panic!("boom")).unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        pool.execute(move || tx.send(7).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }

    #[test]
    fn execute_after_shutdown_fails() {
        let pool = ThreadPool::new(2);
        pool.shutdown();
        assert_eq!(pool.execute(|| {}), Err(PoolError::Closed));
        assert_eq!(pool.size(), 0);
    }
}
