//! Queen端反应器
//!
//! 单线程驱动所有`WorkerChannel`：接受连接、按负载均衡算法切分任务包、
//! 读取结果并回灌反馈。其他线程通过`DispatcherHandle`发送命令并唤醒反应器。

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{Receiver, Sender};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

use super::channel::{ChannelEvent, WorkerChannel};
use super::job::Bundle;
use super::queue::{JobQueue, QueueError, QueueEvent, QueueListener};
use crate::balancer::{Bundler, BundlerContext, BundlerFactory};
use crate::config::{GridConfig, LoadBalancingConfig, QueenConfig};
use crate::persistence::{BundlerStore, StateKey};
use crate::proto::{CancelFrame, ResultsFrame};
use crate::stats::{labels, StatsSink};
use crate::{GridError, JobId, Result, WorkerId};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CHANNEL: usize = 2;

enum Command {
    Wake,
    Cancel {
        job: JobId,
        workers: Vec<WorkerId>,
        requeue: bool,
    },
    SetLoadBalancing(LoadBalancingConfig),
    Shutdown,
}

/// 跨线程控制反应器的句柄
#[derive(Clone)]
pub struct DispatcherHandle {
    sender: Sender<Command>,
    waker: Arc<Waker>,
}

impl DispatcherHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.sender.send(command).map_err(|_| GridError::Shutdown)?;
        self.waker.wake()?;
        Ok(())
    }

    /// 唤醒反应器重新尝试派发
    pub fn wake(&self) -> Result<()> {
        self.send(Command::Wake)
    }

    /// 停止反应器；在途任务包全部回队后`run`返回
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    /// 整体替换负载均衡算法
    pub fn set_load_balancing(&self, config: LoadBalancingConfig) -> Result<()> {
        self.send(Command::SetLoadBalancing(config))
    }

    /// 通知持有`job`任务包的节点取消执行
    pub fn cancel_in_flight(&self, job: JobId, workers: Vec<WorkerId>, requeue: bool) -> Result<()> {
        self.send(Command::Cancel {
            job,
            workers,
            requeue,
        })
    }
}

/// 把队列事件转成反应器命令
struct ReactorListener {
    handle: DispatcherHandle,
}

impl QueueListener for ReactorListener {
    fn on_event(&self, event: &QueueEvent) {
        let result = match event {
            QueueEvent::JobAdded { .. } | QueueEvent::JobUpdated { .. } => self.handle.wake(),
            QueueEvent::JobCancelled { job, in_flight } if !in_flight.is_empty() => {
                self.handle.cancel_in_flight(*job, in_flight.clone(), false)
            }
            QueueEvent::JobSuspended { job, in_flight } if !in_flight.is_empty() => {
                self.handle.cancel_in_flight(*job, in_flight.clone(), true)
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            log::debug!("Dispatcher not reachable for {:?}: {}", event, e);
        }
    }
}

pub struct Dispatcher {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    config: QueenConfig,
    queue: Arc<JobQueue>,
    bundler: Arc<dyn Bundler>,
    factory: Arc<BundlerFactory>,
    store: Option<Arc<dyn BundlerStore>>,
    stats: Arc<dyn StatsSink>,
    channels: HashMap<Token, WorkerChannel<TcpStream>>,
    idle: VecDeque<Token>,
    next_token: usize,
    next_worker: u64,
    commands: Receiver<Command>,
    handle: DispatcherHandle,
    running: bool,
    last_tick: Instant,
}

impl Dispatcher {
    /// 绑定监听地址并订阅队列事件
    pub fn bind(config: QueenConfig, queue: Arc<JobQueue>, bundler: Arc<dyn Bundler>) -> Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(config.listen_addr)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (sender, commands) = crossbeam_channel::unbounded();
        let handle = DispatcherHandle { sender, waker };
        queue.add_listener(Arc::new(ReactorListener {
            handle: handle.clone(),
        }));
        log::info!(
            "Queen listening on {} with {} load balancing",
            listener.local_addr()?,
            bundler.algorithm()
        );
        Ok(Self {
            poll,
            events: Events::with_capacity(config.events_capacity.max(16)),
            listener,
            stats: queue.stats().clone(),
            config,
            queue,
            bundler,
            factory: Arc::new(BundlerFactory::with_builtin()),
            store: None,
            channels: HashMap::new(),
            idle: VecDeque::new(),
            next_token: FIRST_CHANNEL,
            next_worker: 1,
            commands,
            handle,
            running: true,
            last_tick: Instant::now(),
        })
    }

    /// 按完整配置创建，算法由内置注册表构造
    pub fn from_config(config: &GridConfig, queue: Arc<JobQueue>) -> Result<Self> {
        config.validate()?;
        let factory = Arc::new(BundlerFactory::with_builtin());
        let ctx: Arc<dyn BundlerContext> = queue.clone();
        let bundler = factory.from_config(&config.load_balancing, ctx);
        Ok(Self::bind(config.queen.clone(), queue, bundler)?.with_factory(factory))
    }

    pub fn with_factory(mut self, factory: Arc<BundlerFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn BundlerStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_stats(mut self, stats: Arc<dyn StatsSink>) -> Self {
        self.stats = stats;
        self
    }

    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn bundler(&self) -> &Arc<dyn Bundler> {
        &self.bundler
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    /// 运行到收到关闭命令
    pub fn run(&mut self) -> Result<()> {
        let interval = self.config.poll_interval();
        while self.running {
            self.run_once(Some(interval))?;
        }
        self.drain();
        log::info!("Dispatcher stopped");
        Ok(())
    }

    /// 处理一轮就绪事件、命令与派发
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<()> {
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e.into());
        }
        let ready: Vec<Readiness> = self.events.iter().map(Readiness::from).collect();
        for event in ready {
            match event.token {
                LISTENER => self.accept(),
                WAKER => {}
                token => self.channel_ready(token, event),
            }
        }
        self.process_commands();
        if self.last_tick.elapsed() >= self.config.poll_interval() {
            self.last_tick = Instant::now();
            self.queue.expire_jobs(Utc::now());
        }
        if self.running {
            self.dispatch_idle();
        }
        Ok(())
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    let worker = WorkerId(self.next_worker);
                    self.next_worker += 1;
                    if let Err(e) = stream.set_nodelay(true) {
                        log::debug!("set_nodelay failed for {}: {}", addr, e);
                    }
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        log::error!("Failed to register drone connection {}: {}", addr, e);
                        continue;
                    }
                    log::info!("{} connected from {}", worker, addr);
                    self.channels.insert(
                        token,
                        WorkerChannel::new(worker, stream, self.config.max_frame_len),
                    );
                    self.idle.push_back(token);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("Accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn channel_ready(&mut self, token: Token, event: Readiness) {
        let Some(channel) = self.channels.get_mut(&token) else {
            return;
        };
        let mut failure = None;
        if event.writable && !event.error {
            if let Err(e) = channel.on_writable() {
                failure = Some(e.to_string());
            }
        }
        // 出错的连接也先读一次，对端关闭前写出的结果不能丢
        let mut received = Vec::new();
        if event.readable || event.error || failure.is_some() {
            let batch = channel.on_readable();
            received = batch.events;
            if let Some(e) = batch.error {
                failure.get_or_insert_with(|| e.to_string());
            }
        }
        if event.error {
            failure.get_or_insert_with(|| "socket error".to_string());
        }
        for received in received {
            match received {
                ChannelEvent::Hello(_) => self.restore_state(token),
                ChannelEvent::Results { bundle, frame } => {
                    self.process_results(token, bundle, frame)
                }
            }
        }
        match failure {
            Some(reason) => self.destroy_channel(token, &reason),
            None => self.reregister(token),
        }
    }

    fn process_results(&mut self, token: Token, bundle: Bundle, frame: ResultsFrame) {
        let Some(channel) = self.channels.get_mut(&token) else {
            return;
        };
        let worker = channel.worker();
        if let Some(failure) = &frame.failure {
            log::warn!(
                "{} could not run bundle {} of job {}: {}",
                worker,
                bundle.id,
                bundle.job_id,
                failure
            );
            self.requeue(&bundle);
        } else {
            let feedback = channel.feedback_for(&bundle, &frame);
            self.bundler.feedback(worker, &feedback);
            self.stats.add_value(
                labels::BUNDLE_ELAPSED,
                feedback.elapsed.as_secs_f64() * 1000.0,
            );
            let outcomes = frame
                .results
                .iter()
                .map(|r| (r.position, r.to_outcome()))
                .collect();
            match self
                .queue
                .bundle_completed(&bundle.job_id, bundle.id, outcomes, frame.requeue)
            {
                Ok(report) => log::debug!(
                    "{} finished bundle {} of job {} in {:?}: {:?}",
                    worker,
                    bundle.id,
                    bundle.job_id,
                    feedback.elapsed,
                    report
                ),
                Err(e) => {
                    log::error!("Results of bundle {} discarded: {}", bundle.id, e);
                    self.stats
                        .add_value(labels::TASKS_DROPPED, bundle.len() as f64);
                }
            }
        }
        if !self.idle.contains(&token) {
            self.idle.push_back(token);
        }
    }

    /// 把在途任务包放回队列，失败时计数并记录
    fn requeue(&self, bundle: &Bundle) {
        match self.queue.requeue_bundle(&bundle.job_id, bundle.id) {
            Ok(count) => log::warn!(
                "Requeued {} tasks of bundle {} (job {})",
                count,
                bundle.id,
                bundle.job_id
            ),
            Err(QueueError::JobCancelled { dropped, .. }) => log::warn!(
                "Job {} was cancelled, dropped {} returned tasks",
                bundle.job_id,
                dropped
            ),
            Err(e) => {
                log::error!(
                    "Failed to requeue {} tasks of bundle {}: {}",
                    bundle.len(),
                    bundle.id,
                    e
                );
                self.stats
                    .add_value(labels::TASKS_DROPPED, bundle.len() as f64);
            }
        }
    }

    fn dispatch_idle(&mut self) {
        let mut still_idle = VecDeque::with_capacity(self.idle.len());
        let mut failed = Vec::new();
        while let Some(token) = self.idle.pop_front() {
            let Some(channel) = self.channels.get_mut(&token) else {
                continue;
            };
            if !channel.is_idle() {
                continue;
            }
            let worker = channel.worker();
            let bundler = &self.bundler;
            let Some(bundle) = self
                .queue
                .poll_bundle(worker, || bundler.next_size(worker))
            else {
                still_idle.push_back(token);
                continue;
            };
            if let Err(e) = channel.begin_send(bundle).and_then(|_| channel.on_writable()) {
                failed.push((token, e.to_string()));
                continue;
            }
            let interest = channel.interest();
            if let Err(e) = self
                .poll
                .registry()
                .reregister(channel.stream_mut(), token, interest)
            {
                failed.push((token, e.to_string()));
            }
        }
        self.idle = still_idle;
        for (token, reason) in failed {
            self.destroy_channel(token, &reason);
        }
    }

    fn process_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Wake => {}
                Command::Cancel {
                    job,
                    workers,
                    requeue,
                } => self.propagate_cancel(job, &workers, requeue),
                Command::SetLoadBalancing(config) => {
                    let ctx: Arc<dyn BundlerContext> = self.queue.clone();
                    let bundler = self.factory.from_config(&config, ctx);
                    let workers: Vec<WorkerId> =
                        self.channels.values().map(|c| c.worker()).collect();
                    for worker in workers {
                        self.bundler.release(worker);
                    }
                    log::info!(
                        "Load balancing switched from {} to {}",
                        self.bundler.algorithm(),
                        bundler.algorithm()
                    );
                    self.bundler = bundler;
                }
                Command::Shutdown => {
                    log::info!("Dispatcher shutdown requested");
                    self.running = false;
                }
            }
        }
    }

    fn propagate_cancel(&mut self, job: JobId, workers: &[WorkerId], requeue: bool) {
        let tokens: Vec<Token> = self
            .channels
            .iter()
            .filter(|(_, c)| workers.contains(&c.worker()))
            .map(|(t, _)| *t)
            .collect();
        for token in tokens {
            let Some(channel) = self.channels.get_mut(&token) else {
                continue;
            };
            let cancel = CancelFrame {
                job_uuid: job.to_string(),
                call_on_cancel: true,
                requeue,
            };
            log::debug!("Cancelling job {} on {}", job, channel.worker());
            if let Err(e) = channel.queue_cancel(cancel).and_then(|_| channel.on_writable()) {
                self.destroy_channel(token, &e.to_string());
                continue;
            }
            self.reregister(token);
        }
    }

    fn reregister(&mut self, token: Token) {
        let Some(channel) = self.channels.get_mut(&token) else {
            return;
        };
        let interest = channel.interest();
        if let Err(e) = self
            .poll
            .registry()
            .reregister(channel.stream_mut(), token, interest)
        {
            self.destroy_channel(token, &e.to_string());
        }
    }

    /// 销毁通道，在途任务包无条件回队
    fn destroy_channel(&mut self, token: Token, reason: &str) {
        let Some(mut channel) = self.channels.remove(&token) else {
            return;
        };
        self.idle.retain(|t| *t != token);
        let _ = self.poll.registry().deregister(channel.stream_mut());
        let worker = channel.worker();
        log::warn!("{} disconnected: {}", worker, reason);
        self.stats.add_value(labels::CHANNEL_FAILURES, 1.0);
        if let Some(bundle) = channel.take_bundle() {
            self.requeue(&bundle);
        }
        self.persist_state(&channel);
        self.bundler.release(worker);
    }

    fn state_key(&self, channel: &WorkerChannel<TcpStream>) -> Option<StateKey> {
        channel.identity().map(|identity| {
            StateKey::new(
                BundlerFactory::algorithm_hash(self.bundler.algorithm()),
                identity,
            )
        })
    }

    fn restore_state(&mut self, token: Token) {
        let Some(store) = &self.store else {
            return;
        };
        let Some(channel) = self.channels.get(&token) else {
            return;
        };
        let Some(key) = self.state_key(channel) else {
            return;
        };
        match store.load(&key) {
            Ok(Some(state)) => {
                if let Err(e) = self.bundler.restore_state(channel.worker(), &state) {
                    log::warn!("Ignoring stored bundler state for {}: {}", key.channel_identity, e);
                } else {
                    log::debug!("Restored bundler state for {}", key.channel_identity);
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("Failed to load bundler state: {}", e),
        }
    }

    fn persist_state(&self, channel: &WorkerChannel<TcpStream>) {
        let (Some(store), Some(key)) = (&self.store, self.state_key(channel)) else {
            return;
        };
        if let Some(state) = self.bundler.save_state(channel.worker()) {
            if let Err(e) = store.store(&key, &state) {
                log::warn!("Failed to store bundler state: {}", e);
            }
        }
    }

    /// 关闭前回收所有在途任务包
    fn drain(&mut self) {
        let tokens: Vec<Token> = self.channels.keys().copied().collect();
        for token in tokens {
            if let Some(mut channel) = self.channels.remove(&token) {
                let _ = self.poll.registry().deregister(channel.stream_mut());
                if let Some(bundle) = channel.take_bundle() {
                    self.requeue(&bundle);
                }
                self.persist_state(&channel);
                self.bundler.release(channel.worker());
            }
        }
        self.idle.clear();
    }
}

/// 从`mio::event::Event`复制出的就绪状态
#[derive(Debug, Clone, Copy)]
struct Readiness {
    token: Token,
    readable: bool,
    writable: bool,
    error: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable(),
            error: event.is_error(),
        }
    }
}
