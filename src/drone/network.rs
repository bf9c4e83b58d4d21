//! Drone端网络通信
//!
//! 阻塞式TCP连接：读线程接收任务包与取消帧，解析线程把任务负载解码为任务对象，
//! 写线程把整包结果按完成顺序回传给Queen。连接关闭时节点停止。

use std::io::{self, ErrorKind};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use uuid::Uuid;

use super::execution::{BundleKey, BundleResult, ExecutionManager, MaterializedBundle};
use super::task::TaskError;
use crate::codec::{CodeResolver, ResolverCache};
use crate::config::DroneConfig;
use crate::proto::{
    decode_payload, read_frame, to_drone, write_frame, BundleFrame, FrameError, Hello, ToDrone,
    ToQueen,
};
use crate::stats::{NoopStats, StatsSink};
use crate::{JobId, Result};

/// 工作节点
pub struct DroneNode {
    config: DroneConfig,
    resolver: Arc<ResolverCache>,
    stats: Arc<dyn StatsSink>,
}

impl DroneNode {
    pub fn new(config: DroneConfig, resolver: Arc<dyn CodeResolver>) -> Self {
        Self {
            config,
            resolver: Arc::new(ResolverCache::new(resolver)),
            stats: Arc::new(NoopStats),
        }
    }

    pub fn with_stats(mut self, stats: Arc<dyn StatsSink>) -> Self {
        self.stats = stats;
        self
    }

    pub fn config(&self) -> &DroneConfig {
        &self.config
    }

    /// 连接Queen并完成握手
    pub fn connect(&self) -> Result<DroneSession> {
        let stream = TcpStream::connect(&self.config.queen_addr)?;
        stream.set_nodelay(true)?;
        let worker_uuid = self
            .config
            .worker_uuid
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let threads = self.config.threads.max(1);

        let mut writer = stream.try_clone()?;
        write_frame(
            &mut writer,
            &ToQueen::hello(Hello {
                worker_uuid: worker_uuid.clone(),
                threads: u32::try_from(threads).unwrap_or(u32::MAX),
                version: env!("CARGO_PKG_VERSION").to_string(),
            }),
        )?;
        log::info!(
            "Drone {} connected to {} with {} threads",
            worker_uuid,
            self.config.queen_addr,
            threads
        );

        let (results_tx, results) = unbounded();
        let manager = ExecutionManager::with_services(
            threads,
            Arc::new(results_tx),
            Arc::new(super::timer::TokioTimer::new()?),
            self.stats.clone(),
        );
        Ok(DroneSession {
            stream,
            worker_uuid,
            manager: Arc::new(manager),
            results,
            resolver: self.resolver.clone(),
            max_frame_len: self.config.max_frame_len,
        })
    }

    /// 连接并运行直到连接关闭
    pub fn run(&self) -> Result<()> {
        self.connect()?.run()
    }
}

/// 已握手的连接
pub struct DroneSession {
    stream: TcpStream,
    worker_uuid: String,
    manager: Arc<ExecutionManager>,
    results: Receiver<BundleResult>,
    resolver: Arc<ResolverCache>,
    max_frame_len: usize,
}

/// 从其他线程关闭连接
#[derive(Debug)]
pub struct DroneStopper(TcpStream);

impl DroneStopper {
    pub fn stop(&self) {
        if let Err(e) = self.0.shutdown(Shutdown::Both) {
            log::debug!("Drone socket shutdown: {}", e);
        }
    }
}

impl DroneSession {
    pub fn worker_uuid(&self) -> &str {
        &self.worker_uuid
    }

    pub fn manager(&self) -> &Arc<ExecutionManager> {
        &self.manager
    }

    pub fn stopper(&self) -> io::Result<DroneStopper> {
        Ok(DroneStopper(self.stream.try_clone()?))
    }

    pub fn run(self) -> Result<()> {
        let DroneSession {
            mut stream,
            worker_uuid,
            manager,
            results,
            resolver,
            max_frame_len,
        } = self;

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let writer_stream = stream.try_clone()?;
        let writer = thread::Builder::new()
            .name("zerg-drone-writer".to_string())
            .spawn(move || write_results(writer_stream, results, stop_rx))?;

        let (resolve_tx, resolve_rx) = unbounded();
        let resolve_manager = manager.clone();
        let resolver_thread = thread::Builder::new()
            .name("zerg-drone-resolver".to_string())
            .spawn(move || resolve_bundles(resolver, resolve_manager, resolve_rx))?;

        let outcome = read_loop(&mut stream, &manager, &resolve_tx, max_frame_len);

        drop(resolve_tx);
        if resolver_thread.join().is_err() {
            log::error!("Drone {} resolver thread panicked", worker_uuid);
        }
        manager.shutdown();
        drop(stop_tx);
        if writer.join().is_err() {
            log::error!("Drone {} writer thread panicked", worker_uuid);
        }
        log::info!("Drone {} stopped", worker_uuid);
        outcome
    }
}

fn read_loop(
    stream: &mut TcpStream,
    manager: &ExecutionManager,
    resolve: &Sender<(BundleKey, BundleFrame)>,
    max_frame_len: usize,
) -> Result<()> {
    loop {
        let payload = match read_frame(stream, max_frame_len) {
            Ok(payload) => payload,
            Err(FrameError::Closed) => return Ok(()),
            Err(FrameError::Io(e))
                if matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
                ) =>
            {
                log::warn!("Connection to queen lost: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let message: ToDrone = decode_payload(payload)?;
        match message.kind {
            Some(to_drone::Kind::Bundle(frame)) => {
                let key = BundleKey::new(parse_job_id(&frame.job_uuid)?, frame.bundle_id);
                log::debug!(
                    "Received bundle {} of job {} with {} tasks",
                    key,
                    frame.job_name,
                    frame.tasks.len()
                );
                // 解析期间也必须能被取消
                manager.add_pending_entry(key);
                if resolve.send((key, frame)).is_err() {
                    return Err(crate::GridError::Shutdown);
                }
            }
            Some(to_drone::Kind::Cancel(cancel)) => {
                let job_id = parse_job_id(&cancel.job_uuid)?;
                manager.cancel_job(job_id, cancel.call_on_cancel, cancel.requeue);
            }
            None => log::warn!("Ignoring empty message from queen"),
        }
    }
}

fn resolve_bundles(
    resolver: Arc<ResolverCache>,
    manager: Arc<ExecutionManager>,
    bundles: Receiver<(BundleKey, BundleFrame)>,
) {
    for (key, frame) in bundles {
        let positions: Vec<u32> = frame.tasks.iter().map(|t| t.position).collect();
        let payloads: Vec<Bytes> = frame.tasks.iter().map(|t| t.payload.clone()).collect();
        match resolver.decode_all(&frame.app_id, &payloads) {
            Ok(tasks) => manager.execute(MaterializedBundle {
                key,
                data_provider: frame.data_provider,
                tasks: positions.into_iter().zip(tasks).collect(),
            }),
            Err(e) => manager.fail_pending(key, &positions, TaskError::Resolve(e.to_string())),
        }
    }
}

fn write_results(mut stream: TcpStream, results: Receiver<BundleResult>, stop: Receiver<()>) {
    loop {
        select! {
            recv(results) -> result => match result {
                Ok(result) => {
                    if !send_result(&mut stream, &result) {
                        return;
                    }
                }
                Err(_) => return,
            },
            recv(stop) -> _ => {
                // 线程池已停止，剩余结果尽量发出
                for result in results.try_iter() {
                    if !send_result(&mut stream, &result) {
                        return;
                    }
                }
                return;
            }
        }
    }
}

fn send_result(stream: &mut TcpStream, result: &BundleResult) -> bool {
    match write_frame(stream, &ToQueen::results(result.to_frame())) {
        Ok(()) => {
            log::debug!(
                "Sent {} results of bundle {}",
                result.outcomes.len(),
                result.key
            );
            true
        }
        Err(e) => {
            log::error!("Failed to send results of bundle {}: {}", result.key, e);
            false
        }
    }
}

fn parse_job_id(uuid: &str) -> std::result::Result<JobId, FrameError> {
    JobId::parse_str(uuid).map_err(|e| FrameError::Protocol(format!("invalid job id `{uuid}`: {e}")))
}
