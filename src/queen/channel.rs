//! 单个Drone连接的派发状态机
//!
//! `Idle -> SendingBundle -> AwaitingResult -> Idle`。所有方法只在反应器线程上调用。
//! 流类型是泛型参数，测试时用内存流代替套接字。

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use mio::Interest;

use super::job::Bundle;
use crate::balancer::{Ema, Feedback};
use crate::proto::{
    decode_payload, encode_frame, to_queen, CancelFrame, FrameError, FrameReader, FrameWriter,
    Hello, ResultsFrame, ToDrone, ToQueen, HEADER_LEN,
};
use crate::WorkerId;

/// 开销估计的平滑系数
const OVERHEAD_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    SendingBundle,
    AwaitingResult,
}

#[derive(Debug)]
pub enum ChannelEvent {
    Hello(Hello),
    /// 当前任务包的结果已完整读到，通道回到`Idle`
    Results { bundle: Bundle, frame: ResultsFrame },
}

/// 一次可读事件的处理结果
///
/// 出错前已解析的帧仍在`events`中。结果帧会从通道取走在途任务包，
/// 调用方必须先处理`events`再处理`error`，否则任务包丢失。
#[derive(Debug, Default)]
pub struct ReadBatch {
    pub events: Vec<ChannelEvent>,
    pub error: Option<FrameError>,
}

pub struct WorkerChannel<S> {
    worker: WorkerId,
    stream: S,
    state: ChannelState,
    reader: FrameReader,
    writer: FrameWriter,
    current: Option<Bundle>,
    /// 当前任务包帧在写队列中的序号
    bundle_seq: Option<u64>,
    identity: Option<String>,
    threads: u32,
    bytes_sent: u64,
    bytes_received: u64,
    overhead: Ema,
}

impl<S: Read + Write> WorkerChannel<S> {
    pub fn new(worker: WorkerId, stream: S, max_frame_len: usize) -> Self {
        Self {
            worker,
            stream,
            state: ChannelState::Idle,
            reader: FrameReader::new(max_frame_len),
            writer: FrameWriter::new(),
            current: None,
            bundle_seq: None,
            identity: None,
            threads: 0,
            bytes_sent: 0,
            bytes_received: 0,
            overhead: Ema::new(OVERHEAD_ALPHA),
        }
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == ChannelState::Idle
    }

    /// Hello中声明的节点标识
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn threads(&self) -> u32 {
        self.threads
    }

    pub fn current_bundle(&self) -> Option<&Bundle> {
        self.current.as_ref()
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// 当前需要关注的就绪事件
    pub fn interest(&self) -> Interest {
        if self.writer.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    /// 编码任务包并进入`SendingBundle`，实际写出由`on_writable`完成
    pub fn begin_send(&mut self, bundle: Bundle) -> Result<(), FrameError> {
        if self.state != ChannelState::Idle {
            return Err(FrameError::Protocol(format!(
                "{} is {:?}, cannot send bundle {}",
                self.worker, self.state, bundle.id
            )));
        }
        let frame = encode_frame(&ToDrone::bundle(bundle.to_frame()))?;
        log::debug!(
            "Sending bundle {} ({} tasks, {} bytes) to {}",
            bundle.id,
            bundle.len(),
            frame.len(),
            self.worker
        );
        self.bundle_seq = Some(self.writer.push(frame));
        self.current = Some(bundle);
        self.state = ChannelState::SendingBundle;
        Ok(())
    }

    /// 排入取消帧，不改变通道状态
    pub fn queue_cancel(&mut self, cancel: CancelFrame) -> Result<(), FrameError> {
        let frame = encode_frame(&ToDrone::cancel(cancel))?;
        self.writer.push(frame);
        Ok(())
    }

    /// 可写时继续写出；写完任务包帧后进入`AwaitingResult`
    pub fn on_writable(&mut self) -> Result<(), FrameError> {
        let progress = self.writer.write_to(&mut self.stream)?;
        self.bytes_sent += progress.bytes as u64;
        if self.state == ChannelState::SendingBundle {
            if let Some(seq) = self.bundle_seq {
                if self.writer.completed() > seq {
                    self.bundle_seq = None;
                    self.state = ChannelState::AwaitingResult;
                }
            }
        }
        Ok(())
    }

    /// 可读时读取全部完整帧，直到流暂无数据或出错
    pub fn on_readable(&mut self) -> ReadBatch {
        let mut batch = ReadBatch::default();
        if let Err(e) = self.read_frames(&mut batch.events) {
            batch.error = Some(e);
        }
        batch
    }

    fn read_frames(&mut self, events: &mut Vec<ChannelEvent>) -> Result<(), FrameError> {
        while let Some(payload) = self.reader.read_from(&mut self.stream)? {
            self.bytes_received += (HEADER_LEN + payload.len()) as u64;
            let message: ToQueen = decode_payload(payload)?;
            match message.kind {
                Some(to_queen::Kind::Hello(hello)) => {
                    log::info!(
                        "{} identified as {} with {} threads (v{})",
                        self.worker,
                        hello.worker_uuid,
                        hello.threads,
                        hello.version
                    );
                    self.identity = Some(hello.worker_uuid.clone());
                    self.threads = hello.threads;
                    events.push(ChannelEvent::Hello(hello));
                }
                Some(to_queen::Kind::Results(frame)) => {
                    let bundle = self.accept_results(&frame)?;
                    events.push(ChannelEvent::Results { bundle, frame });
                }
                None => {
                    return Err(FrameError::Protocol(format!(
                        "{} sent an empty message",
                        self.worker
                    )))
                }
            }
        }
        Ok(())
    }

    fn accept_results(&mut self, frame: &ResultsFrame) -> Result<Bundle, FrameError> {
        let matches = self.state == ChannelState::AwaitingResult
            && self.current.as_ref().map_or(false, |b| {
                b.id == frame.bundle_id && b.job_id.to_string() == frame.job_uuid
            });
        if !matches {
            return Err(FrameError::Protocol(format!(
                "{} returned results for bundle {} of job {} while {:?}",
                self.worker, frame.bundle_id, frame.job_uuid, self.state
            )));
        }
        self.state = ChannelState::Idle;
        self.current
            .take()
            .ok_or_else(|| FrameError::Protocol("no bundle in flight".to_string()))
    }

    /// 取走在途任务包(通道故障时回队用)
    pub fn take_bundle(&mut self) -> Option<Bundle> {
        self.state = ChannelState::Idle;
        self.bundle_seq = None;
        self.current.take()
    }

    /// 由结果计算负载均衡反馈
    ///
    /// 每任务开销为往返时间减去Drone端执行时间后的平滑均值。
    pub fn feedback_for(&mut self, bundle: &Bundle, frame: &ResultsFrame) -> Feedback {
        let elapsed = bundle.elapsed();
        let size = bundle.len();
        let execution = Duration::from_nanos(frame.execution_nanos);
        let overhead = elapsed.saturating_sub(execution).as_nanos() as f64 / size.max(1) as f64;
        let smoothed = self.overhead.next(overhead);
        Feedback::new(size, elapsed).with_overhead(Duration::from_nanos(smoothed as u64))
    }

    /// 当前任务包已发出的时长
    pub fn in_flight_for(&self) -> Option<Duration> {
        self.current.as_ref().map(|b| Instant::now() - b.dispatched_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drone::TaskOutcome;
    use crate::proto::{TaskResult, ToQueen};
    use crate::queen::job::TaskPayload;
    use crate::JobId;
    use bytes::Bytes;
    use std::io::{self, ErrorKind};

    /// 非阻塞内存流：读完输入后WouldBlock，每次最多写`budget`字节
    #[derive(Default)]
    struct MockStream {
        input: Vec<u8>,
        pos: usize,
        output: Vec<u8>,
        budget: usize,
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos == self.input.len() {
                return Err(ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.input.len() - self.pos);
            buf[..n].copy_from_slice(&self.input[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.budget);
            self.output.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn bundle(id: u64, tasks: u32) -> Bundle {
        Bundle {
            id,
            job_id: JobId::new_v4(),
            job_name: "job".into(),
            app_id: "app".into(),
            priority: 0,
            data_provider: Bytes::new(),
            tasks: (0..tasks)
                .map(|position| TaskPayload {
                    position,
                    data: Bytes::from_static(b"task"),
                })
                .collect(),
            worker: WorkerId(1),
            dispatched_at: Instant::now(),
            queue_wait: Duration::ZERO,
        }
    }

    fn results_for(bundle: &Bundle) -> Vec<u8> {
        let frame = ResultsFrame {
            job_uuid: bundle.job_id.to_string(),
            bundle_id: bundle.id,
            results: bundle
                .positions()
                .map(|p| TaskResult::new(p, &TaskOutcome::Completed(Bytes::from_static(b"ok"))))
                .collect(),
            ..Default::default()
        };
        encode_frame(&ToQueen::results(frame)).unwrap().to_vec()
    }

    fn channel(budget: usize) -> WorkerChannel<MockStream> {
        let stream = MockStream {
            budget,
            ..Default::default()
        };
        WorkerChannel::new(WorkerId(1), stream, 1 << 20)
    }

    #[test]
    fn full_cycle_returns_to_idle() {
        let mut ch = channel(usize::MAX);
        let b = bundle(7, 3);
        let reply = results_for(&b);
        ch.begin_send(b).unwrap();
        assert_eq!(ch.state(), ChannelState::SendingBundle);
        assert!(ch.interest().is_writable());

        ch.on_writable().unwrap();
        assert_eq!(ch.state(), ChannelState::AwaitingResult);
        assert!(!ch.interest().is_writable());

        ch.stream_mut().input = reply;
        let batch = ch.on_readable();
        assert!(batch.error.is_none());
        assert_eq!(batch.events.len(), 1);
        match &batch.events[0] {
            ChannelEvent::Results { bundle, frame } => {
                assert_eq!(bundle.id, 7);
                assert_eq!(frame.results.len(), 3);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(ch.is_idle());
        assert!(ch.current_bundle().is_none());
    }

    #[test]
    fn partial_writes_resume_at_offset() {
        let mut ch = channel(5);
        ch.begin_send(bundle(1, 2)).unwrap();
        ch.on_writable().unwrap();
        assert_eq!(ch.state(), ChannelState::SendingBundle);
        assert_eq!(ch.bytes_sent(), 5);

        ch.stream_mut().budget = usize::MAX;
        ch.on_writable().unwrap();
        assert_eq!(ch.state(), ChannelState::AwaitingResult);
        let written = ch.stream().output.clone();
        let len = u32::from_be_bytes([written[0], written[1], written[2], written[3]]) as usize;
        assert_eq!(written.len(), HEADER_LEN + len);
    }

    #[test]
    fn cancel_frame_does_not_change_state() {
        let mut ch = channel(usize::MAX);
        ch.begin_send(bundle(1, 1)).unwrap();
        ch.on_writable().unwrap();
        ch.queue_cancel(CancelFrame {
            job_uuid: "x".into(),
            call_on_cancel: true,
            requeue: false,
        })
        .unwrap();
        assert!(ch.interest().is_writable());
        ch.on_writable().unwrap();
        assert_eq!(ch.state(), ChannelState::AwaitingResult);
    }

    #[test]
    fn unexpected_results_are_a_protocol_error() {
        let mut ch = channel(usize::MAX);
        ch.stream_mut().input = results_for(&bundle(3, 1));
        let batch = ch.on_readable();
        assert!(batch.events.is_empty());
        assert!(matches!(batch.error, Some(FrameError::Protocol(_))));
    }

    #[test]
    fn hello_sets_identity() {
        let mut ch = channel(usize::MAX);
        let hello = Hello {
            worker_uuid: "node-a".into(),
            threads: 4,
            version: "0.1.0".into(),
        };
        ch.stream_mut().input = encode_frame(&ToQueen::hello(hello)).unwrap().to_vec();
        let events = ch.on_readable().events;
        assert!(matches!(events[0], ChannelEvent::Hello(_)));
        assert_eq!(ch.identity(), Some("node-a"));
        assert_eq!(ch.threads(), 4);
    }

    #[test]
    fn busy_channel_rejects_second_bundle() {
        let mut ch = channel(usize::MAX);
        ch.begin_send(bundle(1, 1)).unwrap();
        assert!(ch.begin_send(bundle(2, 1)).is_err());
        let taken = ch.take_bundle().unwrap();
        assert_eq!(taken.id, 1);
        assert!(ch.is_idle());
    }

    #[test]
    fn closed_stream_is_reported() {
        struct Closed;
        impl Read for Closed {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Ok(0)
            }
        }
        impl Write for Closed {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let mut ch = WorkerChannel::new(WorkerId(9), Closed, 1024);
        assert!(matches!(ch.on_readable().error, Some(FrameError::Closed)));
    }

    #[test]
    fn overhead_estimate_is_smoothed_across_bundles() {
        let mut ch = channel(usize::MAX);
        let mut slow = bundle(1, 4);
        slow.dispatched_at = Instant::now() - Duration::from_millis(40);
        let idle_drone = ResultsFrame::default();
        let first = ch.feedback_for(&slow, &idle_drone).overhead_per_task;
        assert!(first >= Duration::from_millis(10));

        // Drone端执行占满往返时间，本次开销样本为0
        let mut busy = bundle(2, 4);
        busy.dispatched_at = Instant::now() - Duration::from_millis(40);
        let saturated = ResultsFrame {
            execution_nanos: Duration::from_secs(60).as_nanos() as u64,
            ..Default::default()
        };
        let second = ch.feedback_for(&busy, &saturated);
        assert_eq!(second.size, 4);
        assert!(second.elapsed >= Duration::from_millis(40));
        let expected = first.as_nanos() as f64 * (1.0 - OVERHEAD_ALPHA);
        let actual = second.overhead_per_task.as_nanos() as f64;
        assert!((actual - expected).abs() <= 2.0, "{} vs {}", actual, expected);
    }

    /// 读完输入后返回EOF的流
    struct ClosingStream {
        input: Vec<u8>,
        pos: usize,
    }

    impl Read for ClosingStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.input.len() - self.pos);
            buf[..n].copy_from_slice(&self.input[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    impl Write for ClosingStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn awaiting<S: Read + Write>(ch: &mut WorkerChannel<S>, b: Bundle) {
        ch.begin_send(b).unwrap();
        ch.on_writable().unwrap();
        assert_eq!(ch.state(), ChannelState::AwaitingResult);
    }

    #[test]
    fn results_before_close_are_kept() {
        let b = bundle(11, 4);
        let stream = ClosingStream {
            input: results_for(&b),
            pos: 0,
        };
        let mut ch = WorkerChannel::new(WorkerId(2), stream, 1 << 20);
        awaiting(&mut ch, b);

        let batch = ch.on_readable();
        assert!(matches!(batch.error, Some(FrameError::Closed)));
        assert_eq!(batch.events.len(), 1);
        match &batch.events[0] {
            ChannelEvent::Results { bundle, .. } => assert_eq!(bundle.id, 11),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(ch.take_bundle().is_none());
    }

    #[test]
    fn results_before_bad_frame_are_kept() {
        let mut ch = channel(usize::MAX);
        let b = bundle(12, 2);
        let mut input = results_for(&b);
        // 空消息帧
        input.extend_from_slice(&encode_frame(&ToQueen::default()).unwrap());
        awaiting(&mut ch, b);
        ch.stream_mut().input = input;

        let batch = ch.on_readable();
        assert!(matches!(batch.error, Some(FrameError::Protocol(_))));
        assert!(matches!(
            batch.events.as_slice(),
            [ChannelEvent::Results { bundle, .. }] if bundle.id == 12
        ));
    }
}
