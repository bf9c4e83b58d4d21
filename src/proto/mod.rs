//! 线上协议: 消息定义与长度前缀分帧

pub mod framing;
pub mod messages;

pub use framing::{
    decode_payload, encode_frame, read_frame, write_frame, FrameError, FrameReader, FrameWriter,
    WriteProgress, HEADER_LEN,
};
pub use messages::{
    to_drone, to_queen, BundleFrame, CancelFrame, Hello, ResultsFrame, TaskEnvelope, TaskFailure,
    TaskResult, ToDrone, ToQueen,
};
