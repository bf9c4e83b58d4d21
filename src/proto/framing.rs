//! Length-prefixed framing: `[u32 big-endian length][payload]`.
//!
//! `FrameReader` and `FrameWriter` are resumable: a non-blocking socket may
//! return `WouldBlock` at any byte offset, header included, and the next
//! readiness callback continues from exactly that offset.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("peer closed the connection")]
    Closed,
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("Protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("Protobuf encode error: {0}")]
    Encode(#[from] prost::EncodeError),
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Encode `msg` into a complete frame, length prefix included.
pub fn encode_frame<M: Message>(msg: &M) -> Result<Bytes, FrameError> {
    let len = msg.encoded_len();
    let prefix = u32::try_from(len).map_err(|_| FrameError::TooLarge {
        len,
        max: u32::MAX as usize,
    })?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + len);
    buf.put_u32(prefix);
    msg.encode(&mut buf)?;
    Ok(buf.freeze())
}

/// Decode a frame payload (without its prefix).
pub fn decode_payload<M: Message + Default>(payload: Bytes) -> Result<M, FrameError> {
    Ok(M::decode(payload)?)
}

/// Blocking write of one message.
pub fn write_frame<W: Write, M: Message>(dst: &mut W, msg: &M) -> Result<(), FrameError> {
    let frame = encode_frame(msg)?;
    dst.write_all(&frame)?;
    dst.flush()?;
    Ok(())
}

/// Blocking read of one frame payload.
pub fn read_frame<R: Read>(src: &mut R, max_len: usize) -> Result<Bytes, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    match src.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(FrameError::Closed),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len });
    }
    let mut body = vec![0u8; len];
    match src.read_exact(&mut body) {
        Ok(()) => Ok(Bytes::from(body)),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(FrameError::Closed),
        Err(e) => Err(e.into()),
    }
}

/// Incremental frame reader for non-blocking sources.
#[derive(Debug)]
pub struct FrameReader {
    header: [u8; HEADER_LEN],
    header_read: usize,
    body: Vec<u8>,
    body_read: usize,
    max_len: usize,
    bytes_read: u64,
}

impl FrameReader {
    pub fn new(max_len: usize) -> Self {
        Self {
            header: [0; HEADER_LEN],
            header_read: 0,
            body: Vec::new(),
            body_read: 0,
            max_len,
            bytes_read: 0,
        }
    }

    /// True when part of a frame has been consumed but not yet returned.
    pub fn is_mid_frame(&self) -> bool {
        self.header_read > 0
    }

    /// Bytes consumed since the last completed frame.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Read until one frame completes or the source would block.
    ///
    /// Returns `Ok(None)` on `WouldBlock`; the partial state is kept.
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> Result<Option<Bytes>, FrameError> {
        while self.header_read < HEADER_LEN {
            match src.read(&mut self.header[self.header_read..]) {
                Ok(0) => return Err(FrameError::Closed),
                Ok(n) => {
                    self.header_read += n;
                    self.bytes_read += n as u64;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            if self.header_read == HEADER_LEN {
                let len = u32::from_be_bytes(self.header) as usize;
                if len > self.max_len {
                    return Err(FrameError::TooLarge {
                        len,
                        max: self.max_len,
                    });
                }
                self.body = vec![0u8; len];
                self.body_read = 0;
            }
        }

        while self.body_read < self.body.len() {
            match src.read(&mut self.body[self.body_read..]) {
                Ok(0) => return Err(FrameError::Closed),
                Ok(n) => {
                    self.body_read += n;
                    self.bytes_read += n as u64;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let body = std::mem::take(&mut self.body);
        self.header_read = 0;
        self.body_read = 0;
        self.bytes_read = 0;
        Ok(Some(Bytes::from(body)))
    }
}

/// Result of one `FrameWriter::write_to` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteProgress {
    pub bytes: usize,
    pub frames_completed: usize,
    pub drained: bool,
}

/// Incremental writer holding a queue of encoded frames.
#[derive(Debug, Default)]
pub struct FrameWriter {
    frames: VecDeque<Bytes>,
    offset: usize,
    pushed: u64,
    completed: u64,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an encoded frame; returns its sequence number.
    pub fn push(&mut self, frame: Bytes) -> u64 {
        let seq = self.pushed;
        self.frames.push_back(frame);
        self.pushed += 1;
        seq
    }

    /// Number of frames fully written so far.
    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Byte offset inside the frame currently being written.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Write queued frames until drained or the sink would block.
    pub fn write_to<W: Write>(&mut self, dst: &mut W) -> io::Result<WriteProgress> {
        let mut progress = WriteProgress::default();
        while let Some(frame) = self.frames.front() {
            if self.offset == frame.len() {
                self.frames.pop_front();
                self.offset = 0;
                self.completed += 1;
                progress.frames_completed += 1;
                continue;
            }
            match dst.write(&frame[self.offset..]) {
                Ok(0) => return Err(io::Error::new(ErrorKind::WriteZero, "socket wrote 0 bytes")),
                Ok(n) => {
                    self.offset += n;
                    progress.bytes += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(progress),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        progress.drained = true;
        Ok(progress)
    }
}
