//! NUL-terminated JSON framing.
//!
//! A frame is the JSON text of one message followed by a single `0x00`
//! byte:
//!
//! ```text
//! {"greetings":"hello"}\0
//! ```
//!
//! JSON text never contains a raw NUL (U+0000 is always escaped as
//! `\u0000`), so the first `0x00` on the stream is always a frame boundary.
//! There is no length prefix: frames of any size are accumulated until the
//! terminator shows up.

use bytes::{Buf, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Byte that terminates every frame.
pub const TERMINATOR: u8 = 0x00;

/// Initial read buffer capacity.
const INITIAL_CAPACITY: usize = 4 * 1024;

/// Bytes reserved before each socket read.
const READ_CHUNK: usize = 16 * 1024;

/// Serialize `message` as JSON and append the terminator.
pub fn encode<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>> {
    let mut out = serde_json::to_vec(message).map_err(Error::Marshal)?;
    out.push(TERMINATOR);
    Ok(out)
}

/// Deserialize the body of one frame (terminator already stripped).
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    serde_json::from_slice(frame).map_err(Error::Unmarshal)
}

/// Encode `message` and write it to `writer` as one frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await.map_err(Error::Write)?;
    writer.flush().await.map_err(Error::Write)
}

/// Outcome of scanning the buffered bytes for a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanResult {
    /// A full frame, without its terminator.
    Complete(Bytes),
    /// No terminator buffered yet.
    NeedMore,
    /// EOF with nothing buffered: the peer closed between frames.
    Closed,
    /// EOF with this many unterminated bytes buffered.
    Truncated(usize),
}

/// Read buffer that splits a byte stream into frames.
///
/// Bytes that follow a terminator stay buffered for the next frame, so
/// frames written back-to-back are returned one at a time.
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: BytesMut,
    /// Prefix of `buffer` already known to contain no terminator.
    searched: usize,
}

impl FrameBuffer {
    /// Create an empty frame buffer.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            searched: 0,
        }
    }

    /// Append raw bytes received from the stream.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet returned as a frame.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Look for the next frame in the buffered bytes.
    ///
    /// `at_eof` tells the scanner the stream has ended, which turns a
    /// missing terminator into [`ScanResult::Truncated`] (or
    /// [`ScanResult::Closed`] when nothing is buffered).
    pub fn scan(&mut self, at_eof: bool) -> ScanResult {
        let unsearched = &self.buffer[self.searched..];
        if let Some(pos) = unsearched.iter().position(|&b| b == TERMINATOR) {
            let end = self.searched + pos;
            let frame = self.buffer.split_to(end).freeze();
            self.buffer.advance(1);
            self.searched = 0;
            return ScanResult::Complete(frame);
        }

        self.searched = self.buffer.len();

        if !at_eof {
            ScanResult::NeedMore
        } else if self.buffer.is_empty() {
            ScanResult::Closed
        } else {
            ScanResult::Truncated(self.buffer.len())
        }
    }

    /// Read from `reader` until one complete frame is buffered and return it.
    ///
    /// Fails with [`Error::Closed`] if the stream ends before any byte of a
    /// new frame arrives, and with [`Error::TruncatedFrame`] if it ends in
    /// the middle of one.
    pub async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Bytes>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let ScanResult::Complete(frame) = self.scan(false) {
                return Ok(frame);
            }

            self.buffer.reserve(READ_CHUNK);
            let n = reader.read_buf(&mut self.buffer).await.map_err(Error::Read)?;
            if n == 0 {
                return match self.scan(true) {
                    ScanResult::Complete(frame) => Ok(frame),
                    ScanResult::Truncated(buffered) => Err(Error::TruncatedFrame { buffered }),
                    ScanResult::Closed | ScanResult::NeedMore => Err(Error::Closed),
                };
            }
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
