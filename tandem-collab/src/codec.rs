//! Length-prefixed framing for the byte stream between client and server.
//!
//! Wire format:
//! ```text
//! ┌────────────────────┬──────────────────────────┐
//! │ length (u32, BE)   │ payload (`length` bytes) │
//! │ 4 bytes            │ UTF-8 JSON or join name  │
//! └────────────────────┴──────────────────────────┘
//! ```
//!
//! Payloads are opaque. Boundaries come only from the prefix, so a payload
//! containing `}{` or any other byte pattern never splits or merges frames.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SyncError};

/// Size of the big-endian length prefix.
pub const HEADER_LEN: usize = 4;

/// Default upper bound for a single payload (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Prepend the 4-byte big-endian length to `payload`.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len()).map_err(|_| SyncError::FrameTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Result of one decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(Vec<u8>),
    /// Not enough bytes buffered yet; keep them and retry later.
    Incomplete,
}

/// Incremental decoder that keeps partial frames across reads.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_len,
        }
    }

    /// Append raw bytes received from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop exactly one complete frame, if one is buffered.
    ///
    /// Bytes belonging to the next frame stay buffered.
    pub fn decode(&mut self) -> Result<Decoded> {
        if self.buf.len() < HEADER_LEN {
            return Ok(Decoded::Incomplete);
        }
        let header = [self.buf[0], self.buf[1], self.buf[2], self.buf[3]];
        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_frame_len {
            return Err(SyncError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        let end = HEADER_LEN + len;
        if self.buf.len() < end {
            return Ok(Decoded::Incomplete);
        }
        let frame = self.buf[HEADER_LEN..end].to_vec();
        self.buf.drain(..end);
        Ok(Decoded::Frame(frame))
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

/// Outcome of a bounded receive attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Frame(Vec<u8>),
    Incomplete,
    Closed,
}

/// Pulls frames off an async byte stream.
pub struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_len: usize) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(max_frame_len),
        }
    }

    /// Wait for the next complete frame. `None` means the peer closed the
    /// stream; a trailing partial frame is discarded.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Decoded::Frame(frame) = self.decoder.decode()? {
                return Ok(Some(frame));
            }
            if !self.fill().await? {
                return Ok(None);
            }
        }
    }

    /// Try to complete one frame within `wait`.
    ///
    /// A timeout yields [`Received::Incomplete`] and leaves any partial bytes
    /// buffered for the next attempt.
    pub async fn poll_frame(&mut self, wait: Duration) -> Result<Received> {
        if let Decoded::Frame(frame) = self.decoder.decode()? {
            return Ok(Received::Frame(frame));
        }
        match tokio::time::timeout(wait, self.fill()).await {
            Err(_) => Ok(Received::Incomplete),
            Ok(Ok(false)) => Ok(Received::Closed),
            Ok(Ok(true)) => match self.decoder.decode()? {
                Decoded::Frame(frame) => Ok(Received::Frame(frame)),
                Decoded::Incomplete => Ok(Received::Incomplete),
            },
            Ok(Err(e)) => Err(e.into()),
        }
    }

    /// Bytes buffered towards an unfinished frame.
    pub fn pending(&self) -> usize {
        self.decoder.buffered()
    }

    // `read` is cancel safe: a dropped future has consumed nothing.
    async fn fill(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.inner.read(&mut chunk).await?;
        if n == 0 {
            return Ok(false);
        }
        self.decoder.extend(&chunk[..n]);
        Ok(true)
    }
}

/// Frame `payload` and write it out in full.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
