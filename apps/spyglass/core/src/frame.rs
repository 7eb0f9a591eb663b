//! Length-prefixed framing over a byte stream.
//!
//! Each message is written as:
//! - `header_width` bytes: payload length as ASCII decimal, right-padded with spaces
//! - N bytes: payload
//!
//! A peer that goes away before a complete header or payload arrives yields
//! `Ok(None)` from the receive side. There is no partial-message recovery:
//! a short read anywhere aborts the whole receive.

use std::io;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Header width used by current deployments. Older peers used 12.
pub const DEFAULT_HEADER_WIDTH: usize = 64;
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Upfront buffer reservation for an incoming payload.
const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("payload of {len} bytes does not fit a {width}-byte header")]
    HeaderOverflow { len: usize, width: usize },
    #[error("invalid frame header {0:?}")]
    InvalidHeader(String),
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("frame i/o failed: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// True when the error means the peer is gone rather than misbehaving.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, FrameError::Io(err) if is_disconnect(err))
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// Fixed per-deployment framing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    header_width: usize,
    max_payload: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            header_width: DEFAULT_HEADER_WIDTH,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl FrameCodec {
    pub fn new(header_width: usize) -> Self {
        Self {
            header_width: header_width.max(1),
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    #[must_use]
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn header_width(&self) -> usize {
        self.header_width
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn encode_header(&self, len: usize) -> Result<Vec<u8>, FrameError> {
        if len > self.max_payload {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_payload,
            });
        }
        let mut header = len.to_string().into_bytes();
        if header.len() > self.header_width {
            return Err(FrameError::HeaderOverflow {
                len,
                width: self.header_width,
            });
        }
        header.resize(self.header_width, b' ');
        Ok(header)
    }

    pub fn decode_header(&self, header: &[u8]) -> Result<usize, FrameError> {
        let text = std::str::from_utf8(header)
            .map_err(|_| FrameError::InvalidHeader(String::from_utf8_lossy(header).into_owned()))?;
        let len: usize = text
            .trim()
            .parse()
            .map_err(|_| FrameError::InvalidHeader(text.to_owned()))?;
        if len > self.max_payload {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_payload,
            });
        }
        Ok(len)
    }
}

async fn read_frame<R>(reader: &mut R, codec: &FrameCodec) -> Result<Option<Bytes>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = vec![0u8; codec.header_width];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if is_disconnect(&err) => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = codec.decode_header(&header)?;

    // The buffer grows with the bytes that actually arrive, not with the
    // length the header claims.
    let mut payload = Vec::with_capacity(len.min(READ_CHUNK));
    let mut limited = (&mut *reader).take(len as u64);
    match limited.read_to_end(&mut payload).await {
        Ok(_) if payload.len() == len => Ok(Some(Bytes::from(payload))),
        Ok(_) => Ok(None),
        Err(err) if is_disconnect(&err) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

async fn write_frame<W>(writer: &mut W, codec: &FrameCodec, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let header = codec.encode_header(payload.len())?;
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive half of a framed stream.
pub struct FrameReader<R> {
    inner: R,
    codec: FrameCodec,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, codec: FrameCodec) -> Self {
        Self { inner, codec }
    }

    /// `Ok(None)` means the peer disconnected.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, FrameError> {
        read_frame(&mut self.inner, &self.codec).await
    }
}

/// Send half of a framed stream.
pub struct FrameWriter<W> {
    inner: W,
    codec: FrameCodec,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, codec: FrameCodec) -> Self {
        Self { inner, codec }
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        write_frame(&mut self.inner, &self.codec, payload).await
    }

    /// Best-effort close of the write direction.
    pub async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }

    pub fn into_parts(self) -> (W, FrameCodec) {
        (self.inner, self.codec)
    }
}

/// A whole framed stream, used until a connection needs concurrent
/// reads and writes.
pub struct FramedChannel<S> {
    stream: S,
    codec: FrameCodec,
}

impl<S> FramedChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, codec: FrameCodec) -> Self {
        Self { stream, codec }
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        write_frame(&mut self.stream, &self.codec, payload).await
    }

    /// `Ok(None)` means the peer disconnected.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, FrameError> {
        read_frame(&mut self.stream, &self.codec).await
    }

    /// Best-effort close of the write direction; the stream is dropped with
    /// the channel.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    pub fn into_split(self) -> (FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>) {
        let (read, write) = tokio::io::split(self.stream);
        (
            FrameReader::new(read, self.codec),
            FrameWriter::new(write, self.codec),
        )
    }
}
