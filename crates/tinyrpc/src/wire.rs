//! Length-delimited framing over a split byte stream.
//!
//! Every RPC message is a header frame followed by a body frame; each frame
//! is a varint length prefix followed by that many bytes in the connection's
//! negotiated [`Encoding`]. [`MessageCodec`] owns both halves of the stream
//! and hands out clones that share them, so one task can sit in the read
//! loop while others write responses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};
use tokio::sync::Mutex as AsyncMutex;

use crate::codec::{CodecError, Encoding, Header};

/// Maximum varint length in bytes.
const MAX_VARINT_LEN: usize = 10;

/// Frames announcing a length beyond this are rejected outright.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub(crate) type BoxReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
pub(crate) type BoxWriter = BufWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// Split a duplex stream into the buffered boxed halves the handshake and
/// codec operate on.
pub(crate) fn split_stream<S>(stream: S) -> (BoxReader, BoxWriter)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (r, w) = tokio::io::split(stream);
    (
        BufReader::new(Box::new(r) as Box<dyn AsyncRead + Send + Unpin>),
        BufWriter::new(Box::new(w) as Box<dyn AsyncWrite + Send + Unpin>),
    )
}

/// Encode a u64 value as a varint into a buffer.
/// Returns the number of bytes written.
fn encode_varint(mut value: u64, buf: &mut [u8; MAX_VARINT_LEN]) -> usize {
    let mut i = 0;
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf[i] = byte;
            return i + 1;
        }
        buf[i] = byte | 0x80;
        i += 1;
    }
}

/// Result of reading a varint length prefix from the stream.
enum VarintResult {
    /// Successfully read a varint value.
    Value(u64),
    /// Stream ended cleanly before any varint bytes were read.
    CleanEof,
    /// Stream ended after reading some varint bytes but before termination.
    Truncated,
    /// Varint exceeded 10 bytes without terminating.
    TooLong,
}

async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<VarintResult, std::io::Error> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;

    for bytes_read in 0..MAX_VARINT_LEN {
        let mut byte = [0u8; 1];
        match reader.read_exact(&mut byte).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Distinguish clean close from a torn prefix.
                if bytes_read == 0 {
                    return Ok(VarintResult::CleanEof);
                }
                return Ok(VarintResult::Truncated);
            }
            Err(e) => return Err(e),
        }

        value |= ((byte[0] & 0x7F) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(VarintResult::Value(value));
        }
        shift += 7;
    }

    Ok(VarintResult::TooLong)
}

/// Frames `(Header, Body)` pairs over a byte stream in a fixed encoding.
///
/// Writes are buffered and flushed once per logical message, which bounds
/// the window in which a partial frame is visible to the peer; a failed
/// write closes the stream since the frame boundary can no longer be
/// trusted. Reads and writes are serialized internally per direction, but
/// the header/body pairing is not: the connection must have a single
/// logical reader.
#[derive(Clone)]
pub struct MessageCodec {
    inner: Arc<CodecInner>,
}

struct CodecInner {
    reader: AsyncMutex<BoxReader>,
    writer: AsyncMutex<BoxWriter>,
    closed: AtomicBool,
    encoding: Encoding,
}

impl std::fmt::Debug for MessageCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCodec")
            .field("encoding", &self.inner.encoding)
            .finish_non_exhaustive()
    }
}

impl MessageCodec {
    pub(crate) fn new(reader: BoxReader, writer: BoxWriter, encoding: Encoding) -> Self {
        Self {
            inner: Arc::new(CodecInner {
                reader: AsyncMutex::new(reader),
                writer: AsyncMutex::new(writer),
                closed: AtomicBool::new(false),
                encoding,
            }),
        }
    }

    /// The encoding negotiated for this connection.
    pub fn encoding(&self) -> Encoding {
        self.inner.encoding
    }

    /// Read and decode the next header frame.
    ///
    /// Returns [`CodecError::Eof`] when the peer closed the stream between
    /// messages and [`CodecError::Truncated`] when it died mid-frame.
    pub async fn read_header(&self) -> Result<Header, CodecError> {
        let buf = self.read_frame().await?;
        self.inner.encoding.decode(&buf)
    }

    /// Read the next body frame, raw.
    ///
    /// A body always follows a header, so end-of-stream here is truncation.
    /// Dropping the returned buffer discards the body, which is how an
    /// unwanted response is drained.
    pub async fn read_body(&self) -> Result<Vec<u8>, CodecError> {
        match self.read_frame().await {
            Err(CodecError::Eof) => Err(CodecError::Truncated),
            other => other,
        }
    }

    async fn read_frame(&self) -> Result<Vec<u8>, CodecError> {
        let mut reader = self.inner.reader.lock().await;

        let len = match read_varint(&mut *reader).await? {
            VarintResult::Value(len) => len as usize,
            VarintResult::CleanEof => return Err(CodecError::Eof),
            VarintResult::Truncated => return Err(CodecError::Truncated),
            VarintResult::TooLong => {
                return Err(CodecError::Decode(
                    "varint length prefix exceeded 10 bytes".to_string(),
                ))
            }
        };

        if len > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge {
                len,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut buf = vec![0u8; len];
        if len > 0 {
            reader.read_exact(&mut buf).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    CodecError::Truncated
                } else {
                    CodecError::Io(e)
                }
            })?;
        }
        Ok(buf)
    }

    /// Encode and write one `(header, body)` message.
    pub async fn write<T: Serialize>(&self, header: &Header, body: &T) -> Result<(), CodecError> {
        let body_bytes = self.inner.encoding.encode(body)?;
        self.write_raw(header, &body_bytes).await
    }

    /// Write one `(header, body)` message with an already-encoded body.
    ///
    /// The header and body frames go out under one writer lock and one
    /// flush. A transport failure closes the codec before returning.
    pub async fn write_raw(&self, header: &Header, body: &[u8]) -> Result<(), CodecError> {
        let header_bytes = self.inner.encoding.encode(header)?;

        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = write_message(&mut writer, &header_bytes, body).await {
            self.inner.closed.store(true, Ordering::Release);
            let _ = writer.shutdown().await;
            return Err(CodecError::Io(e));
        }
        Ok(())
    }

    /// Flush and shut down the write side. Idempotent.
    pub async fn close(&self) -> Result<(), CodecError> {
        let was_closed = self.inner.closed.swap(true, Ordering::AcqRel);
        if was_closed {
            return Ok(());
        }
        let mut writer = self.inner.writer.lock().await;
        writer.shutdown().await.map_err(CodecError::Io)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

async fn write_message(
    writer: &mut BoxWriter,
    header: &[u8],
    body: &[u8],
) -> Result<(), std::io::Error> {
    write_frame(writer, header).await?;
    write_frame(writer, body).await?;
    writer.flush().await
}

async fn write_frame(writer: &mut BoxWriter, payload: &[u8]) -> Result<(), std::io::Error> {
    let mut varint_buf = [0u8; MAX_VARINT_LEN];
    let varint_len = encode_varint(payload.len() as u64, &mut varint_buf);
    writer.write_all(&varint_buf[..varint_len]).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    Ok(())
}
