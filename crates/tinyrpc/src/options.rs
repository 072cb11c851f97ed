//! Connection-level handshake descriptor.
//!
//! Before any codec frames move, the client sends one [`Options`] value as a
//! single line of JSON and the server echoes it back. The echo confirms the
//! handshake was accepted and delimits the text prefix from the framed
//! traffic that follows, so neither side can misread half a negotiation as a
//! frame.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{CodecError, Encoding};
use crate::error::RpcError;
use crate::wire::BoxReader;

/// Protocol magic identifying a tinyrpc connection.
pub const MAGIC: u32 = 0x3bef5c;

/// Handshake descriptor exchanged once per connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    /// Must equal [`MAGIC`]; anything else is dropped without further reads.
    pub magic: u32,
    /// Message encoding for everything after the handshake.
    pub codec_type: Encoding,
    /// Client-side bound on connect plus handshake. Zero waits indefinitely.
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Server-side bound on handling each request. Zero means unbounded.
    #[serde(rename = "handle_timeout_ms", with = "duration_ms")]
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            magic: MAGIC,
            codec_type: Encoding::Postcard,
            connect_timeout: Duration::from_secs(10),
            handle_timeout: Duration::ZERO,
        }
    }
}

impl Options {
    pub(crate) async fn write_line<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), RpcError> {
        let mut line = serde_json::to_vec(self)
            .map_err(|e| RpcError::Codec(CodecError::Encode(e.to_string())))?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    pub(crate) async fn read_line(reader: &mut BoxReader) -> Result<Options, RpcError> {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed during handshake",
            )));
        }
        serde_json::from_str(line.trim_end())
            .map_err(|e| RpcError::Codec(CodecError::Decode(e.to_string())))
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opt = Options::default();
        assert_eq!(opt.magic, MAGIC);
        assert_eq!(opt.codec_type, Encoding::Postcard);
        assert_eq!(opt.connect_timeout, Duration::from_secs(10));
        assert!(opt.handle_timeout.is_zero());
    }

    #[test]
    fn json_shape() {
        let opt = Options {
            magic: MAGIC,
            codec_type: Encoding::Json,
            connect_timeout: Duration::from_millis(250),
            handle_timeout: Duration::from_secs(1),
        };
        let json = serde_json::to_string(&opt).unwrap();
        assert!(json.contains("\"magic\":3927900"));
        assert!(json.contains("\"codec_type\":\"application/json\""));
        assert!(json.contains("\"connect_timeout_ms\":250"));
        assert!(json.contains("\"handle_timeout_ms\":1000"));

        let back: Options = serde_json::from_str(&json).unwrap();
        assert_eq!(back, opt);
    }

    #[tokio::test]
    async fn line_roundtrip() {
        let (a, b) = tokio::io::duplex(4096);
        let (_ra, mut wa) = crate::wire::split_stream(a);
        let (mut rb, _wb) = crate::wire::split_stream(b);

        let opt = Options::default();
        opt.write_line(&mut wa).await.unwrap();

        let got = Options::read_line(&mut rb).await.unwrap();
        assert_eq!(got, opt);
    }
}
