//! Message encodings and the per-message envelope.
//!
//! The wire layer moves opaque frames; this module is where typed values
//! become bytes. [`Codec`] is the compile-time contract (one implementation
//! per format), [`Encoding`] is the runtime tag negotiated in the handshake
//! and used to dispatch between them.

use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Per-message envelope preceding every body frame.
///
/// Clients leave `error` empty; servers fill it to propagate a failure
/// reason for the request identified by `seq`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Qualified method name, format `"Service.Method"`.
    pub service_method: String,
    /// Client-assigned sequence number, unique per connection.
    pub seq: u64,
    /// Empty on success and on all client-originated messages.
    pub error: String,
}

/// Encoding format identifier for message serialization.
///
/// The tag is exchanged during the handshake so both peers frame messages
/// the same way for the lifetime of the connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    /// Postcard: compact binary format (the default).
    #[default]
    #[serde(rename = "application/postcard")]
    Postcard,
    /// JSON: human-readable format (for debugging/tooling).
    #[serde(rename = "application/json")]
    Json,
}

impl Encoding {
    /// The tag string carried in the handshake.
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Postcard => "application/postcard",
            Encoding::Json => "application/json",
        }
    }

    /// Parse a tag string back into an encoding.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "application/postcard" => Some(Encoding::Postcard),
            "application/json" => Some(Encoding::Json),
            _ => None,
        }
    }

    /// Encode a value with the codec this tag names.
    pub fn encode<T: Serialize>(self, val: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Encoding::Postcard => {
                PostcardCodec::encode(val).map_err(|e| CodecError::Encode(e.to_string()))
            }
            Encoding::Json => {
                JsonCodec::encode(val).map_err(|e| CodecError::Encode(e.to_string()))
            }
        }
    }

    /// Decode a value with the codec this tag names.
    pub fn decode<T: DeserializeOwned>(self, buf: &[u8]) -> Result<T, CodecError> {
        match self {
            Encoding::Postcard => {
                PostcardCodec::decode(buf).map_err(|e| CodecError::Decode(e.to_string()))
            }
            Encoding::Json => {
                JsonCodec::decode(buf).map_err(|e| CodecError::Decode(e.to_string()))
            }
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Codec trait for message serialization.
///
/// Implementations provide encoding/decoding for specific serialization
/// formats. Each codec declares its encoding tag and error types.
pub trait Codec {
    /// The encoding tag this codec implements.
    const ENCODING: Encoding;

    /// Error type returned by encode operations.
    type EncodeError: std::error::Error;

    /// Error type returned by decode operations.
    type DecodeError: std::error::Error;

    /// Encode a value into bytes.
    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError>;

    /// Decode bytes into a value.
    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError>;
}

/// Postcard codec: compact binary format, the default for RPC frames.
pub struct PostcardCodec;

impl Codec for PostcardCodec {
    const ENCODING: Encoding = Encoding::Postcard;
    type EncodeError = postcard::Error;
    type DecodeError = postcard::Error;

    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError> {
        postcard::to_allocvec(val)
    }

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError> {
        postcard::from_bytes(buf)
    }
}

/// JSON codec: human-readable, larger and slower than the binary format.
pub struct JsonCodec;

impl Codec for JsonCodec {
    const ENCODING: Encoding = Encoding::Json;
    type EncodeError = serde_json::Error;
    type DecodeError = serde_json::Error;

    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError> {
        serde_json::to_vec(val)
    }

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError> {
        serde_json::from_slice(buf)
    }
}

/// Errors produced by the codec and framing layer.
#[derive(Debug)]
pub enum CodecError {
    /// The stream ended cleanly between messages.
    Eof,
    /// The stream ended inside a frame.
    Truncated,
    /// A frame announced a length beyond the per-frame cap.
    FrameTooLarge { len: usize, max: usize },
    /// Value serialization failed.
    Encode(String),
    /// Value deserialization failed (or the length prefix was malformed).
    Decode(String),
    /// The underlying transport failed.
    Io(std::io::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Eof => write!(f, "connection closed"),
            CodecError::Truncated => write!(f, "stream ended inside a frame"),
            CodecError::FrameTooLarge { len, max } => {
                write!(f, "frame length {} exceeds maximum {}", len, max)
            }
            CodecError::Encode(msg) => write!(f, "encode error: {}", msg),
            CodecError::Decode(msg) => write!(f, "decode error: {}", msg),
            CodecError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_tag_roundtrip() {
        for encoding in [Encoding::Postcard, Encoding::Json] {
            assert_eq!(Encoding::from_tag(encoding.as_str()), Some(encoding));
        }
        assert_eq!(Encoding::from_tag("application/gob"), None);
    }

    #[test]
    fn header_roundtrip_postcard() {
        let header = Header {
            service_method: "Foo.Sum".to_string(),
            seq: 7,
            error: String::new(),
        };

        let encoded = PostcardCodec::encode(&header).unwrap();
        let decoded: Header = PostcardCodec::decode(&encoded).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn header_roundtrip_json() {
        let header = Header {
            service_method: "Foo.Sum".to_string(),
            seq: u64::MAX,
            error: "rpc server: can't find method Missing".to_string(),
        };

        let encoded = JsonCodec::encode(&header).unwrap();
        let decoded: Header = JsonCodec::decode(&encoded).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn runtime_dispatch_matches_static_codecs() {
        let header = Header {
            service_method: "Echo.Echo".to_string(),
            seq: 3,
            error: String::new(),
        };

        let via_tag = Encoding::Postcard.encode(&header).unwrap();
        let via_codec = PostcardCodec::encode(&header).unwrap();
        assert_eq!(via_tag, via_codec);

        let back: Header = Encoding::Postcard.decode(&via_tag).unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn encoding_serializes_as_tag() {
        let json = serde_json::to_string(&Encoding::Postcard).unwrap();
        assert_eq!(json, "\"application/postcard\"");
        let back: Encoding = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Encoding::Postcard);
    }

    #[test]
    fn decode_rejects_garbage() {
        let result: Result<Header, _> = PostcardCodec::decode(&[0xFF, 0xFF, 0xFF]);
        assert!(result.is_err());

        let result: Result<Header, _> = JsonCodec::decode(b"not json {");
        assert!(result.is_err());
    }

    #[test]
    fn postcard_smaller_than_json() {
        let header = Header {
            service_method: "Foo.Sum".to_string(),
            seq: 42,
            error: String::new(),
        };
        let postcard = PostcardCodec::encode(&header).unwrap();
        let json = JsonCodec::encode(&header).unwrap();
        assert!(postcard.len() < json.len());
    }
}
