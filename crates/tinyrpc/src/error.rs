use std::fmt;
use std::time::Duration;

use crate::codec::CodecError;

/// Client- and connection-level failures.
#[derive(Debug)]
pub enum RpcError {
    /// The client was closed, or a prior transport failure shut it down.
    Shutdown,
    /// Transport failure.
    Io(std::io::Error),
    /// Framing or (de)serialization failure.
    Codec(CodecError),
    /// The handshake echo carried the wrong protocol magic.
    InvalidMagic(u32),
    /// Dial plus handshake exceeded the connect timeout.
    ConnectTimeout(Duration),
    /// The HTTP-upgrade exchange was refused.
    HandshakeRejected(String),
    /// The server reported a per-request failure.
    Remote(String),
    /// The caller canceled the call before a response arrived.
    Canceled(String),
    /// The connection died with calls in flight.
    Disconnected(String),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Shutdown => write!(f, "connection is shut down"),
            RpcError::Io(e) => write!(f, "io error: {}", e),
            RpcError::Codec(e) => write!(f, "{}", e),
            RpcError::InvalidMagic(magic) => {
                write!(f, "rpc client: invalid magic number in handshake echo: {:#x}", magic)
            }
            RpcError::ConnectTimeout(timeout) => {
                write!(f, "rpc client: connect timeout: expect within {:?}", timeout)
            }
            RpcError::HandshakeRejected(status) => {
                write!(f, "unexpected HTTP response: {}", status)
            }
            RpcError::Remote(msg) => write!(f, "{}", msg),
            RpcError::Canceled(cause) => write!(f, "rpc client: call failed: {}", cause),
            RpcError::Disconnected(cause) => {
                write!(f, "rpc client: connection lost: {}", cause)
            }
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RpcError::Io(e) => Some(e),
            RpcError::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        RpcError::Io(e)
    }
}

impl From<CodecError> for RpcError {
    fn from(e: CodecError) -> Self {
        RpcError::Codec(e)
    }
}

impl RpcError {
    /// Whether this error means the client is unusable for further calls.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, RpcError::Shutdown)
    }
}
