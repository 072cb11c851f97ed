//! HTTP CONNECT upgrade.
//!
//! A client may reach an RPC server through an HTTP endpoint: it issues
//! `CONNECT /_tinyrpc_ HTTP/1.0`, the server answers `200 Connected to RPC`,
//! and from then on the socket carries the ordinary handshake and framed
//! traffic. Line endings are bare `\n`, matching the exchange the protocol
//! has always used on the wire.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

use crate::error::RpcError;
use crate::wire::{BoxReader, BoxWriter};

/// Path the CONNECT request targets.
pub const DEFAULT_RPC_PATH: &str = "/_tinyrpc_";

/// Status text confirming the upgrade.
pub(crate) const CONNECTED: &str = "200 Connected to RPC";

/// Client side: request the upgrade and consume the response.
pub(crate) async fn client_upgrade(
    reader: &mut BoxReader,
    writer: &mut BoxWriter,
) -> Result<(), RpcError> {
    writer
        .write_all(format!("CONNECT {} HTTP/1.0\n\n", DEFAULT_RPC_PATH).as_bytes())
        .await?;
    writer.flush().await?;

    let mut status = String::new();
    let n = reader.read_line(&mut status).await?;
    if n == 0 {
        return Err(RpcError::HandshakeRejected(
            "connection closed before HTTP response".to_string(),
        ));
    }
    let status = status.trim();
    if !status.contains(CONNECTED) {
        return Err(RpcError::HandshakeRejected(status.to_string()));
    }
    drain_headers(reader).await?;
    Ok(())
}

/// Server side: accept a CONNECT for the RPC path, reject anything else.
///
/// Returns `true` when the socket is now raw and the RPC handshake should
/// proceed.
pub(crate) async fn server_upgrade(
    reader: &mut BoxReader,
    writer: &mut BoxWriter,
) -> Result<bool, RpcError> {
    let mut request_line = String::new();
    let n = reader.read_line(&mut request_line).await?;
    if n == 0 {
        return Ok(false);
    }
    drain_headers(reader).await?;

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");
    if method != "CONNECT" || path != DEFAULT_RPC_PATH {
        writer
            .write_all(
                b"HTTP/1.0 405 Method Not Allowed\nContent-Type: text/plain; charset=utf-8\n\n405 must CONNECT\n",
            )
            .await?;
        writer.flush().await?;
        return Ok(false);
    }

    writer
        .write_all(format!("HTTP/1.0 {}\n\n", CONNECTED).as_bytes())
        .await?;
    writer.flush().await?;
    Ok(true)
}

/// Consume header lines up to and including the blank line.
async fn drain_headers(reader: &mut BoxReader) -> Result<(), RpcError> {
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line.trim().is_empty() {
            return Ok(());
        }
    }
}
