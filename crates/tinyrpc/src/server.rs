//! RPC server: accept loops, per-connection handshake, request dispatch.
//!
//! Each connection runs one request loop (the single reader) that parses
//! `(header, body)` pairs and spawns a handler task per request, so slow
//! methods never stall the connection. Responses funnel back through the
//! codec's internal write lock in whatever order handlers finish.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::codec::{CodecError, Header};
use crate::error::RpcError;
use crate::http;
use crate::options::{Options, MAGIC};
use crate::service::{
    MethodDescriptor, MethodError, Registry, RegistryError, Service, ServiceError,
};
use crate::wire::{self, BoxReader, BoxWriter, MessageCodec};

/// Placeholder body sent when the server has a header but no valid reply.
const INVALID_REQUEST: &[u8] = &[];

/// An RPC server holding a registry of callable services.
///
/// Cheap to share: accept loops and connections borrow it through an `Arc`.
pub struct Server {
    registry: Registry,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Server {
            registry: Registry::new(),
        }
    }

    /// Register a service; duplicate names are rejected.
    pub fn register(&self, service: Service) -> Result<(), RegistryError> {
        self.registry.register(service)
    }

    /// Accept connections until the listener fails.
    ///
    /// Every connection is served on its own task; a connection-level error
    /// never takes down its siblings.
    pub async fn accept(self: Arc<Self>, listener: TcpListener) -> Result<(), RpcError> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(err = %e, "rpc server: accept error");
                    return Err(e.into());
                }
            };
            debug!(%peer, "rpc server: accepted connection");
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server.serve_conn(stream).await;
            });
        }
    }

    /// Accept loop over a Unix-domain listener.
    #[cfg(unix)]
    pub async fn accept_unix(
        self: Arc<Self>,
        listener: tokio::net::UnixListener,
    ) -> Result<(), RpcError> {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(err = %e, "rpc server: accept error");
                    return Err(e.into());
                }
            };
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server.serve_conn(stream).await;
            });
        }
    }

    /// Accept loop that expects an HTTP CONNECT upgrade before the RPC
    /// handshake. Non-CONNECT requests get a 405 and the connection closes.
    pub async fn accept_http(self: Arc<Self>, listener: TcpListener) -> Result<(), RpcError> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(err = %e, "rpc server: accept error");
                    return Err(e.into());
                }
            };
            debug!(%peer, "rpc server: accepted http connection");
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server.serve_http_conn(stream).await;
            });
        }
    }

    /// Serve one raw connection: handshake, then the request loop.
    pub async fn serve_conn<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = wire::split_stream(stream);
        self.serve_parts(reader, writer).await;
    }

    /// Serve one connection that starts with an HTTP CONNECT upgrade.
    pub async fn serve_http_conn<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = wire::split_stream(stream);
        match http::server_upgrade(&mut reader, &mut writer).await {
            Ok(true) => self.serve_parts(reader, writer).await,
            Ok(false) => {}
            Err(e) => warn!(err = %e, "rpc server: http upgrade error"),
        }
    }

    async fn serve_parts(&self, mut reader: BoxReader, mut writer: BoxWriter) {
        let opt = match Options::read_line(&mut reader).await {
            Ok(opt) => opt,
            Err(e) => {
                warn!(err = %e, "rpc server: options error");
                return;
            }
        };
        if opt.magic != MAGIC {
            warn!(magic = format_args!("{:#x}", opt.magic), "rpc server: invalid magic number");
            return;
        }
        // The echo tells the client the handshake was accepted and that
        // everything after this line is framed traffic.
        if let Err(e) = opt.write_line(&mut writer).await {
            warn!(err = %e, "rpc server: option echo error");
            return;
        }

        let codec = MessageCodec::new(reader, writer, opt.codec_type);
        self.serve_codec(codec, opt.handle_timeout).await;
    }

    async fn serve_codec(&self, codec: MessageCodec, handle_timeout: Duration) {
        let mut handlers = JoinSet::new();
        loop {
            let mut header = match codec.read_header().await {
                Ok(h) => h,
                Err(CodecError::Eof) => break,
                Err(e) => {
                    warn!(err = %e, "rpc server: read header err");
                    break;
                }
            };
            // The body frame always follows its header; losing it means the
            // stream itself is gone.
            let body = match codec.read_body().await {
                Ok(b) => b,
                Err(e) => {
                    warn!(err = %e, "rpc server: read body err");
                    break;
                }
            };

            let method = match self.registry.find(&header.service_method) {
                Ok(m) => m,
                Err(e) => {
                    header.error = e.to_string();
                    send_response(&codec, &header, INVALID_REQUEST).await;
                    continue;
                }
            };

            let codec = codec.clone();
            handlers.spawn(async move {
                handle_request(codec, header, method, body, handle_timeout).await;
            });
        }

        // Let in-flight handlers finish their responses before closing.
        while handlers.join_next().await.is_some() {}
        let _ = codec.close().await;
    }
}

async fn handle_request(
    codec: MessageCodec,
    mut header: Header,
    method: Arc<MethodDescriptor>,
    body: Vec<u8>,
    handle_timeout: Duration,
) {
    let encoding = codec.encoding();
    let invoke = async move { method.invoke(encoding, body).await };

    if handle_timeout.is_zero() {
        let result = invoke.await;
        send_result(&codec, &mut header, result).await;
        return;
    }

    // The invocation runs as its own task so that a timed-out request can
    // leave it behind; dropping the handle detaches it and its eventual
    // result is discarded without anyone blocking on it.
    let mut invocation = tokio::spawn(invoke);
    tokio::select! {
        joined = &mut invocation => {
            let result = joined.unwrap_or_else(|e| {
                Err(ServiceError::Method(MethodError::new(format!(
                    "rpc server: handler panic: {}",
                    e
                ))))
            });
            send_result(&codec, &mut header, result).await;
        }
        _ = tokio::time::sleep(handle_timeout) => {
            header.error = format!(
                "rpc server: request handle timeout: expect within {:?}",
                handle_timeout
            );
            send_response(&codec, &header, INVALID_REQUEST).await;
        }
    }
}

async fn send_result(codec: &MessageCodec, header: &mut Header, result: Result<Vec<u8>, ServiceError>) {
    match result {
        Ok(reply) => send_response(codec, header, &reply).await,
        Err(e) => {
            header.error = e.to_string();
            send_response(codec, header, INVALID_REQUEST).await;
        }
    }
}

async fn send_response(codec: &MessageCodec, header: &Header, body: &[u8]) {
    if let Err(e) = codec.write_raw(header, body).await {
        warn!(err = %e, "rpc server: write response error");
    }
}
