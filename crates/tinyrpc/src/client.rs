//! RPC client: sequence assignment, pending-call tracking, response demux.
//!
//! One receive task owns the read side of the connection and routes each
//! response to its waiting call by sequence number. Callers share the
//! client freely; sends are serialized by a lock that also orders sequence
//! assignment, so the server observes strictly increasing `seq` per client.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::{CodecError, Encoding, Header};
use crate::error::RpcError;
use crate::http;
use crate::options::{Options, MAGIC};
use crate::wire::{self, BoxReader, BoxWriter, MessageCodec};

type CompletionSender = oneshot::Sender<Result<Vec<u8>, RpcError>>;
type CompletionReceiver = oneshot::Receiver<Result<Vec<u8>, RpcError>>;

/// A connected RPC client.
///
/// Clones share one connection; any number of tasks may call concurrently.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

struct ClientInner {
    codec: MessageCodec,
    /// Serializes request transmission, and is briefly held by
    /// `terminate_calls` so termination cannot race a half-written frame.
    send_lock: AsyncMutex<()>,
    state: Mutex<ClientState>,
}

struct ClientState {
    seq: u64,
    pending: HashMap<u64, CompletionSender>,
    /// Set by an explicit `close`.
    closing: bool,
    /// Set when the connection died underneath us.
    shutdown: bool,
}

impl ClientInner {
    fn register_call(&self, sender: CompletionSender) -> Result<u64, RpcError> {
        let mut state = self.state.lock();
        if state.closing || state.shutdown {
            return Err(RpcError::Shutdown);
        }
        let seq = state.seq;
        state.seq += 1;
        state.pending.insert(seq, sender);
        Ok(seq)
    }

    fn remove_call(&self, seq: u64) -> Option<CompletionSender> {
        self.state.lock().pending.remove(&seq)
    }

    /// Fail every pending call and refuse new ones.
    ///
    /// Lock order: send lock, then state lock. Holding the send lock means
    /// no request can be mid-write while its caller is being failed.
    async fn terminate_calls(&self, err: RpcError) {
        let _send = self.send_lock.lock().await;
        let mut state = self.state.lock();
        state.shutdown = true;
        for (_, sender) in state.pending.drain() {
            let _ = sender.send(Err(match &err {
                RpcError::Shutdown => RpcError::Shutdown,
                RpcError::Disconnected(cause) => RpcError::Disconnected(cause.clone()),
                other => RpcError::Disconnected(other.to_string()),
            }));
        }
    }
}

/// Handle for one in-flight request, resolving to the decoded reply.
///
/// Completion is delivered at most once. Dropping an unresolved call
/// abandons it: the pending entry is removed and a late response from the
/// server is drained instead of delivered.
pub struct Call<R> {
    seq: u64,
    service_method: String,
    rx: CompletionReceiver,
    inner: Arc<ClientInner>,
    encoding: Encoding,
    completed: bool,
    _reply: PhantomData<fn() -> R>,
}

impl<R> Call<R> {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn service_method(&self) -> &str {
        &self.service_method
    }
}

impl<R: DeserializeOwned> Future for Call<R> {
    type Output = Result<R, RpcError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(res) => {
                this.completed = true;
                let out = match res {
                    Ok(Ok(body)) => this.encoding.decode(&body).map_err(RpcError::Codec),
                    Ok(Err(e)) => Err(e),
                    // The sender only disappears through termination.
                    Err(_) => Err(RpcError::Shutdown),
                };
                Poll::Ready(out)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<R> Drop for Call<R> {
    fn drop(&mut self) {
        if !self.completed {
            let _ = self.inner.remove_call(self.seq);
        }
    }
}

impl Client {
    /// Handshake over an established stream and start the receive task.
    ///
    /// Sends `opt`, waits for the server's echo (which confirms acceptance
    /// and keeps codec frames out of the text prefix), then spawns the task
    /// that demultiplexes responses for the life of the connection.
    pub async fn new<S>(conn: S, opt: Options) -> Result<Client, RpcError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = wire::split_stream(conn);
        Client::handshake(reader, writer, opt).await
    }

    /// Like [`Client::new`], but performs the HTTP CONNECT upgrade first.
    pub async fn new_http<S>(conn: S, opt: Options) -> Result<Client, RpcError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = wire::split_stream(conn);
        http::client_upgrade(&mut reader, &mut writer).await?;
        Client::handshake(reader, writer, opt).await
    }

    async fn handshake(
        mut reader: BoxReader,
        mut writer: BoxWriter,
        opt: Options,
    ) -> Result<Client, RpcError> {
        opt.write_line(&mut writer).await?;
        let echo = Options::read_line(&mut reader).await?;
        if echo.magic != MAGIC {
            return Err(RpcError::InvalidMagic(echo.magic));
        }

        let codec = MessageCodec::new(reader, writer, opt.codec_type);
        let inner = Arc::new(ClientInner {
            codec,
            send_lock: AsyncMutex::new(()),
            state: Mutex::new(ClientState {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
        });
        tokio::spawn(receive_loop(Arc::clone(&inner)));
        Ok(Client { inner })
    }

    /// Connect over TCP with the connect timeout applied to both the socket
    /// connect and the handshake. A zero timeout waits indefinitely.
    pub async fn dial(addr: &str, opt: Options) -> Result<Client, RpcError> {
        let timeout = opt.connect_timeout;
        let stream =
            with_connect_timeout(timeout, async { Ok(TcpStream::connect(addr).await?) }).await?;
        with_connect_timeout(timeout, Client::new(stream, opt)).await
    }

    /// Connect through an HTTP endpoint via CONNECT upgrade.
    pub async fn dial_http(addr: &str, opt: Options) -> Result<Client, RpcError> {
        let timeout = opt.connect_timeout;
        let stream =
            with_connect_timeout(timeout, async { Ok(TcpStream::connect(addr).await?) }).await?;
        with_connect_timeout(timeout, Client::new_http(stream, opt)).await
    }

    /// Connect over a Unix-domain socket.
    #[cfg(unix)]
    pub async fn dial_unix(path: &str, opt: Options) -> Result<Client, RpcError> {
        let timeout = opt.connect_timeout;
        let stream = with_connect_timeout(timeout, async {
            Ok(tokio::net::UnixStream::connect(path).await?)
        })
        .await?;
        with_connect_timeout(timeout, Client::new(stream, opt)).await
    }

    /// Issue a request asynchronously, returning the in-flight [`Call`].
    ///
    /// Fails fast with [`RpcError::Shutdown`] once the client is closing or
    /// shut down. A transmission failure is delivered through the returned
    /// call rather than lost.
    pub async fn go<A, R>(&self, service_method: &str, args: &A) -> Result<Call<R>, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        // Register and transmit under the send lock: sequence order on the
        // wire is assignment order.
        let _send = self.inner.send_lock.lock().await;

        let (tx, rx) = oneshot::channel();
        let seq = self.inner.register_call(tx)?;
        let header = Header {
            service_method: service_method.to_string(),
            seq,
            error: String::new(),
        };

        if let Err(e) = self.inner.codec.write(&header, args).await {
            if let Some(sender) = self.inner.remove_call(seq) {
                let _ = sender.send(Err(e.into()));
            }
        }

        Ok(Call {
            seq,
            service_method: service_method.to_string(),
            rx,
            inner: Arc::clone(&self.inner),
            encoding: self.inner.codec.encoding(),
            completed: false,
            _reply: PhantomData,
        })
    }

    /// Call synchronously: issue the request and wait for its reply.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.go(service_method, args).await?.await
    }

    /// Call, racing the reply against caller-driven cancellation.
    ///
    /// On cancellation the pending entry is removed and the server's
    /// eventual response is drained; the server itself is not notified.
    pub async fn call_with_cancel<A, R>(
        &self,
        token: &CancellationToken,
        service_method: &str,
        args: &A,
    ) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let call = self.go(service_method, args).await?;
        tokio::select! {
            _ = token.cancelled() => Err(RpcError::Canceled("context canceled".to_string())),
            res = call => res,
        }
    }

    /// Whether the client can still issue calls.
    pub fn is_available(&self) -> bool {
        let state = self.inner.state.lock();
        !state.closing && !state.shutdown
    }

    /// Close the connection. Pending calls are failed by the receive task
    /// once the stream unwinds; a second close returns [`RpcError::Shutdown`].
    pub async fn close(&self) -> Result<(), RpcError> {
        {
            let mut state = self.inner.state.lock();
            if state.closing {
                return Err(RpcError::Shutdown);
            }
            state.closing = true;
        }
        self.inner.codec.close().await?;
        Ok(())
    }
}

async fn with_connect_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T, RpcError>>,
) -> Result<T, RpcError> {
    if timeout.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(RpcError::ConnectTimeout(timeout)),
    }
}

/// The connection's single reader: demultiplexes responses by `seq`.
async fn receive_loop(inner: Arc<ClientInner>) {
    let codec = inner.codec.clone();
    let err = loop {
        let header = match codec.read_header().await {
            Ok(h) => h,
            Err(e) => break e,
        };

        match inner.remove_call(header.seq) {
            None => {
                // Already canceled, or the request never finished sending;
                // the body still has to come off the stream.
                match codec.read_body().await {
                    Ok(_) => debug!(seq = header.seq, "rpc client: discarding response"),
                    Err(e) => break e,
                }
            }
            Some(sender) if !header.error.is_empty() => {
                if let Err(e) = codec.read_body().await {
                    break e;
                }
                let _ = sender.send(Err(RpcError::Remote(header.error)));
            }
            Some(sender) => match codec.read_body().await {
                Ok(body) => {
                    let _ = sender.send(Ok(body));
                }
                Err(e) => {
                    let _ = sender.send(Err(RpcError::Disconnected(format!(
                        "reading body: {}",
                        e
                    ))));
                    break e;
                }
            },
        }
    };

    let err = match err {
        CodecError::Eof => RpcError::Shutdown,
        other => RpcError::Disconnected(other.to_string()),
    };
    inner.terminate_calls(err).await;
}
