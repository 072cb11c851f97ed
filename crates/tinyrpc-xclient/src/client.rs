//! The multi-endpoint client.
//!
//! [`XClient`] routes each call to an endpoint chosen by its discovery
//! source, caching one [`Client`] per endpoint and rebuilding it when the
//! cached one has gone stale. [`XClient::broadcast`] fans a call out to
//! every endpoint at once with first-error cancellation.

use std::collections::HashMap;
use std::fmt;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use tinyrpc::{Client, Options, RpcError};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::discovery::{Discovery, DiscoveryError, SelectMode};

#[derive(Debug)]
pub enum XClientError {
    /// Endpoint selection failed.
    Discovery(DiscoveryError),
    /// The underlying call failed.
    Rpc(RpcError),
    /// The address did not parse as `protocol@addr`.
    BadAddress(String),
}

impl fmt::Display for XClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XClientError::Discovery(e) => write!(f, "{}", e),
            XClientError::Rpc(e) => write!(f, "{}", e),
            XClientError::BadAddress(addr) => {
                write!(
                    f,
                    "rpc client err: wrong format '{}', expect protocol@addr",
                    addr
                )
            }
        }
    }
}

impl std::error::Error for XClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            XClientError::Discovery(e) => Some(e),
            XClientError::Rpc(e) => Some(e),
            XClientError::BadAddress(_) => None,
        }
    }
}

impl From<DiscoveryError> for XClientError {
    fn from(e: DiscoveryError) -> Self {
        XClientError::Discovery(e)
    }
}

impl From<RpcError> for XClientError {
    fn from(e: RpcError) -> Self {
        XClientError::Rpc(e)
    }
}

/// Dial a `protocol@addr` endpoint.
///
/// `http` upgrades through CONNECT; `tcp` and `unix` dial the transport
/// directly.
pub async fn xdial(rpc_addr: &str, opt: Options) -> Result<Client, XClientError> {
    let Some((protocol, addr)) = rpc_addr.split_once('@') else {
        return Err(XClientError::BadAddress(rpc_addr.to_string()));
    };
    match protocol {
        "http" => Ok(Client::dial_http(addr, opt).await?),
        "tcp" => Ok(Client::dial(addr, opt).await?),
        #[cfg(unix)]
        "unix" => Ok(Client::dial_unix(addr, opt).await?),
        _ => Err(XClientError::BadAddress(rpc_addr.to_string())),
    }
}

/// A client spanning every endpoint a discovery source knows about.
///
/// Cached per-endpoint clients are shared with concurrent callers for as
/// long as the endpoint stays healthy.
pub struct XClient<D: Discovery> {
    discovery: D,
    mode: SelectMode,
    opt: Options,
    clients: AsyncMutex<HashMap<String, Client>>,
}

impl<D: Discovery> XClient<D> {
    pub fn new(discovery: D, mode: SelectMode, opt: Options) -> Self {
        XClient {
            discovery,
            mode,
            opt,
            clients: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Close and drop every cached client.
    pub async fn close(&self) {
        let mut clients = self.clients.lock().await;
        for (_, client) in clients.drain() {
            let _ = client.close().await;
        }
    }

    /// Cached-or-fresh client for one endpoint.
    ///
    /// A cached client that is no longer available is closed and evicted
    /// before a replacement is dialed.
    async fn dial(&self, rpc_addr: &str) -> Result<Client, XClientError> {
        let mut clients = self.clients.lock().await;

        if let Some(cached) = clients.get(rpc_addr) {
            if cached.is_available() {
                return Ok(cached.clone());
            }
            debug!(addr = %rpc_addr, "rpc xclient: evicting stale client");
            if let Some(stale) = clients.remove(rpc_addr) {
                let _ = stale.close().await;
            }
        }

        let client = xdial(rpc_addr, self.opt.clone()).await?;
        clients.insert(rpc_addr.to_string(), client.clone());
        Ok(client)
    }

    async fn call_addr<A, R>(
        &self,
        rpc_addr: &str,
        token: Option<&CancellationToken>,
        service_method: &str,
        args: &A,
    ) -> Result<R, XClientError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let client = self.dial(rpc_addr).await?;
        let reply = match token {
            Some(token) => client.call_with_cancel(token, service_method, args).await?,
            None => client.call(service_method, args).await?,
        };
        Ok(reply)
    }

    /// Call one endpoint chosen by the configured selection mode.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R, XClientError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let rpc_addr = self.discovery.get(self.mode).await?;
        self.call_addr(&rpc_addr, None, service_method, args).await
    }

    /// Like [`XClient::call`], racing the reply against cancellation.
    pub async fn call_with_cancel<A, R>(
        &self,
        token: &CancellationToken,
        service_method: &str,
        args: &A,
    ) -> Result<R, XClientError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let rpc_addr = self.discovery.get(self.mode).await?;
        self.call_addr(&rpc_addr, Some(token), service_method, args)
            .await
    }

    /// Send the call to every discovered endpoint concurrently.
    ///
    /// Each endpoint decodes into its own reply value, so there is no
    /// shared destination to race on. The first failure cancels the
    /// remaining endpoints and is returned once every endpoint has
    /// finished; otherwise the first success's reply is returned
    /// (`Ok(None)` when discovery produced no endpoints).
    pub async fn broadcast<A, R>(
        &self,
        service_method: &str,
        args: &A,
    ) -> Result<Option<R>, XClientError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let servers = self.discovery.get_all().await?;
        let token = CancellationToken::new();

        let mut in_flight: FuturesUnordered<_> = servers
            .iter()
            .map(|rpc_addr| {
                let token = token.clone();
                async move {
                    self.call_addr::<A, R>(rpc_addr, Some(&token), service_method, args)
                        .await
                }
            })
            .collect();

        let mut first_error = None;
        let mut reply = None;
        while let Some(result) = in_flight.next().await {
            match result {
                Ok(r) => {
                    if reply.is_none() {
                        reply = Some(r);
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                        token.cancel();
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(reply),
        }
    }
}
