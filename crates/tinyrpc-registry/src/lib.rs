//! Registry service: tracks live RPC servers over HTTP.
//!
//! Providers POST a heartbeat naming their address; consumers GET the
//! current live list. Both travel in headers, so the bodies stay empty:
//!
//! - `GET` responds with `X-tinyrpc-Servers: addr1,addr2,...`
//! - `POST` with `X-tinyrpc-Server: addr` registers or refreshes `addr`
//!
//! Entries that miss their heartbeat window are pruned on the next read.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Path the registry routes are mounted on.
pub const DEFAULT_REGISTRY_PATH: &str = "/_tinyrpc_/registry";

/// How long a server stays alive without a heartbeat.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Response header listing live servers, comma-separated.
pub const SERVERS_HEADER: &str = "X-tinyrpc-Servers";

/// Request header naming the server a heartbeat is for.
pub const SERVER_HEADER: &str = "X-tinyrpc-Server";

/// The registry state: server address to last-heartbeat time.
pub struct Registry {
    timeout: Duration,
    servers: Mutex<HashMap<String, Instant>>,
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new(DEFAULT_TIMEOUT)
    }
}

impl Registry {
    /// A zero timeout keeps every server forever.
    pub fn new(timeout: Duration) -> Self {
        Registry {
            timeout,
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Register `addr`, or refresh its heartbeat if already present.
    pub fn put_server(&self, addr: &str) {
        self.servers.lock().insert(addr.to_string(), Instant::now());
    }

    /// The sorted live list; expired entries are dropped on the way out.
    pub fn alive_servers(&self) -> Vec<String> {
        let timeout = self.timeout;
        let mut servers = self.servers.lock();
        servers.retain(|_, heartbeat| timeout.is_zero() || heartbeat.elapsed() < timeout);

        let mut alive: Vec<String> = servers.keys().cloned().collect();
        alive.sort();
        alive
    }

    /// Router exposing the registry on [`DEFAULT_REGISTRY_PATH`].
    ///
    /// Methods other than GET and POST get a 405 from the router itself.
    pub fn into_router(self: Arc<Self>) -> Router {
        Router::new()
            .route(DEFAULT_REGISTRY_PATH, get(list_servers).post(put_server))
            .with_state(self)
    }
}

async fn list_servers(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    ([(SERVERS_HEADER, registry.alive_servers().join(","))], StatusCode::OK)
}

async fn put_server(State(registry): State<Arc<Registry>>, headers: HeaderMap) -> StatusCode {
    match headers.get(SERVER_HEADER).and_then(|v| v.to_str().ok()) {
        Some(addr) if !addr.is_empty() => {
            registry.put_server(addr);
            StatusCode::OK
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Serve the registry until the listener fails.
pub async fn serve(registry: Arc<Registry>, listener: tokio::net::TcpListener) -> std::io::Result<()> {
    debug!(path = DEFAULT_REGISTRY_PATH, "rpc registry: serving");
    axum::serve(listener, registry.into_router()).await
}

/// Keep `addr` registered at `registry_url`.
///
/// Sends one heartbeat immediately, then repeats every `period` until a
/// send fails. A zero period leaves a minute of slack inside
/// [`DEFAULT_TIMEOUT`].
pub fn heartbeat(
    registry_url: impl Into<String>,
    addr: impl Into<String>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    let registry_url = registry_url.into();
    let addr = addr.into();
    let period = if period.is_zero() {
        DEFAULT_TIMEOUT - Duration::from_secs(60)
    } else {
        period
    };

    tokio::spawn(async move {
        let http = reqwest::Client::new();
        let mut ticker = tokio::time::interval(period);
        loop {
            // The first tick fires immediately.
            ticker.tick().await;
            if let Err(e) = send_heartbeat(&http, &registry_url, &addr).await {
                warn!(err = %e, "rpc server: heart beat err");
                break;
            }
        }
    })
}

async fn send_heartbeat(
    http: &reqwest::Client,
    registry_url: &str,
    addr: &str,
) -> Result<(), reqwest::Error> {
    debug!(%addr, registry = %registry_url, "rpc server: send heart beat to registry");
    http.post(registry_url)
        .header(SERVER_HEADER, addr)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_and_list_sorted() {
        let registry = Registry::new(DEFAULT_TIMEOUT);
        registry.put_server("tcp@b:2");
        registry.put_server("tcp@a:1");
        assert_eq!(
            registry.alive_servers(),
            vec!["tcp@a:1".to_string(), "tcp@b:2".to_string()]
        );
    }

    #[test]
    fn heartbeat_refreshes_existing_entry() {
        let registry = Registry::new(DEFAULT_TIMEOUT);
        registry.put_server("tcp@a:1");
        registry.put_server("tcp@a:1");
        assert_eq!(registry.alive_servers().len(), 1);
    }

    #[test]
    fn expired_servers_are_pruned() {
        let registry = Registry::new(Duration::from_millis(20));
        registry.put_server("tcp@a:1");
        std::thread::sleep(Duration::from_millis(40));
        assert!(registry.alive_servers().is_empty());
    }

    #[test]
    fn zero_timeout_keeps_everything() {
        let registry = Registry::new(Duration::ZERO);
        registry.put_server("tcp@a:1");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.alive_servers().len(), 1);
    }
}
