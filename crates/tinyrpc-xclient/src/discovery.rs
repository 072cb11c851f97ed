//! Endpoint discovery and selection.
//!
//! [`Discovery`] hands the multi-endpoint client one address per call
//! (subject to a [`SelectMode`]) or the whole list for broadcast.
//! [`MultiServersDiscovery`] is the static in-memory variant;
//! [`RegistryDiscovery`] layers registry polling on top of it.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

/// Response header carrying the comma-separated live server list.
pub const SERVERS_HEADER: &str = "X-tinyrpc-Servers";

/// How long a fetched server list stays fresh before the next refresh.
pub const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Load-balancing strategy for [`Discovery::get`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectMode {
    /// Uniform over the current server list.
    Random,
    /// Cycle through the list; the cursor starts at a random offset so
    /// co-located processes don't synchronize.
    RoundRobin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// The server list is empty.
    NoServers,
    /// Fetching the list from the registry failed.
    Registry(String),
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryError::NoServers => write!(f, "rpc discovery: no available servers"),
            DiscoveryError::Registry(msg) => write!(f, "rpc registry refresh err: {}", msg),
        }
    }
}

impl std::error::Error for DiscoveryError {}

/// The endpoint-selection abstraction the multi-endpoint client consumes.
pub trait Discovery: Send + Sync {
    /// Re-fetch the server list from wherever it lives.
    fn refresh(&self) -> impl Future<Output = Result<(), DiscoveryError>> + Send;

    /// Replace the server list by hand.
    fn update(&self, servers: Vec<String>) -> impl Future<Output = Result<(), DiscoveryError>> + Send;

    /// Pick one endpoint according to `mode`.
    fn get(&self, mode: SelectMode) -> impl Future<Output = Result<String, DiscoveryError>> + Send;

    /// Snapshot of every known endpoint.
    fn get_all(&self) -> impl Future<Output = Result<Vec<String>, DiscoveryError>> + Send;
}

struct ServerList {
    servers: Vec<String>,
    index: usize,
}

/// Discovery over a fixed, caller-maintained endpoint list.
pub struct MultiServersDiscovery {
    inner: Mutex<ServerList>,
}

impl MultiServersDiscovery {
    pub fn new(servers: Vec<String>) -> Self {
        let index = rand::thread_rng().gen_range(0..u32::MAX) as usize;
        MultiServersDiscovery {
            inner: Mutex::new(ServerList { servers, index }),
        }
    }

    pub(crate) fn select(&self, mode: SelectMode) -> Result<String, DiscoveryError> {
        let mut inner = self.inner.lock();
        let n = inner.servers.len();
        if n == 0 {
            return Err(DiscoveryError::NoServers);
        }
        match mode {
            SelectMode::Random => {
                Ok(inner.servers[rand::thread_rng().gen_range(0..n)].clone())
            }
            SelectMode::RoundRobin => {
                let server = inner.servers[inner.index % n].clone();
                inner.index = (inner.index + 1) % n;
                Ok(server)
            }
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<String> {
        self.inner.lock().servers.clone()
    }

    pub(crate) fn set_servers(&self, servers: Vec<String>) {
        self.inner.lock().servers = servers;
    }
}

impl Discovery for MultiServersDiscovery {
    async fn refresh(&self) -> Result<(), DiscoveryError> {
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<(), DiscoveryError> {
        self.set_servers(servers);
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String, DiscoveryError> {
        self.select(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>, DiscoveryError> {
        Ok(self.snapshot())
    }
}

/// Discovery backed by a registry service.
///
/// Polls the registry's GET endpoint and reads the live list from the
/// [`SERVERS_HEADER`] response header. A refresh inside the update window
/// is a no-op, so hot call paths don't hammer the registry.
pub struct RegistryDiscovery {
    servers: MultiServersDiscovery,
    registry_url: String,
    timeout: Duration,
    last_update: Mutex<Option<Instant>>,
    http: reqwest::Client,
}

impl RegistryDiscovery {
    /// `timeout` of zero selects [`DEFAULT_UPDATE_TIMEOUT`].
    pub fn new(registry_url: impl Into<String>, timeout: Duration) -> Self {
        let timeout = if timeout.is_zero() {
            DEFAULT_UPDATE_TIMEOUT
        } else {
            timeout
        };
        RegistryDiscovery {
            servers: MultiServersDiscovery::new(Vec::new()),
            registry_url: registry_url.into(),
            timeout,
            last_update: Mutex::new(None),
            http: reqwest::Client::new(),
        }
    }

    async fn refresh_inner(&self) -> Result<(), DiscoveryError> {
        {
            let last_update = self.last_update.lock();
            if let Some(at) = *last_update {
                if at.elapsed() < self.timeout {
                    return Ok(());
                }
            }
        }

        debug!(registry = %self.registry_url, "rpc registry: refresh servers from registry");
        let response = self
            .http
            .get(&self.registry_url)
            .send()
            .await
            .map_err(|e| DiscoveryError::Registry(e.to_string()))?;
        let raw = response
            .headers()
            .get(SERVERS_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let servers: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        self.servers.set_servers(servers);
        *self.last_update.lock() = Some(Instant::now());
        Ok(())
    }
}

impl Discovery for RegistryDiscovery {
    async fn refresh(&self) -> Result<(), DiscoveryError> {
        self.refresh_inner().await
    }

    async fn update(&self, servers: Vec<String>) -> Result<(), DiscoveryError> {
        self.servers.set_servers(servers);
        *self.last_update.lock() = Some(Instant::now());
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String, DiscoveryError> {
        self.refresh_inner().await?;
        self.servers.select(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>, DiscoveryError> {
        self.refresh_inner().await?;
        Ok(self.servers.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_list_errors() {
        let discovery = MultiServersDiscovery::new(Vec::new());
        assert_eq!(
            discovery.get(SelectMode::Random).await.err(),
            Some(DiscoveryError::NoServers)
        );
        assert_eq!(
            DiscoveryError::NoServers.to_string(),
            "rpc discovery: no available servers"
        );
    }

    #[tokio::test]
    async fn round_robin_cycles() {
        let servers = vec![
            "tcp@a:1".to_string(),
            "tcp@b:2".to_string(),
            "tcp@c:3".to_string(),
        ];
        let discovery = MultiServersDiscovery::new(servers.clone());

        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(discovery.get(SelectMode::RoundRobin).await.unwrap());
        }
        // Two full cycles: each server appears exactly twice.
        for server in &servers {
            assert_eq!(seen.iter().filter(|s| *s == server).count(), 2);
        }
        // And consecutive picks never repeat while cycling.
        assert_eq!(seen[0], seen[3]);
        assert_eq!(seen[1], seen[4]);
        assert_eq!(seen[2], seen[5]);
    }

    #[tokio::test]
    async fn random_pick_is_a_member() {
        let servers = vec!["tcp@a:1".to_string(), "tcp@b:2".to_string()];
        let discovery = MultiServersDiscovery::new(servers.clone());
        for _ in 0..10 {
            let pick = discovery.get(SelectMode::Random).await.unwrap();
            assert!(servers.contains(&pick));
        }
    }

    #[tokio::test]
    async fn update_replaces_list() {
        let discovery = MultiServersDiscovery::new(vec!["tcp@a:1".to_string()]);
        discovery
            .update(vec!["tcp@b:2".to_string()])
            .await
            .unwrap();
        assert_eq!(
            discovery.get_all().await.unwrap(),
            vec!["tcp@b:2".to_string()]
        );
    }

    #[tokio::test]
    async fn registry_discovery_update_window() {
        // A manual update stamps the window; get_all within it must not
        // touch the (nonexistent) registry.
        let discovery = RegistryDiscovery::new("http://127.0.0.1:1/registry", Duration::ZERO);
        assert_eq!(discovery.timeout, DEFAULT_UPDATE_TIMEOUT);

        discovery
            .update(vec!["tcp@a:1".to_string()])
            .await
            .unwrap();
        assert_eq!(
            discovery.get_all().await.unwrap(),
            vec!["tcp@a:1".to_string()]
        );
    }
}
