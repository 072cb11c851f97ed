//! Multi-endpoint client for tinyrpc.
//!
//! When the same service runs on several machines, this crate picks an
//! endpoint per call: [`MultiServersDiscovery`] over a static list or
//! [`RegistryDiscovery`] polling a registry service, with random or
//! round-robin selection, per-endpoint connection caching, and a
//! broadcast primitive with first-error cancellation.

pub mod client;
pub mod discovery;

pub use client::{xdial, XClient, XClientError};
pub use discovery::{
    Discovery, DiscoveryError, MultiServersDiscovery, RegistryDiscovery, SelectMode,
    DEFAULT_UPDATE_TIMEOUT, SERVERS_HEADER,
};
