//! Minimal multiplexed RPC over a single stream.
//!
//! A connection opens with a JSON-line handshake ([`Options`]) fixing the
//! protocol magic and message encoding, then carries length-delimited
//! `(header, body)` frames in that encoding. Requests from one client
//! multiplex freely; responses come back in any order and are matched to
//! callers by sequence number.
//!
//! Servers expose plain receivers through [`ServiceBuilder`], addressable
//! as `"Service.Method"`:
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde::{Deserialize, Serialize};
//! use tinyrpc::{Client, MethodError, Options, Server, ServiceBuilder};
//! use tokio::net::TcpListener;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Args { num1: i64, num2: i64 }
//!
//! struct Foo;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Arc::new(Server::new());
//! server.register(
//!     ServiceBuilder::new("Foo", Foo)?
//!         .method("Sum", |_foo: Arc<Foo>, args: Args| async move {
//!             Ok::<_, MethodError>(args.num1 + args.num2)
//!         })?
//!         .build(),
//! )?;
//! let listener = TcpListener::bind("127.0.0.1:0").await?;
//! let addr = listener.local_addr()?.to_string();
//! tokio::spawn(server.accept(listener));
//!
//! let client = Client::dial(&addr, Options::default()).await?;
//! let reply: i64 = client.call("Foo.Sum", &Args { num1: 1, num2: 2 }).await?;
//! assert_eq!(reply, 3);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod server;
pub mod service;
pub mod wire;

mod error;
mod http;
mod options;

pub use client::{Call, Client};
pub use codec::{Codec, CodecError, Encoding, Header, JsonCodec, PostcardCodec};
pub use error::RpcError;
pub use http::DEFAULT_RPC_PATH;
pub use options::{Options, MAGIC};
pub use server::Server;
pub use service::{
    MethodDescriptor, MethodError, Registry, RegistryError, Service, ServiceBuilder, ServiceError,
};

// Re-exported so callers of `call_with_cancel` don't need a direct
// tokio-util dependency.
pub use tokio_util::sync::CancellationToken;
