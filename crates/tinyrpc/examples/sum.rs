//! Start a server, register a service, call it once.
//!
//! ```sh
//! RUST_LOG=debug cargo run --example sum
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tinyrpc::{Client, MethodError, Options, Server, ServiceBuilder};
use tokio::net::TcpListener;

#[derive(Debug, Serialize, Deserialize)]
struct Args {
    num1: i64,
    num2: i64,
}

struct Foo;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let server = Arc::new(Server::new());
    server.register(
        ServiceBuilder::new("Foo", Foo)?
            .method("Sum", |_foo: Arc<Foo>, args: Args| async move {
                Ok::<_, MethodError>(args.num1 + args.num2)
            })?
            .build(),
    )?;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    tokio::spawn(server.accept(listener));

    let client = Client::dial(&addr, Options::default()).await?;
    for i in 0..3 {
        let reply: i64 = client
            .call("Foo.Sum", &Args { num1: i, num2: i * i })
            .await?;
        println!("Foo.Sum({}, {}) = {}", i, i * i, reply);
    }
    client.close().await?;
    Ok(())
}
