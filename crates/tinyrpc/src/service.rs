//! Service registration and method dispatch.
//!
//! A service is a named receiver whose methods follow one convention: take
//! an argument value, produce a reply value or an error. Registration
//! captures each method as a type-erased thunk that decodes the argument in
//! the connection's encoding, invokes the handler, and encodes the reply,
//! so the server can dispatch any registered method from a raw body frame.
//!
//! ```
//! use std::sync::Arc;
//! use tinyrpc::{MethodError, ServiceBuilder};
//!
//! struct Foo;
//!
//! let service = ServiceBuilder::new("Foo", Foo)
//!     .unwrap()
//!     .method("Sum", |_foo: Arc<Foo>, args: (i64, i64)| async move {
//!         Ok::<_, MethodError>(args.0 + args.1)
//!     })
//!     .unwrap()
//!     .build();
//! assert_eq!(service.name(), "Foo");
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::codec::{CodecError, Encoding};

/// Error returned by a service method implementation.
///
/// The message travels back to the caller verbatim in the response header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodError(String);

impl MethodError {
    pub fn new(msg: impl Into<String>) -> Self {
        MethodError(msg.into())
    }
}

impl fmt::Display for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MethodError {
    fn from(msg: String) -> Self {
        MethodError(msg)
    }
}

impl From<&str> for MethodError {
    fn from(msg: &str) -> Self {
        MethodError(msg.to_string())
    }
}

impl std::error::Error for MethodError {}

/// Errors raised while registering services and methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Service name is empty.
    EmptyServiceName,
    /// Method name is empty.
    EmptyMethodName,
    /// Names must start with an uppercase letter to be addressable.
    UnexportedName(String),
    /// A service with this name is already registered.
    DuplicateService(String),
    /// A method with this name already exists on the service.
    DuplicateMethod(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::EmptyServiceName => write!(f, "rpc server: service name cannot be empty"),
            RegistryError::EmptyMethodName => write!(f, "rpc server: method name cannot be empty"),
            RegistryError::UnexportedName(name) => {
                write!(f, "rpc server: {} is not a valid service name", name)
            }
            RegistryError::DuplicateService(name) => {
                write!(f, "rpc server: service already defined: {}", name)
            }
            RegistryError::DuplicateMethod(name) => {
                write!(f, "rpc server: method already defined: {}", name)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Per-request dispatch failures, rendered into the response header.
#[derive(Debug)]
pub enum ServiceError {
    /// No dot in the requested `service_method`.
    IllFormed(String),
    /// No service registered under the requested name.
    ServiceNotFound(String),
    /// The service exists but has no such method.
    MethodNotFound(String),
    /// The request body did not decode as the method's argument type.
    DecodeArgs(CodecError),
    /// The reply failed to encode.
    EncodeReply(CodecError),
    /// The method itself returned an error.
    Method(MethodError),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::IllFormed(sm) => {
                write!(f, "rpc server: service/method request ill-formed: {}", sm)
            }
            ServiceError::ServiceNotFound(name) => {
                write!(f, "rpc server: can't find service {}", name)
            }
            ServiceError::MethodNotFound(name) => {
                write!(f, "rpc server: can't find method {}", name)
            }
            ServiceError::DecodeArgs(e) => write!(f, "rpc server: read body err: {}", e),
            ServiceError::EncodeReply(e) => write!(f, "rpc server: encode reply err: {}", e),
            ServiceError::Method(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ServiceError {}

type MethodHandler =
    Box<dyn Fn(Encoding, Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, ServiceError>> + Send + Sync>;

/// One callable method: the erased invoke thunk plus observational state.
pub struct MethodDescriptor {
    name: String,
    handler: MethodHandler,
    num_calls: AtomicU64,
}

impl MethodDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How many times this method has been invoked.
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    /// Decode the body, run the method, encode the reply.
    pub async fn invoke(&self, encoding: Encoding, body: Vec<u8>) -> Result<Vec<u8>, ServiceError> {
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        (self.handler)(encoding, body).await
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("num_calls", &self.num_calls())
            .finish_non_exhaustive()
    }
}

fn is_exported(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_uppercase())
}

/// Builds a [`Service`] from a receiver and its methods.
///
/// The receiver is shared with every handler as an `Arc`, standing in for
/// the implicit first argument of a method call.
pub struct ServiceBuilder<T> {
    name: String,
    receiver: Arc<T>,
    methods: HashMap<String, Arc<MethodDescriptor>>,
}

impl<T: Send + Sync + 'static> ServiceBuilder<T> {
    /// Start a service for `receiver` under `name`.
    ///
    /// The name must be non-empty and start with an uppercase letter, the
    /// same "exported identifier" rule the method names follow.
    pub fn new(name: impl Into<String>, receiver: T) -> Result<Self, RegistryError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RegistryError::EmptyServiceName);
        }
        if !is_exported(&name) {
            return Err(RegistryError::UnexportedName(name));
        }
        Ok(ServiceBuilder {
            name,
            receiver: Arc::new(receiver),
            methods: HashMap::new(),
        })
    }

    /// Register a method under `name`.
    ///
    /// The handler signature *is* the eligibility rule: exactly one argument
    /// value in, one reply value or an error out. Anything else does not
    /// typecheck, so ineligible methods are rejected at compile time rather
    /// than silently dropped. Name problems and duplicates are reported as
    /// registration errors.
    pub fn method<A, R, F, Fut>(mut self, name: impl Into<String>, f: F) -> Result<Self, RegistryError>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<T>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, MethodError>> + Send + 'static,
    {
        let name = name.into();
        if name.is_empty() {
            return Err(RegistryError::EmptyMethodName);
        }
        if !is_exported(&name) {
            return Err(RegistryError::UnexportedName(name));
        }
        if self.methods.contains_key(&name) {
            return Err(RegistryError::DuplicateMethod(name));
        }

        let receiver = Arc::clone(&self.receiver);
        let f = Arc::new(f);
        let handler: MethodHandler = Box::new(move |encoding, body| {
            let receiver = Arc::clone(&receiver);
            let f = Arc::clone(&f);
            Box::pin(async move {
                let args: A = encoding.decode(&body).map_err(ServiceError::DecodeArgs)?;
                let reply = f(receiver, args).await.map_err(ServiceError::Method)?;
                encoding.encode(&reply).map_err(ServiceError::EncodeReply)
            })
        });

        self.methods.insert(
            name.clone(),
            Arc::new(MethodDescriptor {
                name,
                handler,
                num_calls: AtomicU64::new(0),
            }),
        );
        Ok(self)
    }

    pub fn build(self) -> Service {
        Service {
            name: self.name,
            methods: self.methods,
        }
    }
}

/// A registered receiver whose methods are addressable as `Service.Method`.
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<MethodDescriptor>>,
}

impl Service {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self, name: &str) -> Option<&Arc<MethodDescriptor>> {
        self.methods.get(name)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

/// Maps service names to services for a server instance.
#[derive(Default)]
pub struct Registry {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Install a service; a second registration under the same name fails.
    pub fn register(&self, service: Service) -> Result<(), RegistryError> {
        let mut services = self.services.write();
        if services.contains_key(service.name()) {
            return Err(RegistryError::DuplicateService(service.name().to_string()));
        }
        for method in service.method_names() {
            debug!(service = %service.name(), %method, "rpc server: register");
        }
        services.insert(service.name().to_string(), Arc::new(service));
        Ok(())
    }

    /// Resolve a `"Service.Method"` string to its descriptor.
    ///
    /// The split is at the last dot. Each failure short-circuits: an
    /// ill-formed name, a missing service, and a missing method are three
    /// distinct per-request errors.
    pub fn find(&self, service_method: &str) -> Result<Arc<MethodDescriptor>, ServiceError> {
        let dot = service_method
            .rfind('.')
            .ok_or_else(|| ServiceError::IllFormed(service_method.to_string()))?;
        let (service_name, method_name) = (&service_method[..dot], &service_method[dot + 1..]);

        let services = self.services.read();
        let service = services
            .get(service_name)
            .ok_or_else(|| ServiceError::ServiceNotFound(service_name.to_string()))?;
        service
            .method(method_name)
            .cloned()
            .ok_or_else(|| ServiceError::MethodNotFound(method_name.to_string()))
    }
}
