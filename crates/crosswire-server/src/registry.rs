//! Service registry, interceptor chain, and dispatch.
//!
//! Registration happens once at startup; the table is shared read-only by
//! every connection afterwards. Interceptors are composed onion-style around
//! each method handler at registration time, so dispatch is a plain map
//! lookup plus one call through the pre-built chain.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde::de::DeserializeOwned;

use crosswire_core::error::{Error, Result};
use crosswire_core::protocol::codec::WireCodec;
use crosswire_core::protocol::envelope::Meta;

/// One inbound business call, decoupled from its transport.
#[derive(Debug, Clone)]
pub struct Request {
    /// Connection that carried the request (0 for in-process dispatch).
    pub conn_id: u64,
    pub service: String,
    pub method: String,
    /// Codec negotiated on the carrying connection.
    pub codec: WireCodec,
    /// Opaque payload bytes.
    pub data: Bytes,
    /// Ordered metadata pairs (trace fields, auth material, ...).
    pub metas: Vec<Meta>,
}

impl Request {
    /// Decode the payload into a typed request via the negotiated codec.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        self.codec.decode(&self.data)
    }

    /// First meta value with this name.
    pub fn meta(&self, name: &str) -> Option<&str> {
        self.metas
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.value.as_str())
    }
}

/// Handler output. A non-zero `code` is a well-formed business failure; the
/// connection stays open and the pair lands in the response envelope.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub data: Bytes,
    pub code: i32,
    pub desc: String,
}

impl Response {
    pub fn ok(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn error(code: i32, desc: impl Into<String>) -> Self {
        Self {
            data: Bytes::new(),
            code,
            desc: desc.into(),
        }
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Response>> + Send>>;

/// A business method handler (or a composed chain ending in one).
pub type Handler = Arc<dyn Fn(Request) -> HandlerFuture + Send + Sync>;

/// Middleware around a handler. `next` is the remaining chain.
pub type Interceptor = Arc<dyn Fn(Request, Handler) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure into a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    Arc::new(move |req| Box::pin(f(req)))
}

/// Wrap an async closure into an [`Interceptor`].
pub fn interceptor<F, Fut>(f: F) -> Interceptor
where
    F: Fn(Request, Handler) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    Arc::new(move |req, next| Box::pin(f(req, next)))
}

/// Method name plus its terminal handler.
pub struct MethodDescriptor {
    pub name: String,
    pub handler: Handler,
}

/// A service to register: name plus its methods in declaration order.
pub struct ServiceInfo {
    pub name: String,
    methods: Vec<MethodDescriptor>,
}

impl ServiceInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    /// Add a method (builder style).
    pub fn method(mut self, name: impl Into<String>, handler: Handler) -> Self {
        self.methods.push(MethodDescriptor {
            name: name.into(),
            handler,
        });
        self
    }

    pub fn method_names(&self) -> Vec<String> {
        self.methods.iter().map(|m| m.name.clone()).collect()
    }
}

struct CompiledService {
    methods: HashMap<String, Handler>,
}

/// The startup-built dispatch table.
pub struct Registry {
    services: DashMap<String, Arc<CompiledService>>,
    interceptors: Vec<Interceptor>,
    unknown_service: Option<Handler>,
}

impl Registry {
    pub fn new(interceptors: Vec<Interceptor>, unknown_service: Option<Handler>) -> Self {
        Self {
            services: DashMap::new(),
            interceptors,
            unknown_service,
        }
    }

    /// Register a service. A duplicate name is a fatal startup error.
    pub fn register(&self, svc: ServiceInfo) -> Result<()> {
        let compiled = CompiledService {
            methods: svc
                .methods
                .into_iter()
                .map(|m| (m.name, self.compose(m.handler)))
                .collect(),
        };
        match self.services.entry(svc.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(Error::DuplicateService(svc.name))
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                tracing::debug!(service = %svc.name, "service registered");
                v.insert(Arc::new(compiled));
                Ok(())
            }
        }
    }

    /// Build I₀(I₁(...(H))) from the configured interceptors. Entry order is
    /// I₀, I₁, ..., H; unwind is the reverse.
    fn compose(&self, terminal: Handler) -> Handler {
        let mut next = terminal;
        for ic in self.interceptors.iter().rev() {
            let ic = ic.clone();
            let inner = next;
            next = Arc::new(move |req| ic(req, inner.clone()));
        }
        next
    }

    /// Route a request to its composed handler.
    ///
    /// An unknown service goes to the unknown-service hook when one is set;
    /// otherwise the caller gets the dispatch error to report or drop.
    pub async fn dispatch(&self, req: Request) -> Result<Response> {
        let Some(svc) = self.services.get(&req.service).map(|e| e.value().clone()) else {
            if let Some(hook) = &self.unknown_service {
                return hook(req).await;
            }
            return Err(Error::ServiceNotFound(req.service));
        };
        let Some(chain) = svc.methods.get(&req.method).cloned() else {
            return Err(Error::MethodNotFound {
                service: req.service,
                method: req.method,
            });
        };
        chain(req).await
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }
}
