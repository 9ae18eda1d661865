//! Server composition: transports, builder, graceful shutdown.
//!
//! One business surface, several transports. Each transport implements the
//! [`Transport`] trait and is selected at composition time; all of them feed
//! the same registry/pool/wheel owned by [`ServeCtx`]. No global singletons:
//! everything is constructed by the builder and passed down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crosswire_core::error::{Error, Result};

use crate::config::ServerConfig;
use crate::conn::registry::ConnRegistry;
use crate::conn::{tcp, ws, Connection};
use crate::naming::{Naming, ServiceDesc};
use crate::pool::WorkerPool;
use crate::registry::{Handler, Interceptor, Registry, ServiceInfo};
use crate::timer::TimerWheel;

pub type OnConnect = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
pub type OnClose = Arc<dyn Fn(u64) + Send + Sync>;

/// Optional lifecycle hooks.
#[derive(Default, Clone)]
pub struct Hooks {
    pub on_connect: Option<OnConnect>,
    pub on_close: Option<OnClose>,
}

/// Everything a transport needs to serve connections.
pub struct ServeCtx {
    pub(crate) cfg: ServerConfig,
    pub(crate) registry: Arc<Registry>,
    pub(crate) pool: Arc<WorkerPool>,
    pub(crate) wheel: Arc<TimerWheel>,
    pub(crate) conns: Arc<ConnRegistry>,
    pub(crate) hooks: Hooks,
    shutdown_rx: watch::Receiver<bool>,
}

impl ServeCtx {
    pub(crate) fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }
}

/// A wire transport serving the shared dispatch pipeline.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    /// Run until the shutdown signal flips. Accepted connections are spawned
    /// onto their own tasks.
    async fn serve(self: Arc<Self>, ctx: Arc<ServeCtx>) -> Result<()>;
}

/// Custom binary protocol over TCP.
pub struct TcpTransport {
    listen: String,
    prebound: StdMutex<Option<TcpListener>>,
}

impl TcpTransport {
    pub fn new(listen: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            listen: listen.into(),
            prebound: StdMutex::new(None),
        })
    }

    /// Use an already-bound listener (tests bind to port 0 and need the
    /// address before the server runs).
    pub fn from_listener(listener: TcpListener) -> Arc<Self> {
        let listen = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        Arc::new(Self {
            listen,
            prebound: StdMutex::new(Some(listener)),
        })
    }

    fn take_prebound(&self) -> Option<TcpListener> {
        match self.prebound.lock() {
            Ok(mut g) => g.take(),
            Err(p) => p.into_inner().take(),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn serve(self: Arc<Self>, ctx: Arc<ServeCtx>) -> Result<()> {
        let listener = match self.take_prebound() {
            Some(l) => l,
            None => TcpListener::bind(&self.listen).await?,
        };
        tracing::info!(transport = "tcp", listen = %self.listen, "listening");

        let mut shutdown = ctx.shutdown_rx();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                res = listener.accept() => {
                    match res {
                        Ok((stream, peer)) => {
                            tokio::spawn(tcp::run_conn(ctx.clone(), stream, peer));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "tcp accept failed");
                        }
                    }
                }
            }
        }
        tracing::info!(transport = "tcp", "stopped accepting");
        Ok(())
    }
}

/// Envelope-over-WebSocket via an axum upgrade route.
pub struct WsTransport {
    listen: String,
    prebound: StdMutex<Option<TcpListener>>,
}

impl WsTransport {
    pub fn new(listen: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            listen: listen.into(),
            prebound: StdMutex::new(None),
        })
    }

    pub fn from_listener(listener: TcpListener) -> Arc<Self> {
        let listen = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        Arc::new(Self {
            listen,
            prebound: StdMutex::new(Some(listener)),
        })
    }

    fn take_prebound(&self) -> Option<TcpListener> {
        match self.prebound.lock() {
            Ok(mut g) => g.take(),
            Err(p) => p.into_inner().take(),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn name(&self) -> &'static str {
        "ws"
    }

    async fn serve(self: Arc<Self>, ctx: Arc<ServeCtx>) -> Result<()> {
        let listener = match self.take_prebound() {
            Some(l) => l,
            None => TcpListener::bind(&self.listen).await?,
        };
        tracing::info!(transport = "ws", listen = %self.listen, "listening");

        let router = Router::new()
            .route("/v1/rpc", get(ws::ws_upgrade))
            .with_state(ws::WsState { ctx: ctx.clone() });

        let mut shutdown = ctx.shutdown_rx();
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(Error::Io)?;
        tracing::info!(transport = "ws", "stopped accepting");
        Ok(())
    }
}

pub struct ServerBuilder {
    cfg: ServerConfig,
    interceptors: Vec<Interceptor>,
    unknown_service: Option<Handler>,
    services: Vec<ServiceInfo>,
    transports: Vec<Arc<dyn Transport>>,
    hooks: Hooks,
    naming: Option<Arc<dyn Naming>>,
}

impl ServerBuilder {
    /// Add an interceptor. Order of calls is invocation order on entry.
    pub fn interceptor(mut self, ic: Interceptor) -> Self {
        self.interceptors.push(ic);
        self
    }

    /// Fallback handler for requests naming an unregistered service.
    pub fn unknown_service(mut self, handler: Handler) -> Self {
        self.unknown_service = Some(handler);
        self
    }

    pub fn service(mut self, svc: ServiceInfo) -> Self {
        self.services.push(svc);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    pub fn on_connect(mut self, hook: OnConnect) -> Self {
        self.hooks.on_connect = Some(hook);
        self
    }

    pub fn on_close(mut self, hook: OnClose) -> Self {
        self.hooks.on_close = Some(hook);
        self
    }

    pub fn naming(mut self, naming: Arc<dyn Naming>) -> Self {
        self.naming = Some(naming);
        self
    }

    /// Construct the server. Registration failures (duplicate service names,
    /// invalid config) surface here, before anything listens.
    pub fn build(self) -> Result<Server> {
        self.cfg.validate()?;

        let addrs = vec![self.cfg.tcp.listen.clone(), self.cfg.ws.listen.clone()];
        let registry = Registry::new(self.interceptors, self.unknown_service);
        let mut descs = Vec::with_capacity(self.services.len());
        for svc in self.services {
            descs.push(ServiceDesc {
                service: svc.name.clone(),
                methods: svc.method_names(),
                addrs: addrs.clone(),
            });
            registry.register(svc)?;
        }

        let pool = WorkerPool::new(self.cfg.workers.count, self.cfg.workers.queue);
        let wheel = TimerWheel::new(
            Duration::from_millis(self.cfg.timer.tick_ms),
            pool.clone(),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = Arc::new(ServeCtx {
            cfg: self.cfg,
            registry: Arc::new(registry),
            pool,
            wheel,
            conns: Arc::new(ConnRegistry::new()),
            hooks: self.hooks,
            shutdown_rx,
        });

        Ok(Server {
            ctx,
            transports: self.transports,
            shutdown_tx,
            naming: self.naming,
            descs,
        })
    }
}

pub struct Server {
    ctx: Arc<ServeCtx>,
    transports: Vec<Arc<dyn Transport>>,
    shutdown_tx: watch::Sender<bool>,
    naming: Option<Arc<dyn Naming>>,
    descs: Vec<ServiceDesc>,
}

impl Server {
    pub fn builder(cfg: ServerConfig) -> ServerBuilder {
        ServerBuilder {
            cfg,
            interceptors: Vec::new(),
            unknown_service: None,
            services: Vec::new(),
            transports: Vec::new(),
            hooks: Hooks::default(),
            naming: None,
        }
    }

    /// Number of live connections (shutdown fan-out observability).
    pub fn connection_count(&self) -> usize {
        self.ctx.conns.len()
    }

    /// Register with discovery and run every transport until shutdown.
    pub async fn serve(&self) -> Result<()> {
        if let Some(naming) = &self.naming {
            for desc in &self.descs {
                naming.register(desc).await?;
            }
        }

        let mut handles = Vec::with_capacity(self.transports.len());
        for transport in &self.transports {
            let name = transport.name();
            let t = transport.clone();
            let ctx = self.ctx.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = t.serve(ctx).await {
                    tracing::error!(transport = name, error = %e, "transport failed");
                }
            }));
        }
        for h in handles {
            let _ = h.await;
        }
        Ok(())
    }

    /// Graceful shutdown: stop accepting, deregister, close tracked
    /// connections, wait for their teardown, then drain the worker pool and
    /// stop the wheel. Already-dispatched jobs run to completion.
    pub async fn shutdown(&self) {
        tracing::info!("shutdown: stopping transports");
        let _ = self.shutdown_tx.send(true);

        if let Some(naming) = &self.naming {
            for desc in &self.descs {
                if let Err(e) = naming.deregister(desc).await {
                    tracing::warn!(service = %desc.service, error = %e, "deregister failed");
                }
            }
        }

        self.ctx.conns.close_all();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !self.ctx.conns.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if !self.ctx.conns.is_empty() {
            tracing::warn!(remaining = self.ctx.conns.len(), "connections did not drain in time");
        }

        self.ctx.pool.stop_wait().await;
        self.ctx.wheel.stop().await;
        tracing::info!("shutdown complete");
    }
}
