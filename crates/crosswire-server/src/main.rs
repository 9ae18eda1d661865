//! crosswire demo server.
//!
//! - Custom binary TCP + WebSocket transports over one echo service
//! - Tracing to stderr, filtered by RUST_LOG
//! - Heartbeat eviction and graceful ctrl-c shutdown

use std::sync::Arc;
use std::time::Instant;

use tracing_subscriber::{fmt, EnvFilter};

use crosswire_server::config;
use crosswire_server::registry::{interceptor, Handler, Request};
use crosswire_server::server::{Server, TcpTransport, WsTransport};
use crosswire_server::services;

#[tokio::main]
async fn main() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cfg = config::load_from_file("crosswire.yaml").expect("config load failed");
    let tcp = TcpTransport::new(cfg.tcp.listen.clone());
    let ws = WsTransport::new(cfg.ws.listen.clone());

    let access_log = interceptor(|req: Request, next: Handler| async move {
        let service = req.service.clone();
        let method = req.method.clone();
        let started = Instant::now();
        let res = next(req).await;
        tracing::debug!(%service, %method, elapsed_us = started.elapsed().as_micros() as u64,
            ok = res.is_ok(), "dispatch");
        res
    });

    let server = Server::builder(cfg)
        .interceptor(access_log)
        .service(services::echo::service())
        .transport(tcp)
        .transport(ws)
        .build()
        .expect("server build failed");
    let server = Arc::new(server);

    let sig_server = server.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("ctrl-c received");
        sig_server.shutdown().await;
    });

    tracing::info!("crosswire-server starting");
    server.serve().await.expect("serve failed");
}
