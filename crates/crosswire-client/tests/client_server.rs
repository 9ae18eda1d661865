//! Client/server round trips through the public client API.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crosswire_client::{Backend, Client, KetamaBalancer};
use crosswire_core::error::Error;
use crosswire_core::protocol::codec::WireCodec;
use crosswire_core::protocol::envelope::Meta;
use crosswire_server::config::ServerConfig;
use crosswire_server::registry::{handler, Request, Response, ServiceInfo};
use crosswire_server::server::{Server, TcpTransport};
use crosswire_server::services;

fn default_config() -> ServerConfig {
    ServerConfig {
        version: 1,
        tcp: Default::default(),
        ws: Default::default(),
        connection: Default::default(),
        heartbeat: Default::default(),
        workers: Default::default(),
        timer: Default::default(),
    }
}

async fn start_server() -> (Arc<Server>, SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let meta_svc = ServiceInfo::new("meta").method(
        "first-tag",
        handler(|req: Request| async move {
            match req.meta("tag") {
                Some(v) => Ok(Response::ok(Bytes::from(v.to_string()))),
                None => Err(Error::handler(40, "missing tag meta")),
            }
        }),
    );

    let server = Server::builder(default_config())
        .service(services::echo::service())
        .service(meta_svc)
        .transport(TcpTransport::from_listener(listener))
        .build()
        .expect("build");
    let server = Arc::new(server);
    let s = server.clone();
    let handle = tokio::spawn(async move {
        s.serve().await.expect("serve");
    });
    (server, addr, handle)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn call_round_trip() {
    let (server, addr, serve) = start_server().await;
    let client = Client::connect(&addr.to_string(), WireCodec::Json)
        .await
        .expect("connect");

    let data = client
        .call("echo", "echo", Bytes::from_static(b"ping"), Vec::new())
        .await
        .expect("call");
    assert_eq!(&data[..], b"ping");

    // Concurrent calls correlate independently.
    let c = Arc::new(client);
    let mut tasks = Vec::new();
    for i in 0..20u32 {
        let c = c.clone();
        tasks.push(tokio::spawn(async move {
            let payload = Bytes::from(i.to_le_bytes().to_vec());
            let back = c.call("echo", "echo", payload.clone(), Vec::new()).await?;
            assert_eq!(back, payload);
            Ok::<_, Error>(())
        }));
    }
    for t in tasks {
        t.await.unwrap().unwrap();
    }

    c.close().await;
    server.shutdown().await;
    serve.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn metas_reach_the_handler_in_order() {
    let (server, addr, serve) = start_server().await;
    let client = Client::connect(&addr.to_string(), WireCodec::Json)
        .await
        .unwrap();

    let metas = vec![Meta::new("tag", "one"), Meta::new("tag", "two")];
    let data = client
        .call("meta", "first-tag", Bytes::new(), metas)
        .await
        .unwrap();
    assert_eq!(&data[..], b"one");

    client.close().await;
    server.shutdown().await;
    serve.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn business_errors_map_to_handler_error() {
    let (server, addr, serve) = start_server().await;
    let client = Client::connect(&addr.to_string(), WireCodec::Json)
        .await
        .unwrap();

    let err = client
        .call("meta", "first-tag", Bytes::new(), Vec::new())
        .await
        .expect_err("must fail");
    match err {
        Error::Handler { code, desc } => {
            assert_eq!(code, 40);
            assert!(desc.contains("missing tag meta"));
        }
        other => panic!("expected Handler error, got {other}"),
    }

    // Connection is still usable afterwards.
    let data = client
        .call("echo", "echo", Bytes::from_static(b"still"), Vec::new())
        .await
        .unwrap();
    assert_eq!(&data[..], b"still");

    client.close().await;
    server.shutdown().await;
    serve.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn notify_is_fire_and_forget() {
    let (server, addr, serve) = start_server().await;
    let client = Client::connect(&addr.to_string(), WireCodec::Json)
        .await
        .unwrap();

    client
        .notify("echo", "echo", Bytes::from_static(b"quiet"))
        .await
        .unwrap();
    // No response arrives for the notify; the next correlated call gets its
    // own response.
    let data = client
        .call("echo", "echo", Bytes::from_static(b"loud"), Vec::new())
        .await
        .unwrap();
    assert_eq!(&data[..], b"loud");

    client.close().await;
    server.shutdown().await;
    serve.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn balancer_routes_to_a_live_server() {
    let (server, addr, serve) = start_server().await;

    let lb = KetamaBalancer::with_backends(64, vec![Backend::new(addr.to_string(), 1)]);
    let picked = lb.pick(Some("tenant-42")).unwrap();

    let client = Client::connect(&picked.addr, WireCodec::Json).await.unwrap();
    let data = client
        .call("echo", "reverse", Bytes::from_static(b"abc"), Vec::new())
        .await
        .unwrap();
    assert_eq!(&data[..], b"cba");

    client.close().await;
    server.shutdown().await;
    serve.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_shutdown_fails_parked_calls() {
    let (server, addr, serve) = start_server().await;
    let client = Client::connect(&addr.to_string(), WireCodec::Json)
        .await
        .unwrap();

    server.shutdown().await;
    serve.await.unwrap();

    let err = client
        .call("echo", "echo", Bytes::from_static(b"late"), Vec::new())
        .await
        .expect_err("must fail after server shutdown");
    assert!(
        matches!(err, Error::ConnectionClosed | Error::Io(_)),
        "got {err}"
    );

    client.close().await;
}
