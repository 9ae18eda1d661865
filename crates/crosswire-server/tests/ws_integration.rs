//! End-to-end tests over the WebSocket transport: sub-protocol codec
//! negotiation, binary envelope exchange, and the abort paths.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};

use crosswire_core::error::status;
use crosswire_core::protocol::envelope::Envelope;
use crosswire_server::config::{ServerConfig, TimerSection};
use crosswire_server::server::{Server, WsTransport};
use crosswire_server::services;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_config() -> ServerConfig {
    ServerConfig {
        version: 1,
        tcp: Default::default(),
        ws: Default::default(),
        connection: Default::default(),
        heartbeat: Default::default(),
        workers: Default::default(),
        timer: TimerSection { tick_ms: 50 },
    }
}

async fn start_server() -> (Arc<Server>, SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::builder(test_config())
        .service(services::echo::service())
        .transport(WsTransport::from_listener(listener))
        .build()
        .expect("server build");
    let server = Arc::new(server);
    let s = server.clone();
    let handle = tokio::spawn(async move {
        s.serve().await.expect("serve");
    });
    (server, addr, handle)
}

/// Upgrade with an explicit `Sec-WebSocket-Protocol` offer.
async fn connect_with_protocol(addr: SocketAddr, token: &str) -> (WsClient, Option<String>) {
    let url = format!("ws://{addr}/v1/rpc");
    let request = tungstenite::http::Request::builder()
        .uri(&url)
        .header("Sec-WebSocket-Protocol", token)
        .header("Host", addr.to_string())
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tungstenite::handshake::client::generate_key(),
        )
        .body(())
        .unwrap();

    let (stream, response) = connect_async(request).await.expect("ws connect");
    let accepted = response
        .headers()
        .get("Sec-WebSocket-Protocol")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    (stream, accepted)
}

fn request(service: &str, method: &str, data: &'static [u8], id: u64) -> Envelope {
    let mut env = Envelope::request(service, method, Bytes::from_static(data));
    env.message_id = Bytes::copy_from_slice(&id.to_le_bytes());
    env
}

/// Read frames until a binary envelope arrives; fail on session end.
async fn next_envelope(ws: &mut WsClient) -> Envelope {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("response within 3s")
            .expect("session must stay open")
            .expect("ws read");
        match msg {
            Message::Binary(raw) => return Envelope::decode(Bytes::from(raw)).expect("decode"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected ws message: {other:?}"),
        }
    }
}

/// The session is over when the stream yields a close frame, an error, or
/// nothing at all.
async fn assert_session_ends(ws: &mut WsClient) {
    let ended = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "session did not end within 3s");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subprotocol_negotiation_and_echo() {
    let (server, addr, serve) = start_server().await;

    let (mut ws, accepted) = connect_with_protocol(addr, "json").await;
    assert_eq!(accepted.as_deref(), Some("json"));

    let req = request("echo", "echo", b"over websocket", 1);
    ws.send(Message::Binary(req.encode().to_vec())).await.unwrap();

    let resp = next_envelope(&mut ws).await;
    assert_eq!(resp.message_id, req.message_id);
    assert_eq!(&resp.data[..], b"over websocket");
    assert_eq!(resp.code, status::OK);

    let req = request("echo", "reverse", b"abc", 2);
    ws.send(Message::Binary(req.encode().to_vec())).await.unwrap();
    let resp = next_envelope(&mut ws).await;
    assert_eq!(&resp.data[..], b"cba");

    let _ = ws.close(None).await;
    server.shutdown().await;
    serve.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dispatch_errors_surface_over_ws() {
    let (server, addr, serve) = start_server().await;
    let (mut ws, _) = connect_with_protocol(addr, "json").await;

    let req = request("ghost", "any", b"", 1);
    ws.send(Message::Binary(req.encode().to_vec())).await.unwrap();
    let resp = next_envelope(&mut ws).await;
    assert_eq!(resp.code, status::SERVICE_NOT_FOUND);

    // Session survives dispatch errors.
    let req = request("echo", "echo", b"still here", 2);
    ws.send(Message::Binary(req.encode().to_vec())).await.unwrap();
    let resp = next_envelope(&mut ws).await;
    assert_eq!(&resp.data[..], b"still here");

    let _ = ws.close(None).await;
    server.shutdown().await;
    serve.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upgrade_without_codec_token_is_aborted() {
    let (server, addr, serve) = start_server().await;

    // No Sec-WebSocket-Protocol offer: the upgrade completes but the server
    // ends the session without serving any request.
    let url = format!("ws://{addr}/v1/rpc");
    let (mut ws, response) = connect_async(url.as_str()).await.expect("ws connect");
    assert!(response.headers().get("Sec-WebSocket-Protocol").is_none());

    let req = request("echo", "echo", b"ignored", 1);
    let _ = ws.send(Message::Binary(req.encode().to_vec())).await;
    assert_session_ends(&mut ws).await;

    server.shutdown().await;
    serve.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn text_frame_closes_the_session() {
    let (server, addr, serve) = start_server().await;
    let (mut ws, _) = connect_with_protocol(addr, "json").await;

    ws.send(Message::Text("not an envelope".into())).await.unwrap();
    assert_session_ends(&mut ws).await;

    // Other sessions are unaffected.
    let (mut healthy, _) = connect_with_protocol(addr, "json").await;
    let req = request("echo", "echo", b"alive", 1);
    healthy.send(Message::Binary(req.encode().to_vec())).await.unwrap();
    let resp = next_envelope(&mut healthy).await;
    assert_eq!(&resp.data[..], b"alive");

    let _ = healthy.close(None).await;
    server.shutdown().await;
    serve.await.unwrap();
}
