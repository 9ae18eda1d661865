//! WebSocket connection handling.
//!
//! Codec negotiation rides the upgrade handshake's sub-protocol tokens; an
//! upgrade without a recognizable token is aborted. After the upgrade, binary
//! WS messages carry envelope bytes directly -- WS framing already delimits
//! messages, so there is no extra length prefix.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};

use crosswire_core::protocol::codec::WireCodec;
use crosswire_core::protocol::envelope::Envelope;

use super::{register_heartbeat, submit_dispatch, teardown, Connection};
use crate::server::ServeCtx;

/// Axum state for the WS route.
#[derive(Clone)]
pub struct WsState {
    pub ctx: Arc<ServeCtx>,
}

pub async fn ws_upgrade(
    State(state): State<WsState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let ws = ws.protocols(WireCodec::SUBPROTOCOLS);
    ws.on_upgrade(move |socket| run_session(state.ctx, socket, peer))
}

async fn run_session(ctx: Arc<ServeCtx>, socket: WebSocket, peer: SocketAddr) {
    // The upgrade negotiated (or failed to negotiate) a sub-protocol token.
    let codec = socket
        .protocol()
        .and_then(|h| h.to_str().ok())
        .and_then(|t| WireCodec::from_token(t.as_bytes()));
    let Some(codec) = codec else {
        tracing::warn!(%peer, "ws upgrade without codec sub-protocol; aborting session");
        return;
    };

    let (conn, mut out_rx, mut cancel_rx) =
        Connection::new(peer.to_string(), ctx.cfg.connection.outbound_queue);
    conn.set_codec(codec);
    conn.touch();
    tracing::debug!(conn = conn.id(), codec = codec.name(), "ws session open");

    if let Some(hook) = &ctx.hooks.on_connect {
        hook(&conn);
    }

    ctx.conns.insert(conn.clone());
    if let Err(e) = register_heartbeat(&ctx, &conn).await {
        tracing::warn!(conn = conn.id(), error = %e, "heartbeat registration failed");
    }

    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            _ = cancel_rx.changed() => break,

            maybe = out_rx.recv() => {
                match maybe {
                    Some(payload) => {
                        if ws_tx.send(Message::Binary(payload.to_vec())).await.is_err() {
                            conn.close();
                            break;
                        }
                    }
                    None => break,
                }
            }

            incoming = ws_rx.next() => {
                let Some(Ok(msg)) = incoming else { break };
                match msg {
                    Message::Binary(raw) => {
                        conn.touch();
                        match Envelope::decode(Bytes::from(raw)) {
                            Ok(env) => submit_dispatch(&ctx, &conn, env),
                            Err(e) => {
                                tracing::warn!(conn = conn.id(), error = %e,
                                    "malformed envelope; closing session");
                                break;
                            }
                        }
                    }
                    Message::Text(_) => {
                        tracing::warn!(conn = conn.id(),
                            "text frame on binary protocol; closing session");
                        break;
                    }
                    Message::Ping(payload) => {
                        conn.touch();
                        let _ = ws_tx.send(Message::Pong(payload)).await;
                    }
                    Message::Pong(_) => {
                        conn.touch();
                    }
                    Message::Close(_) => break,
                }
            }
        }
    }

    teardown(&ctx, &conn).await;
}
