//! TCP connection loops: codec negotiation, framed read loop, queued write
//! loop.
//!
//! One task reads, one task writes. The read loop turns frames into dispatch
//! jobs on the shared worker pool; the write loop drains the bounded outbound
//! queue. Either loop exiting cancels the other through the connection's
//! watch signal.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crosswire_core::error::{Error, Result};
use crosswire_core::protocol::codec::WireCodec;
use crosswire_core::protocol::envelope::Envelope;
use crosswire_core::protocol::frame;

use super::{register_heartbeat, submit_dispatch, teardown, Connection};
use crate::server::ServeCtx;

/// Serve one accepted TCP socket until it closes.
pub(crate) async fn run_conn(ctx: Arc<ServeCtx>, stream: TcpStream, peer: SocketAddr) {
    let _ = stream.set_nodelay(true);

    let (conn, out_rx, cancel_rx) =
        Connection::new(peer.to_string(), ctx.cfg.connection.outbound_queue);
    tracing::debug!(conn = conn.id(), peer = %peer, "tcp connection accepted");

    if let Some(hook) = &ctx.hooks.on_connect {
        hook(&conn);
    }

    let (mut rd, mut wr) = stream.into_split();

    // The first frame's payload carries the codec token; echo the chosen name
    // back. The peer gets one idle-timeout's worth of time to speak, and a
    // server shutdown aborts the wait, so a silent socket can outlive neither
    // the idle policy nor the close fan-out.
    let deadline = Duration::from_millis(ctx.cfg.heartbeat.idle_timeout_ms);
    let mut shutdown = ctx.shutdown_rx();
    let negotiated = tokio::select! {
        res = tokio::time::timeout(deadline, negotiate(&mut rd, &mut wr)) => match res {
            Ok(inner) => inner,
            Err(_) => Err(Error::CodecNegotiation(
                "no handshake frame before the idle deadline".into(),
            )),
        },
        _ = shutdown.changed() => {
            Err(Error::CodecNegotiation("server shutting down".into()))
        }
    };
    let codec = match negotiated {
        Ok(codec) => codec,
        Err(e) => {
            tracing::warn!(conn = conn.id(), peer = %peer, error = %e,
                "codec negotiation failed; aborting connection");
            teardown(&ctx, &conn).await;
            return;
        }
    };
    conn.set_codec(codec);
    conn.touch();
    tracing::debug!(conn = conn.id(), codec = codec.name(), "codec negotiated");

    ctx.conns.insert(conn.clone());
    if let Err(e) = register_heartbeat(&ctx, &conn).await {
        tracing::warn!(conn = conn.id(), error = %e, "heartbeat registration failed");
    }

    let writer = tokio::spawn(write_loop(wr, out_rx, cancel_rx.clone(), conn.clone()));

    read_loop(&ctx, &conn, &mut rd, cancel_rx).await;

    teardown(&ctx, &conn).await;
    let _ = writer.await;
}

async fn negotiate(rd: &mut OwnedReadHalf, wr: &mut OwnedWriteHalf) -> Result<WireCodec> {
    let payload = frame::read_frame(rd).await?;
    let codec = WireCodec::from_token(&payload).ok_or_else(|| {
        Error::CodecNegotiation("no recognizable codec token in first frame".into())
    })?;
    frame::write_frame(wr, codec.name().as_bytes()).await?;
    Ok(codec)
}

async fn read_loop(
    ctx: &Arc<ServeCtx>,
    conn: &Arc<Connection>,
    rd: &mut OwnedReadHalf,
    mut cancel_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = cancel_rx.changed() => break,
            res = frame::read_frame(rd) => {
                match res {
                    Ok(payload) => {
                        conn.touch();
                        match Envelope::decode(payload) {
                            Ok(env) => submit_dispatch(ctx, conn, env),
                            Err(e) => {
                                tracing::warn!(conn = conn.id(), error = %e,
                                    "malformed envelope; closing connection");
                                break;
                            }
                        }
                    }
                    Err(Error::PeerClosed) => {
                        tracing::debug!(conn = conn.id(), "peer closed");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(conn = conn.id(), error = %e, "read failed");
                        break;
                    }
                }
            }
        }
    }
}

async fn write_loop<W>(
    mut wr: W,
    mut out_rx: mpsc::Receiver<Bytes>,
    mut cancel_rx: watch::Receiver<bool>,
    conn: Arc<Connection>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel_rx.changed() => break,
            maybe = out_rx.recv() => {
                match maybe {
                    Some(payload) => {
                        if let Err(e) = frame::write_frame(&mut wr, &payload).await {
                            tracing::debug!(conn = conn.id(), error = %e, "write failed");
                            conn.close();
                            let _ = wr.shutdown().await;
                            return;
                        }
                    }
                    None => break,
                }
            }
        }
    }
    // Flush frames accepted before the close signal; the peer still sees
    // responses that were already queued.
    out_rx.close();
    while let Some(payload) = out_rx.recv().await {
        if frame::write_frame(&mut wr, &payload).await.is_err() {
            break;
        }
    }
    let _ = wr.shutdown().await;
}
