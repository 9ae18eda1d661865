//! Connection lifecycle shared by the TCP and WebSocket transports.
//!
//! State progression: CONNECTED -> CODEC_NEGOTIATED -> SERVING -> CLOSING ->
//! CLOSED. A connection is owned by its read/write loop pair plus the live
//! connection registry (for shutdown fan-out). Business handlers never run on
//! connection tasks; every decoded envelope becomes a job on the shared
//! worker pool.

pub mod registry;
pub mod tcp;
pub mod ws;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures_util::FutureExt;
use tokio::sync::{mpsc, watch};

use crosswire_core::error::{Error, Result};
use crosswire_core::protocol::codec::WireCodec;
use crosswire_core::protocol::envelope::Envelope;
use crosswire_core::protocol::frame::MAX_FRAME_BYTES;

use crate::registry::Request;
use crate::server::ServeCtx;
use crate::timer::TimerCallback;

/// Identity attached to a connection via [`Connection::auth`]. Notified when
/// the connection goes away.
pub trait Identity: Send + Sync {
    fn subject(&self) -> &str;
    fn on_close(&self, conn_id: u64) {
        let _ = conn_id;
    }
}

static CONN_ID: OnceLock<AtomicU64> = OnceLock::new();

/// Process-unique monotonic connection id, seeded from the system clock's
/// nanoseconds so ids differ across restarts.
pub fn next_conn_id() -> u64 {
    let counter = CONN_ID.get_or_init(|| {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        AtomicU64::new(nanos | 1)
    });
    counter.fetch_add(1, Ordering::Relaxed)
}

/// Per-connection state shared between the read loop, write loop, heartbeat
/// callback, and dispatch jobs.
pub struct Connection {
    id: u64,
    peer: String,
    codec: OnceLock<WireCodec>,
    last_activity: StdMutex<Instant>,
    closed: AtomicBool,
    out_tx: mpsc::Sender<Bytes>,
    cancel_tx: watch::Sender<bool>,
    heartbeat_timer: AtomicU64,
    identity: StdMutex<Option<Arc<dyn Identity>>>,
}

impl Connection {
    /// Build a connection with a bounded outbound queue. Returns the queue's
    /// receiver (for the write loop) and a cancellation receiver.
    pub(crate) fn new(
        peer: String,
        outbound_queue: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>, watch::Receiver<bool>) {
        let (out_tx, out_rx) = mpsc::channel(outbound_queue.max(1));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let conn = Arc::new(Self {
            id: next_conn_id(),
            peer,
            codec: OnceLock::new(),
            last_activity: StdMutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            out_tx,
            cancel_tx,
            heartbeat_timer: AtomicU64::new(0),
            identity: StdMutex::new(None),
        });
        (conn, out_rx, cancel_rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn codec(&self) -> Option<WireCodec> {
        self.codec.get().copied()
    }

    pub(crate) fn set_codec(&self, codec: WireCodec) {
        let _ = self.codec.set(codec);
    }

    /// Record activity (a successful read or an explicit heartbeat).
    pub fn touch(&self) {
        *lock_ignore_poison(&self.last_activity) = Instant::now();
    }

    /// Time since the last observed activity.
    pub fn idle_for(&self) -> Duration {
        lock_ignore_poison(&self.last_activity).elapsed()
    }

    /// Queue one pre-encoded envelope payload for writing.
    ///
    /// Backpressure is synchronous: a full queue returns [`Error::QueueFull`]
    /// immediately instead of blocking; the connection stays open and the
    /// caller decides whether to retry or shed the write.
    pub fn send(&self, payload: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        if payload.len() > MAX_FRAME_BYTES {
            return Err(Error::FrameOversize {
                len: payload.len(),
                max: MAX_FRAME_BYTES,
            });
        }
        match self.out_tx.try_send(payload) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Error::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::ConnectionClosed),
        }
    }

    /// Attach an identity (post-authentication).
    pub fn auth(&self, identity: Arc<dyn Identity>) {
        *lock_ignore_poison(&self.identity) = Some(identity);
    }

    pub fn identity(&self) -> Option<Arc<dyn Identity>> {
        lock_ignore_poison(&self.identity).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Idempotent close: first caller wins, everyone else is a no-op. Signals
    /// both loops to exit and notifies the attached identity. Registry and
    /// timer cleanup happen in [`teardown`], which observes the signal.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.cancel_tx.send(true);
        if let Some(identity) = self.identity() {
            identity.on_close(self.id);
        }
    }

    pub(crate) fn set_heartbeat_timer(&self, id: u64) {
        self.heartbeat_timer.store(id, Ordering::Release);
    }

    pub(crate) fn heartbeat_timer(&self) -> u64 {
        self.heartbeat_timer.load(Ordering::Acquire)
    }

    /// Subscribe to the cancellation signal.
    pub fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }
}

fn lock_ignore_poison<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

/// Register the periodic idle check with the timer wheel.
pub(crate) async fn register_heartbeat(ctx: &Arc<ServeCtx>, conn: &Arc<Connection>) -> Result<()> {
    let interval = Duration::from_millis(ctx.cfg.heartbeat.interval_ms);
    let timeout = Duration::from_millis(ctx.cfg.heartbeat.idle_timeout_ms);

    let watched = conn.clone();
    let cb: TimerCallback = Arc::new(move |_id| {
        let conn = watched.clone();
        Box::pin(async move {
            if conn.is_closed() {
                return;
            }
            let idle = conn.idle_for();
            if idle >= timeout {
                tracing::info!(conn = conn.id(), idle_ms = idle.as_millis() as u64,
                    "heartbeat timeout; evicting idle connection");
                conn.close();
            }
        })
    });

    let id = ctx.wheel.add(interval, interval, cb).await?;
    conn.set_heartbeat_timer(id);
    Ok(())
}

/// Common teardown for both transports. Safe to reach from either loop and
/// from shutdown fan-out; everything in here is idempotent.
pub(crate) async fn teardown(ctx: &Arc<ServeCtx>, conn: &Arc<Connection>) {
    conn.close();
    let timer = conn.heartbeat_timer();
    if timer != 0 {
        let _ = ctx.wheel.cancel(timer).await;
    }
    ctx.conns.remove(conn.id());
    if let Some(hook) = &ctx.hooks.on_close {
        hook(conn.id());
    }
    tracing::debug!(conn = conn.id(), peer = %conn.peer(), "connection closed");
}

/// Hand a decoded envelope to the shared worker pool.
pub(crate) fn submit_dispatch(ctx: &Arc<ServeCtx>, conn: &Arc<Connection>, env: Envelope) {
    let ctx2 = ctx.clone();
    let conn2 = conn.clone();
    let res = ctx.pool.submit(Box::pin(async move {
        dispatch_one(ctx2, conn2, env).await;
    }));
    if let Err(e) = res {
        tracing::warn!(conn = conn.id(), error = %e, "dispatch submission dropped");
    }
}

/// Run one request through the registry and correlate the response.
///
/// Error surfaces per class: dispatch and business failures become a
/// well-formed error envelope (reply-expecting callers only); a handler panic
/// is logged and closes this connection; fire-and-forget failures are logged
/// and dropped.
async fn dispatch_one(ctx: Arc<ServeCtx>, conn: Arc<Connection>, env: Envelope) {
    let Some(codec) = conn.codec() else {
        tracing::warn!(conn = conn.id(), "request before codec negotiation");
        conn.close();
        return;
    };

    let req = Request {
        conn_id: conn.id(),
        service: env.service.clone(),
        method: env.method.clone(),
        codec,
        data: env.data.clone(),
        metas: env.metas.clone(),
    };

    let outcome = AssertUnwindSafe(ctx.registry.dispatch(req)).catch_unwind().await;

    let reply = match outcome {
        Ok(Ok(resp)) => {
            if env.expects_reply() {
                let mut out = Envelope::reply_to(&env, resp.data);
                out.code = resp.code;
                out.desc = resp.desc;
                Some(out)
            } else {
                None
            }
        }
        Ok(Err(e)) => {
            if env.expects_reply() {
                Some(Envelope::error_reply_to(&env, e.status_code(), e.to_string()))
            } else {
                tracing::warn!(conn = conn.id(), service = %env.service,
                    method = %env.method, error = %e, "fire-and-forget dispatch failed");
                None
            }
        }
        Err(_) => {
            tracing::error!(conn = conn.id(), service = %env.service, method = %env.method,
                "handler panicked; closing connection");
            conn.close();
            None
        }
    };

    if let Some(reply) = reply {
        match conn.send(reply.encode()) {
            Ok(()) => {}
            Err(Error::QueueFull) => {
                tracing::warn!(conn = conn.id(), "outbound queue full; response shed");
            }
            Err(e) => {
                tracing::debug!(conn = conn.id(), error = %e, "response not sent");
            }
        }
    }
}
