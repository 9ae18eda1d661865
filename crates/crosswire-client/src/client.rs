//! Correlating TCP client for the binary wire protocol.
//!
//! One connection, one background read task. Calls allocate a monotonic
//! message id, park a oneshot under it, and are completed by the read task
//! when the matching response envelope arrives. Connection loss fails every
//! parked call.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crosswire_core::error::{Error, Result};
use crosswire_core::protocol::codec::WireCodec;
use crosswire_core::protocol::envelope::{Envelope, Meta};
use crosswire_core::protocol::frame;

type Pending = Arc<DashMap<Bytes, oneshot::Sender<Envelope>>>;

pub struct Client {
    codec: WireCodec,
    writer: Mutex<OwnedWriteHalf>,
    pending: Pending,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Connect and run the codec token handshake: send our codec name as the
    /// first frame, expect the server to echo it back.
    pub async fn connect(addr: &str, codec: WireCodec) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        let (mut rd, mut wr) = stream.into_split();

        frame::write_frame(&mut wr, codec.name().as_bytes()).await?;
        let echo = frame::read_frame(&mut rd).await?;
        if WireCodec::from_token(&echo) != Some(codec) {
            return Err(Error::CodecNegotiation(format!(
                "server answered with unexpected token ({} bytes)",
                echo.len()
            )));
        }

        let pending: Pending = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(rd, pending.clone(), closed.clone()));

        Ok(Self {
            codec,
            writer: Mutex::new(wr),
            pending,
            next_id: AtomicU64::new(1),
            closed,
            reader: StdMutex::new(Some(reader)),
        })
    }

    pub fn codec(&self) -> WireCodec {
        self.codec
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Issue a correlated call and wait for its response. A non-zero response
    /// code surfaces as [`Error::Handler`]; the connection stays usable.
    ///
    /// Deadlines are the caller's: wrap in `tokio::time::timeout` as needed.
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        data: Bytes,
        metas: Vec<Meta>,
    ) -> Result<Bytes> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message_id = Bytes::copy_from_slice(&id.to_le_bytes());

        let mut env = Envelope::request(service, method, data);
        env.message_id = message_id.clone();
        env.metas = metas;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(message_id.clone(), tx);

        if let Err(e) = self.write(&env).await {
            self.pending.remove(&message_id);
            return Err(e);
        }

        // The read task clears the map when the connection dies; an insert
        // that lost that race would park forever. Removing our own entry
        // drops the sender and fails the await below.
        if self.is_closed() {
            self.pending.remove(&message_id);
        }

        let resp = rx.await.map_err(|_| Error::ConnectionClosed)?;
        if resp.code != 0 {
            return Err(Error::Handler {
                code: resp.code,
                desc: resp.desc,
            });
        }
        Ok(resp.data)
    }

    /// Fire-and-forget: empty message id, no response, no remote feedback.
    pub async fn notify(&self, service: &str, method: &str, data: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let env = Envelope::request(service, method, data);
        self.write(&env).await
    }

    async fn write(&self, env: &Envelope) -> Result<()> {
        let mut wr = self.writer.lock().await;
        frame::write_frame(&mut *wr, &env.encode()).await
    }

    /// Close the connection and fail every parked call.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut wr = self.writer.lock().await;
            let _ = wr.shutdown().await;
        }
        let handle = {
            let mut guard = match self.reader.lock() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            guard.take()
        };
        if let Some(h) = handle {
            let _ = h.await;
        }
        self.pending.clear();
    }
}

async fn read_loop(mut rd: OwnedReadHalf, pending: Pending, closed: Arc<AtomicBool>) {
    loop {
        match frame::read_frame(&mut rd).await {
            Ok(payload) => match Envelope::decode(payload) {
                Ok(env) => {
                    if let Some((_, tx)) = pending.remove(&env.message_id) {
                        let _ = tx.send(env);
                    } else {
                        tracing::debug!("response with no parked call; dropped");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "malformed response envelope");
                    break;
                }
            },
            Err(Error::PeerClosed) => break,
            Err(e) => {
                tracing::debug!(error = %e, "client read failed");
                break;
            }
        }
    }
    closed.store(true, Ordering::Release);
    // Dropping the parked senders wakes every waiting call with an error.
    pending.clear();
}
