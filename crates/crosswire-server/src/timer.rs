//! Single-owner timer wheel.
//!
//! A min-heap ordered by absolute expiration, owned by exactly one event-loop
//! task. Add/cancel/size arrive as messages over an mpsc channel, so the heap
//! itself is never locked or shared. The loop wakes on a coarse fixed tick
//! (default 500 ms), pops everything expired, and hands callbacks to the
//! companion worker pool so one slow callback cannot delay the others.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crosswire_core::error::{Error, Result};

use crate::pool::WorkerPool;

pub type TimerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Invoked with the timer id on every expiration.
pub type TimerCallback = Arc<dyn Fn(u64) -> TimerFuture + Send + Sync>;

struct Entry {
    id: u64,
    expires: Instant,
    /// Zero means one-shot.
    interval: Duration,
    cb: TimerCallback,
}

// BinaryHeap is a max-heap; reverse the ordering so the root is the nearest
// expiration.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .expires
            .cmp(&self.expires)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.expires == other.expires && self.id == other.id
    }
}

impl Eq for Entry {}

enum Command {
    Add(Entry),
    Cancel(u64),
    Size(oneshot::Sender<usize>),
}

pub struct TimerWheel {
    cmd: mpsc::Sender<Command>,
    next_id: AtomicU64,
    loop_task: StdMutex<Option<JoinHandle<()>>>,
    tick: Duration,
}

impl TimerWheel {
    /// Start the wheel's event loop. Callbacks fire through `pool`.
    pub fn new(tick: Duration, pool: Arc<WorkerPool>) -> Arc<Self> {
        let tick = tick.max(Duration::from_millis(1));
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let handle = tokio::spawn(run_wheel(tick, cmd_rx, pool));
        Arc::new(Self {
            cmd: cmd_tx,
            next_id: AtomicU64::new(1),
            loop_task: StdMutex::new(Some(handle)),
            tick,
        })
    }

    /// Timer delivery granularity.
    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Schedule a timer. `interval == 0` fires once; otherwise it repeats
    /// every `interval` until cancelled. Returns the timer id.
    pub async fn add(
        &self,
        delay: Duration,
        interval: Duration,
        cb: TimerCallback,
    ) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.cmd
            .send(Command::Add(Entry {
                id,
                expires: Instant::now() + delay,
                interval,
                cb,
            }))
            .await
            .map_err(|_| Error::Internal("timer wheel is stopped".into()))?;
        Ok(id)
    }

    /// Cancel a timer. Unknown ids are ignored (the timer may have already
    /// fired and left the wheel).
    pub async fn cancel(&self, id: u64) -> Result<()> {
        self.cmd
            .send(Command::Cancel(id))
            .await
            .map_err(|_| Error::Internal("timer wheel is stopped".into()))
    }

    /// Number of live (not cancelled) entries.
    pub async fn size(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.cmd
            .send(Command::Size(tx))
            .await
            .map_err(|_| Error::Internal("timer wheel is stopped".into()))?;
        rx.await
            .map_err(|_| Error::Internal("timer wheel is stopped".into()))
    }

    /// Tear the event loop down. Pending timers are discarded.
    pub async fn stop(&self) {
        let handle = {
            let mut guard = match self.loop_task.lock() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            guard.take()
        };
        if let Some(h) = handle {
            h.abort();
            let _ = h.await;
        }
    }
}

async fn run_wheel(tick: Duration, mut cmd_rx: mpsc::Receiver<Command>, pool: Arc<WorkerPool>) {
    let mut heap: BinaryHeap<Entry> = BinaryHeap::new();
    // Lazy cancellation: ids land here and are skipped when they surface.
    let mut cancelled: HashSet<u64> = HashSet::new();

    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Add(entry)) => heap.push(entry),
                    Some(Command::Cancel(id)) => {
                        cancelled.insert(id);
                    }
                    Some(Command::Size(tx)) => {
                        let dead = heap.iter().filter(|e| cancelled.contains(&e.id)).count();
                        let _ = tx.send(heap.len() - dead);
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                let now = Instant::now();
                while let Some(top) = heap.peek() {
                    if top.expires > now {
                        break;
                    }
                    let Some(entry) = heap.pop() else { break };
                    if cancelled.remove(&entry.id) {
                        continue;
                    }

                    let cb = entry.cb.clone();
                    let id = entry.id;
                    if pool.submit(Box::pin(cb(id))).is_err() {
                        tracing::warn!(timer = id, "worker pool stopped; timer callback dropped");
                    }

                    if !entry.interval.is_zero() {
                        let mut next = entry.expires + entry.interval;
                        // Reschedule from the prior deadline, but reset to now
                        // when lag exceeds one interval (or one tick for very
                        // short intervals) so delivery does not compound drift.
                        let threshold = entry.interval.max(tick);
                        if now.saturating_duration_since(next) > threshold {
                            next = now + entry.interval;
                        }
                        heap.push(Entry {
                            id: entry.id,
                            expires: next,
                            interval: entry.interval,
                            cb: entry.cb,
                        });
                    }
                }
                // Drop tombstones for entries that already left the heap.
                if !cancelled.is_empty() {
                    cancelled.retain(|id| heap.iter().any(|e| e.id == *id));
                }
            }
        }
    }
    tracing::trace!("timer wheel loop exiting");
}
