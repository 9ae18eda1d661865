//! Bounded worker pool.
//!
//! A fixed set of long-lived workers pulls boxed-future jobs from one shared
//! bounded queue, so the number of concurrently executing business calls is
//! bounded by the worker count rather than the connection count. When the
//! queue is full, `submit` degrades gracefully by spawning the job on an
//! ad-hoc task instead of blocking the submitter.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crosswire_core::error::{Error, Result};

/// A zero-argument unit of work, executed at most once.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Box an async block into a [`Job`].
pub fn job<F>(fut: F) -> Job
where
    F: Future<Output = ()> + Send + 'static,
{
    Box::pin(fut)
}

pub struct WorkerPool {
    tx: StdMutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Ad-hoc tasks spawned when the queue was full; drained by `stop_wait`.
    adhoc: StdMutex<Vec<JoinHandle<()>>>,
    saturated: AtomicU64,
}

impl WorkerPool {
    /// Spawn `workers` long-lived tasks over a queue of `queue` slots.
    pub fn new(workers: usize, queue: usize) -> Arc<Self> {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<Job>(queue.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx = rx.clone();
            handles.push(tokio::spawn(worker_loop(idx, rx)));
        }

        Arc::new(Self {
            tx: StdMutex::new(Some(tx)),
            workers: Mutex::new(handles),
            adhoc: StdMutex::new(Vec::new()),
            saturated: AtomicU64::new(0),
        })
    }

    /// Enqueue a job for eventual, at-most-once execution. Cross-job ordering
    /// is not guaranteed. A full queue falls back to an ad-hoc task; a stopped
    /// pool rejects the submission.
    pub fn submit(&self, job: Job) -> Result<()> {
        let guard = self
            .tx
            .lock()
            .map_err(|_| Error::Internal("worker pool mutex poisoned".into()))?;
        let Some(tx) = guard.as_ref() else {
            return Err(Error::Internal("worker pool is stopped".into()));
        };
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.saturated.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("worker queue saturated; spawning ad-hoc task");
                let handle = tokio::spawn(run_guarded(job));
                let mut adhoc = match self.adhoc.lock() {
                    Ok(g) => g,
                    Err(p) => p.into_inner(),
                };
                adhoc.retain(|h| !h.is_finished());
                adhoc.push(handle);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(Error::Internal("worker pool is stopped".into()))
            }
        }
    }

    /// Stop accepting submissions and wait until every already-queued job has
    /// finished (drain semantics). Ad-hoc saturation tasks count too.
    pub async fn stop_wait(&self) {
        // Dropping the sender closes the queue; workers drain and exit.
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
        let mut handles = self.workers.lock().await;
        for h in handles.drain(..) {
            let _ = h.await;
        }
        let adhoc: Vec<JoinHandle<()>> = {
            let mut guard = match self.adhoc.lock() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            guard.drain(..).collect()
        };
        for h in adhoc {
            let _ = h.await;
        }
        tracing::debug!("worker pool drained");
    }

    /// Number of submissions that overflowed into ad-hoc tasks.
    pub fn saturated_submits(&self) -> u64 {
        self.saturated.load(Ordering::Relaxed)
    }
}

async fn worker_loop(idx: usize, rx: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let next = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        match next {
            Some(job) => run_guarded(job).await,
            None => break,
        }
    }
    tracing::trace!(worker = idx, "worker exiting");
}

/// A panicking job must not take its worker down with it.
async fn run_guarded(job: Job) {
    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
        tracing::error!("worker job panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn all_jobs_run_exactly_once() {
        for workers in [1usize, 4] {
            let pool = WorkerPool::new(workers, 64);
            let counter = Arc::new(AtomicUsize::new(0));
            let k = 200;

            for _ in 0..k {
                let c = counter.clone();
                pool.submit(job(async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
            }

            pool.stop_wait().await;
            assert_eq!(counter.load(Ordering::SeqCst), k, "workers={workers}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn saturation_falls_back_instead_of_blocking() {
        // One worker, a one-slot queue, and a job that parks the worker.
        let pool = WorkerPool::new(1, 1);
        let counter = Arc::new(AtomicUsize::new(0));
        let (hold_tx, hold_rx) = tokio::sync::oneshot::channel::<()>();

        pool.submit(job(async move {
            let _ = hold_rx.await;
        }))
        .unwrap();

        // Burst past the queue capacity; submits must return immediately.
        for _ in 0..10 {
            let c = counter.clone();
            pool.submit(job(async move {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        assert!(pool.saturated_submits() > 0);

        let _ = hold_tx.send(());
        // Drain covers the ad-hoc fallback tasks as well as the queue.
        pool.stop_wait().await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn submit_after_stop_is_rejected() {
        let pool = WorkerPool::new(2, 8);
        pool.stop_wait().await;
        let res = pool.submit(job(async {}));
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn job_panic_does_not_kill_the_pool() {
        let pool = WorkerPool::new(1, 8);
        let counter = Arc::new(AtomicUsize::new(0));

        pool.submit(job(async {
            panic!("boom");
        }))
        .unwrap();

        let c = counter.clone();
        pool.submit(job(async move {
            c.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        pool.stop_wait().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
