//! Bounded Work Queue
//!
//! Background jobs (asynchronous merges after a full-sync reply, for
//! example) go through a fixed-capacity queue drained by a small worker
//! pool. Submitting never blocks: a full queue drops the job and logs.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type Job = BoxFuture<'static, ()>;

pub struct WorkQueue {
    name: String,
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    dropped: Arc<AtomicUsize>,
}

impl WorkQueue {
    /// Create the queue and spawn `workers` tasks on the current runtime.
    pub fn new(name: impl Into<String>, capacity: usize, workers: usize) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::channel::<Job>(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|id| {
                let rx = rx.clone();
                let name = name.clone();
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        match job {
                            Some(job) => job.await,
                            None => break,
                        }
                    }
                    tracing::debug!("work queue {} worker {} stopped", name, id);
                })
            })
            .collect();

        Self {
            name,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            dropped: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue a job. Returns false if the queue is full or shut down.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            tracing::warn!("work queue {} is shut down, dropping job", self.name);
            return false;
        };

        match tx.try_send(Box::pin(job)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("work queue {} is full, dropping job", self.name);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("work queue {} is closed, dropping job", self.name);
                false
            }
        }
    }

    /// Jobs dropped because the queue was full.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting jobs and wait for queued work to drain.
    ///
    /// Returns false if the workers did not finish within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.tx.lock().take();
        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock());

        let drained = tokio::time::timeout(timeout, futures::future::join_all(handles)).await;
        match drained {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!("work queue {} did not drain within {:?}", self.name, timeout);
                false
            }
        }
    }
}
