//! Bounded worker pool.
//!
//! Readiness work (an inbound message to dispatch, an accepted socket to
//! set up) is queued as a boxed job on a bounded channel and drained by a
//! fixed set of worker tasks. The bound is the backpressure: submitters
//! wait when every worker is occupied and the queue is full.

use crate::error::{TransportError, TransportResult};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(worker_count: usize, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue_depth.max(1));
        let rx = Arc::new(AsyncMutex::new(rx));
        let handles = (0..worker_count.max(1))
            .map(|worker| {
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        // hold the receiver lock only while waiting for a job
                        let job = rx.lock().await.recv().await;
                        match job {
                            Some(job) => job.await,
                            None => break,
                        }
                    }
                    tracing::debug!(worker, "worker exiting");
                })
            })
            .collect();
        Self { tx, handles }
    }

    /// Queues a job, waiting if the queue is at its bound.
    pub async fn submit(&self, job: impl Future<Output = ()> + Send + 'static) -> TransportResult<()> {
        self.tx
            .send(Box::pin(job))
            .await
            .map_err(|_| TransportError::Internal("worker pool is shut down".to_string()))
    }

    /// Closes the queue and waits for the workers to drain it.
    pub async fn shutdown(self) {
        let Self { tx, handles } = self;
        drop(tx);
        for handle in handles {
            let _ = handle.await;
        }
    }
}
