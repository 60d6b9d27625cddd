use std::fmt::Display;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::BatchConfig;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BatchError {
    /// The batch function failed; every item in the batch gets this.
    #[error("batch failed: {0}")]
    Failed(String),

    #[error("batch returned {got} results for {expected} items")]
    Mismatch { expected: usize, got: usize },

    #[error("batch processor stopped")]
    Dropped,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    pub max_batch_size: usize,
    pub max_wait: Duration,
}

impl From<&BatchConfig> for BatchSettings {
    fn from(cfg: &BatchConfig) -> Self {
        Self {
            max_batch_size: cfg.max_batch_size.max(1),
            max_wait: Duration::from_millis(cfg.max_wait_ms),
        }
    }
}

struct Pending<I, O> {
    item: I,
    reply: oneshot::Sender<Result<O, BatchError>>,
}

/// Accumulates items and hands them to a batch function together.
///
/// A batch is flushed when it reaches `max_batch_size` items or when
/// `max_wait` has passed since its first item, whichever comes first. The
/// batch function returns one output per item, in order.
pub struct BatchProcessor<I, O> {
    tx: Mutex<Option<mpsc::UnboundedSender<Pending<I, O>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<I, O> std::fmt::Debug for BatchProcessor<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProcessor").finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl<I, O> BatchProcessor<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new<F, Fut, E>(settings: BatchSettings, batch_fn: F) -> Self
    where
        F: Fn(Vec<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<O>, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(settings, batch_fn, rx));
        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queues `item` and waits for its share of the batch result.
    pub async fn add(&self, item: I) -> Result<O, BatchError> {
        let (reply, rx) = oneshot::channel();
        {
            let sender = lock(&self.tx).clone().ok_or(BatchError::Dropped)?;
            sender
                .send(Pending { item, reply })
                .map_err(|_| BatchError::Dropped)?;
        }
        rx.await.unwrap_or(Err(BatchError::Dropped))
    }

    /// Flushes whatever is queued and stops the worker.
    pub async fn dispose(&self) {
        drop(lock(&self.tx).take());
        let worker = lock(&self.worker).take();
        if let Some(handle) = worker {
            let _ = handle.await;
        }
    }
}

async fn run_worker<I, O, F, Fut, E>(
    settings: BatchSettings,
    batch_fn: F,
    mut rx: mpsc::UnboundedReceiver<Pending<I, O>>,
) where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(Vec<I>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<O>, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let mut inflight = Vec::new();
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        let deadline = sleep(settings.max_wait);
        tokio::pin!(deadline);
        while batch.len() < settings.max_batch_size {
            tokio::select! {
                biased;
                next = rx.recv() => match next {
                    Some(p) => batch.push(p),
                    None => break,
                },
                _ = &mut deadline => break,
            }
        }

        debug!(size = batch.len(), "flushing batch");
        let (items, replies): (Vec<I>, Vec<_>) =
            batch.into_iter().map(|p| (p.item, p.reply)).unzip();
        let fut = batch_fn(items);
        inflight.push(tokio::spawn(async move {
            deliver(fut.await, replies);
        }));
        inflight.retain(|h: &JoinHandle<()>| !h.is_finished());
    }
    for handle in inflight {
        let _ = handle.await;
    }
}

fn deliver<O, E: Display>(
    result: Result<Vec<O>, E>,
    replies: Vec<oneshot::Sender<Result<O, BatchError>>>,
) {
    match result {
        Ok(outputs) if outputs.len() == replies.len() => {
            for (reply, out) in replies.into_iter().zip(outputs) {
                let _ = reply.send(Ok(out));
            }
        }
        Ok(outputs) => {
            let err = BatchError::Mismatch {
                expected: replies.len(),
                got: outputs.len(),
            };
            warn!(error = %err, "batch result size mismatch");
            for reply in replies {
                let _ = reply.send(Err(err.clone()));
            }
        }
        Err(e) => {
            let err = BatchError::Failed(e.to_string());
            for reply in replies {
                let _ = reply.send(Err(err.clone()));
            }
        }
    }
}
