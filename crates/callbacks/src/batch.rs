//! Shared queueing policy for sinks whose upstream prefers bulk ingest.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::SinkError;

/// Sends one batch upstream.
#[async_trait]
pub trait BatchFlusher<T>: Send + Sync {
    /// Deliver the batch. A failed batch is dropped.
    async fn flush(&self, batch: Vec<T>) -> Result<(), SinkError>;
}

/// A queue flushed when it reaches `batch_size` items, on every tick of the
/// flush interval and once more on shutdown. Delivery is at most once.
pub struct BatchSink<T> {
    name: String,
    queue: Mutex<Vec<T>>,
    batch_size: usize,
    flusher: Arc<dyn BatchFlusher<T>>,
    stopped: CancellationToken,
}

impl<T: Send + 'static> BatchSink<T> {
    /// Create the queue.
    pub fn new(name: impl Into<String>, batch_size: usize, flusher: Arc<dyn BatchFlusher<T>>) -> Self {
        Self {
            name: name.into(),
            queue: Mutex::new(Vec::with_capacity(batch_size)),
            batch_size: batch_size.max(1),
            flusher,
            stopped: CancellationToken::new(),
        }
    }

    /// Queue an item, flushing from the caller when the batch is full.
    pub async fn append(&self, item: T) {
        if self.stopped.is_cancelled() {
            log::warn!("Batch sink '{}' is stopped, dropping item", self.name);
            return;
        }

        let full = {
            let mut queue = self.queue.lock().await;
            queue.push(item);
            queue.len() >= self.batch_size
        };

        if full {
            self.flush().await;
        }
    }

    /// Number of queued items.
    pub async fn queued(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Send everything queued so far.
    pub async fn flush(&self) {
        // The lock is released before the upstream call so producers are never blocked by it.
        let batch = std::mem::take(&mut *self.queue.lock().await);

        if batch.is_empty() {
            return;
        }

        let size = batch.len();

        match self.flusher.flush(batch).await {
            Ok(()) => log::debug!("Batch sink '{}' flushed {size} item(s)", self.name),
            Err(e) => log::warn!("Batch sink '{}' failed to flush, discarding {size} item(s): {e}", self.name),
        }
    }

    /// Flush on every tick until `shutdown` is cancelled, then flush one last time.
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let sink = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => sink.flush().await,
                    _ = shutdown.cancelled() => break,
                }
            }

            sink.stop().await;
        })
    }

    /// Flush the remaining items once and refuse new ones.
    pub async fn stop(&self) {
        if self.stopped.is_cancelled() {
            return;
        }

        self.stopped.cancel();
        self.flush().await;
    }
}
