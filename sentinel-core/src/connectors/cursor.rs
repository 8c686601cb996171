//! Streaming row cursor.
//!
//! Connectors run their query in a producer task that pushes batches into a
//! bounded channel. The channel holds at most [`CURSOR_BUFFER_BATCHES`]
//! batches, so a slow consumer stalls the producer instead of growing memory.
//! Dropping the cursor stops the producer.

use super::SourceRow;
use crate::{Result, SentinelError};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Batches buffered between the producer and the executor.
pub const CURSOR_BUFFER_BATCHES: usize = 2;

type BatchResult = Result<Vec<SourceRow>>;

/// Producer side of a [`RowCursor`], accumulating rows into batches.
pub struct BatchSender {
    tx: mpsc::Sender<BatchResult>,
    batch: Vec<SourceRow>,
    batch_size: usize,
}

impl BatchSender {
    fn new(tx: mpsc::Sender<BatchResult>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            tx,
            batch: Vec::with_capacity(batch_size),
            batch_size,
        }
    }

    /// Adds a row, sending the batch when full. Returns `false` once the
    /// cursor has been dropped and the producer should stop.
    pub async fn push(&mut self, row: SourceRow) -> bool {
        self.batch.push(row);
        if self.batch.len() >= self.batch_size {
            return self.flush().await;
        }
        true
    }

    /// Sends any buffered rows.
    pub async fn flush(&mut self) -> bool {
        if self.batch.is_empty() {
            return !self.tx.is_closed();
        }
        let batch = std::mem::replace(&mut self.batch, Vec::with_capacity(self.batch_size));
        self.tx.send(Ok(batch)).await.is_ok()
    }

    /// Blocking variant of [`BatchSender::push`] for drivers without an async API.
    pub fn blocking_push(&mut self, row: SourceRow) -> bool {
        self.batch.push(row);
        if self.batch.len() >= self.batch_size {
            return self.blocking_flush();
        }
        true
    }

    /// Blocking variant of [`BatchSender::flush`].
    pub fn blocking_flush(&mut self) -> bool {
        if self.batch.is_empty() {
            return !self.tx.is_closed();
        }
        let batch = std::mem::replace(&mut self.batch, Vec::with_capacity(self.batch_size));
        self.tx.blocking_send(Ok(batch)).is_ok()
    }
}

/// Consumer side: yields batches in source order.
pub struct RowCursor {
    rx: mpsc::Receiver<BatchResult>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for RowCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCursor")
            .field("finished", &self.task.is_finished())
            .finish_non_exhaustive()
    }
}

impl RowCursor {
    /// Runs `producer` as a task feeding this cursor. An error returned by
    /// the producer, or a panic inside it, is delivered as the cursor's last
    /// item so a truncated stream never reads as exhausted.
    pub fn spawn<F, Fut>(batch_size: usize, producer: F) -> Self
    where
        F: FnOnce(BatchSender) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(CURSOR_BUFFER_BATCHES);
        let error_tx = tx.clone();
        let sender = BatchSender::new(tx, batch_size);
        let task = tokio::spawn(async move {
            let run = AssertUnwindSafe(async move { producer(sender).await });
            let failure = match run.catch_unwind().await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e,
                Err(panic) => {
                    let message = panic_message(&*panic);
                    tracing::error!("Row producer panicked: {}", message);
                    SentinelError::query_failed(format!("Row producer panicked: {message}"))
                }
            };
            let _ = error_tx.send(Err(failure)).await;
        });
        Self { rx, task }
    }

    /// Runs a synchronous `producer` on the blocking pool. A panic in the
    /// producer ends the cursor with an extraction error.
    pub fn spawn_blocking<F>(batch_size: usize, producer: F) -> Self
    where
        F: FnOnce(&mut BatchSender) -> Result<()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(CURSOR_BUFFER_BATCHES);
        let error_tx = tx.clone();
        let join_tx = tx.clone();
        let mut sender = BatchSender::new(tx, batch_size);
        let blocking = tokio::task::spawn_blocking(move || {
            if let Err(e) = producer(&mut sender) {
                let _ = error_tx.blocking_send(Err(e));
            }
        });
        let task = tokio::spawn(async move {
            if let Err(e) = blocking.await {
                tracing::error!("Blocking row producer failed: {}", e);
                let _ = join_tx
                    .send(Err(SentinelError::extraction_failed(
                        "Blocking row producer failed",
                        e,
                    )))
                    .await;
            }
        });
        Self { rx, task }
    }

    /// Next batch, `Ok(None)` once the source is exhausted.
    ///
    /// # Errors
    /// Returns the producer's error, typically an extraction failure.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<SourceRow>>> {
        match self.rx.recv().await {
            Some(Ok(batch)) => Ok(Some(batch)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

impl Drop for RowCursor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
