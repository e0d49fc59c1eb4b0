//! # Asynchronous Write Pipeline
//!
//! The staged dataflow between `write_messages` callers and the database:
//!
//! ```text
//! callers ──try_send──► bounded queue ──► weight batcher ──► flush (×N)
//!            (drop-newest,  capacity =      (rows summed        (semaphore-
//!             QueueFull)    buffer_size)     up to batch_size)    bounded)
//! ```
//!
//! - The queue is the only cross-caller shared mutable resource. Overflow
//!   drops the newest entry and that caller alone sees `QueueFull`.
//! - The batcher takes one entry, then keeps draining entries that are
//!   already queued until the summed row count reaches `batch_size` or the
//!   queue momentarily empties. No timer: an idle upstream flushes
//!   immediately.
//! - Each batch is flushed on the blocking pool through a per-operation
//!   connection, with at most `parallelism` flushes in flight. Success
//!   resolves every completion handle in the batch; failure fails them all
//!   with the same error.
//!
//! Within one persistence id, callers await each write before issuing the
//! next (single-writer assumption), so parallel flushes never hold two
//! writes of the same id concurrently.

use std::sync::Arc;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, Semaphore};

use crate::config::JournalConfig;
use crate::error::{Error, Result};
use crate::schema::ConnectionFactory;
use crate::storage;
use crate::types::JournalRow;

// =============================================================================
// Queue Entries
// =============================================================================

/// One enqueued `write_messages` call: the serialized rows of all its
/// atomic writes plus the handle resolved when their batch commits.
pub struct WriteEntry {
    pub rows: Vec<JournalRow>,
    pub done: oneshot::Sender<Result<()>>,
}

impl WriteEntry {
    /// Batch weight of this entry.
    fn weight(&self) -> usize {
        self.rows.len()
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Spawns the write pipeline and returns its enqueue side.
///
/// The pipeline stops when every sender is dropped; entries still queued
/// at that point are flushed before the task exits.
pub fn spawn_write_pipeline(
    factory: Arc<ConnectionFactory>,
    config: Arc<JournalConfig>,
) -> mpsc::Sender<WriteEntry> {
    let (tx, rx) = mpsc::channel(config.buffer_size);
    tokio::spawn(run_write_pipeline(factory, config, rx));
    tx
}

/// The batching driver loop.
async fn run_write_pipeline(
    factory: Arc<ConnectionFactory>,
    config: Arc<JournalConfig>,
    mut rx: mpsc::Receiver<WriteEntry>,
) {
    let semaphore = Arc::new(Semaphore::new(config.parallelism));

    while let Some(first) = rx.recv().await {
        let mut weight = first.weight();
        let mut batch = vec![first];

        while weight < config.batch_size {
            match rx.try_recv() {
                Ok(entry) => {
                    weight += entry.weight();
                    batch.push(entry);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        tracing::trace!(entries = batch.len(), rows = weight, "flushing write batch");

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            // The semaphore is never closed; treat it as shutdown anyway.
            Err(_) => break,
        };
        let factory = factory.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let _permit = permit;
            flush_batch(factory, config, batch).await;
        });
    }
}

/// Writes one batch and resolves its completion handles.
async fn flush_batch(
    factory: Arc<ConnectionFactory>,
    config: Arc<JournalConfig>,
    batch: Vec<WriteEntry>,
) {
    let mut rows = Vec::new();
    let mut handles = Vec::new();
    for entry in batch {
        rows.extend(entry.rows);
        handles.push(entry.done);
    }

    let result = tokio::task::spawn_blocking(move || -> Result<()> {
        let conn = factory.connect()?;
        storage::insert_batch(&conn, &rows, &config)
    })
    .await;

    let failure = match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(join) => Some(format!("flush task panicked: {join}")),
    };

    match failure {
        None => {
            for handle in handles {
                // A caller that stopped waiting is its own problem.
                let _ = handle.send(Ok(()));
            }
        }
        Some(message) => {
            tracing::warn!(error = %message, "write batch failed");
            for handle in handles {
                let _ = handle.send(Err(Error::BatchFailed(message.clone())));
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
