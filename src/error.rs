//! # Error Handling for the Journal
//!
//! A single [`Error`] enum covers every failure mode, with a [`Result`]
//! alias used throughout the crate. The taxonomy follows the journal's
//! propagation rules:
//!
//! | Variant | Scope | Carried by |
//! |---------|-------|------------|
//! | `Serialization` | one atomic write | positional slot in `write_messages` |
//! | `Sqlite` | one database operation | the failed call |
//! | `BatchFailed` | one write batch | every completion handle in the batch |
//! | `QueueFull` / `QueueClosed` | one `write_messages` call | the failed call |
//! | `Deserialization` | one row | an `Err` item inside the read stream |
//! | `Update` | one `(persistence id, sequence nr)` target | the failed call |
//! | `ConnectionFailed` | connection acquisition | the failed call / stream |
//! | `Rollback` | a failed transaction whose rollback also failed | every handle in the batch |
//!
//! Nothing is recovered silently: transactional paths attempt rollback,
//! aggregate a rollback failure with the root cause, and re-raise.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors the journal can produce.
#[derive(Error, Debug)]
pub enum Error {
    /// An event could not be serialized into a journal row.
    ///
    /// Returned positionally from `write_messages`; sibling atomic writes
    /// in the same call are unaffected.
    #[error("serialization failed for '{persistence_id}' seq {sequence_number}: {reason}")]
    Serialization {
        persistence_id: String,
        sequence_number: i64,
        reason: String,
    },

    /// A database operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A batched write transaction failed.
    ///
    /// Every caller whose rows were in the batch observes this same
    /// error; the journal retries nothing on its own.
    #[error("write batch failed: {0}")]
    BatchFailed(String),

    /// The write queue was full (drop-newest overflow policy).
    ///
    /// Non-retriable for this attempt; the write was never enqueued.
    #[error("write queue full: write dropped under drop-newest policy")]
    QueueFull,

    /// The write pipeline has shut down.
    #[error("write queue closed")]
    QueueClosed,

    /// A row read back from the journal could not be deserialized.
    ///
    /// Carried as a failed element inside the read stream; the stream
    /// itself continues past the row.
    #[error("deserialization failed at ordering {ordering}: {reason}")]
    Deserialization { ordering: i64, reason: String },

    /// An `update` could not be applied to its target row.
    #[error("update failed for '{persistence_id}' seq {sequence_number}: {reason}")]
    Update {
        persistence_id: String,
        sequence_number: i64,
        reason: String,
    },

    /// Connection acquisition failed after the configured retries.
    #[error("connection acquisition failed after {attempts} attempts: {reason}")]
    ConnectionFailed { attempts: u32, reason: String },

    /// A blocking database task was cancelled or panicked.
    #[error("database task failed: {0}")]
    TaskFailed(String),

    /// A transaction failed and the subsequent rollback failed too.
    ///
    /// Both causes are surfaced; the database connection is abandoned.
    #[error("transaction failed ({cause}); rollback also failed ({rollback})")]
    Rollback { cause: String, rollback: String },

    /// Invalid journal configuration, rejected at startup.
    #[error("configuration error: {0}")]
    Config(String),
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// `Result` specialized to the journal's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
