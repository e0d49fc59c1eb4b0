//! # Schema and Connection Factory
//!
//! DDL for the three journal tables and the factory that hands out one
//! SQLite connection per operation.
//!
//! ## Table Overview
//!
//! ```text
//! journal_row                    journal_tag_row          journal_metadata
//! ┌──────────────────┐          ┌──────────────────┐     ┌──────────────────┐
//! │ ordering (PK)    │◄─────────│ ordering_id      │     │ persistence_id   │
//! │ persistence_id   │          │ tag_value        │     │ sequence_number  │
//! │ sequence_number  │          │ persistence_id   │     │ (composite PK)   │
//! │ deleted          │          │ sequence_number  │     └──────────────────┘
//! │ message BLOB     │          │ write_uuid       │      compat mode only
//! │ tags (CSV only)  │          └──────────────────┘
//! │ write_uuid       │           tag-table mode only
//! └──────────────────┘
//! ```
//!
//! `ordering` is `AUTOINCREMENT`, so values are assigned at insert and
//! never reused even after hard-delete — the read cursor depends on that.
//!
//! ## Connections
//!
//! Connections are per-operation and never cross a stage boundary except
//! inside one transaction. Every connection gets WAL mode and a busy
//! timeout, since concurrent batch flushes may overlap. For in-memory
//! databases the factory rewrites the DSN to a shared-cache URI and keeps
//! one connection open for the lifetime of the factory; without it the
//! store would vanish between operations.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};

use crate::config::JournalConfig;
use crate::error::{Error, Result};

// =============================================================================
// DDL
// =============================================================================

/// The event log. One row per persisted event.
///
/// `UNIQUE (persistence_id, sequence_number)` both enforces per-id
/// sequence uniqueness and serves the replay access path. `tags` is NULL
/// everywhere except in CSV layout.
const CREATE_JOURNAL_ROW: &str = r#"
CREATE TABLE IF NOT EXISTS journal_row (
    ordering        INTEGER PRIMARY KEY AUTOINCREMENT,
    persistence_id  TEXT    NOT NULL,
    sequence_number INTEGER NOT NULL,
    deleted         INTEGER NOT NULL DEFAULT 0,
    timestamp       INTEGER NOT NULL,
    message         BLOB    NOT NULL,
    manifest        TEXT    NOT NULL DEFAULT '',
    event_manifest  TEXT    NOT NULL DEFAULT '',
    identifier      INTEGER,
    tags            TEXT,
    write_uuid      BLOB    NOT NULL,
    UNIQUE (persistence_id, sequence_number)
)
"#;

/// Normalized tag rows (tag-table layout only).
///
/// `persistence_id` and `sequence_number` are denormalized so the delete
/// protocol can clean tags without joining back to the event row.
const CREATE_JOURNAL_TAG_ROW: &str = r#"
CREATE TABLE IF NOT EXISTS journal_tag_row (
    ordering_id     INTEGER NOT NULL,
    tag_value       TEXT    NOT NULL,
    persistence_id  TEXT    NOT NULL,
    sequence_number INTEGER NOT NULL,
    write_uuid      BLOB    NOT NULL
)
"#;

/// Serves `WHERE tag_value = ? AND ordering_id > ? ORDER BY ordering_id`.
const CREATE_TAG_VALUE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS journal_tag_row_value
ON journal_tag_row(tag_value, ordering_id)
"#;

/// Serves the delete protocol's tag cleanup by (persistence id, seq range).
const CREATE_TAG_PID_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS journal_tag_row_pid
ON journal_tag_row(persistence_id, sequence_number)
"#;

/// High-water-mark bookkeeping (compatibility mode only).
const CREATE_JOURNAL_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS journal_metadata (
    persistence_id  TEXT    NOT NULL,
    sequence_number INTEGER NOT NULL,
    PRIMARY KEY (persistence_id, sequence_number)
)
"#;

// =============================================================================
// Connection Factory
// =============================================================================

/// How many times `connect` retries opening before giving up.
const CONNECT_ATTEMPTS: u32 = 3;

/// Pause between open attempts.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Busy timeout applied to every connection; batch flushes overlap.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Namespace counter for anonymous in-memory databases.
static MEMORY_DB_SEQ: AtomicU64 = AtomicU64::new(0);

/// Produces per-operation database connections.
///
/// Cheap to share behind an `Arc`; `connect` opens a fresh connection each
/// call so no connection ever crosses a pipeline stage.
pub struct ConnectionFactory {
    /// Resolved DSN; `:memory:` is rewritten to a unique shared-cache URI.
    connection_string: String,

    /// Keep-alive connection pinning a shared-cache in-memory database.
    /// Never used for queries; only its lifetime matters.
    _keepalive: Option<Mutex<Connection>>,
}

impl ConnectionFactory {
    /// Builds a factory from the journal configuration.
    ///
    /// For `:memory:` DSNs a unique shared-cache URI is substituted and a
    /// keep-alive connection opened immediately (also verifying the DSN is
    /// usable at startup rather than at first write).
    pub fn new(config: &JournalConfig) -> Result<Self> {
        let connection_string = if config.connection_string == ":memory:" {
            let n = MEMORY_DB_SEQ.fetch_add(1, AtomicOrdering::Relaxed);
            format!("file:quilldb-mem-{n}?mode=memory&cache=shared")
        } else {
            config.connection_string.clone()
        };

        let mut factory = Self {
            connection_string,
            _keepalive: None,
        };

        if config.use_clone_connection && factory.is_memory() {
            let conn = factory.connect()?;
            factory._keepalive = Some(Mutex::new(conn));
        }

        Ok(factory)
    }

    fn is_memory(&self) -> bool {
        self.connection_string.contains("mode=memory")
    }

    /// Opens a fresh connection with journal pragmas applied.
    ///
    /// Retries [`CONNECT_ATTEMPTS`] times; persistent failure surfaces as
    /// [`Error::ConnectionFailed`].
    pub fn connect(&self) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let mut last_err = None;
        for attempt in 0..CONNECT_ATTEMPTS {
            if attempt > 0 {
                std::thread::sleep(CONNECT_RETRY_DELAY);
            }
            match Connection::open_with_flags(&self.connection_string, flags) {
                Ok(conn) => {
                    self.apply_pragmas(&conn)?;
                    return Ok(conn);
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "connection open failed");
                    last_err = Some(e);
                }
            }
        }

        Err(Error::ConnectionFailed {
            attempts: CONNECT_ATTEMPTS,
            reason: last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }

    fn apply_pragmas(&self, conn: &Connection) -> Result<()> {
        // WAL so readers never block the writer; a no-op for memory DBs.
        conn.execute_batch("PRAGMA journal_mode = WAL")?;
        conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        conn.execute_batch(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"))?;
        Ok(())
    }

    /// Creates the journal tables and indexes. Idempotent.
    pub fn initialize_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(CREATE_JOURNAL_ROW)?;
        conn.execute_batch(CREATE_JOURNAL_TAG_ROW)?;
        conn.execute_batch(CREATE_TAG_VALUE_INDEX)?;
        conn.execute_batch(CREATE_TAG_PID_INDEX)?;
        conn.execute_batch(CREATE_JOURNAL_METADATA)?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
