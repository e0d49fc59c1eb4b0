//! # Journal Configuration
//!
//! Every tunable of the write pipeline, delete protocol, and query engine
//! in one struct, validated once at [`crate::api::Journal::open`] time.
//! Layout ([`TagMode`]) and provider are fixed at startup; switching the
//! tag layout of an existing database requires offline migration.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

// =============================================================================
// Defaults
// =============================================================================

/// Default write-pipeline concurrency (parallel batch flushes).
pub const DEFAULT_PARALLELISM: usize = 8;

/// Default write queue capacity.
pub const DEFAULT_BUFFER_SIZE: usize = 5000;

/// Default maximum rows per write transaction.
pub const DEFAULT_BATCH_SIZE: usize = 400;

/// Run size above which the multi-path insert switches from a multi-row
/// VALUES statement to a reused per-row prepared statement.
pub const DEFAULT_MAX_ROW_BY_ROW_SIZE: usize = 100;

/// Default cap on rows per multi-row INSERT round trip.
pub const DEFAULT_DB_ROUND_TRIP_BATCH_SIZE: usize = 1000;

/// Default cap on tag rows per multi-row INSERT round trip.
pub const DEFAULT_DB_ROUND_TRIP_TAG_BATCH_SIZE: usize = 1000;

/// Default live-query polling period.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Default page size for query streams (bounds rows fetched per page).
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 500;

/// Default ordering safety window for live queries.
pub const DEFAULT_ORDERING_SAFETY_WINDOW: i64 = 1;

// =============================================================================
// Tag Layout
// =============================================================================

/// Physical representation of tags. Fixed at bootstrap (invariant I4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagMode {
    /// Tags live in the `tags` column of the event row, separator-joined.
    Csv,
    /// Tags live in `journal_tag_row`, one row per (event, tag).
    TagTable,
}

impl FromStr for TagMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "csv" => Ok(TagMode::Csv),
            "tag_table" | "tag-table" => Ok(TagMode::TagTable),
            other => Err(Error::Config(format!("unknown tag mode '{other}'"))),
        }
    }
}

// =============================================================================
// Provider
// =============================================================================

/// Dialect selector.
///
/// The full set of provider names is accepted so configuration written for
/// other deployments parses, but only the SQLite providers are executable
/// here; the rest are rejected by [`JournalConfig::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    SqliteMs,
    SqliteClassic,
    SqlServer2017,
    Postgres,
    Mysql,
}

impl Provider {
    pub fn is_sqlite(&self) -> bool {
        matches!(self, Provider::SqliteMs | Provider::SqliteClassic)
    }

    /// Whether this provider wants per-operation connection cloning
    /// (the keep-alive workaround for shared in-memory databases).
    pub fn default_use_clone_connection(&self) -> bool {
        self.is_sqlite()
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sqlite-ms" => Ok(Provider::SqliteMs),
            "sqlite-classic" => Ok(Provider::SqliteClassic),
            "sql-server-2017" => Ok(Provider::SqlServer2017),
            "postgres" => Ok(Provider::Postgres),
            "mysql" => Ok(Provider::Mysql),
            other => Err(Error::Config(format!("unknown provider '{other}'"))),
        }
    }
}

// =============================================================================
// Journal Configuration
// =============================================================================

/// Configuration for a [`crate::api::Journal`].
///
/// Construct with [`JournalConfig::new`] and override fields as needed;
/// validation runs at journal open, not at mutation.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Database DSN: a file path, or a `file:...` URI for shared-cache
    /// in-memory databases.
    pub connection_string: String,

    /// Dialect selector. Only SQLite providers are executable.
    pub provider: Provider,

    /// Concurrent batch flushes (≥ 1).
    pub parallelism: usize,

    /// Write queue capacity (≥ 1). Overflow drops the newest write.
    pub buffer_size: usize,

    /// Maximum rows per write transaction (≥ 1); the weight-batching
    /// threshold.
    pub batch_size: usize,

    /// Run size above which bulk insert goes row-by-row with a reused
    /// prepared statement instead of one multi-row statement.
    pub max_row_by_row_size: usize,

    /// Rows per multi-row INSERT round trip for `journal_row`.
    pub db_round_trip_batch_size: usize,

    /// Rows per multi-row INSERT round trip for `journal_tag_row`.
    pub db_round_trip_tag_batch_size: usize,

    /// When false, multi-row VALUES inserts are disabled and the per-row
    /// prepared statement is always used (no safe literal inlining here).
    pub prefer_parameters_on_multi_row_insert: bool,

    /// Tag layout. Fixed at startup.
    pub tag_mode: TagMode,

    /// Maintain `journal_metadata` high-water marks on delete so the
    /// highest sequence number survives hard-deletes of legacy data.
    pub delete_compatibility_mode: bool,

    /// Live query polling period.
    pub refresh_interval: Duration,

    /// Page size for query streams; bounds rows fetched, not envelopes
    /// emitted.
    pub max_buffer_size: usize,

    /// Live queries hold back this many orderings below `MAX(ordering)`
    /// while the max is advancing, tolerating commits that assign an
    /// earlier ordering but land later.
    pub ordering_safety_window: i64,

    /// Run the DDL at startup.
    pub auto_initialize: bool,

    /// Retain a keep-alive connection so per-operation connections of a
    /// shared-cache in-memory database all see the same store.
    pub use_clone_connection: bool,
}

impl JournalConfig {
    /// Creates a configuration with defaults for everything except the DSN.
    pub fn new(connection_string: impl Into<String>) -> Self {
        let provider = Provider::SqliteMs;
        Self {
            connection_string: connection_string.into(),
            provider,
            parallelism: DEFAULT_PARALLELISM,
            buffer_size: DEFAULT_BUFFER_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            max_row_by_row_size: DEFAULT_MAX_ROW_BY_ROW_SIZE,
            db_round_trip_batch_size: DEFAULT_DB_ROUND_TRIP_BATCH_SIZE,
            db_round_trip_tag_batch_size: DEFAULT_DB_ROUND_TRIP_TAG_BATCH_SIZE,
            prefer_parameters_on_multi_row_insert: true,
            tag_mode: TagMode::TagTable,
            delete_compatibility_mode: false,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            ordering_safety_window: DEFAULT_ORDERING_SAFETY_WINDOW,
            auto_initialize: true,
            use_clone_connection: provider.default_use_clone_connection(),
        }
    }

    /// Checks the configuration invariants.
    pub fn validate(&self) -> Result<()> {
        if self.connection_string.is_empty() {
            return Err(Error::Config("connection_string must be non-empty".into()));
        }
        if !self.provider.is_sqlite() {
            return Err(Error::Config(format!(
                "provider {:?} is not executable by this journal; use a sqlite provider",
                self.provider
            )));
        }
        if self.parallelism == 0 {
            return Err(Error::Config("parallelism must be >= 1".into()));
        }
        if self.buffer_size == 0 {
            return Err(Error::Config("buffer_size must be >= 1".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be >= 1".into()));
        }
        if self.db_round_trip_batch_size == 0 || self.db_round_trip_tag_batch_size == 0 {
            return Err(Error::Config("round trip batch sizes must be >= 1".into()));
        }
        if self.max_buffer_size == 0 {
            return Err(Error::Config("max_buffer_size must be >= 1".into()));
        }
        if self.ordering_safety_window < 0 {
            return Err(Error::Config("ordering_safety_window must be >= 0".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
