//! # Journal API
//!
//! The async facade over the journal: [`Journal`] owns the write surface
//! and lifecycle, [`ReadJournal`] is the factory for query streams.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                       Tokio runtime                        │
//! │                                                            │
//! │  callers ──► Journal ──try_send──► write pipeline task     │
//! │                 │                     │ spawn_blocking     │
//! │  consumers ◄── ReadJournal streams ◄──┤                    │
//! │                 │ spawn_blocking      ▼                    │
//! │                 ▼              per-operation connections   │
//! │          per-operation conns          │                    │
//! └─────────────────────────┬─────────────┴────────────────────┘
//!                           ▼
//!                        SQLite
//! ```
//!
//! rusqlite connections are synchronous, so every round trip runs on the
//! blocking pool with a connection from the shared factory; nothing here
//! blocks the async threads. Dropping the `Journal` closes the queue: the
//! pipeline flushes what it already accepted and later writes fail with
//! `QueueClosed`.

use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use crate::config::JournalConfig;
use crate::error::{Error, Result};
use crate::query::{
    with_connection, EventReplay, EventStream, Mode, PersistenceIdsStream, Selection,
    StreamSettings,
};
use crate::schema::ConnectionFactory;
use crate::serializer::{
    serialize_atomic_writes, serialize_single, BytesSerializer, EventAdapter, IdentityAdapter,
    JournalSerializer,
};
use crate::storage;
use crate::types::{AtomicWrite, Ordering, PersistenceId, PersistentRepr, SequenceNr, Tag};
use crate::writer::{spawn_write_pipeline, WriteEntry};

// =============================================================================
// Journal
// =============================================================================

/// A durable event journal over one SQLite database.
///
/// Cloneable and cheap to share; all clones feed the same write pipeline.
#[derive(Clone)]
pub struct Journal {
    config: Arc<JournalConfig>,
    factory: Arc<ConnectionFactory>,
    serializer: Arc<dyn JournalSerializer>,
    write_tx: mpsc::Sender<WriteEntry>,
}

impl Journal {
    /// Opens a journal with the pass-through [`BytesSerializer`].
    pub async fn open(config: JournalConfig) -> Result<Self> {
        Self::open_with_serializer(config, Arc::new(BytesSerializer)).await
    }

    /// Opens a journal with a custom serializer.
    ///
    /// Validates the configuration, builds the connection factory, runs
    /// the DDL when `auto_initialize` is set, and spawns the write
    /// pipeline. Must be called from within a Tokio runtime.
    pub async fn open_with_serializer(
        config: JournalConfig,
        serializer: Arc<dyn JournalSerializer>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let setup_config = config.clone();
        let factory = tokio::task::spawn_blocking(move || -> Result<ConnectionFactory> {
            let factory = ConnectionFactory::new(&setup_config)?;
            if setup_config.auto_initialize {
                factory.initialize_schema()?;
            }
            Ok(factory)
        })
        .await
        .map_err(|e| Error::TaskFailed(e.to_string()))??;
        let factory = Arc::new(factory);

        let write_tx = spawn_write_pipeline(factory.clone(), config.clone());

        tracing::debug!(
            dsn = %config.connection_string,
            tag_mode = ?config.tag_mode,
            "journal opened"
        );

        Ok(Self {
            config,
            factory,
            serializer,
            write_tx,
        })
    }

    /// Persists a batch of atomic writes stamped with `timestamp`.
    ///
    /// The outer `Result` is the transport/storage outcome: queue overflow
    /// (`QueueFull`, drop-newest), pipeline shutdown (`QueueClosed`), or
    /// the shared failure of the batch the rows landed in. The inner
    /// vector mirrors `writes` positionally and carries per-write
    /// serialization failures; a failed write never affects its siblings.
    pub async fn write_messages(
        &self,
        writes: Vec<AtomicWrite>,
        timestamp: i64,
    ) -> Result<Vec<Result<()>>> {
        let outcomes = serialize_atomic_writes(
            self.serializer.as_ref(),
            &writes,
            timestamp,
            self.config.tag_mode,
        );

        let mut rows = Vec::new();
        for outcome in &outcomes {
            if let Ok(write_rows) = outcome {
                rows.extend(write_rows.iter().cloned());
            }
        }

        if !rows.is_empty() {
            let (done_tx, done_rx) = oneshot::channel();
            self.write_tx
                .try_send(WriteEntry {
                    rows,
                    done: done_tx,
                })
                .map_err(|e| match e {
                    TrySendError::Full(_) => Error::QueueFull,
                    TrySendError::Closed(_) => Error::QueueClosed,
                })?;
            done_rx.await.map_err(|_| Error::QueueClosed)??;
        }

        Ok(outcomes
            .into_iter()
            .map(|outcome| outcome.map(|_| ()))
            .collect())
    }

    /// Runs the delete protocol for `persistence_id` up to `to_seq`.
    pub async fn delete_messages_to(
        &self,
        persistence_id: PersistenceId,
        to_seq: SequenceNr,
    ) -> Result<()> {
        let config = self.config.clone();
        with_connection(self.factory.clone(), move |conn| {
            storage::delete_messages_to(conn, &persistence_id, to_seq, &config)
        })
        .await
    }

    /// Overwrites the stored payload of event `(persistence_id, seq)`.
    ///
    /// The event is re-serialized; tags are **not** rewritten. Failure to
    /// serialize, or a missing target row, surfaces as [`Error::Update`]
    /// naming the target.
    pub async fn update(
        &self,
        persistence_id: PersistenceId,
        sequence_number: SequenceNr,
        payload: Vec<u8>,
    ) -> Result<()> {
        let repr = PersistentRepr::new(persistence_id.clone(), sequence_number, payload);
        let row = serialize_single(self.serializer.as_ref(), &repr, 0, self.config.tag_mode)
            .map_err(|e| Error::Update {
                persistence_id: persistence_id.to_string(),
                sequence_number: sequence_number.as_raw(),
                reason: e.to_string(),
            })?;

        with_connection(self.factory.clone(), move |conn| {
            storage::update_message(conn, &row)
        })
        .await
    }

    /// Highest sequence number recorded under `persistence_id`, 0 when
    /// none. Honors `delete_compatibility_mode`.
    pub async fn highest_sequence_nr(
        &self,
        persistence_id: PersistenceId,
        from: SequenceNr,
    ) -> Result<SequenceNr> {
        let compat = self.config.delete_compatibility_mode;
        with_connection(self.factory.clone(), move |conn| {
            storage::highest_sequence_nr(conn, &persistence_id, from, compat)
        })
        .await
    }

    /// Read journal with the identity adapter (every event is one
    /// envelope).
    pub fn read_journal(&self) -> ReadJournal {
        self.read_journal_with_adapter(Arc::new(IdentityAdapter))
    }

    /// Read journal with a custom read-side adapter.
    pub fn read_journal_with_adapter(&self, adapter: Arc<dyn EventAdapter>) -> ReadJournal {
        ReadJournal {
            config: self.config.clone(),
            factory: self.factory.clone(),
            serializer: self.serializer.clone(),
            adapter,
        }
    }
}

// =============================================================================
// Read Journal
// =============================================================================

/// Factory for the journal's query streams.
///
/// Injects the shared configuration (refresh interval, page size, tag
/// layout, safety window) into every stream it creates. Streams are
/// pull-based: dropping one cancels its polling within the in-flight
/// round trip.
#[derive(Clone)]
pub struct ReadJournal {
    config: Arc<JournalConfig>,
    factory: Arc<ConnectionFactory>,
    serializer: Arc<dyn JournalSerializer>,
    adapter: Arc<dyn EventAdapter>,
}

impl ReadJournal {
    fn settings(&self) -> StreamSettings {
        StreamSettings {
            tag_mode: self.config.tag_mode,
            page_size: self.config.max_buffer_size,
            refresh_interval: self.config.refresh_interval,
            safety_window: self.config.ordering_safety_window,
        }
    }

    fn event_stream(&self, selection: Selection, mode: Mode, offset: Ordering) -> EventStream {
        EventStream::new(
            self.factory.clone(),
            self.serializer.clone(),
            self.adapter.clone(),
            self.settings(),
            selection,
            mode,
            offset,
        )
    }

    /// Ordered replay of `[from, to]` for one persistence id, at most
    /// `max` events. Soft-deleted rows are excluded.
    pub fn messages(
        &self,
        persistence_id: PersistenceId,
        from: SequenceNr,
        to: SequenceNr,
        max: u64,
    ) -> EventReplay {
        EventReplay::new(
            self.factory.clone(),
            self.serializer.clone(),
            persistence_id,
            from,
            to,
            max,
            self.config.max_buffer_size,
        )
    }

    /// Events carrying `tag`, starting after `offset`; terminates when
    /// caught up.
    pub fn current_events_by_tag(&self, tag: Tag, offset: Ordering) -> EventStream {
        self.event_stream(Selection::ByTag(tag), Mode::Current, offset)
    }

    /// Events carrying `tag`, starting after `offset`; polls forever.
    pub fn live_events_by_tag(&self, tag: Tag, offset: Ordering) -> EventStream {
        self.event_stream(Selection::ByTag(tag), Mode::Live, offset)
    }

    /// The whole log after `offset`; terminates when caught up.
    pub fn current_all_events(&self, offset: Ordering) -> EventStream {
        self.event_stream(Selection::All, Mode::Current, offset)
    }

    /// The whole log after `offset`; polls forever.
    pub fn live_all_events(&self, offset: Ordering) -> EventStream {
        self.event_stream(Selection::All, Mode::Live, offset)
    }

    /// All known persistence ids; terminates when caught up.
    pub fn current_persistence_ids(&self) -> PersistenceIdsStream {
        PersistenceIdsStream::new(
            self.factory.clone(),
            Mode::Current,
            self.config.max_buffer_size,
            self.config.refresh_interval,
        )
    }

    /// Persistence ids as they first appear; polls forever.
    pub fn live_persistence_ids(&self) -> PersistenceIdsStream {
        PersistenceIdsStream::new(
            self.factory.clone(),
            Mode::Live,
            self.config.max_buffer_size,
            self.config.refresh_interval,
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
