//! # quilldb — a durable event-sourcing journal on SQLite
//!
//! quilldb stores an append-only log of events per persistence id with
//! atomic multi-event writes, tag-based secondary indexing, soft-delete
//! semantics with legacy-compatible bookkeeping, and streaming reads:
//! per-id replay, events-by-tag, and all-events, each in a terminating
//! *current* and a polling *live* variant.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Async API Layer                          │
//! │          (write_messages, delete, update, query streams)        │
//! └────────────┬───────────────────────────────────┬────────────────┘
//!              │                                   │
//!              ▼                                   ▼
//! ┌─────────────────────────┐        ┌───────────────────────────┐
//! │      Write Pipeline     │        │       Query Streams       │
//! │  bounded queue (drop-   │        │  pull-based pages, live   │
//! │  newest) → weight       │        │  polling with ordering-   │
//! │  batches → parallel     │        │  gap safety window        │
//! │  transactional flush    │        └─────────────┬─────────────┘
//! └────────────┬────────────┘                      │
//!              │         per-operation connections │
//!              ▼                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     SQLite (WAL, AUTOINCREMENT)                 │
//! │        journal_row · journal_tag_row · journal_metadata         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core invariants
//!
//! 1. **Atomic groups**: an [`AtomicWrite`]'s events become visible all at
//!    once or not at all, correlated by a shared write uuid.
//! 2. **Per-id monotonicity**: under a single writer per persistence id,
//!    sequence numbers are gap-free; the database enforces uniqueness.
//! 3. **Ordering never reused**: the global cursor is an `AUTOINCREMENT`
//!    column, so offsets stay valid across deletes.
//! 4. **Soft-delete before hard-delete**: the delete protocol always
//!    retains the high-watermark row (plus a metadata row in
//!    compatibility mode), so `highest_sequence_nr` survives deletion.
//! 5. **Opaque payloads**: the `message` bytes round-trip untouched;
//!    interpretation belongs to the [`serializer::JournalSerializer`].

/// Failure taxonomy: one error enum, a `Result` alias, and the rules for
/// how each variant propagates (per write, per row, per batch, per call).
pub mod error;

/// Domain newtypes and row shapes: persistence ids, sequence numbers, the
/// global ordering cursor, tags, write uuids, rows, and envelopes.
pub mod types;

/// Journal configuration: write pipeline sizing, tag layout, delete
/// compatibility, query polling, validated at open.
pub mod config;

/// DDL for the three journal tables and the per-operation connection
/// factory.
pub mod schema;

/// The serialization seam: serializer trait, row mapping with per-write
/// error isolation, CSV tag encoding, and read-side adapters.
pub mod serializer;

/// Sequential 128-bit write-uuid generator.
pub mod idgen;

/// Synchronous write-side SQL: batch insert with tag fan-out, update, the
/// delete protocol, highest-sequence-number queries.
pub mod storage;

/// Synchronous read-side SQL: replay pages, tag pages for both layouts,
/// all-events pages, persistence-id scans.
pub mod reader;

/// The asynchronous write pipeline: bounded queue, weight batching,
/// bounded-parallel transactional flushes.
pub mod writer;

/// Query streams: replay, events-by-tag, all-events, persistence ids —
/// current and live, with ordering-gap tolerance.
pub mod query;

/// The `Journal` / `ReadJournal` facade.
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::{Journal, ReadJournal};
pub use config::{JournalConfig, Provider, TagMode};
pub use error::{Error, Result};
pub use query::{EventReplay, EventStream, PersistenceIdsStream};
pub use serializer::{
    BytesSerializer, EventAdapter, IdentityAdapter, JournalSerializer, SerializedEvent,
};
pub use types::{
    AtomicWrite, Event, EventEnvelope, EventSequence, JournalRow, Ordering, PersistenceId,
    PersistentRepr, SequenceNr, Tag, WriteUuid,
};
