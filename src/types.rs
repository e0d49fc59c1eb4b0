//! # Domain Types for the Journal
//!
//! Core types for the journal data model: persistence ids, sequence
//! numbers, the global ordering cursor, tags, write identifiers, and the
//! row shapes that cross the storage boundary.
//!
//! ## Newtypes
//!
//! Every identifier is a newtype over its primitive representation. A
//! `SequenceNr` cannot be passed where an `Ordering` is expected, even
//! though both are `i64` on disk. Each newtype exposes `from_raw`/`as_raw`
//! for the storage layer and nothing else that would let the two be mixed.
//!
//! ## The two counters
//!
//! - [`SequenceNr`]: position **within** one persistence id. Starts at 1,
//!   gap-free under a single writer.
//! - [`Ordering`]: database-assigned position in the **global** log,
//!   unique across the table, never reused. This is the read cursor for
//!   tag and all-events queries.

use std::collections::BTreeSet;
use std::fmt;

// =============================================================================
// Persistence Id
// =============================================================================

/// The partitioning key selecting one entity's event log.
///
/// Non-empty by construction; the journal never stores a row without one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PersistenceId(String);

impl PersistenceId {
    /// Creates a persistence id.
    ///
    /// # Panics
    ///
    /// Panics if `id` is empty.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        assert!(!id.is_empty(), "persistence id must be non-empty");
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PersistenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PersistenceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PersistenceId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

// =============================================================================
// Sequence Number
// =============================================================================

/// A position within a single persistence id's log.
///
/// Starts at 1 for the first event. `ZERO` is the sentinel for "no events"
/// and the neutral `from` bound in range queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SequenceNr(i64);

impl SequenceNr {
    /// Sentinel: no events / unbounded lower end.
    pub const ZERO: SequenceNr = SequenceNr(0);

    /// The first sequence number of a log.
    pub const FIRST: SequenceNr = SequenceNr(1);

    /// Upper bound used for "replay everything" requests.
    pub const MAX: SequenceNr = SequenceNr(i64::MAX);

    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> i64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for SequenceNr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Global Ordering
// =============================================================================

/// The database-assigned identity of an event row in the global log.
///
/// Assigned on insert commit (`AUTOINCREMENT`), unique and never reused.
/// Query offsets are expressed as the last consumed `Ordering`, so `ZERO`
/// means "from the beginning".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ordering(i64);

impl Ordering {
    /// Cursor sentinel: nothing consumed yet.
    pub const ZERO: Ordering = Ordering(0);

    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Ordering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Tags
// =============================================================================

/// A label attached to an event for secondary queries.
///
/// Tags are free-form strings with one restriction enforced at write time:
/// they must not contain the CSV layout separator (`;`), because the CSV
/// layout persists the tag set as a single separated column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(String);

impl Tag {
    /// Creates a tag.
    ///
    /// # Panics
    ///
    /// Panics if `value` is empty. Separator validation happens at
    /// serialization time, where it can fail the owning write instead of
    /// the calling thread.
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        assert!(!value.is_empty(), "tag must be non-empty");
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Tag {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// =============================================================================
// Write Uuid
// =============================================================================

/// 128-bit identifier correlating rows written by one atomic group.
///
/// Minted by [`crate::idgen::next_write_uuid`]: a random base whose low
/// 8 bytes carry a process-global counter, so two ids minted on the same
/// host compare by insertion order under byte-wise collation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteUuid([u8; 16]);

impl WriteUuid {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for WriteUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

// =============================================================================
// Rows
// =============================================================================

/// One persisted event: the in-memory image of a `journal_row` record.
///
/// `ordering` is `None` until the database assigns it on insert. `tags`
/// (the CSV column) and `tag_set` (the normalized set) are layout-specific:
/// exactly one of them is populated per deployment, never both.
#[derive(Debug, Clone)]
pub struct JournalRow {
    /// Database-assigned global position; `None` before insert.
    pub ordering: Option<Ordering>,
    pub persistence_id: PersistenceId,
    pub sequence_number: SequenceNr,
    /// Soft-delete flag. Deleted rows are excluded from replay but kept
    /// until the delete protocol removes them.
    pub deleted: bool,
    /// Caller-supplied wall time; may be 0.
    pub timestamp: i64,
    /// Opaque serialized payload. Preserved byte-for-byte.
    pub message: Vec<u8>,
    pub manifest: String,
    pub event_manifest: String,
    pub identifier: Option<i32>,
    /// CSV layout only: separator-joined tag values as persisted.
    pub tags: Option<String>,
    /// Tag-table layout only: the logical tag set. Not a column of
    /// `journal_row`; fanned out into `journal_tag_row` on insert.
    pub tag_set: BTreeSet<Tag>,
    pub write_uuid: WriteUuid,
}

impl JournalRow {
    /// Whether this row carries tags that need tag-table fan-out.
    pub fn has_tags(&self) -> bool {
        !self.tag_set.is_empty()
    }
}

/// One `journal_tag_row` record (tag-table layout only).
///
/// `persistence_id` and `sequence_number` are denormalized from the event
/// row so tag cleanup during the delete protocol never needs a join back.
#[derive(Debug, Clone)]
pub struct TagRow {
    pub ordering_id: Ordering,
    pub tag_value: Tag,
    pub persistence_id: PersistenceId,
    pub sequence_number: SequenceNr,
    pub write_uuid: WriteUuid,
}

/// One `journal_metadata` record (compatibility mode only).
///
/// Records the historical maximum sequence number under a persistence id
/// so it survives hard-delete of the event rows themselves.
#[derive(Debug, Clone)]
pub struct MetadataRow {
    pub persistence_id: PersistenceId,
    pub sequence_number: SequenceNr,
}

// =============================================================================
// Write-side Representations
// =============================================================================

/// An event as handed to the journal for persistence.
///
/// The payload is opaque bytes; manifests are serializer hints carried
/// alongside it. `tags` are caller-side tags — a serializer may add its
/// own on top (write-side tagging).
#[derive(Debug, Clone)]
pub struct PersistentRepr {
    pub persistence_id: PersistenceId,
    pub sequence_number: SequenceNr,
    pub payload: Vec<u8>,
    pub manifest: String,
    pub event_manifest: String,
    pub tags: BTreeSet<Tag>,
}

impl PersistentRepr {
    pub fn new(
        persistence_id: impl Into<PersistenceId>,
        sequence_number: SequenceNr,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            persistence_id: persistence_id.into(),
            sequence_number,
            payload: payload.into(),
            manifest: String::new(),
            event_manifest: String::new(),
            tags: BTreeSet::new(),
        }
    }

    pub fn with_manifest(mut self, manifest: impl Into<String>) -> Self {
        self.manifest = manifest.into();
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = Tag>) -> Self {
        self.tags = tags.into_iter().collect();
        self
    }
}

/// A group of events persisted in one transaction, sharing a write uuid.
///
/// All events must target the same persistence id; the group becomes
/// visible to readers atomically or not at all.
#[derive(Debug, Clone)]
pub struct AtomicWrite {
    events: Vec<PersistentRepr>,
}

impl AtomicWrite {
    /// Creates an atomic write.
    ///
    /// # Panics
    ///
    /// Panics if `events` is empty or the events span persistence ids.
    pub fn new(events: Vec<PersistentRepr>) -> Self {
        assert!(!events.is_empty(), "atomic write must contain at least one event");
        let pid = &events[0].persistence_id;
        assert!(
            events.iter().all(|e| &e.persistence_id == pid),
            "atomic write must target a single persistence id"
        );
        Self { events }
    }

    /// Convenience for the common single-event group.
    pub fn single(event: PersistentRepr) -> Self {
        Self::new(vec![event])
    }

    pub fn persistence_id(&self) -> &PersistenceId {
        &self.events[0].persistence_id
    }

    pub fn events(&self) -> &[PersistentRepr] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}

// =============================================================================
// Read-side Representations
// =============================================================================

/// A deserialized event as read back from the journal.
#[derive(Debug, Clone)]
pub struct Event {
    pub ordering: Ordering,
    pub persistence_id: PersistenceId,
    pub sequence_number: SequenceNr,
    pub timestamp: i64,
    pub payload: Vec<u8>,
    pub manifest: String,
    pub event_manifest: String,
    pub tags: BTreeSet<Tag>,
}

/// What tag and all-events query streams emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Global read cursor; pass back as the offset to resume after this
    /// envelope.
    pub ordering: Ordering,
    pub persistence_id: PersistenceId,
    pub sequence_number: SequenceNr,
    pub event: Vec<u8>,
    pub timestamp: i64,
}

/// Adapter fan-out for one journal row.
///
/// A read-side adapter may suppress a row, pass it through, or expand it
/// into several payloads. Envelope identity (ordering, persistence id,
/// sequence number, timestamp) always comes from the row; only payloads
/// multiply.
#[derive(Debug, Clone)]
pub enum EventSequence {
    /// Row yields no envelopes. The query cursor still advances past it.
    Empty,
    Single(Vec<u8>),
    Many(Vec<Vec<u8>>),
}

impl EventSequence {
    /// Number of envelopes this sequence produces.
    pub fn len(&self) -> usize {
        match self {
            EventSequence::Empty => 0,
            EventSequence::Single(_) => 1,
            EventSequence::Many(payloads) => payloads.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_payloads(self) -> Vec<Vec<u8>> {
        match self {
            EventSequence::Empty => Vec::new(),
            EventSequence::Single(p) => vec![p],
            EventSequence::Many(ps) => ps,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
