//! # Serialization Seam
//!
//! The journal never interprets payloads: a [`JournalSerializer`] maps
//! events to row bytes and back, and the journal preserves the `message`
//! column byte-for-byte. This module holds the trait, the pass-through
//! [`BytesSerializer`], the row-mapping stage that turns atomic writes
//! into journal rows, and the read-side [`EventAdapter`] fan-out.
//!
//! ## Error isolation
//!
//! `serialize_atomic_writes` returns one result per atomic write: a
//! failing write never aborts its siblings, and a failing event fails only
//! its own write. On the read side, deserialization errors are carried per
//! row inside the stream, which keeps flowing.

use std::collections::BTreeSet;

use crate::config::TagMode;
use crate::error::{Error, Result};
use crate::idgen::next_write_uuid;
use crate::types::{AtomicWrite, Event, EventSequence, JournalRow, Ordering, PersistentRepr, Tag};

/// Separator for the CSV tag layout. Persisted un-wrapped (`a;b;c`); tags
/// containing it are rejected at serialization time.
pub const TAG_SEPARATOR: char = ';';

// =============================================================================
// Serializer Trait
// =============================================================================

/// Output of serializing one event.
#[derive(Debug, Clone)]
pub struct SerializedEvent {
    /// Opaque payload bytes, stored verbatim in `message`.
    pub message: Vec<u8>,
    pub manifest: String,
    pub event_manifest: String,
    pub identifier: Option<i32>,
    /// Tags for this event. A serializer may extend the caller-side tags
    /// of the [`PersistentRepr`] (write-side tagging).
    pub tags: BTreeSet<Tag>,
}

/// Maps in-memory events to row payloads and back.
pub trait JournalSerializer: Send + Sync {
    fn serialize(&self, repr: &PersistentRepr) -> Result<SerializedEvent>;

    fn deserialize(&self, row: &JournalRow) -> Result<Event>;
}

/// Pass-through serializer: the payload bytes are the message bytes.
///
/// Tags are taken from the repr unchanged. This is the default serializer
/// of a journal; applications with typed events install their own.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesSerializer;

impl JournalSerializer for BytesSerializer {
    fn serialize(&self, repr: &PersistentRepr) -> Result<SerializedEvent> {
        Ok(SerializedEvent {
            message: repr.payload.clone(),
            manifest: repr.manifest.clone(),
            event_manifest: repr.event_manifest.clone(),
            identifier: None,
            tags: repr.tags.clone(),
        })
    }

    fn deserialize(&self, row: &JournalRow) -> Result<Event> {
        Ok(Event {
            ordering: row.ordering.unwrap_or(Ordering::ZERO),
            persistence_id: row.persistence_id.clone(),
            sequence_number: row.sequence_number,
            timestamp: row.timestamp,
            payload: row.message.clone(),
            manifest: row.manifest.clone(),
            event_manifest: row.event_manifest.clone(),
            tags: row
                .tags
                .as_deref()
                .map(decode_csv_tags)
                .unwrap_or_else(|| row.tag_set.clone()),
        })
    }
}

// =============================================================================
// Row Mapping
// =============================================================================

/// Serializes a batch of atomic writes into journal rows.
///
/// Each atomic write yields either its full list of rows (one per event,
/// sharing one fresh write uuid) or a per-write error; errors never abort
/// sibling writes. The result length always equals the input length.
pub fn serialize_atomic_writes(
    serializer: &dyn JournalSerializer,
    writes: &[AtomicWrite],
    timestamp: i64,
    tag_mode: TagMode,
) -> Vec<Result<Vec<JournalRow>>> {
    writes
        .iter()
        .map(|write| serialize_atomic_write(serializer, write, timestamp, tag_mode))
        .collect()
}

fn serialize_atomic_write(
    serializer: &dyn JournalSerializer,
    write: &AtomicWrite,
    timestamp: i64,
    tag_mode: TagMode,
) -> Result<Vec<JournalRow>> {
    let write_uuid = next_write_uuid();
    write
        .events()
        .iter()
        .map(|repr| {
            let serialized = serializer.serialize(repr).map_err(|e| Error::Serialization {
                persistence_id: repr.persistence_id.to_string(),
                sequence_number: repr.sequence_number.as_raw(),
                reason: e.to_string(),
            })?;
            build_row(repr, serialized, timestamp, tag_mode, write_uuid)
        })
        .collect()
}

/// Serializes one event for `update`. Fresh write uuid; never re-tags.
pub fn serialize_single(
    serializer: &dyn JournalSerializer,
    repr: &PersistentRepr,
    timestamp: i64,
    tag_mode: TagMode,
) -> Result<JournalRow> {
    let serialized = serializer.serialize(repr).map_err(|e| Error::Serialization {
        persistence_id: repr.persistence_id.to_string(),
        sequence_number: repr.sequence_number.as_raw(),
        reason: e.to_string(),
    })?;
    build_row(repr, serialized, timestamp, tag_mode, next_write_uuid())
}

fn build_row(
    repr: &PersistentRepr,
    serialized: SerializedEvent,
    timestamp: i64,
    tag_mode: TagMode,
    write_uuid: crate::types::WriteUuid,
) -> Result<JournalRow> {
    // Separator validation applies in both layouts so a deployment can be
    // migrated between them without rewriting tags.
    if let Some(bad) = serialized
        .tags
        .iter()
        .find(|t| t.as_str().contains(TAG_SEPARATOR))
    {
        return Err(Error::Serialization {
            persistence_id: repr.persistence_id.to_string(),
            sequence_number: repr.sequence_number.as_raw(),
            reason: format!("tag '{bad}' contains the separator '{TAG_SEPARATOR}'"),
        });
    }

    let (tags, tag_set) = match tag_mode {
        TagMode::Csv => {
            let csv = if serialized.tags.is_empty() {
                None
            } else {
                Some(encode_csv_tags(&serialized.tags))
            };
            (csv, BTreeSet::new())
        }
        TagMode::TagTable => (None, serialized.tags),
    };

    Ok(JournalRow {
        ordering: None,
        persistence_id: repr.persistence_id.clone(),
        sequence_number: repr.sequence_number,
        deleted: false,
        timestamp,
        message: serialized.message,
        manifest: serialized.manifest,
        event_manifest: serialized.event_manifest,
        identifier: serialized.identifier,
        tags,
        tag_set,
        write_uuid,
    })
}

/// Joins tags with the CSV separator.
pub fn encode_csv_tags(tags: &BTreeSet<Tag>) -> String {
    tags.iter()
        .map(Tag::as_str)
        .collect::<Vec<_>>()
        .join(&TAG_SEPARATOR.to_string())
}

/// Splits a persisted CSV tag column into a tag set, dropping empties.
pub fn decode_csv_tags(csv: &str) -> BTreeSet<Tag> {
    csv.split(TAG_SEPARATOR)
        .filter(|s| !s.is_empty())
        .map(Tag::new)
        .collect()
}

// =============================================================================
// Read-side Adapters
// =============================================================================

/// Expands one journal event into 0..N query payloads.
///
/// Applied by `ReadJournal` query streams only, never by replay. The
/// stream engine never confuses a zero-envelope row with "no rows remain",
/// and page size bounds rows fetched, not envelopes emitted.
pub trait EventAdapter: Send + Sync {
    fn adapt(&self, event: &Event) -> EventSequence;
}

/// Emits every event unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityAdapter;

impl EventAdapter for IdentityAdapter {
    fn adapt(&self, event: &Event) -> EventSequence {
        EventSequence::Single(event.payload.clone())
    }
}

// =============================================================================
// Tests
// =============================================================================
