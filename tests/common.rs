//! Shared fixtures for the integration tests: temp-file databases, a
//! write-side tagging serializer, and a read-side adapter that suppresses
//! or duplicates events.

// Each test binary compiles its own copy; not every binary uses every
// fixture.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use quilldb::{
    BytesSerializer, Error, Event, EventAdapter, EventEnvelope, EventSequence, JournalConfig,
    JournalRow, JournalSerializer, PersistentRepr, Result, SequenceNr, SerializedEvent, Tag,
    TagMode,
};
use tempfile::TempDir;

/// Creates a temp directory holding a journal database file.
///
/// The directory must outlive the journal; return it alongside the path.
pub fn temp_db(name: &str) -> (TempDir, String) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir
        .path()
        .join(name)
        .to_str()
        .expect("utf-8 temp path")
        .to_string();
    (dir, path)
}

/// Journal config tuned for tests: fast polling, small safety window.
pub fn test_config(path: &str, tag_mode: TagMode) -> JournalConfig {
    init_tracing();
    let mut config = JournalConfig::new(path);
    config.tag_mode = tag_mode;
    config.refresh_interval = Duration::from_millis(25);
    config
}

/// Installs a subscriber honoring `RUST_LOG`; safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Words the tagging serializer looks for in utf-8 payloads.
const TAG_WORDS: &[&str] = &["green", "black", "blue", "apple", "banana"];

/// Write-side tagger: tags each event with every known word its payload
/// contains, on top of any caller-side tags.
#[derive(Debug, Default, Clone, Copy)]
pub struct ColorFruitTagger;

impl JournalSerializer for ColorFruitTagger {
    fn serialize(&self, repr: &PersistentRepr) -> Result<SerializedEvent> {
        let mut serialized = BytesSerializer.serialize(repr)?;
        if let Ok(text) = std::str::from_utf8(&repr.payload) {
            for word in TAG_WORDS {
                if text.contains(word) {
                    serialized.tags.insert(Tag::new(*word));
                }
            }
        }
        Ok(serialized)
    }

    fn deserialize(&self, row: &JournalRow) -> Result<Event> {
        BytesSerializer.deserialize(row)
    }
}

/// Serializer whose deserialize fails on rows whose payload starts with
/// `poison`. Used to check that per-row read errors do not kill streams.
#[derive(Debug, Default, Clone, Copy)]
pub struct PoisonDeserializer;

impl JournalSerializer for PoisonDeserializer {
    fn serialize(&self, repr: &PersistentRepr) -> Result<SerializedEvent> {
        BytesSerializer.serialize(repr)
    }

    fn deserialize(&self, row: &JournalRow) -> Result<Event> {
        if row.message.starts_with(b"poison") {
            return Err(Error::Deserialization {
                ordering: row.ordering.map(|o| o.as_raw()).unwrap_or(0),
                reason: "poisoned payload".to_string(),
            });
        }
        BytesSerializer.deserialize(row)
    }
}

/// Read-side adapter for the apple scenarios:
///
/// - payloads containing `invalid` vanish (zero envelopes),
/// - payloads containing `duplicated` split into `…-1` and `…-2`,
/// - everything else passes through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct AppleAdapter;

impl EventAdapter for AppleAdapter {
    fn adapt(&self, event: &Event) -> EventSequence {
        let text = String::from_utf8_lossy(&event.payload);
        if text.contains("invalid") {
            EventSequence::Empty
        } else if text.contains("duplicated") {
            EventSequence::Many(vec![
                format!("{text}-1").into_bytes(),
                format!("{text}-2").into_bytes(),
            ])
        } else {
            EventSequence::Single(event.payload.clone())
        }
    }
}

/// One-event atomic write.
pub fn single_write(pid: &str, seq: i64, payload: &str) -> quilldb::AtomicWrite {
    quilldb::AtomicWrite::single(PersistentRepr::new(
        pid,
        SequenceNr::from_raw(seq),
        payload.as_bytes().to_vec(),
    ))
}

/// Collapses an envelope into the `(pid, seq, payload)` triple the
/// scenario assertions compare.
pub fn triple(envelope: &EventEnvelope) -> (String, i64, String) {
    (
        envelope.persistence_id.as_str().to_string(),
        envelope.sequence_number.as_raw(),
        String::from_utf8_lossy(&envelope.event).to_string(),
    )
}

/// Serializer handle for journals opened with the tagger.
pub fn tagger() -> Arc<dyn JournalSerializer> {
    Arc::new(ColorFruitTagger)
}

/// Drains a current-mode event stream to completion.
pub async fn collect_current(stream: &mut quilldb::EventStream) -> Vec<EventEnvelope> {
    let mut envelopes = Vec::new();
    while let Some(item) = stream.next().await {
        envelopes.push(item.expect("stream item"));
    }
    envelopes
}
