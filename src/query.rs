//! # Query Streams
//!
//! The pull-based streams behind the read journal: per-id replay,
//! events-by-tag and all-events (current and live), and persistence ids.
//! Every stream is driven by calling `next().await`; nothing runs in the
//! background, so dropping a stream cancels it outright — there is no
//! polling loop left behind, only at most the one in-flight round trip.
//!
//! ## Current vs live
//!
//! A *current* stream captures `MAX(ordering)` at its first poll and
//! terminates once its cursor reaches that horizon. A *live* stream never
//! terminates: when caught up it sleeps one `refresh_interval` and polls
//! again.
//!
//! ## Ordering-gap tolerance (live mode)
//!
//! `ordering` is assigned inside the insert transaction but becomes
//! visible at commit, so a transaction that started earlier can surface a
//! *smaller* ordering *later*. A live poll therefore emits only up to
//! `MAX(ordering) - safety_window` while the max is still advancing; once
//! a poll observes the max unchanged, the window is released and the head
//! rows are emitted. A late commit inside the window is picked up within
//! one refresh interval; nothing is skipped.
//!
//! ## Cursor discipline
//!
//! The cursor advances by **database ordering**, never by envelope count.
//! A full page whose rows all post-filter away (CSV substring false
//! positives) or adapt to zero envelopes still moves the cursor to the
//! highest ordering the page touched, so the stream always progresses and
//! a current stream always terminates.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::reader;
use crate::schema::ConnectionFactory;
use crate::serializer::{EventAdapter, JournalSerializer};
use crate::types::{
    Event, EventEnvelope, JournalRow, Ordering, PersistenceId, SequenceNr, Tag,
};

// =============================================================================
// Shared Plumbing
// =============================================================================

/// Runs one database round trip on the blocking pool with a
/// per-operation connection.
pub(crate) async fn with_connection<T, F>(factory: Arc<ConnectionFactory>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let conn = factory.connect()?;
        f(&conn)
    })
    .await
    .map_err(|e| Error::TaskFailed(e.to_string()))?
}

fn deserialization_error(row: &JournalRow, cause: Error) -> Error {
    match cause {
        already @ Error::Deserialization { .. } => already,
        other => Error::Deserialization {
            ordering: row.ordering.map(|o| o.as_raw()).unwrap_or(0),
            reason: other.to_string(),
        },
    }
}

// =============================================================================
// Replay
// =============================================================================

/// Ordered, bounded replay of one persistence id.
///
/// Emits `Ok(Event)` per live row and `Err` for rows that fail to
/// deserialize; per-row errors never terminate the stream. Pages are
/// materialized greedily, one bounded page per round trip.
pub struct EventReplay {
    factory: Arc<ConnectionFactory>,
    serializer: Arc<dyn JournalSerializer>,
    persistence_id: PersistenceId,
    next_seq: SequenceNr,
    to: SequenceNr,
    remaining: u64,
    page_size: usize,
    buffer: VecDeque<Result<Event>>,
    done: bool,
}

impl EventReplay {
    pub(crate) fn new(
        factory: Arc<ConnectionFactory>,
        serializer: Arc<dyn JournalSerializer>,
        persistence_id: PersistenceId,
        from: SequenceNr,
        to: SequenceNr,
        max: u64,
        page_size: usize,
    ) -> Self {
        Self {
            factory,
            serializer,
            persistence_id,
            next_seq: from,
            to,
            remaining: max,
            page_size,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    /// Next replayed event, or `None` when the range is exhausted.
    pub async fn next(&mut self) -> Option<Result<Event>> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(item);
            }
            if self.done {
                return None;
            }
            if self.remaining == 0 || self.next_seq > self.to {
                self.done = true;
                return None;
            }

            let limit = (self.page_size as u64).min(self.remaining) as usize;
            let factory = self.factory.clone();
            let pid = self.persistence_id.clone();
            let (from, to) = (self.next_seq, self.to);
            let fetched = with_connection(factory, move |conn| {
                reader::replay_page(conn, &pid, from, to, limit)
            })
            .await;

            let rows = match fetched {
                Ok(rows) => rows,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            if rows.is_empty() {
                self.done = true;
                return None;
            }

            self.remaining -= rows.len() as u64;
            if rows.len() < limit {
                // Live rows in the range are exhausted.
                self.done = true;
            }
            if let Some(last) = rows.last() {
                self.next_seq = last.sequence_number.next();
            }

            for row in &rows {
                let item = self
                    .serializer
                    .deserialize(row)
                    .map_err(|e| deserialization_error(row, e));
                self.buffer.push_back(item);
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Event>> + Send {
        futures::stream::unfold(self, |mut replay| async move {
            replay.next().await.map(|item| (item, replay))
        })
    }
}

// =============================================================================
// Event Streams (by tag / all events)
// =============================================================================

/// What an [`EventStream`] selects from the global log.
#[derive(Debug, Clone)]
pub enum Selection {
    All,
    ByTag(Tag),
}

/// Whether the stream terminates at the catch-up horizon or polls forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Current,
    Live,
}

/// Knobs shared by every event stream, snapshot from the journal config.
#[derive(Debug, Clone)]
pub(crate) struct StreamSettings {
    pub tag_mode: crate::config::TagMode,
    pub page_size: usize,
    pub refresh_interval: Duration,
    pub safety_window: i64,
}

/// Ordered envelope stream over the global log, current or live.
pub struct EventStream {
    factory: Arc<ConnectionFactory>,
    serializer: Arc<dyn JournalSerializer>,
    adapter: Arc<dyn EventAdapter>,
    settings: StreamSettings,
    selection: Selection,
    mode: Mode,
    /// Last ordering consumed (exclusive lower bound of the next fetch).
    offset: Ordering,
    /// Current-mode termination bound, captured at the first poll.
    horizon: Option<Ordering>,
    /// Live mode: `MAX(ordering)` seen by the previous poll; when a poll
    /// sees the same value again the safety window is released.
    prev_poll_max: Ordering,
    buffer: VecDeque<Result<EventEnvelope>>,
    done: bool,
}

impl EventStream {
    pub(crate) fn new(
        factory: Arc<ConnectionFactory>,
        serializer: Arc<dyn JournalSerializer>,
        adapter: Arc<dyn EventAdapter>,
        settings: StreamSettings,
        selection: Selection,
        mode: Mode,
        offset: Ordering,
    ) -> Self {
        Self {
            factory,
            serializer,
            adapter,
            settings,
            selection,
            mode,
            offset,
            horizon: None,
            prev_poll_max: Ordering::ZERO,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    /// Next envelope. `None` only in current mode, once caught up.
    pub async fn next(&mut self) -> Option<Result<EventEnvelope>> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(item);
            }
            if self.done {
                return None;
            }

            let max_in_db = match self.fetch_max_ordering().await {
                Ok(max) => max,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            let horizon = match self.mode {
                Mode::Current => *self.horizon.get_or_insert(max_in_db),
                Mode::Live => {
                    let released = max_in_db == self.prev_poll_max;
                    self.prev_poll_max = max_in_db;
                    if released {
                        max_in_db
                    } else {
                        Ordering::from_raw(
                            (max_in_db.as_raw() - self.settings.safety_window).max(0),
                        )
                    }
                }
            };

            if horizon <= self.offset {
                match self.mode {
                    Mode::Current => {
                        self.done = true;
                        return None;
                    }
                    Mode::Live => {
                        tokio::time::sleep(self.settings.refresh_interval).await;
                        continue;
                    }
                }
            }

            let page = match self.fetch_page(horizon).await {
                Ok(page) => page,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            // Advance by database offset: a short page exhausted the
            // range, a full page stops at the highest row it touched.
            if page.fetched < self.settings.page_size {
                self.offset = horizon;
            } else if let Some(highest) = page.highest_fetched {
                self.offset = highest;
            }

            tracing::trace!(
                fetched = page.fetched,
                surviving = page.rows.len(),
                offset = %self.offset,
                "event stream page"
            );

            for row in &page.rows {
                match self.serializer.deserialize(row) {
                    Ok(event) => {
                        for payload in self.adapter.adapt(&event).into_payloads() {
                            self.buffer.push_back(Ok(EventEnvelope {
                                ordering: event.ordering,
                                persistence_id: event.persistence_id.clone(),
                                sequence_number: event.sequence_number,
                                event: payload,
                                timestamp: event.timestamp,
                            }));
                        }
                    }
                    Err(e) => {
                        self.buffer
                            .push_back(Err(deserialization_error(row, e)));
                    }
                }
            }
            // Zero surviving envelopes is not "no rows remain": loop and
            // fetch the next page from the advanced offset.
        }
    }

    async fn fetch_max_ordering(&self) -> Result<Ordering> {
        with_connection(self.factory.clone(), reader::max_ordering).await
    }

    async fn fetch_page(&self, horizon: Ordering) -> Result<reader::Page> {
        let factory = self.factory.clone();
        let selection = self.selection.clone();
        let tag_mode = self.settings.tag_mode;
        let after = self.offset;
        let limit = self.settings.page_size;
        with_connection(factory, move |conn| match selection {
            Selection::All => reader::all_events_page(conn, after, horizon, limit),
            Selection::ByTag(tag) => {
                reader::events_by_tag_page(conn, tag_mode, &tag, after, horizon, limit)
            }
        })
        .await
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<EventEnvelope>> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|item| (item, stream))
        })
    }
}

// =============================================================================
// Persistence Ids
// =============================================================================

/// Stream of known persistence ids.
///
/// Current mode pages alphabetically and terminates. Live mode follows the
/// global log cursor and emits each id the first time it appears, forever.
pub struct PersistenceIdsStream {
    factory: Arc<ConnectionFactory>,
    mode: Mode,
    page_size: usize,
    refresh_interval: Duration,
    /// Current mode: alphabetical cursor.
    after: Option<String>,
    /// Live mode: global log cursor and the ids already emitted.
    cursor: Ordering,
    seen: HashSet<String>,
    buffer: VecDeque<PersistenceId>,
    done: bool,
}

impl PersistenceIdsStream {
    pub(crate) fn new(
        factory: Arc<ConnectionFactory>,
        mode: Mode,
        page_size: usize,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            factory,
            mode,
            page_size,
            refresh_interval,
            after: None,
            cursor: Ordering::ZERO,
            seen: HashSet::new(),
            buffer: VecDeque::new(),
            done: false,
        }
    }

    pub async fn next(&mut self) -> Option<Result<PersistenceId>> {
        loop {
            if let Some(id) = self.buffer.pop_front() {
                return Some(Ok(id));
            }
            if self.done {
                return None;
            }

            match self.mode {
                Mode::Current => {
                    let factory = self.factory.clone();
                    let after = self.after.clone();
                    let limit = self.page_size;
                    let ids = match with_connection(factory, move |conn| {
                        reader::persistence_ids_page(conn, after.as_deref(), limit)
                    })
                    .await
                    {
                        Ok(ids) => ids,
                        Err(e) => {
                            self.done = true;
                            return Some(Err(e));
                        }
                    };

                    if ids.len() < self.page_size {
                        self.done = true;
                    }
                    if ids.is_empty() {
                        return None;
                    }
                    self.after = ids.last().map(|p| p.as_str().to_string());
                    self.buffer.extend(ids);
                }
                Mode::Live => {
                    let factory = self.factory.clone();
                    let cursor = self.cursor;
                    let scan = with_connection(factory, move |conn| {
                        let max = reader::max_ordering(conn)?;
                        if max <= cursor {
                            return Ok((max, Vec::new()));
                        }
                        let ids = reader::persistence_ids_in_range(conn, cursor, max)?;
                        Ok((max, ids))
                    })
                    .await;

                    let (max, ids) = match scan {
                        Ok(scan) => scan,
                        Err(e) => {
                            self.done = true;
                            return Some(Err(e));
                        }
                    };

                    self.cursor = self.cursor.max(max);
                    let mut emitted = false;
                    for id in ids {
                        if self.seen.insert(id.as_str().to_string()) {
                            self.buffer.push_back(id);
                            emitted = true;
                        }
                    }
                    if !emitted {
                        tokio::time::sleep(self.refresh_interval).await;
                    }
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<PersistenceId>> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|item| (item, stream))
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
