//! # Read-side Storage Operations
//!
//! Synchronous SQL for the query half of the journal: replay pages, tag
//! pages in both layouts, all-events pages, the global ordering maximum,
//! and persistence-id scans. The async stream drivers in [`crate::query`]
//! call these from blocking tasks, one page per round trip.
//!
//! ## Pages, not streams
//!
//! Every fetch here materializes one bounded page into memory — the
//! drivers trade memory for a consistent snapshot per round trip. A
//! [`Page`] reports the highest ordering the SQL actually touched next to
//! the surviving rows, because the two can differ (CSV post-filtering) and
//! the cursor must advance by database offset either way.

use rusqlite::{params, Connection};

use crate::config::TagMode;
use crate::error::Result;
use crate::serializer::TAG_SEPARATOR;
use crate::types::{JournalRow, Ordering, PersistenceId, SequenceNr, Tag, WriteUuid};

/// Columns selected for full row reads, in [`journal_row_from_sql`] order.
const ROW_COLUMNS: &str = "ordering, persistence_id, sequence_number, deleted, timestamp, \
     message, manifest, event_manifest, identifier, tags, write_uuid";

/// One fetched page of event rows.
#[derive(Debug)]
pub struct Page {
    /// Rows surviving any in-memory post-filter, in ordering order.
    pub rows: Vec<JournalRow>,
    /// Highest ordering the fetch touched, including post-filtered rows.
    /// `None` when the fetch touched nothing.
    pub highest_fetched: Option<Ordering>,
    /// Rows the SQL fetched before post-filtering; compare against the
    /// requested limit to detect an exhausted range.
    pub fetched: usize,
}

// =============================================================================
// Row Mapping
// =============================================================================

fn journal_row_from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<JournalRow> {
    let uuid_blob: Vec<u8> = row.get(10)?;
    let uuid_bytes: [u8; 16] = uuid_blob.as_slice().try_into().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            10,
            rusqlite::types::Type::Blob,
            "write_uuid must be 16 bytes".into(),
        )
    })?;

    Ok(JournalRow {
        ordering: Some(Ordering::from_raw(row.get(0)?)),
        persistence_id: PersistenceId::new(row.get::<_, String>(1)?),
        sequence_number: SequenceNr::from_raw(row.get(2)?),
        deleted: row.get::<_, i64>(3)? != 0,
        timestamp: row.get(4)?,
        message: row.get(5)?,
        manifest: row.get(6)?,
        event_manifest: row.get(7)?,
        identifier: row.get(8)?,
        tags: row.get(9)?,
        tag_set: Default::default(),
        write_uuid: WriteUuid::from_bytes(uuid_bytes),
    })
}

// =============================================================================
// Replay
// =============================================================================

/// One page of a per-id replay: live rows in `[from, to]`, sequence order.
pub fn replay_page(
    conn: &Connection,
    persistence_id: &PersistenceId,
    from: SequenceNr,
    to: SequenceNr,
    limit: usize,
) -> Result<Vec<JournalRow>> {
    let sql = format!(
        "SELECT {ROW_COLUMNS} FROM journal_row
         WHERE persistence_id = ? AND sequence_number >= ? AND sequence_number <= ?
           AND deleted = 0
         ORDER BY sequence_number
         LIMIT ?"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map(
            params![
                persistence_id.as_str(),
                from.as_raw(),
                to.as_raw(),
                limit as i64
            ],
            journal_row_from_sql,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// =============================================================================
// Global Ordering
// =============================================================================

/// Highest assigned ordering, or `Ordering::ZERO` on an empty journal.
pub fn max_ordering(conn: &Connection) -> Result<Ordering> {
    let max: Option<i64> =
        conn.query_row("SELECT MAX(ordering) FROM journal_row", [], |row| row.get(0))?;
    Ok(Ordering::from_raw(max.unwrap_or(0)))
}

// =============================================================================
// Events by Tag
// =============================================================================

/// One page of tagged live rows with `after < ordering <= horizon`.
pub fn events_by_tag_page(
    conn: &Connection,
    tag_mode: TagMode,
    tag: &Tag,
    after: Ordering,
    horizon: Ordering,
    limit: usize,
) -> Result<Page> {
    match tag_mode {
        TagMode::Csv => events_by_tag_page_csv(conn, tag, after, horizon, limit),
        TagMode::TagTable => events_by_tag_page_tag_table(conn, tag, after, horizon, limit),
    }
}

/// CSV layout: SQL substring match, then an exact in-memory check.
///
/// The `LIKE` mirrors the historical substring test over the separated
/// column, so it can surface `bluebird` for `blue`; the post-filter
/// compares separated values and drops those false positives. The page's
/// `highest_fetched` still reflects every row the `LIKE` touched so the
/// cursor keeps moving over dropped rows.
fn events_by_tag_page_csv(
    conn: &Connection,
    tag: &Tag,
    after: Ordering,
    horizon: Ordering,
    limit: usize,
) -> Result<Page> {
    let sql = format!(
        "SELECT {ROW_COLUMNS} FROM journal_row
         WHERE deleted = 0 AND tags LIKE '%' || ? || '%'
           AND ordering > ? AND ordering <= ?
         ORDER BY ordering
         LIMIT ?"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let fetched_rows = stmt
        .query_map(
            params![tag.as_str(), after.as_raw(), horizon.as_raw(), limit as i64],
            journal_row_from_sql,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let fetched = fetched_rows.len();
    let highest_fetched = fetched_rows.last().and_then(|r| r.ordering);
    let rows = fetched_rows
        .into_iter()
        .filter(|row| {
            row.tags
                .as_deref()
                .map(|csv| csv.split(TAG_SEPARATOR).any(|t| t == tag.as_str()))
                .unwrap_or(false)
        })
        .collect();

    Ok(Page {
        rows,
        highest_fetched,
        fetched,
    })
}

/// Tag-table layout: join on the assigned ordering.
fn events_by_tag_page_tag_table(
    conn: &Connection,
    tag: &Tag,
    after: Ordering,
    horizon: Ordering,
    limit: usize,
) -> Result<Page> {
    let sql = format!(
        "SELECT j.ordering, j.persistence_id, j.sequence_number, j.deleted, j.timestamp, \
                j.message, j.manifest, j.event_manifest, j.identifier, j.tags, j.write_uuid
         FROM journal_row j
         JOIN journal_tag_row t ON t.ordering_id = j.ordering
         WHERE t.tag_value = ? AND j.deleted = 0
           AND j.ordering > ? AND j.ordering <= ?
         ORDER BY j.ordering
         LIMIT ?"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map(
            params![tag.as_str(), after.as_raw(), horizon.as_raw(), limit as i64],
            journal_row_from_sql,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Page {
        fetched: rows.len(),
        highest_fetched: rows.last().and_then(|r| r.ordering),
        rows,
    })
}

// =============================================================================
// All Events
// =============================================================================

/// One page of the global log with `after < ordering <= horizon`.
pub fn all_events_page(
    conn: &Connection,
    after: Ordering,
    horizon: Ordering,
    limit: usize,
) -> Result<Page> {
    let sql = format!(
        "SELECT {ROW_COLUMNS} FROM journal_row
         WHERE deleted = 0 AND ordering > ? AND ordering <= ?
         ORDER BY ordering
         LIMIT ?"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map(
            params![after.as_raw(), horizon.as_raw(), limit as i64],
            journal_row_from_sql,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Page {
        fetched: rows.len(),
        highest_fetched: rows.last().and_then(|r| r.ordering),
        rows,
    })
}

// =============================================================================
// Persistence Ids
// =============================================================================

/// One alphabetical page of known persistence ids, strictly after `after`.
pub fn persistence_ids_page(
    conn: &Connection,
    after: Option<&str>,
    limit: usize,
) -> Result<Vec<PersistenceId>> {
    let mut stmt = conn.prepare_cached(
        "SELECT DISTINCT persistence_id FROM journal_row
         WHERE persistence_id > ?
         ORDER BY persistence_id
         LIMIT ?",
    )?;
    let ids = stmt
        .query_map(params![after.unwrap_or(""), limit as i64], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids.into_iter().map(PersistenceId::new).collect())
}

/// Distinct persistence ids among rows with `after < ordering <= to`.
///
/// Used by the live persistence-ids stream, which dedups against its own
/// seen set; the bounded ordering range keeps the scan incremental.
pub fn persistence_ids_in_range(
    conn: &Connection,
    after: Ordering,
    to: Ordering,
) -> Result<Vec<PersistenceId>> {
    let mut stmt = conn.prepare_cached(
        "SELECT DISTINCT persistence_id FROM journal_row
         WHERE ordering > ? AND ordering <= ?
         ORDER BY persistence_id",
    )?;
    let ids = stmt
        .query_map(params![after.as_raw(), to.as_raw()], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids.into_iter().map(PersistenceId::new).collect())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JournalConfig;
    use crate::schema::ConnectionFactory;
    use crate::serializer::{serialize_atomic_writes, BytesSerializer};
    use crate::storage::{delete_messages_to, insert_batch};
    use crate::types::{AtomicWrite, PersistentRepr};

    fn setup(tag_mode: TagMode) -> (JournalConfig, ConnectionFactory, Connection) {
        let mut config = JournalConfig::new(":memory:");
        config.tag_mode = tag_mode;
        let factory = ConnectionFactory::new(&config).unwrap();
        factory.initialize_schema().unwrap();
        let conn = factory.connect().unwrap();
        (config, factory, conn)
    }

    fn write(
        conn: &Connection,
        config: &JournalConfig,
        pid: &str,
        fixtures: &[(i64, &str, &[&str])],
    ) {
        let events = fixtures
            .iter()
            .map(|(seq, payload, tags)| {
                PersistentRepr::new(pid, SequenceNr::from_raw(*seq), payload.as_bytes().to_vec())
                    .with_tags(tags.iter().map(|t| Tag::new(*t)))
            })
            .collect();
        let rows = serialize_atomic_writes(
            &BytesSerializer,
            &[AtomicWrite::new(events)],
            0,
            config.tag_mode,
        )
        .remove(0)
        .unwrap();
        insert_batch(conn, &rows, config).unwrap();
    }

    #[test]
    fn replay_respects_range_limit_and_deleted() {
        let (config, _f, conn) = setup(TagMode::TagTable);
        write(
            &conn,
            &config,
            "a",
            &[(1, "e1", &[]), (2, "e2", &[]), (3, "e3", &[]), (4, "e4", &[]), (5, "e5", &[])],
        );

        delete_messages_to(&conn, &PersistenceId::new("a"), SequenceNr::from_raw(2), &config)
            .unwrap();

        let pid = PersistenceId::new("a");
        let rows =
            replay_page(&conn, &pid, SequenceNr::FIRST, SequenceNr::MAX, 100).unwrap();
        let seqs: Vec<i64> = rows.iter().map(|r| r.sequence_number.as_raw()).collect();
        assert_eq!(seqs, vec![3, 4, 5]);

        let limited =
            replay_page(&conn, &pid, SequenceNr::FIRST, SequenceNr::MAX, 2).unwrap();
        assert_eq!(limited.len(), 2);

        let bounded = replay_page(
            &conn,
            &pid,
            SequenceNr::from_raw(4),
            SequenceNr::from_raw(4),
            100,
        )
        .unwrap();
        assert_eq!(bounded.len(), 1);
        assert_eq!(bounded[0].sequence_number.as_raw(), 4);
    }

    #[test]
    fn max_ordering_on_empty_journal_is_zero() {
        let (_config, _f, conn) = setup(TagMode::TagTable);
        assert_eq!(max_ordering(&conn).unwrap(), Ordering::ZERO);
    }

    #[test]
    fn csv_substring_false_positive_is_post_filtered() {
        let (config, _f, conn) = setup(TagMode::Csv);
        write(
            &conn,
            &config,
            "a",
            &[(1, "sky", &["blue"]), (2, "bird", &["bluebird"]), (3, "sea", &["blue"])],
        );

        let page = events_by_tag_page(
            &conn,
            TagMode::Csv,
            &Tag::new("blue"),
            Ordering::ZERO,
            max_ordering(&conn).unwrap(),
            100,
        )
        .unwrap();

        // The LIKE touched all three rows; only exact matches survive.
        assert_eq!(page.fetched, 3);
        assert_eq!(page.rows.len(), 2);
        let seqs: Vec<i64> = page.rows.iter().map(|r| r.sequence_number.as_raw()).collect();
        assert_eq!(seqs, vec![1, 3]);
        assert_eq!(page.highest_fetched, Some(Ordering::from_raw(3)));
    }

    #[test]
    fn tag_table_page_joins_on_ordering() {
        let (config, _f, conn) = setup(TagMode::TagTable);
        write(
            &conn,
            &config,
            "a",
            &[(1, "x", &["green"]), (2, "y", &[]), (3, "z", &["green", "big"])],
        );

        let page = events_by_tag_page(
            &conn,
            TagMode::TagTable,
            &Tag::new("green"),
            Ordering::ZERO,
            max_ordering(&conn).unwrap(),
            100,
        )
        .unwrap();

        assert_eq!(page.rows.len(), 2);
        let seqs: Vec<i64> = page.rows.iter().map(|r| r.sequence_number.as_raw()).collect();
        assert_eq!(seqs, vec![1, 3]);
    }

    #[test]
    fn tag_page_respects_offset_and_horizon() {
        let (config, _f, conn) = setup(TagMode::TagTable);
        write(
            &conn,
            &config,
            "a",
            &[(1, "x", &["t"]), (2, "y", &["t"]), (3, "z", &["t"]), (4, "w", &["t"])],
        );

        let page = events_by_tag_page(
            &conn,
            TagMode::TagTable,
            &Tag::new("t"),
            Ordering::from_raw(1),
            Ordering::from_raw(3),
            100,
        )
        .unwrap();

        let ords: Vec<i64> = page
            .rows
            .iter()
            .map(|r| r.ordering.unwrap().as_raw())
            .collect();
        assert_eq!(ords, vec![2, 3]);
    }

    #[test]
    fn all_events_page_spans_persistence_ids() {
        let (config, _f, conn) = setup(TagMode::TagTable);
        write(&conn, &config, "a", &[(1, "a1", &[])]);
        write(&conn, &config, "b", &[(1, "b1", &[])]);
        write(&conn, &config, "a", &[(2, "a2", &[])]);

        let page = all_events_page(
            &conn,
            Ordering::ZERO,
            max_ordering(&conn).unwrap(),
            100,
        )
        .unwrap();

        let pids: Vec<&str> = page
            .rows
            .iter()
            .map(|r| r.persistence_id.as_str())
            .collect();
        assert_eq!(pids, vec!["a", "b", "a"]);
        assert_eq!(page.fetched, 3);
    }

    #[test]
    fn persistence_id_scans() {
        let (config, _f, conn) = setup(TagMode::TagTable);
        write(&conn, &config, "alpha", &[(1, "x", &[])]);
        write(&conn, &config, "beta", &[(1, "x", &[])]);
        write(&conn, &config, "alpha", &[(2, "x", &[])]);

        let ids = persistence_ids_page(&conn, None, 10).unwrap();
        let names: Vec<&str> = ids.iter().map(|p| p.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);

        let after_alpha = persistence_ids_page(&conn, Some("alpha"), 10).unwrap();
        assert_eq!(after_alpha.len(), 1);
        assert_eq!(after_alpha[0].as_str(), "beta");

        // Rows 1..=2 cover alpha and beta; row 3 adds nothing new.
        let in_range =
            persistence_ids_in_range(&conn, Ordering::ZERO, Ordering::from_raw(2)).unwrap();
        assert_eq!(in_range.len(), 2);
        let tail =
            persistence_ids_in_range(&conn, Ordering::from_raw(2), Ordering::from_raw(3)).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].as_str(), "alpha");
    }
}
