//! # Write-side Storage Operations
//!
//! Synchronous SQL for the write half of the journal: batch insert with
//! tag fan-out, message update, the delete protocol, and the
//! highest-sequence-number queries. Everything here runs on a
//! per-operation connection handed in by the factory; the async pipeline
//! in [`crate::writer`] calls into this module from blocking tasks.
//!
//! ## Insert paths
//!
//! ```text
//! batch of rows
//!   │
//!   ├─ one row, no tag fan-out needed ──► single INSERT, no transaction
//!   │
//!   └─ otherwise ──► BEGIN IMMEDIATE
//!        split into contiguous runs, preserving batch order:
//!          untagged run ──► multi-row VALUES (small runs)
//!          │               or reused prepared statement (large runs)
//!          tagged run ────► row-by-row INSERT, read last_insert_rowid()
//!                           for the assigned ordering, then bulk-insert
//!                           the accumulated tag rows
//!        COMMIT (rollback on failure, aggregating rollback errors)
//! ```
//!
//! Tagged rows go row-by-row because a multi-row insert cannot return the
//! generated `ordering` values, and `journal_tag_row.ordering_id` needs
//! them.

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};

use crate::config::{JournalConfig, TagMode};
use crate::error::{Error, Result};
use crate::types::{JournalRow, Ordering, PersistenceId, SequenceNr, TagRow};

/// Hard cap on rows per multi-row INSERT into `journal_row`, keeping the
/// bound parameter count under SQLite's variable limit (10 columns/row).
const MAX_MULTI_ROW_CHUNK: usize = 80;

/// Hard cap on tag rows per multi-row INSERT (5 columns/row).
const MAX_MULTI_TAG_CHUNK: usize = 150;

const INSERT_ROW_SQL: &str = "INSERT INTO journal_row \
    (persistence_id, sequence_number, deleted, timestamp, message, manifest, \
     event_manifest, identifier, tags, write_uuid) \
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

const INSERT_TAG_SQL: &str = "INSERT INTO journal_tag_row \
    (ordering_id, tag_value, persistence_id, sequence_number, write_uuid) \
    VALUES (?, ?, ?, ?, ?)";

// =============================================================================
// Transactions
// =============================================================================

/// Runs `f` inside `BEGIN IMMEDIATE` … `COMMIT`.
///
/// On any failure a rollback is attempted; if the rollback itself fails,
/// both causes surface as [`Error::Rollback`]. Raw SQL transaction control
/// keeps the connection borrowable inside `f`.
fn run_in_transaction<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> Result<T>,
) -> Result<T> {
    conn.execute_batch("BEGIN IMMEDIATE")?;

    let outcome = f(conn).and_then(|value| {
        conn.execute_batch("COMMIT")?;
        Ok(value)
    });

    match outcome {
        Ok(value) => Ok(value),
        Err(cause) => match conn.execute_batch("ROLLBACK") {
            Ok(()) => Err(cause),
            Err(rollback) => Err(Error::Rollback {
                cause: cause.to_string(),
                rollback: rollback.to_string(),
            }),
        },
    }
}

// =============================================================================
// Batch Insert
// =============================================================================

/// Inserts a write batch.
///
/// Hot path: a single row that needs no tag-table fan-out goes in as one
/// statement without a transaction. Everything else takes the
/// transactional multi-path insert.
pub fn insert_batch(conn: &Connection, rows: &[JournalRow], config: &JournalConfig) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }

    let single_untagged =
        rows.len() == 1 && (config.tag_mode == TagMode::Csv || !rows[0].has_tags());
    if single_untagged {
        conn.execute(INSERT_ROW_SQL, params_from_iter(row_values(&rows[0])))?;
        return Ok(());
    }

    run_in_transaction(conn, |conn| insert_batch_in_tx(conn, rows, config))
}

fn insert_batch_in_tx(
    conn: &Connection,
    rows: &[JournalRow],
    config: &JournalConfig,
) -> Result<()> {
    // Contiguous runs by tag-presence, in batch order. CSV rows never
    // carry a tag_set, so the whole batch is one untagged run there.
    let mut index = 0;
    while index < rows.len() {
        let tagged = rows[index].has_tags();
        let mut end = index + 1;
        while end < rows.len() && rows[end].has_tags() == tagged {
            end += 1;
        }
        let run = &rows[index..end];
        if tagged {
            insert_tagged_run(conn, run, config)?;
        } else {
            insert_untagged_run(conn, run, config)?;
        }
        index = end;
    }
    Ok(())
}

/// Bulk-inserts rows that need no tag fan-out.
fn insert_untagged_run(
    conn: &Connection,
    run: &[JournalRow],
    config: &JournalConfig,
) -> Result<()> {
    let multi_row =
        run.len() <= config.max_row_by_row_size && config.prefer_parameters_on_multi_row_insert;

    if multi_row {
        let chunk_size = config.db_round_trip_batch_size.min(MAX_MULTI_ROW_CHUNK);
        for chunk in run.chunks(chunk_size) {
            let sql = multi_insert_sql(INSERT_ROW_SQL, 10, chunk.len());
            let values = chunk.iter().flat_map(row_values);
            conn.execute(&sql, params_from_iter(values))?;
        }
    } else {
        let mut stmt = conn.prepare_cached(INSERT_ROW_SQL)?;
        for row in run {
            stmt.execute(params_from_iter(row_values(row)))?;
        }
    }
    Ok(())
}

/// Inserts tagged rows one by one to learn their assigned orderings, then
/// bulk-inserts the accumulated tag rows.
fn insert_tagged_run(conn: &Connection, run: &[JournalRow], config: &JournalConfig) -> Result<()> {
    let mut tag_rows = Vec::new();

    {
        let mut stmt = conn.prepare_cached(INSERT_ROW_SQL)?;
        for row in run {
            stmt.execute(params_from_iter(row_values(row)))?;
            let ordering = Ordering::from_raw(conn.last_insert_rowid());
            for tag in &row.tag_set {
                tag_rows.push(TagRow {
                    ordering_id: ordering,
                    tag_value: tag.clone(),
                    persistence_id: row.persistence_id.clone(),
                    sequence_number: row.sequence_number,
                    write_uuid: row.write_uuid,
                });
            }
        }
    }

    let chunk_size = config.db_round_trip_tag_batch_size.min(MAX_MULTI_TAG_CHUNK);
    for chunk in tag_rows.chunks(chunk_size) {
        let sql = multi_insert_sql(INSERT_TAG_SQL, 5, chunk.len());
        let values = chunk.iter().flat_map(tag_values);
        conn.execute(&sql, params_from_iter(values))?;
    }
    Ok(())
}

/// Extends a single-row INSERT with additional `(?, …)` groups.
fn multi_insert_sql(base: &str, columns: usize, rows: usize) -> String {
    debug_assert!(rows >= 1);
    let group = format!(", ({})", vec!["?"; columns].join(", "));
    let mut sql = String::from(base);
    for _ in 1..rows {
        sql.push_str(&group);
    }
    sql
}

fn row_values(row: &JournalRow) -> Vec<Value> {
    vec![
        Value::Text(row.persistence_id.to_string()),
        Value::Integer(row.sequence_number.as_raw()),
        Value::Integer(row.deleted as i64),
        Value::Integer(row.timestamp),
        Value::Blob(row.message.clone()),
        Value::Text(row.manifest.clone()),
        Value::Text(row.event_manifest.clone()),
        match row.identifier {
            Some(id) => Value::Integer(id as i64),
            None => Value::Null,
        },
        match &row.tags {
            Some(csv) => Value::Text(csv.clone()),
            None => Value::Null,
        },
        Value::Blob(row.write_uuid.as_bytes().to_vec()),
    ]
}

fn tag_values(tag: &TagRow) -> Vec<Value> {
    vec![
        Value::Integer(tag.ordering_id.as_raw()),
        Value::Text(tag.tag_value.to_string()),
        Value::Text(tag.persistence_id.to_string()),
        Value::Integer(tag.sequence_number.as_raw()),
        Value::Blob(tag.write_uuid.as_bytes().to_vec()),
    ]
}

// =============================================================================
// Update
// =============================================================================

/// Overwrites the stored message of one event row. Never re-tags.
///
/// Fails with [`Error::Update`] when the target row does not exist.
pub fn update_message(conn: &Connection, row: &JournalRow) -> Result<()> {
    let changed = conn.execute(
        "UPDATE journal_row
         SET message = ?, manifest = ?, event_manifest = ?, identifier = ?
         WHERE persistence_id = ? AND sequence_number = ?",
        params![
            row.message,
            row.manifest,
            row.event_manifest,
            row.identifier,
            row.persistence_id.as_str(),
            row.sequence_number.as_raw(),
        ],
    )?;

    if changed == 0 {
        return Err(Error::Update {
            persistence_id: row.persistence_id.to_string(),
            sequence_number: row.sequence_number.as_raw(),
            reason: "no such row".to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Delete Protocol
// =============================================================================

/// Deletes events of `persistence_id` up to and including `to_seq`.
///
/// One transaction:
/// 1. soft-delete the range,
/// 2. find the highest soft-deleted sequence number (the watermark),
/// 3. compatibility mode: record the watermark in `journal_metadata`,
/// 4. hard-delete the range strictly below the watermark — the
///    soft-deleted watermark row itself is retained,
/// 5. compatibility mode: collapse metadata rows below the watermark,
/// 6. tag-table layout: drop the range's tag rows.
///
/// The retained watermark row (plus the metadata row in compatibility
/// mode) is what keeps `highest_sequence_nr` correct after the last live
/// event is gone.
pub fn delete_messages_to(
    conn: &Connection,
    persistence_id: &PersistenceId,
    to_seq: SequenceNr,
    config: &JournalConfig,
) -> Result<()> {
    tracing::debug!(
        persistence_id = %persistence_id,
        to_seq = to_seq.as_raw(),
        compat = config.delete_compatibility_mode,
        "deleting messages"
    );

    run_in_transaction(conn, |conn| {
        conn.execute(
            "UPDATE journal_row SET deleted = 1
             WHERE persistence_id = ? AND sequence_number <= ?",
            params![persistence_id.as_str(), to_seq.as_raw()],
        )?;

        let max_marked: Option<i64> = conn.query_row(
            "SELECT MAX(sequence_number) FROM journal_row
             WHERE persistence_id = ? AND deleted = 1",
            params![persistence_id.as_str()],
            |row| row.get(0),
        )?;

        if let Some(watermark) = max_marked {
            if config.delete_compatibility_mode {
                conn.execute(
                    "INSERT INTO journal_metadata (persistence_id, sequence_number)
                     VALUES (?, ?)
                     ON CONFLICT (persistence_id, sequence_number) DO NOTHING",
                    params![persistence_id.as_str(), watermark],
                )?;
            }

            conn.execute(
                "DELETE FROM journal_row
                 WHERE persistence_id = ? AND sequence_number <= ? AND sequence_number < ?",
                params![persistence_id.as_str(), to_seq.as_raw(), watermark],
            )?;

            if config.delete_compatibility_mode {
                conn.execute(
                    "DELETE FROM journal_metadata
                     WHERE persistence_id = ? AND sequence_number < ?",
                    params![persistence_id.as_str(), watermark],
                )?;
            }
        }

        if config.tag_mode == TagMode::TagTable {
            conn.execute(
                "DELETE FROM journal_tag_row
                 WHERE persistence_id = ? AND sequence_number <= ?",
                params![persistence_id.as_str(), to_seq.as_raw()],
            )?;
        }

        Ok(())
    })
}

// =============================================================================
// Highest Sequence Number
// =============================================================================

/// Returns the highest sequence number recorded under `persistence_id`,
/// or 0 when nothing is known.
///
/// Four query shapes by (compatibility mode × `from` > 0). In
/// compatibility mode the answer is the max over the union of the event
/// rows and the metadata watermarks, so it survives hard-deletes.
pub fn highest_sequence_nr(
    conn: &Connection,
    persistence_id: &PersistenceId,
    from: SequenceNr,
    compatibility_mode: bool,
) -> Result<SequenceNr> {
    let journal_max = max_seq(
        conn,
        "journal_row",
        persistence_id,
        from,
    )?;

    let highest = if compatibility_mode {
        let metadata_max = max_seq(conn, "journal_metadata", persistence_id, from)?;
        match (journal_max, metadata_max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    } else {
        journal_max
    };

    Ok(SequenceNr::from_raw(highest.unwrap_or(0)))
}

fn max_seq(
    conn: &Connection,
    table: &str,
    persistence_id: &PersistenceId,
    from: SequenceNr,
) -> Result<Option<i64>> {
    // Table names are the two compile-time constants above, never input.
    let value = if from.is_zero() {
        conn.query_row(
            &format!("SELECT MAX(sequence_number) FROM {table} WHERE persistence_id = ?"),
            params![persistence_id.as_str()],
            |row| row.get(0),
        )?
    } else {
        conn.query_row(
            &format!(
                "SELECT MAX(sequence_number) FROM {table}
                 WHERE persistence_id = ? AND sequence_number > ?"
            ),
            params![persistence_id.as_str(), from.as_raw()],
            |row| row.get(0),
        )?
    };
    Ok(value)
}

// =============================================================================
// Tests
// =============================================================================
