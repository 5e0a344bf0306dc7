//! # Event Log Reader
//!
//! Direct SQL reads against `repo_seq`. Readers use their own connections and,
//! with WAL, always see the latest committed rows without blocking the writer,
//! including rows appended by writers in other processes.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::events::SeqRow;
use crate::types::{Did, Seq};
use crate::writer::TRIM_WATERMARK_KEY;

/// Reads up to `limit` events with `seq >= from`, in seq order.
pub fn read_events(conn: &Connection, from: Seq, limit: usize) -> Result<Vec<SeqRow>> {
    let mut stmt = conn.prepare_cached(
        "SELECT seq, did, event_type, payload, checksum, sequenced_ms
         FROM repo_seq WHERE seq >= ? ORDER BY seq LIMIT ?",
    )?;
    let rows = stmt.query_map(params![from.as_raw() as i64, limit as i64], |row| {
        Ok(SeqRow {
            seq: Seq::from_raw(row.get::<_, i64>(0)? as u64),
            did: Did::new(row.get::<_, String>(1)?),
            event_type: row.get(2)?,
            payload: row.get(3)?,
            checksum: row.get(4)?,
            sequenced_ms: row.get::<_, i64>(5)? as u64,
        })
    })?;

    let mut events = Vec::new();
    for row in rows {
        events.push(row?);
    }
    Ok(events)
}

/// Returns the highest seq ever assigned, or `None` for an empty log.
///
/// Reads the AUTOINCREMENT counter rather than `MAX(seq)`, so deleting the
/// newest rows does not move the head backwards.
pub fn current_seq(conn: &Connection) -> Result<Option<Seq>> {
    let seq: Option<i64> = conn
        .query_row(
            "SELECT seq FROM sqlite_sequence WHERE name = 'repo_seq'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(seq.filter(|s| *s > 0).map(|s| Seq::from_raw(s as u64)))
}

/// Returns the lowest seq still stored, or `None` for an empty log.
pub fn earliest_seq(conn: &Connection) -> Result<Option<Seq>> {
    let seq: Option<i64> = conn.query_row("SELECT MIN(seq) FROM repo_seq", [], |row| row.get(0))?;
    Ok(seq.map(|s| Seq::from_raw(s as u64)))
}

/// Returns the lowest cursor that can still be replayed without loss.
///
/// Everything below it was trimmed. Gaps above it (deleted accounts) are legal
/// and do not make a cursor outdated.
pub fn retained_from(conn: &Connection) -> Result<Seq> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM repohost_metadata WHERE key = ?",
            [TRIM_WATERMARK_KEY],
            |row| row.get(0),
        )
        .optional()?;
    let raw = value.and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
    Ok(Seq::from_raw(raw.max(Seq::FIRST.as_raw())))
}

// =============================================================================
// Tests
// =============================================================================
