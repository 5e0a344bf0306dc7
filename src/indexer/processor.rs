//! # Record Processing
//!
//! Every indexed collection is a [`RecordPlugin`]: how one record becomes a
//! derived row, and what that row implies for counters and notifications.
//! [`RecordProcessor`] wraps a plugin with the bookkeeping shared by all
//! collections: the generic `record` row, duplicate tracking, counter deltas
//! and notifications.
//!
//! ## Collapse groups
//!
//! ```text
//!   like A (creator X, subject P)  ──► post_like row        (canonical)
//!   like B (creator X, subject P)  ──► duplicate_record B ─► A
//!   like C (creator X, subject P)  ──► duplicate_record C ─► A
//!
//!   delete A  ──► promote the oldest duplicate (B) into post_like,
//!                 re-point C at B, counters unchanged
//! ```
//!
//! The derived table's unique constraint decides which record wins the group,
//! so indexers on other connections converge without coordination.
//!
//! Every method runs inside a transaction opened by the caller.

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use super::aggregates::{self, AggSubject, Delta};
use crate::error::{Error, Result};
use crate::types::{AtUri, Cid};

// =============================================================================
// Plugin Interface
// =============================================================================

/// A notification implied by a derived row, before author filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    /// Recipient DID.
    pub recipient: String,
    pub reason: &'static str,
    pub reason_subject: Option<String>,
}

/// The derived row of one indexed record, as reported back to the processor.
pub trait IndexedRow {
    fn uri(&self) -> &str;
    fn cid(&self) -> &str;
    fn creator(&self) -> &str;
}

/// How one collection is materialized.
///
/// `insert` followed by `delete` and `insert` again must leave the same state
/// as a single `insert`: updates are implemented that way.
pub trait RecordPlugin: Send + Sync + 'static {
    /// The record shape; decoding failure is a validation failure.
    type Record: DeserializeOwned;
    type Indexed: IndexedRow;

    const COLLECTION: &'static str;

    /// Inserts the derived row, returning it only if this call created it.
    fn insert(
        &self,
        conn: &Connection,
        uri: &AtUri,
        cid: &Cid,
        record: &Self::Record,
        indexed_ms: u64,
    ) -> Result<Option<Self::Indexed>>;

    /// The canonical record of this record's collapse group, if any.
    fn find_duplicate(
        &self,
        _conn: &Connection,
        _uri: &AtUri,
        _record: &Self::Record,
    ) -> Result<Option<String>> {
        Ok(None)
    }

    /// Deletes the derived row, returning it only if it existed.
    fn delete(&self, conn: &Connection, uri: &AtUri) -> Result<Option<Self::Indexed>>;

    fn notifications(&self, _indexed: &Self::Indexed) -> Vec<NewNotification> {
        Vec::new()
    }

    /// Counter increments implied by the row's existence.
    fn deltas(&self, _indexed: &Self::Indexed) -> Vec<Delta> {
        Vec::new()
    }
}

// =============================================================================
// Processor
// =============================================================================

/// Object-safe view of a [`RecordProcessor`], keyed by collection.
pub trait Processor: Send + Sync {
    fn collection(&self) -> &'static str;

    fn insert_record(&self, conn: &Connection, uri: &AtUri, cid: &Cid, value: &Value, ts: u64)
        -> Result<()>;

    fn update_record(&self, conn: &Connection, uri: &AtUri, cid: &Cid, value: &Value, ts: u64)
        -> Result<()>;

    /// Deletes a record, promoting a duplicate if one exists.
    ///
    /// With `cascade_aggregates` false no counters move; the subjects whose
    /// counters are now stale are returned for a later [`aggregates::reconcile`].
    fn delete_record(
        &self,
        conn: &Connection,
        uri: &AtUri,
        cascade_aggregates: bool,
    ) -> Result<Vec<AggSubject>>;
}

pub struct RecordProcessor<P> {
    plugin: P,
}

impl<P: RecordPlugin> RecordProcessor<P> {
    pub fn new(plugin: P) -> Self {
        Self { plugin }
    }

    fn decode(&self, uri: &AtUri, value: &Value) -> Result<P::Record> {
        if let Some(kind) = value.get("$type").and_then(Value::as_str) {
            if kind != P::COLLECTION {
                return Err(Error::ValidationFailed {
                    uri: uri.to_string(),
                    reason: format!("record type {} in collection {}", kind, P::COLLECTION),
                });
            }
        }
        serde_json::from_value(value.clone()).map_err(|e| Error::ValidationFailed {
            uri: uri.to_string(),
            reason: e.to_string(),
        })
    }

    /// Applies the counters and notifications of a freshly inserted row.
    fn on_inserted(&self, conn: &Connection, indexed: &P::Indexed, ts: u64) -> Result<()> {
        aggregates::apply(conn, &self.plugin.deltas(indexed), 1)?;
        insert_notifications(conn, indexed, &self.plugin.notifications(indexed), ts)
    }
}

impl<P: RecordPlugin> Processor for RecordProcessor<P> {
    fn collection(&self) -> &'static str {
        P::COLLECTION
    }

    fn insert_record(
        &self,
        conn: &Connection,
        uri: &AtUri,
        cid: &Cid,
        value: &Value,
        ts: u64,
    ) -> Result<()> {
        let record = self.decode(uri, value)?;
        conn.prepare_cached(
            "INSERT INTO record (uri, cid, did, collection, json, indexed_ms)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(uri) DO NOTHING",
        )?
        .execute(params![
            uri.to_string(),
            cid.to_string(),
            uri.host().as_str(),
            P::COLLECTION,
            value.to_string(),
            ts as i64
        ])?;

        if let Some(indexed) = self.plugin.insert(conn, uri, cid, &record, ts)? {
            return self.on_inserted(conn, &indexed, ts);
        }

        // Lost the collapse group (or already indexed): remember it so it can
        // be promoted later.
        let uri_str = uri.to_string();
        if let Some(original) = self.plugin.find_duplicate(conn, uri, &record)? {
            if original != uri_str {
                conn.prepare_cached(
                    "INSERT INTO duplicate_record (uri, cid, duplicate_of, indexed_ms)
                     VALUES (?, ?, ?, ?)
                     ON CONFLICT(uri) DO NOTHING",
                )?
                .execute(params![uri_str, cid.to_string(), original, ts as i64])?;
                debug!(uri = %uri, duplicate_of = %original, "record collapsed into duplicate");
            }
        }
        Ok(())
    }

    fn update_record(
        &self,
        conn: &Connection,
        uri: &AtUri,
        cid: &Cid,
        value: &Value,
        ts: u64,
    ) -> Result<()> {
        let record = self.decode(uri, value)?;
        let uri_str = uri.to_string();
        conn.prepare_cached("UPDATE record SET cid = ?, json = ?, indexed_ms = ? WHERE uri = ?")?
            .execute(params![cid.to_string(), value.to_string(), ts as i64, uri_str])?;

        match self.plugin.find_duplicate(conn, uri, &record)? {
            Some(original) if original != uri_str => {
                conn.prepare_cached(
                    "UPDATE duplicate_record SET cid = ?, duplicate_of = ?, indexed_ms = ?
                     WHERE uri = ?",
                )?
                .execute(params![cid.to_string(), original, ts as i64, uri_str])?;
            }
            _ => {
                conn.prepare_cached("DELETE FROM duplicate_record WHERE uri = ?")?
                    .execute([&uri_str])?;
            }
        }

        let deleted = match self.plugin.delete(conn, uri)? {
            Some(deleted) => deleted,
            // Updated before it was ever indexed.
            None => return self.insert_record(conn, uri, cid, value, ts),
        };
        aggregates::apply(conn, &self.plugin.deltas(&deleted), -1)?;

        let inserted = self.plugin.insert(conn, uri, cid, &record, ts)?.ok_or_else(|| {
            Error::DuplicateConflict(format!(
                "{} was removed from the index but could not be replaced",
                uri
            ))
        })?;

        conn.prepare_cached("DELETE FROM notification WHERE record_uri = ?")?
            .execute([&uri_str])?;
        self.on_inserted(conn, &inserted, ts)
    }

    fn delete_record(
        &self,
        conn: &Connection,
        uri: &AtUri,
        cascade_aggregates: bool,
    ) -> Result<Vec<AggSubject>> {
        let uri_str = uri.to_string();
        conn.prepare_cached("DELETE FROM record WHERE uri = ?")?
            .execute([&uri_str])?;
        conn.prepare_cached("DELETE FROM duplicate_record WHERE uri = ?")?
            .execute([&uri_str])?;

        let deleted = match self.plugin.delete(conn, uri)? {
            Some(deleted) => deleted,
            None => return Ok(Vec::new()),
        };

        let promoted = self.promote_duplicate(conn, &uri_str)?;

        let mut stale = Vec::new();
        let removed = self.plugin.deltas(&deleted);
        if cascade_aggregates {
            aggregates::apply(conn, &removed, -1)?;
        } else {
            stale.extend(removed.iter().map(Delta::subject));
        }

        match promoted {
            Some(inserted) => {
                if cascade_aggregates {
                    aggregates::apply(conn, &self.plugin.deltas(&inserted), 1)?;
                } else {
                    stale.extend(self.plugin.deltas(&inserted).iter().map(Delta::subject));
                }
                conn.prepare_cached(
                    "UPDATE notification SET record_uri = ?, record_cid = ? WHERE record_uri = ?",
                )?
                .execute(params![inserted.uri(), inserted.cid(), uri_str])?;
                debug!(uri = %uri, promoted = %inserted.uri(), "duplicate promoted to canonical");
            }
            None => {
                conn.prepare_cached("DELETE FROM notification WHERE record_uri = ?")?
                    .execute([&uri_str])?;
            }
        }

        stale.sort();
        stale.dedup();
        Ok(stale)
    }
}

impl<P: RecordPlugin> RecordProcessor<P> {
    /// Moves the oldest surviving duplicate of `original` into the derived
    /// table and re-points the others at it.
    ///
    /// A duplicate whose stored record no longer decodes is dropped from the
    /// group and the next one is tried.
    fn promote_duplicate(&self, conn: &Connection, original: &str) -> Result<Option<P::Indexed>> {
        loop {
            let found: Option<(String, String, String, i64)> = conn
                .prepare_cached(
                    "SELECT d.uri, d.cid, r.json, d.indexed_ms
                     FROM duplicate_record d JOIN record r ON r.uri = d.uri
                     WHERE d.duplicate_of = ?
                     ORDER BY d.indexed_ms, d.uri
                     LIMIT 1",
                )?
                .query_row([original], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
                .optional()?;

            let (uri, cid, json, indexed_ms) = match found {
                Some(found) => found,
                None => return Ok(None),
            };
            conn.prepare_cached("DELETE FROM duplicate_record WHERE uri = ?")?
                .execute([&uri])?;

            let candidate = uri.parse::<AtUri>().and_then(|parsed| {
                let cid = cid.parse::<Cid>()?;
                let value = serde_json::from_str::<Value>(&json)?;
                let record = self.decode(&parsed, &value)?;
                Ok((parsed, cid, record))
            });
            let (uri_parsed, cid_parsed, record) = match candidate {
                Ok(candidate) => candidate,
                Err(e) => {
                    warn!(uri = %uri, duplicate_of = %original, error = %e, "dropping duplicate that cannot be promoted");
                    continue;
                }
            };

            conn.prepare_cached("UPDATE duplicate_record SET duplicate_of = ? WHERE duplicate_of = ?")?
                .execute(params![uri, original])?;
            return self
                .plugin
                .insert(conn, &uri_parsed, &cid_parsed, &record, indexed_ms as u64);
        }
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Writes notifications for a row, skipping its own author and repeats.
fn insert_notifications<R: IndexedRow>(
    conn: &Connection,
    indexed: &R,
    notifications: &[NewNotification],
    ts: u64,
) -> Result<()> {
    let mut notified = vec![indexed.creator()];
    let mut stmt = conn.prepare_cached(
        "INSERT INTO notification
             (did, author, record_uri, record_cid, reason, reason_subject, sort_ms)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )?;
    for notif in notifications {
        if notified.contains(&notif.recipient.as_str()) {
            continue;
        }
        notified.push(&notif.recipient);
        stmt.execute(params![
            notif.recipient,
            indexed.creator(),
            indexed.uri(),
            indexed.cid(),
            notif.reason,
            notif.reason_subject,
            ts as i64
        ])?;
    }
    Ok(())
}
