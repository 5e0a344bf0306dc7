//! Read views over the derived tables.
//!
//! Taken-down subjects are reported as [`Error::NotFound`], exactly like
//! subjects that never existed.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::{AtUri, Did};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorView {
    pub did: Did,
    pub handle: Option<String>,
    pub indexed_ms: u64,
    /// Non-active upstream status, if any.
    pub upstream_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordView {
    pub uri: AtUri,
    pub cid: String,
    pub value: Value,
    pub indexed_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostAggregates {
    pub like_count: u64,
    pub repost_count: u64,
    pub reply_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileAggregates {
    pub followers_count: u64,
    pub follows_count: u64,
    pub posts_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationView {
    pub author: Did,
    pub record_uri: String,
    pub record_cid: String,
    pub reason: String,
    pub reason_subject: Option<String>,
    pub sort_ms: u64,
}

fn actor_taken_down(conn: &Connection, did: &str) -> Result<bool> {
    let taken_down: Option<bool> = conn
        .prepare_cached("SELECT takedown_ref IS NOT NULL FROM actor WHERE did = ?")?
        .query_row([did], |row| row.get(0))
        .optional()?;
    Ok(taken_down.unwrap_or(false))
}

fn record_visible(conn: &Connection, uri: &AtUri) -> Result<bool> {
    let taken_down: Option<bool> = conn
        .prepare_cached("SELECT takedown_ref IS NOT NULL FROM record WHERE uri = ?")?
        .query_row([uri.to_string()], |row| row.get(0))
        .optional()?;
    Ok(taken_down == Some(false) && !actor_taken_down(conn, uri.host().as_str())?)
}

pub fn get_actor(conn: &Connection, did: &Did) -> Result<ActorView> {
    conn.prepare_cached(
        "SELECT handle, indexed_ms, upstream_status FROM actor
         WHERE did = ? AND takedown_ref IS NULL",
    )?
    .query_row([did.as_str()], |row| {
        Ok(ActorView {
            did: did.clone(),
            handle: row.get(0)?,
            indexed_ms: row.get::<_, i64>(1)? as u64,
            upstream_status: row.get(2)?,
        })
    })
    .optional()?
    .ok_or_else(|| Error::not_found(did))
}

pub fn get_record(conn: &Connection, uri: &AtUri) -> Result<RecordView> {
    if !record_visible(conn, uri)? {
        return Err(Error::not_found(uri));
    }
    let (cid, json, indexed_ms): (String, String, i64) = conn
        .prepare_cached("SELECT cid, json, indexed_ms FROM record WHERE uri = ?")?
        .query_row([uri.to_string()], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
    Ok(RecordView {
        uri: uri.clone(),
        cid,
        value: serde_json::from_str(&json)?,
        indexed_ms: indexed_ms as u64,
    })
}

/// Counters of a post. A post that is indexed but never interacted with has
/// all-zero counters.
pub fn get_post_aggregates(conn: &Connection, uri: &AtUri) -> Result<PostAggregates> {
    if !record_visible(conn, uri)? {
        return Err(Error::not_found(uri));
    }
    let aggs = conn
        .prepare_cached("SELECT like_count, repost_count, reply_count FROM post_agg WHERE uri = ?")?
        .query_row([uri.to_string()], |row| {
            Ok(PostAggregates {
                like_count: row.get::<_, i64>(0)? as u64,
                repost_count: row.get::<_, i64>(1)? as u64,
                reply_count: row.get::<_, i64>(2)? as u64,
            })
        })
        .optional()?;
    Ok(aggs.unwrap_or_default())
}

pub fn get_profile_aggregates(conn: &Connection, did: &Did) -> Result<ProfileAggregates> {
    if actor_taken_down(conn, did.as_str())? {
        return Err(Error::not_found(did));
    }
    let aggs = conn
        .prepare_cached(
            "SELECT followers_count, follows_count, posts_count FROM profile_agg WHERE did = ?",
        )?
        .query_row([did.as_str()], |row| {
            Ok(ProfileAggregates {
                followers_count: row.get::<_, i64>(0)? as u64,
                follows_count: row.get::<_, i64>(1)? as u64,
                posts_count: row.get::<_, i64>(2)? as u64,
            })
        })
        .optional()?;
    Ok(aggs.unwrap_or_default())
}

/// Newest first. Notifications whose record is gone or hidden, or whose
/// author is taken down, are skipped.
pub fn list_notifications(conn: &Connection, did: &Did, limit: usize) -> Result<Vec<NotificationView>> {
    if actor_taken_down(conn, did.as_str())? {
        return Err(Error::not_found(did));
    }
    let mut stmt = conn.prepare_cached(
        "SELECT n.author, n.record_uri, n.record_cid, n.reason, n.reason_subject, n.sort_ms
         FROM notification n
         JOIN record r ON r.uri = n.record_uri AND r.takedown_ref IS NULL
         LEFT JOIN actor a ON a.did = n.author
         WHERE n.did = ? AND a.takedown_ref IS NULL
         ORDER BY n.sort_ms DESC, n.id DESC
         LIMIT ?",
    )?;
    let rows = stmt.query_map(params![did.as_str(), limit as i64], |row| {
        Ok(NotificationView {
            author: Did::new(row.get::<_, String>(0)?),
            record_uri: row.get(1)?,
            record_cid: row.get(2)?,
            reason: row.get(3)?,
            reason_subject: row.get(4)?,
            sort_ms: row.get::<_, i64>(5)? as u64,
        })
    })?;

    let mut notifications = Vec::new();
    for row in rows {
        notifications.push(row?);
    }
    Ok(notifications)
}
