//! The indexed collections.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;

use super::aggregates::{Counter, Delta};
use super::processor::{IndexedRow, NewNotification, RecordPlugin};
use crate::error::Result;
use crate::types::{AtUri, Cid};

pub const POST_COLLECTION: &str = "app.bsky.feed.post";
pub const LIKE_COLLECTION: &str = "app.bsky.feed.like";
pub const REPOST_COLLECTION: &str = "app.bsky.feed.repost";
pub const FOLLOW_COLLECTION: &str = "app.bsky.graph.follow";
pub const PROFILE_COLLECTION: &str = "app.bsky.actor.profile";

/// The only rkey a profile record may use.
pub const PROFILE_RKEY: &str = "self";

/// A strong reference to another record.
#[derive(Debug, Clone, Deserialize)]
pub struct StrongRef {
    pub uri: String,
    pub cid: String,
}

/// Host DID of an at-uri string, if it parses.
fn uri_host(uri: &str) -> Option<String> {
    uri.parse::<AtUri>().ok().map(|u| u.host().to_string())
}

// =============================================================================
// Post
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostRecord {
    pub text: String,
    pub created_at: String,
    #[serde(default)]
    pub reply: Option<ReplyRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplyRef {
    pub root: StrongRef,
    pub parent: StrongRef,
}

#[derive(Debug, Clone)]
pub struct IndexedPost {
    pub uri: String,
    pub cid: String,
    pub creator: String,
    pub reply_root: Option<String>,
    pub reply_parent: Option<String>,
}

impl IndexedRow for IndexedPost {
    fn uri(&self) -> &str {
        &self.uri
    }
    fn cid(&self) -> &str {
        &self.cid
    }
    fn creator(&self) -> &str {
        &self.creator
    }
}

pub struct PostPlugin;

impl RecordPlugin for PostPlugin {
    type Record = PostRecord;
    type Indexed = IndexedPost;

    const COLLECTION: &'static str = POST_COLLECTION;

    fn insert(
        &self,
        conn: &Connection,
        uri: &AtUri,
        cid: &Cid,
        record: &PostRecord,
        indexed_ms: u64,
    ) -> Result<Option<IndexedPost>> {
        let post = IndexedPost {
            uri: uri.to_string(),
            cid: cid.to_string(),
            creator: uri.host().to_string(),
            reply_root: record.reply.as_ref().map(|r| r.root.uri.clone()),
            reply_parent: record.reply.as_ref().map(|r| r.parent.uri.clone()),
        };
        let inserted = conn
            .prepare_cached(
                "INSERT INTO post
                     (uri, cid, creator, text, reply_root, reply_parent, created_at, indexed_ms)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT DO NOTHING",
            )?
            .execute(params![
                post.uri,
                post.cid,
                post.creator,
                record.text,
                post.reply_root,
                post.reply_parent,
                record.created_at,
                indexed_ms as i64
            ])?;
        Ok((inserted == 1).then_some(post))
    }

    fn delete(&self, conn: &Connection, uri: &AtUri) -> Result<Option<IndexedPost>> {
        let uri = uri.to_string();
        let found = conn
            .prepare_cached(
                "SELECT cid, creator, reply_root, reply_parent FROM post WHERE uri = ?",
            )?
            .query_row([&uri], |row| {
                Ok(IndexedPost {
                    uri: uri.clone(),
                    cid: row.get(0)?,
                    creator: row.get(1)?,
                    reply_root: row.get(2)?,
                    reply_parent: row.get(3)?,
                })
            })
            .optional()?;
        if found.is_some() {
            conn.prepare_cached("DELETE FROM post WHERE uri = ?")?
                .execute([&uri])?;
        }
        Ok(found)
    }

    fn notifications(&self, post: &IndexedPost) -> Vec<NewNotification> {
        let mut notifs = Vec::new();
        for ancestor in [&post.reply_parent, &post.reply_root].into_iter().flatten() {
            if let Some(recipient) = uri_host(ancestor) {
                notifs.push(NewNotification {
                    recipient,
                    reason: "reply",
                    reason_subject: Some(ancestor.clone()),
                });
            }
        }
        notifs
    }

    fn deltas(&self, post: &IndexedPost) -> Vec<Delta> {
        let mut deltas = vec![Delta::new(Counter::Posts, post.creator.clone())];
        if let Some(parent) = &post.reply_parent {
            deltas.push(Delta::new(Counter::Replies, parent.clone()));
        }
        deltas
    }
}

// =============================================================================
// Like and Repost
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRecord {
    pub subject: StrongRef,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct IndexedSubjectRecord {
    pub uri: String,
    pub cid: String,
    pub creator: String,
    pub subject: String,
    pub subject_cid: String,
}

impl IndexedRow for IndexedSubjectRecord {
    fn uri(&self) -> &str {
        &self.uri
    }
    fn cid(&self) -> &str {
        &self.cid
    }
    fn creator(&self) -> &str {
        &self.creator
    }
}

/// Shared by likes and reposts: one row per (creator, subject).
struct SubjectTable {
    table: &'static str,
    counter: Counter,
    reason: &'static str,
}

impl SubjectTable {
    fn insert(
        &self,
        conn: &Connection,
        uri: &AtUri,
        cid: &Cid,
        record: &SubjectRecord,
        indexed_ms: u64,
    ) -> Result<Option<IndexedSubjectRecord>> {
        let row = IndexedSubjectRecord {
            uri: uri.to_string(),
            cid: cid.to_string(),
            creator: uri.host().to_string(),
            subject: record.subject.uri.clone(),
            subject_cid: record.subject.cid.clone(),
        };
        let sql = format!(
            "INSERT INTO {} (uri, cid, creator, subject, subject_cid, created_at, indexed_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT DO NOTHING",
            self.table
        );
        let inserted = conn.prepare_cached(&sql)?.execute(params![
            row.uri,
            row.cid,
            row.creator,
            row.subject,
            row.subject_cid,
            record.created_at,
            indexed_ms as i64
        ])?;
        Ok((inserted == 1).then_some(row))
    }

    fn find_duplicate(&self, conn: &Connection, uri: &AtUri, record: &SubjectRecord) -> Result<Option<String>> {
        let sql = format!("SELECT uri FROM {} WHERE creator = ? AND subject = ?", self.table);
        Ok(conn
            .prepare_cached(&sql)?
            .query_row(params![uri.host().as_str(), record.subject.uri], |row| row.get(0))
            .optional()?)
    }

    fn delete(&self, conn: &Connection, uri: &AtUri) -> Result<Option<IndexedSubjectRecord>> {
        let uri = uri.to_string();
        let select = format!(
            "SELECT cid, creator, subject, subject_cid FROM {} WHERE uri = ?",
            self.table
        );
        let found = conn
            .prepare_cached(&select)?
            .query_row([&uri], |row| {
                Ok(IndexedSubjectRecord {
                    uri: uri.clone(),
                    cid: row.get(0)?,
                    creator: row.get(1)?,
                    subject: row.get(2)?,
                    subject_cid: row.get(3)?,
                })
            })
            .optional()?;
        if found.is_some() {
            conn.prepare_cached(&format!("DELETE FROM {} WHERE uri = ?", self.table))?
                .execute([&uri])?;
        }
        Ok(found)
    }

    fn notifications(&self, row: &IndexedSubjectRecord) -> Vec<NewNotification> {
        uri_host(&row.subject)
            .map(|recipient| NewNotification {
                recipient,
                reason: self.reason,
                reason_subject: Some(row.subject.clone()),
            })
            .into_iter()
            .collect()
    }

    fn deltas(&self, row: &IndexedSubjectRecord) -> Vec<Delta> {
        vec![Delta::new(self.counter, row.subject.clone())]
    }
}

const LIKES: SubjectTable = SubjectTable {
    table: "post_like",
    counter: Counter::Likes,
    reason: "like",
};

const REPOSTS: SubjectTable = SubjectTable {
    table: "repost",
    counter: Counter::Reposts,
    reason: "repost",
};

pub struct LikePlugin;

impl RecordPlugin for LikePlugin {
    type Record = SubjectRecord;
    type Indexed = IndexedSubjectRecord;

    const COLLECTION: &'static str = LIKE_COLLECTION;

    fn insert(
        &self,
        conn: &Connection,
        uri: &AtUri,
        cid: &Cid,
        record: &SubjectRecord,
        indexed_ms: u64,
    ) -> Result<Option<IndexedSubjectRecord>> {
        LIKES.insert(conn, uri, cid, record, indexed_ms)
    }

    fn find_duplicate(&self, conn: &Connection, uri: &AtUri, record: &SubjectRecord) -> Result<Option<String>> {
        LIKES.find_duplicate(conn, uri, record)
    }

    fn delete(&self, conn: &Connection, uri: &AtUri) -> Result<Option<IndexedSubjectRecord>> {
        LIKES.delete(conn, uri)
    }

    fn notifications(&self, row: &IndexedSubjectRecord) -> Vec<NewNotification> {
        LIKES.notifications(row)
    }

    fn deltas(&self, row: &IndexedSubjectRecord) -> Vec<Delta> {
        LIKES.deltas(row)
    }
}

pub struct RepostPlugin;

impl RecordPlugin for RepostPlugin {
    type Record = SubjectRecord;
    type Indexed = IndexedSubjectRecord;

    const COLLECTION: &'static str = REPOST_COLLECTION;

    fn insert(
        &self,
        conn: &Connection,
        uri: &AtUri,
        cid: &Cid,
        record: &SubjectRecord,
        indexed_ms: u64,
    ) -> Result<Option<IndexedSubjectRecord>> {
        REPOSTS.insert(conn, uri, cid, record, indexed_ms)
    }

    fn find_duplicate(&self, conn: &Connection, uri: &AtUri, record: &SubjectRecord) -> Result<Option<String>> {
        REPOSTS.find_duplicate(conn, uri, record)
    }

    fn delete(&self, conn: &Connection, uri: &AtUri) -> Result<Option<IndexedSubjectRecord>> {
        REPOSTS.delete(conn, uri)
    }

    fn notifications(&self, row: &IndexedSubjectRecord) -> Vec<NewNotification> {
        REPOSTS.notifications(row)
    }

    fn deltas(&self, row: &IndexedSubjectRecord) -> Vec<Delta> {
        REPOSTS.deltas(row)
    }
}

// =============================================================================
// Follow
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowRecord {
    /// The followed account's DID.
    pub subject: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct IndexedFollow {
    pub uri: String,
    pub cid: String,
    pub creator: String,
    pub subject_did: String,
}

impl IndexedRow for IndexedFollow {
    fn uri(&self) -> &str {
        &self.uri
    }
    fn cid(&self) -> &str {
        &self.cid
    }
    fn creator(&self) -> &str {
        &self.creator
    }
}

pub struct FollowPlugin;

impl RecordPlugin for FollowPlugin {
    type Record = FollowRecord;
    type Indexed = IndexedFollow;

    const COLLECTION: &'static str = FOLLOW_COLLECTION;

    fn insert(
        &self,
        conn: &Connection,
        uri: &AtUri,
        cid: &Cid,
        record: &FollowRecord,
        indexed_ms: u64,
    ) -> Result<Option<IndexedFollow>> {
        let follow = IndexedFollow {
            uri: uri.to_string(),
            cid: cid.to_string(),
            creator: uri.host().to_string(),
            subject_did: record.subject.clone(),
        };
        let inserted = conn
            .prepare_cached(
                "INSERT INTO follow (uri, cid, creator, subject_did, created_at, indexed_ms)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT DO NOTHING",
            )?
            .execute(params![
                follow.uri,
                follow.cid,
                follow.creator,
                follow.subject_did,
                record.created_at,
                indexed_ms as i64
            ])?;
        Ok((inserted == 1).then_some(follow))
    }

    fn find_duplicate(&self, conn: &Connection, uri: &AtUri, record: &FollowRecord) -> Result<Option<String>> {
        Ok(conn
            .prepare_cached("SELECT uri FROM follow WHERE creator = ? AND subject_did = ?")?
            .query_row(params![uri.host().as_str(), record.subject], |row| row.get(0))
            .optional()?)
    }

    fn delete(&self, conn: &Connection, uri: &AtUri) -> Result<Option<IndexedFollow>> {
        let uri = uri.to_string();
        let found = conn
            .prepare_cached("SELECT cid, creator, subject_did FROM follow WHERE uri = ?")?
            .query_row([&uri], |row| {
                Ok(IndexedFollow {
                    uri: uri.clone(),
                    cid: row.get(0)?,
                    creator: row.get(1)?,
                    subject_did: row.get(2)?,
                })
            })
            .optional()?;
        if found.is_some() {
            conn.prepare_cached("DELETE FROM follow WHERE uri = ?")?
                .execute([&uri])?;
        }
        Ok(found)
    }

    fn notifications(&self, follow: &IndexedFollow) -> Vec<NewNotification> {
        vec![NewNotification {
            recipient: follow.subject_did.clone(),
            reason: "follow",
            reason_subject: None,
        }]
    }

    fn deltas(&self, follow: &IndexedFollow) -> Vec<Delta> {
        vec![
            Delta::new(Counter::Followers, follow.subject_did.clone()),
            Delta::new(Counter::Follows, follow.creator.clone()),
        ]
    }
}

// =============================================================================
// Profile
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRecord {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IndexedProfile {
    pub uri: String,
    pub cid: String,
    pub creator: String,
}

impl IndexedRow for IndexedProfile {
    fn uri(&self) -> &str {
        &self.uri
    }
    fn cid(&self) -> &str {
        &self.cid
    }
    fn creator(&self) -> &str {
        &self.creator
    }
}

pub struct ProfilePlugin;

impl RecordPlugin for ProfilePlugin {
    type Record = ProfileRecord;
    type Indexed = IndexedProfile;

    const COLLECTION: &'static str = PROFILE_COLLECTION;

    fn insert(
        &self,
        conn: &Connection,
        uri: &AtUri,
        cid: &Cid,
        record: &ProfileRecord,
        indexed_ms: u64,
    ) -> Result<Option<IndexedProfile>> {
        if uri.rkey() != PROFILE_RKEY {
            return Ok(None);
        }
        let profile = IndexedProfile {
            uri: uri.to_string(),
            cid: cid.to_string(),
            creator: uri.host().to_string(),
        };
        let inserted = conn
            .prepare_cached(
                "INSERT INTO profile (uri, cid, creator, display_name, description, indexed_ms)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT DO NOTHING",
            )?
            .execute(params![
                profile.uri,
                profile.cid,
                profile.creator,
                record.display_name,
                record.description,
                indexed_ms as i64
            ])?;
        Ok((inserted == 1).then_some(profile))
    }

    fn delete(&self, conn: &Connection, uri: &AtUri) -> Result<Option<IndexedProfile>> {
        let uri = uri.to_string();
        let found = conn
            .prepare_cached("SELECT cid, creator FROM profile WHERE uri = ?")?
            .query_row([&uri], |row| {
                Ok(IndexedProfile {
                    uri: uri.clone(),
                    cid: row.get(0)?,
                    creator: row.get(1)?,
                })
            })
            .optional()?;
        if found.is_some() {
            conn.prepare_cached("DELETE FROM profile WHERE uri = ?")?
                .execute([&uri])?;
        }
        Ok(found)
    }
}
