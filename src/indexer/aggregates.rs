//! Aggregate counters on posts and profiles.
//!
//! Counters move by deltas that are applied only when a derived row was
//! actually inserted or actually deleted. A redelivered create finds its row
//! already present and applies nothing, so any number of deliveries of a
//! create/delete pair nets to zero in any order.
//!
//! Deltas are keyed by the subject's identity alone, never by whether the
//! subject has been indexed yet: a like that arrives before its post still
//! lands on the post's counter row.

use rusqlite::{params, Connection};

use crate::error::Result;

/// One counter column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    Likes,
    Reposts,
    Replies,
    Followers,
    Follows,
    Posts,
}

impl Counter {
    fn table(&self) -> &'static str {
        match self {
            Counter::Likes | Counter::Reposts | Counter::Replies => "post_agg",
            Counter::Followers | Counter::Follows | Counter::Posts => "profile_agg",
        }
    }

    fn key_column(&self) -> &'static str {
        match self.table() {
            "post_agg" => "uri",
            _ => "did",
        }
    }

    fn column(&self) -> &'static str {
        match self {
            Counter::Likes => "like_count",
            Counter::Reposts => "repost_count",
            Counter::Replies => "reply_count",
            Counter::Followers => "followers_count",
            Counter::Follows => "follows_count",
            Counter::Posts => "posts_count",
        }
    }
}

/// A +1 on one counter of one subject. The sign is applied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Delta {
    pub counter: Counter,
    /// Post URI or account DID.
    pub subject: String,
}

impl Delta {
    pub fn new(counter: Counter, subject: impl Into<String>) -> Self {
        Self {
            counter,
            subject: subject.into(),
        }
    }

    pub fn subject(&self) -> AggSubject {
        match self.counter.table() {
            "post_agg" => AggSubject::Post(self.subject.clone()),
            _ => AggSubject::Profile(self.subject.clone()),
        }
    }
}

/// A row whose counters can be recomputed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AggSubject {
    /// Keyed by post URI.
    Post(String),
    /// Keyed by account DID.
    Profile(String),
}

/// Adds `sign` (+1 or -1) to each delta's counter. Counters never go below 0.
pub fn apply(conn: &Connection, deltas: &[Delta], sign: i64) -> Result<()> {
    for delta in deltas {
        let sql = format!(
            "INSERT INTO {table} ({key}, {col}) VALUES (?1, MAX(?2, 0))
             ON CONFLICT({key}) DO UPDATE SET {col} = MAX({col} + ?2, 0)",
            table = delta.counter.table(),
            key = delta.counter.key_column(),
            col = delta.counter.column(),
        );
        conn.prepare_cached(&sql)?
            .execute(params![delta.subject, sign])?;
    }
    Ok(())
}

/// Recounts every counter of the given subjects from the derived tables.
pub fn reconcile(conn: &Connection, subjects: &[AggSubject]) -> Result<()> {
    for subject in subjects {
        match subject {
            AggSubject::Post(uri) => {
                conn.prepare_cached(
                    "INSERT INTO post_agg (uri, like_count, repost_count, reply_count)
                     VALUES (
                         ?1,
                         (SELECT COUNT(*) FROM post_like WHERE subject = ?1),
                         (SELECT COUNT(*) FROM repost WHERE subject = ?1),
                         (SELECT COUNT(*) FROM post WHERE reply_parent = ?1)
                     )
                     ON CONFLICT(uri) DO UPDATE SET
                         like_count = excluded.like_count,
                         repost_count = excluded.repost_count,
                         reply_count = excluded.reply_count",
                )?
                .execute([uri])?;
            }
            AggSubject::Profile(did) => {
                conn.prepare_cached(
                    "INSERT INTO profile_agg (did, followers_count, follows_count, posts_count)
                     VALUES (
                         ?1,
                         (SELECT COUNT(*) FROM follow WHERE subject_did = ?1),
                         (SELECT COUNT(*) FROM follow WHERE creator = ?1),
                         (SELECT COUNT(*) FROM post WHERE creator = ?1)
                     )
                     ON CONFLICT(did) DO UPDATE SET
                         followers_count = excluded.followers_count,
                         follows_count = excluded.follows_count,
                         posts_count = excluded.posts_count",
                )?
                .execute([did])?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;

    fn like_count(conn: &Connection, uri: &str) -> i64 {
        conn.query_row("SELECT like_count FROM post_agg WHERE uri = ?", [uri], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_deltas_create_row_and_clamp_at_zero() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();
        let like = [Delta::new(Counter::Likes, "at://did:example:bob/p/1")];

        apply(conn, &like, 1).unwrap();
        apply(conn, &like, 1).unwrap();
        assert_eq!(like_count(conn, "at://did:example:bob/p/1"), 2);

        apply(conn, &like, -1).unwrap();
        apply(conn, &like, -1).unwrap();
        apply(conn, &like, -1).unwrap();
        assert_eq!(like_count(conn, "at://did:example:bob/p/1"), 0);
    }

    #[test]
    fn test_reconcile_overwrites_drifted_counts() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();
        conn.execute(
            "INSERT INTO follow (uri, cid, creator, subject_did, created_at, indexed_ms)
             VALUES ('at://did:example:a/f/1', 'c', 'did:example:a', 'did:example:b', '', 0)",
            [],
        )
        .unwrap();
        apply(conn, &[Delta::new(Counter::Followers, "did:example:b")], 1).unwrap();
        apply(conn, &[Delta::new(Counter::Followers, "did:example:b")], 1).unwrap();

        reconcile(conn, &[AggSubject::Profile("did:example:b".into())]).unwrap();

        let followers: i64 = conn
            .query_row(
                "SELECT followers_count FROM profile_agg WHERE did = 'did:example:b'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(followers, 1);
    }
}
