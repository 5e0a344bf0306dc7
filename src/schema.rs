//! # SQLite Schema for repohost
//!
//! This module defines every table and handles initialization. Each table is
//! owned by exactly one component; components may share one database file or
//! live in separate files.
//!
//! ## Table Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │ Repository Store                                                         │
//! │   repo_root ──head──► repo_commit_history ──prev──► repo_commit_history  │
//! │                            │                                             │
//! │                            └──► repo_commit_block ──► ipld_block         │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │ Event Sequencer           │ Dispatch Queue                               │
//! │   repo_seq (seq, did,     │   message_queue (id, topic, payload)         │
//! │     event_type, payload)  │   message_queue_cursor (consumer, cursor)    │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │ Indexer (derived, rebuildable)                                           │
//! │   record ◄── duplicate_record                                            │
//! │   post, post_like, repost, follow, profile                               │
//! │   post_agg, profile_agg, notification                                    │
//! │   actor, actor_sync, subscription_cursor                                 │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### Why `(creator, cid)` as the block key?
//!
//! Content addressing would allow one row per hash, but reads are scoped per
//! creator so that one account can never observe another account's blocks
//! through its own repository. Identical payloads across creators cost one row
//! each; identical payloads within a creator are stored once.
//!
//! ### Why unique constraints on the collapsible tables?
//!
//! `post_like`, `repost` and `follow` carry `UNIQUE(creator, subject)`. The
//! database, not application code, decides which record of a collapse-group
//! owns the canonical row, so concurrent indexers in different processes
//! converge without locks.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
const SCHEMA_VERSION: i32 = 1;

/// How long a connection waits on another writer's lock before failing.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Repository Store Tables
// =============================================================================

/// The single mutable pointer per account.
///
/// Only ever changed by a conditional update that names the previous head.
const CREATE_REPO_ROOT: &str = r#"
CREATE TABLE IF NOT EXISTS repo_root (
    did         TEXT PRIMARY KEY,
    cid         TEXT NOT NULL,
    rev         TEXT NOT NULL,
    updated_ms  INTEGER NOT NULL
)
"#;

/// Immutable blocks, scoped per creator.
const CREATE_IPLD_BLOCK: &str = r#"
CREATE TABLE IF NOT EXISTS ipld_block (
    creator     TEXT NOT NULL,
    cid         TEXT NOT NULL,
    repo_rev    TEXT NOT NULL,
    size        INTEGER NOT NULL,
    content     BLOB NOT NULL,
    PRIMARY KEY (creator, cid)
)
"#;

const CREATE_IPLD_BLOCK_REV_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS ipld_block_repo_rev_idx
    ON ipld_block (creator, repo_rev, cid)
"#;

/// Parent edges of each account's commit chain.
///
/// `prev` is NULL for the first commit. One row per commit, inserted in the
/// same transaction as the root swap that made it the head.
const CREATE_REPO_COMMIT_HISTORY: &str = r#"
CREATE TABLE IF NOT EXISTS repo_commit_history (
    creator     TEXT NOT NULL,
    commit_cid  TEXT NOT NULL,
    prev        TEXT,
    rev         TEXT NOT NULL,
    PRIMARY KEY (creator, commit_cid)
)
"#;

/// Which blocks each commit introduced.
const CREATE_REPO_COMMIT_BLOCK: &str = r#"
CREATE TABLE IF NOT EXISTS repo_commit_block (
    creator     TEXT NOT NULL,
    commit_cid  TEXT NOT NULL,
    block       TEXT NOT NULL,
    PRIMARY KEY (creator, commit_cid, block)
)
"#;

// =============================================================================
// Event Sequencer Tables
// =============================================================================

/// The ordered event log.
///
/// `AUTOINCREMENT` guarantees a seq is never reused, even after the rows
/// holding the highest values are deleted.
const CREATE_REPO_SEQ: &str = r#"
CREATE TABLE IF NOT EXISTS repo_seq (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    did           TEXT NOT NULL,
    event_type    TEXT NOT NULL,
    payload       BLOB NOT NULL,
    checksum      INTEGER NOT NULL,
    sequenced_ms  INTEGER NOT NULL
)
"#;

const CREATE_REPO_SEQ_DID_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS repo_seq_did_idx ON repo_seq (did)
"#;

// =============================================================================
// Dispatch Queue Tables
// =============================================================================

const CREATE_MESSAGE_QUEUE: &str = r#"
CREATE TABLE IF NOT EXISTS message_queue (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    topic       TEXT NOT NULL,
    payload     BLOB NOT NULL,
    created_ms  INTEGER NOT NULL
)
"#;

/// Next message id each named consumer will handle.
const CREATE_MESSAGE_QUEUE_CURSOR: &str = r#"
CREATE TABLE IF NOT EXISTS message_queue_cursor (
    consumer    TEXT PRIMARY KEY,
    cursor      INTEGER NOT NULL
)
"#;

// =============================================================================
// Indexer Tables
// =============================================================================

const CREATE_RECORD: &str = r#"
CREATE TABLE IF NOT EXISTS record (
    uri           TEXT PRIMARY KEY,
    cid           TEXT NOT NULL,
    did           TEXT NOT NULL,
    collection    TEXT NOT NULL,
    json          TEXT NOT NULL,
    indexed_ms    INTEGER NOT NULL,
    takedown_ref  TEXT
)
"#;

const CREATE_RECORD_DID_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS record_did_idx ON record (did)
"#;

/// Records that lost their collapse-group to an older canonical record.
const CREATE_DUPLICATE_RECORD: &str = r#"
CREATE TABLE IF NOT EXISTS duplicate_record (
    uri           TEXT PRIMARY KEY,
    cid           TEXT NOT NULL,
    duplicate_of  TEXT NOT NULL,
    indexed_ms    INTEGER NOT NULL
)
"#;

const CREATE_DUPLICATE_RECORD_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS duplicate_record_of_idx
    ON duplicate_record (duplicate_of, indexed_ms)
"#;

const CREATE_POST: &str = r#"
CREATE TABLE IF NOT EXISTS post (
    uri           TEXT PRIMARY KEY,
    cid           TEXT NOT NULL,
    creator       TEXT NOT NULL,
    text          TEXT NOT NULL,
    reply_root    TEXT,
    reply_parent  TEXT,
    created_at    TEXT NOT NULL,
    indexed_ms    INTEGER NOT NULL
)
"#;

const CREATE_POST_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS post_creator_idx ON post (creator);
CREATE INDEX IF NOT EXISTS post_reply_parent_idx ON post (reply_parent);
"#;

const CREATE_POST_LIKE: &str = r#"
CREATE TABLE IF NOT EXISTS post_like (
    uri           TEXT PRIMARY KEY,
    cid           TEXT NOT NULL,
    creator       TEXT NOT NULL,
    subject       TEXT NOT NULL,
    subject_cid   TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    indexed_ms    INTEGER NOT NULL,
    UNIQUE (creator, subject)
)
"#;

const CREATE_REPOST: &str = r#"
CREATE TABLE IF NOT EXISTS repost (
    uri           TEXT PRIMARY KEY,
    cid           TEXT NOT NULL,
    creator       TEXT NOT NULL,
    subject       TEXT NOT NULL,
    subject_cid   TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    indexed_ms    INTEGER NOT NULL,
    UNIQUE (creator, subject)
)
"#;

const CREATE_FOLLOW: &str = r#"
CREATE TABLE IF NOT EXISTS follow (
    uri           TEXT PRIMARY KEY,
    cid           TEXT NOT NULL,
    creator       TEXT NOT NULL,
    subject_did   TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    indexed_ms    INTEGER NOT NULL,
    UNIQUE (creator, subject_did)
)
"#;

const CREATE_PROFILE: &str = r#"
CREATE TABLE IF NOT EXISTS profile (
    uri           TEXT PRIMARY KEY,
    cid           TEXT NOT NULL,
    creator       TEXT NOT NULL UNIQUE,
    display_name  TEXT,
    description   TEXT,
    indexed_ms    INTEGER NOT NULL
)
"#;

const CREATE_POST_AGG: &str = r#"
CREATE TABLE IF NOT EXISTS post_agg (
    uri           TEXT PRIMARY KEY,
    like_count    INTEGER NOT NULL DEFAULT 0,
    repost_count  INTEGER NOT NULL DEFAULT 0,
    reply_count   INTEGER NOT NULL DEFAULT 0
)
"#;

const CREATE_PROFILE_AGG: &str = r#"
CREATE TABLE IF NOT EXISTS profile_agg (
    did              TEXT PRIMARY KEY,
    followers_count  INTEGER NOT NULL DEFAULT 0,
    follows_count    INTEGER NOT NULL DEFAULT 0,
    posts_count      INTEGER NOT NULL DEFAULT 0
)
"#;

const CREATE_NOTIFICATION: &str = r#"
CREATE TABLE IF NOT EXISTS notification (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    did             TEXT NOT NULL,
    author          TEXT NOT NULL,
    record_uri      TEXT NOT NULL,
    record_cid      TEXT NOT NULL,
    reason          TEXT NOT NULL,
    reason_subject  TEXT,
    sort_ms         INTEGER NOT NULL
)
"#;

const CREATE_NOTIFICATION_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS notification_did_idx ON notification (did, sort_ms);
CREATE INDEX IF NOT EXISTS notification_record_idx ON notification (record_uri);
"#;

/// `handle` is UNIQUE but nullable: contention clears the loser to NULL.
const CREATE_ACTOR: &str = r#"
CREATE TABLE IF NOT EXISTS actor (
    did              TEXT PRIMARY KEY,
    handle           TEXT UNIQUE,
    indexed_ms       INTEGER NOT NULL,
    upstream_status  TEXT,
    takedown_ref     TEXT
)
"#;

const CREATE_ACTOR_SYNC: &str = r#"
CREATE TABLE IF NOT EXISTS actor_sync (
    did          TEXT PRIMARY KEY,
    commit_cid   TEXT NOT NULL,
    repo_rev     TEXT NOT NULL,
    synced_ms    INTEGER NOT NULL
)
"#;

/// Last event-log seq each indexing service durably handed to its queue.
const CREATE_SUBSCRIPTION_CURSOR: &str = r#"
CREATE TABLE IF NOT EXISTS subscription_cursor (
    service     TEXT PRIMARY KEY,
    cursor      INTEGER NOT NULL
)
"#;

// =============================================================================
// Metadata
// =============================================================================

const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS repohost_metadata (
    key    TEXT PRIMARY KEY,
    value  TEXT NOT NULL
)
"#;

const ALL_TABLES: &[&str] = &[
    CREATE_METADATA,
    CREATE_REPO_ROOT,
    CREATE_IPLD_BLOCK,
    CREATE_IPLD_BLOCK_REV_INDEX,
    CREATE_REPO_COMMIT_HISTORY,
    CREATE_REPO_COMMIT_BLOCK,
    CREATE_REPO_SEQ,
    CREATE_REPO_SEQ_DID_INDEX,
    CREATE_MESSAGE_QUEUE,
    CREATE_MESSAGE_QUEUE_CURSOR,
    CREATE_RECORD,
    CREATE_RECORD_DID_INDEX,
    CREATE_DUPLICATE_RECORD,
    CREATE_DUPLICATE_RECORD_INDEX,
    CREATE_POST,
    CREATE_POST_INDEXES,
    CREATE_POST_LIKE,
    CREATE_REPOST,
    CREATE_FOLLOW,
    CREATE_PROFILE,
    CREATE_POST_AGG,
    CREATE_PROFILE_AGG,
    CREATE_NOTIFICATION,
    CREATE_NOTIFICATION_INDEXES,
    CREATE_ACTOR,
    CREATE_ACTOR_SYNC,
    CREATE_SUBSCRIPTION_CURSOR,
];

// =============================================================================
// Database
// =============================================================================

/// An initialized SQLite database.
///
/// Opening is idempotent: every table is created with `IF NOT EXISTS`, so any
/// number of connections (or processes) may open the same file.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use repohost::Database;
    ///
    /// let db = Database::open("host.db")?;
    /// # Ok::<(), repohost::Error>(())
    /// ```
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database for testing.
    ///
    /// In-memory databases are private to one connection, so components that
    /// need their own connections must use a file instead.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&mut self) -> Result<()> {
        // Concurrent writers (other connections, other processes) queue on
        // the lock for up to this long instead of failing with SQLITE_BUSY.
        self.conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;

        // WAL: readers never block the writer and vice versa.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        self.conn.execute_batch("PRAGMA foreign_keys = ON")?;

        for ddl in ALL_TABLES {
            self.conn.execute_batch(ddl)?;
        }

        self.verify_or_set_version()
    }

    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<String> = match self.conn.query_row(
            "SELECT value FROM repohost_metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        ) {
            Ok(v) => Some(v),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };

        match existing {
            None => {
                self.conn.execute(
                    "INSERT OR IGNORE INTO repohost_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
                Ok(())
            }
            Some(v) if v.parse::<i32>().ok() == Some(SCHEMA_VERSION) => Ok(()),
            Some(v) => Err(Error::Schema(format!(
                "schema version mismatch: database has {}, expected {}",
                v, SCHEMA_VERSION
            ))),
        }
    }

    /// Returns a reference to the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Consumes the database, returning the connection.
    ///
    /// Used to hand ownership to a component (store, writer thread, queue).
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

// =============================================================================
// Shared Connections
// =============================================================================

/// A connection shared between async tasks.
///
/// SQLite calls block, so async code runs them through [`with_connection`]
/// on the blocking pool rather than on a runtime worker.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Wraps a connection for sharing.
pub fn share(conn: Connection) -> SharedConnection {
    Arc::new(Mutex::new(conn))
}

/// Locks a shared connection from synchronous code.
pub fn lock_connection(conn: &SharedConnection) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| Error::Schema("connection lock poisoned".to_string()))
}

/// Runs `f` against a shared connection on the blocking pool.
pub async fn with_connection<T, F>(conn: &SharedConnection, f: F) -> Result<T>
where
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let conn = conn.clone();
    tokio::task::spawn_blocking(move || {
        let mut guard = lock_connection(&conn)?;
        f(&mut guard)
    })
    .await
    .map_err(|e| Error::Schema(format!("blocking task failed: {}", e)))?
}

// =============================================================================
// Tests
// =============================================================================
