//! # Error Handling for repohost
//!
//! A single error enum ([`Error`]) covers every failure mode of the store, the
//! sequencer, the dispatch queue and the indexer. Callers match on the variant
//! to decide whether to retry, degrade, or give up.
//!
//! ## Rust Pattern: thiserror
//!
//! `thiserror` derives `Display` from the `#[error(...)]` attributes and
//! `From` conversions from `#[from]`, so `?` lifts `rusqlite` and `serde_json`
//! errors into [`Error`] without glue code.
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Terminal | `NotFound` | Surface to caller, never retried |
//! | Concurrency | `Misordered` | Re-read the head and retry the write |
//! | Degradable | `CorruptChain`, `Unprocessable`, `UnknownEventKind` | Fall back to partial handling, keep the log moving |
//! | Per-record | `ValidationFailed` | Skip the record, continue the batch |
//! | Collision | `DuplicateConflict` | Surface to caller, never overwrite |
//! | Cursor | `OutdatedCursor` | Run a full backfill, resume at head |
//! | Internal | `Sqlite`, `Json`, `Io`, `Schema`, `QueueClosed` | Log and investigate |

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in repohost operations.
///
/// # Example
///
/// ```rust,ignore
/// use repohost::{Error, Result};
///
/// fn write_with_retry() -> Result<()> {
///     loop {
///         match try_write() {
///             Err(e) if e.is_retryable() => continue,
///             other => return other,
///         }
///     }
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Store Errors
    // =========================================================================

    /// An account, commit, record or actor does not exist.
    ///
    /// Also returned for subjects hidden by a takedown, so that readers cannot
    /// distinguish "taken down" from "never existed".
    #[error("not found: {0}")]
    NotFound(String),

    /// The root compare-and-swap lost a race.
    ///
    /// # When This Happens
    ///
    /// `commit_staged` is given the head the caller believes is current. If
    /// another writer swapped the root in between, the conditional update
    /// touches zero rows and the whole commit transaction is rolled back.
    ///
    /// # Recovery
    ///
    /// 1. Re-read the head
    /// 2. Re-format the commit on top of it
    /// 3. Retry (bounded)
    #[error("misordered write for {did}: expected head {expected}, found {actual}")]
    Misordered {
        /// The account being written
        did: String,
        /// The head the writer believed was current
        expected: String,
        /// The head actually stored
        actual: String,
    },

    /// A commit chain references a commit or block that is not stored.
    ///
    /// Fatal for the export or walk that hit it; other accounts are unaffected.
    #[error("corrupt commit chain for {did}: {reason}")]
    CorruptChain {
        /// The account whose chain is broken
        did: String,
        /// What was missing
        reason: String,
    },

    /// Inserting this key would collide with an existing, different entry.
    #[error("duplicate conflict: {0}")]
    DuplicateConflict(String),

    // =========================================================================
    // Consumer-Side Errors (contained to one event or record)
    // =========================================================================

    /// An event payload or block container could not be decoded.
    ///
    /// The envelope (seq, did, kind) is still usable; consumers degrade to a
    /// minimal action rather than stalling the log.
    #[error("unprocessable payload: {0}")]
    Unprocessable(String),

    /// The event kind is not one of the closed set the decoder knows.
    #[error("unknown event kind '{0}'")]
    UnknownEventKind(String),

    /// A record value does not match the shape its collection requires.
    #[error("validation failed for {uri}: {reason}")]
    ValidationFailed {
        /// The record that failed
        uri: String,
        /// Why it failed
        reason: String,
    },

    /// A tail cursor points before the earliest retained event.
    ///
    /// # Recovery
    ///
    /// The consumer cannot replay what was trimmed. It runs a full backfill
    /// from the repository store and resumes from the current head.
    #[error("cursor {requested} is older than the earliest retained event {earliest}")]
    OutdatedCursor {
        /// The cursor the consumer asked for
        requested: u64,
        /// The earliest seq still in the log
        earliest: u64,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================

    /// The dispatch queue has been destroyed and no longer accepts messages.
    #[error("dispatch queue is closed")]
    QueueClosed,

    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Writing an export to its sink failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Schema mismatch, closed channel, poisoned lock or similar fault.
    #[error("schema error: {0}")]
    Schema(String),
}

impl Error {
    /// Returns true if the operation can be retried after re-reading state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Misordered { .. })
    }

    /// Shorthand for building a [`Error::NotFound`].
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Error::NotFound(what.to_string())
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
