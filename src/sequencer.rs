//! # Event Sequencer
//!
//! Turns every accepted repository mutation or account lifecycle change into
//! exactly one row of the globally ordered event log, and serves that log to
//! consumers as a resumable tail.
//!
//! ```text
//!   sequence_commit / sequence_evt           tail(from)
//!              │                                 ▲
//!              ▼                                 │
//!   ┌────────────────────┐  notify(seq)  ┌───────┴────────┐
//!   │ writer thread      │──────────────►│ EventTail      │
//!   │ (group commit)     │               │ catch-up+live  │
//!   └─────────┬──────────┘               └───────┬────────┘
//!             │ INSERT                           │ SELECT
//!             ▼                                  ▼
//!           ┌──────────────── repo_seq ─────────────┐
//!           └───────────────────────────────────────┘
//! ```
//!
//! A consumer's progress is its last processed seq. Resuming from `N + 1`
//! sees every later event at least once, so consumers must be idempotent.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::events::{AccountEvt, AccountStatus, CommitEvt, IdentityEvt, SeqEvt, SeqRow, TombstoneEvt};
use crate::reader;
use crate::schema::{share, with_connection, Database, SharedConnection};
use crate::subscription::{
    EventTail, SubscriptionManager, DEFAULT_BROADCAST_CAPACITY, DEFAULT_CATCHUP_BATCH_SIZE,
    DEFAULT_POLL_INTERVAL_MS,
};
use crate::types::{CommitData, Did, Seq};
use crate::writer::{
    spawn_log_writer, LogWriterHandle, PendingEvent, WriterConfig, DEFAULT_BATCH_MAX_SIZE,
    DEFAULT_BATCH_TIMEOUT_MS,
};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for a [`Sequencer`].
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Group-commit window of the writer thread.
    pub batch_timeout: Duration,
    /// Maximum appends per transaction.
    pub batch_max_size: usize,
    /// Capacity of the commit wake-up channel.
    pub broadcast_capacity: usize,
    /// Page size of catch-up reads.
    pub catchup_batch_size: usize,
    /// How often a live tail re-reads the log without a wake-up.
    pub poll_interval: Duration,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            batch_timeout: Duration::from_millis(DEFAULT_BATCH_TIMEOUT_MS),
            batch_max_size: DEFAULT_BATCH_MAX_SIZE,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
            catchup_batch_size: DEFAULT_CATCHUP_BATCH_SIZE,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

// =============================================================================
// Sequencer
// =============================================================================

/// Handle to the event log. Cheap to clone; clones share the writer thread.
///
/// # Example
///
/// ```rust,ignore
/// let sequencer = Sequencer::open("host.db", SequencerConfig::default())?;
/// let seq = sequencer.sequence_commit(&did, &commit).await?;
///
/// let mut tail = sequencer.tail(seq).await?;
/// let row = tail.next().await;
/// ```
#[derive(Clone)]
pub struct Sequencer {
    writer: LogWriterHandle,
    subscriptions: SubscriptionManager,
    read_conn: SharedConnection,
    config: SequencerConfig,
}

impl Sequencer {
    /// Opens the log in a database file, starting the writer thread.
    ///
    /// The writer and readers use separate connections, so the file must not
    /// be `:memory:`.
    pub fn open(path: impl AsRef<Path>, config: SequencerConfig) -> Result<Self> {
        let path = path.as_ref();
        let write_conn = Database::open(path)?.into_connection();
        let read_conn = Database::open(path)?.into_connection();

        let subscriptions = SubscriptionManager::new(config.broadcast_capacity);
        let writer = spawn_log_writer(
            write_conn,
            subscriptions.clone(),
            WriterConfig {
                batch_timeout: config.batch_timeout,
                batch_max_size: config.batch_max_size,
            },
        )?;

        info!(path = %path.display(), "sequencer opened");
        Ok(Self {
            writer,
            subscriptions,
            read_conn: share(read_conn),
            config,
        })
    }

    // =========================================================================
    // Appends
    // =========================================================================

    /// Formats and appends the event for a commit that has been stored.
    pub async fn sequence_commit(&self, did: &Did, commit: &CommitData) -> Result<Seq> {
        let evt = CommitEvt::from_commit(did, commit)?;
        if evt.too_big {
            debug!(did = %did, ops = commit.ops.len(), "commit sequenced without blocks");
        }
        self.sequence_evt(SeqEvt::Commit(evt)).await
    }

    /// Appends any event.
    pub async fn sequence_evt(&self, evt: SeqEvt) -> Result<Seq> {
        let payload = evt.encode_payload()?;
        let seq = self
            .writer
            .append(PendingEvent {
                did: evt.did().clone(),
                event_type: evt.event_type(),
                payload,
            })
            .await?;
        debug!(did = %evt.did(), kind = %evt.event_type(), seq = %seq, "event sequenced");
        Ok(seq)
    }

    pub async fn sequence_identity(&self, did: &Did, handle: Option<String>) -> Result<Seq> {
        self.sequence_evt(SeqEvt::Identity(IdentityEvt {
            did: did.clone(),
            handle,
        }))
        .await
    }

    pub async fn sequence_account(
        &self,
        did: &Did,
        active: bool,
        status: Option<AccountStatus>,
    ) -> Result<Seq> {
        self.sequence_evt(SeqEvt::Account(AccountEvt {
            did: did.clone(),
            active,
            status,
        }))
        .await
    }

    pub async fn sequence_tombstone(&self, did: &Did) -> Result<Seq> {
        self.sequence_evt(SeqEvt::Tombstone(TombstoneEvt { did: did.clone() }))
            .await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Opens a tail delivering every event with `seq >= from`.
    ///
    /// # Errors
    ///
    /// `Error::OutdatedCursor` if events at or after `from` have been trimmed.
    /// The same error ends a tail that falls behind a later trim.
    pub async fn tail(&self, from: Seq) -> Result<EventTail> {
        // Subscribe before checking, so nothing committed in between is missed.
        let receiver = self.subscriptions.subscribe();
        with_connection(&self.read_conn, move |conn| check_cursor(conn, from)).await?;

        let conn = self.read_conn.clone();
        Ok(EventTail::new(
            from,
            receiver,
            move |from, limit| {
                let conn = conn.clone();
                async move {
                    with_connection(&conn, move |conn| {
                        check_cursor(conn, from)?;
                        reader::read_events(conn, from, limit)
                    })
                    .await
                }
            },
            self.config.catchup_batch_size,
            self.config.poll_interval,
        ))
    }

    /// Reads a page of the log.
    pub async fn read_events(&self, from: Seq, limit: usize) -> Result<Vec<SeqRow>> {
        with_connection(&self.read_conn, move |conn| reader::read_events(conn, from, limit)).await
    }

    /// Highest seq ever assigned.
    pub async fn current_seq(&self) -> Result<Option<Seq>> {
        with_connection(&self.read_conn, |conn| reader::current_seq(conn)).await
    }

    /// Lowest seq still stored.
    pub async fn earliest_seq(&self) -> Result<Option<Seq>> {
        with_connection(&self.read_conn, |conn| reader::earliest_seq(conn)).await
    }

    // =========================================================================
    // Retention
    // =========================================================================

    /// Deletes an account's events except `keep`.
    pub async fn delete_all_for_user(&self, did: &Did, keep: Vec<Seq>) -> Result<usize> {
        self.writer.delete_all_for_user(did.clone(), keep).await
    }

    /// Drops every event below `seq`. Tails older than it become outdated.
    pub async fn trim_before(&self, seq: Seq) -> Result<usize> {
        self.writer.trim_before(seq).await
    }

    /// Flushes pending appends and stops the writer thread.
    pub async fn shutdown(&self) {
        self.writer.shutdown().await;
    }
}

fn check_cursor(conn: &rusqlite::Connection, from: Seq) -> Result<()> {
    let retained = reader::retained_from(conn)?;
    if from < retained {
        return Err(Error::OutdatedCursor {
            requested: from.as_raw(),
            earliest: retained.as_raw(),
        });
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
