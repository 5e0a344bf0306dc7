//! # Event Log Writer with Group Commit
//!
//! Appends to the event log go through a single writer thread that collects
//! requests over a short window and commits them in one SQLite transaction,
//! each request inside its own SAVEPOINT.
//!
//! ```text
//! Without batching:                With batching:
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │ evt1 → BEGIN → COMMIT    │     │ BEGIN IMMEDIATE          │
//! │ evt2 → BEGIN → COMMIT    │     │   SAVEPOINT evt_0        │
//! │ evt3 → BEGIN → COMMIT    │     │   SAVEPOINT evt_1        │
//! │ ...                      │     │   SAVEPOINT evt_2        │
//! │ 100 fsyncs               │     │ COMMIT                   │
//! └──────────────────────────┘     │ 1 fsync                  │
//!                                  └──────────────────────────┘
//! ```
//!
//! ## Seq Assignment
//!
//! `repo_seq.seq` is an `AUTOINCREMENT` key assigned inside the write
//! transaction. Writers in other processes serialize on the same write lock,
//! so the order in which seqs become visible is the order in which they were
//! assigned, and a seq is never reused.
//!
//! ## After Commit
//!
//! Only once COMMIT returns are callers answered and live tails woken with the
//! highest committed seq. A tail never observes a seq that could still be
//! rolled back.

use std::time::{Duration, Instant};

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::codec::{compute_checksum, current_time_ms};
use crate::error::{Error, Result};
use crate::events::EventType;
use crate::subscription::SubscriptionManager;
use crate::types::{Did, Seq};

// =============================================================================
// Configuration
// =============================================================================

/// Default batch window in milliseconds.
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 5;

/// Default maximum number of appends per transaction.
pub const DEFAULT_BATCH_MAX_SIZE: usize = 500;

const REQUEST_CHANNEL_SIZE: usize = 4096;

/// Metadata key recording the lowest seq still guaranteed to be retained.
pub(crate) const TRIM_WATERMARK_KEY: &str = "seq_trimmed_before";

/// Configuration for the log writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum time to wait for more appends before committing.
    pub batch_timeout: Duration,

    /// Maximum appends per transaction.
    pub batch_max_size: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_timeout: Duration::from_millis(DEFAULT_BATCH_TIMEOUT_MS),
            batch_max_size: DEFAULT_BATCH_MAX_SIZE,
        }
    }
}

// =============================================================================
// Request Types
// =============================================================================

/// An event body ready to be appended.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub did: Did,
    pub event_type: EventType,
    pub payload: Vec<u8>,
}

/// A request sent to the writer thread.
pub enum WriteRequest {
    Append {
        event: PendingEvent,
        response: oneshot::Sender<Result<Seq>>,
    },

    /// Delete an account's events except the listed seqs.
    DeleteAllForUser {
        did: Did,
        keep: Vec<Seq>,
        response: oneshot::Sender<Result<usize>>,
    },

    /// Drop every event below a seq.
    TrimBefore {
        seq: Seq,
        response: oneshot::Sender<Result<usize>>,
    },

    Shutdown,
}

struct PendingAppend {
    event: PendingEvent,
    response: oneshot::Sender<Result<Seq>>,
}

// =============================================================================
// Log Writer
// =============================================================================

/// Owns the write connection to the event log. Runs on a dedicated thread;
/// use [`LogWriterHandle`] from async code.
pub struct LogWriter {
    conn: Connection,
    subscriptions: SubscriptionManager,
}

impl LogWriter {
    pub fn new(conn: Connection, subscriptions: SubscriptionManager) -> Self {
        Self {
            conn,
            subscriptions,
        }
    }

    /// Commits a batch and answers every caller.
    fn execute_batch(&mut self, batch: Vec<PendingAppend>) {
        if batch.is_empty() {
            return;
        }

        let (events, responses): (Vec<_>, Vec<_>) = batch
            .into_iter()
            .map(|pending| (pending.event, pending.response))
            .unzip();

        match self.execute_batch_inner(&events) {
            Ok(results) => {
                let head = results.iter().filter_map(|r| r.as_ref().ok()).max().copied();
                for (response, result) in responses.into_iter().zip(results) {
                    let _ = response.send(result);
                }
                if let Some(head) = head {
                    debug!(events = events.len(), head = %head, "event batch committed");
                    self.subscriptions.notify_committed(head);
                }
            }
            Err(e) => {
                error!(error = %e, events = events.len(), "event batch commit failed");
                let msg = format!("batch commit failed: {}", e);
                for response in responses {
                    let _ = response.send(Err(Error::Schema(msg.clone())));
                }
            }
        }
    }

    fn execute_batch_inner(&mut self, events: &[PendingEvent]) -> Result<Vec<Result<Seq>>> {
        self.conn.execute("BEGIN IMMEDIATE", [])?;

        let mut results = Vec::with_capacity(events.len());
        for (i, event) in events.iter().enumerate() {
            match self.append_in_savepoint(event, i) {
                Ok(result) => results.push(result),
                Err(e) => {
                    let _ = self.conn.execute("ROLLBACK", []);
                    return Err(e);
                }
            }
        }

        match self.conn.execute("COMMIT", []) {
            Ok(_) => Ok(results),
            Err(e) => {
                let _ = self.conn.execute("ROLLBACK", []);
                Err(e.into())
            }
        }
    }

    /// Appends one event inside its own SAVEPOINT.
    ///
    /// The outer `Result` fails the whole batch (savepoint bookkeeping broke);
    /// the inner one fails only this event.
    fn append_in_savepoint(&mut self, event: &PendingEvent, index: usize) -> Result<Result<Seq>> {
        let sp_name = format!("evt_{}", index);
        self.conn.execute(&format!("SAVEPOINT {}", sp_name), [])?;

        match self.insert_event(event) {
            Ok(seq) => {
                self.conn.execute(&format!("RELEASE {}", sp_name), [])?;
                Ok(Ok(seq))
            }
            Err(e) => {
                self.conn.execute(&format!("ROLLBACK TO {}", sp_name), [])?;
                self.conn.execute(&format!("RELEASE {}", sp_name), [])?;
                Ok(Err(e))
            }
        }
    }

    fn insert_event(&mut self, event: &PendingEvent) -> Result<Seq> {
        self.conn.execute(
            "INSERT INTO repo_seq (did, event_type, payload, checksum, sequenced_ms)
             VALUES (?, ?, ?, ?, ?)",
            params![
                event.did.as_str(),
                event.event_type.as_str(),
                event.payload.as_slice(),
                compute_checksum(&event.payload),
                current_time_ms() as i64
            ],
        )?;
        Ok(Seq::from_raw(self.conn.last_insert_rowid() as u64))
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    /// Deletes an account's events, keeping the listed seqs.
    ///
    /// Handled immediately rather than batched. Gaps left behind are legal.
    pub fn execute_delete_all_for_user(&mut self, did: &Did, keep: &[Seq]) -> Result<usize> {
        let deleted = if keep.is_empty() {
            self.conn
                .execute("DELETE FROM repo_seq WHERE did = ?", [did.as_str()])?
        } else {
            let placeholders = vec!["?"; keep.len()].join(", ");
            let sql = format!(
                "DELETE FROM repo_seq WHERE did = ? AND seq NOT IN ({})",
                placeholders
            );
            let mut values: Vec<rusqlite::types::Value> = vec![did.as_str().to_string().into()];
            values.extend(keep.iter().map(|seq| (seq.as_raw() as i64).into()));
            self.conn.execute(&sql, params_from_iter(values))?
        };
        info!(did = %did, deleted, "deleted account events");
        Ok(deleted)
    }

    /// Drops every event below `seq` and records the new watermark.
    pub fn execute_trim_before(&mut self, seq: Seq) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let current: Option<String> = tx
            .query_row(
                "SELECT value FROM repohost_metadata WHERE key = ?",
                [TRIM_WATERMARK_KEY],
                |row| row.get(0),
            )
            .optional()?;
        let watermark = current
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            .max(seq.as_raw());

        let deleted = tx.execute("DELETE FROM repo_seq WHERE seq < ?", [seq.as_raw() as i64])?;
        tx.execute(
            "INSERT INTO repohost_metadata (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![TRIM_WATERMARK_KEY, watermark.to_string()],
        )?;
        tx.commit()?;

        info!(before = %seq, deleted, "trimmed event log");
        Ok(deleted)
    }
}

// =============================================================================
// Writer Handle (Async Interface)
// =============================================================================

/// Async handle to the writer thread. Cheap to clone.
#[derive(Clone)]
pub struct LogWriterHandle {
    tx: mpsc::Sender<WriteRequest>,
}

impl LogWriterHandle {
    /// Appends one event, returning its seq once committed.
    pub async fn append(&self, event: PendingEvent) -> Result<Seq> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(WriteRequest::Append {
            event,
            response: response_tx,
        })
        .await?;
        recv(response_rx).await
    }

    pub async fn delete_all_for_user(&self, did: Did, keep: Vec<Seq>) -> Result<usize> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(WriteRequest::DeleteAllForUser {
            did,
            keep,
            response: response_tx,
        })
        .await?;
        recv(response_rx).await
    }

    pub async fn trim_before(&self, seq: Seq) -> Result<usize> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(WriteRequest::TrimBefore {
            seq,
            response: response_tx,
        })
        .await?;
        recv(response_rx).await
    }

    /// Flushes the pending batch and stops the writer thread.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(WriteRequest::Shutdown).await;
    }

    async fn send(&self, request: WriteRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| Error::Schema("writer has shut down".to_string()))
    }
}

async fn recv<T>(rx: oneshot::Receiver<Result<T>>) -> Result<T> {
    rx.await
        .map_err(|_| Error::Schema("writer dropped response".to_string()))?
}

// =============================================================================
// Writer Loop
// =============================================================================

/// Runs the writer loop until shutdown or until every handle is dropped.
pub async fn run_log_writer(
    mut writer: LogWriter,
    mut rx: mpsc::Receiver<WriteRequest>,
    config: WriterConfig,
) {
    let mut batch: Vec<PendingAppend> = Vec::new();
    let mut batch_start = Instant::now();

    loop {
        let request = if batch.is_empty() {
            rx.recv().await
        } else {
            let remaining = config.batch_timeout.saturating_sub(batch_start.elapsed());
            match timeout(remaining, rx.recv()).await {
                Ok(request) => request,
                Err(_) => {
                    writer.execute_batch(std::mem::take(&mut batch));
                    continue;
                }
            }
        };

        match request {
            Some(WriteRequest::Append { event, response }) => {
                if batch.is_empty() {
                    batch_start = Instant::now();
                }
                batch.push(PendingAppend { event, response });
                if batch.len() >= config.batch_max_size {
                    writer.execute_batch(std::mem::take(&mut batch));
                }
            }
            Some(WriteRequest::DeleteAllForUser {
                did,
                keep,
                response,
            }) => {
                // Appends queued before the delete must land first.
                writer.execute_batch(std::mem::take(&mut batch));
                let _ = response.send(writer.execute_delete_all_for_user(&did, &keep));
            }
            Some(WriteRequest::TrimBefore { seq, response }) => {
                writer.execute_batch(std::mem::take(&mut batch));
                let _ = response.send(writer.execute_trim_before(seq));
            }
            Some(WriteRequest::Shutdown) | None => {
                writer.execute_batch(std::mem::take(&mut batch));
                break;
            }
        }
    }

    debug!("log writer stopped");
}

/// Spawns the writer on a dedicated thread with its own runtime.
pub fn spawn_log_writer(
    conn: Connection,
    subscriptions: SubscriptionManager,
    config: WriterConfig,
) -> Result<LogWriterHandle> {
    let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
    let writer = LogWriter::new(conn, subscriptions);

    std::thread::Builder::new()
        .name("repohost-seq-writer".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!(error = %e, "failed to build writer runtime");
                    return;
                }
            };
            rt.block_on(run_log_writer(writer, rx, config));
        })?;

    Ok(LogWriterHandle { tx })
}

// =============================================================================
// Tests
// =============================================================================
