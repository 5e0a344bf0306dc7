//! # Repo Subscription
//!
//! Feeds the event log into the indexer through the dispatch queue.
//!
//! ```text
//!   Sequencer.tail(cursor + 1)
//!        │ SeqRow
//!        ▼
//!   partition_topic(did) = "repo/<xxh3(did) % partitions>"
//!        │ queue.send(topic, row)          subscription_cursor = row.seq
//!        ▼
//!   DispatchQueue ── lane "repo/0" ──► process_row ──► IndexingService
//!                 ── lane "repo/1" ──► process_row ──► IndexingService
//!                 ...
//! ```
//!
//! One account always maps to the same partition, so its events are indexed
//! in log order while different accounts proceed in parallel.
//!
//! The persisted cursor is the last seq durably handed to the queue. If the
//! log has been trimmed past it, the subscription backfills every repository
//! from the store and resumes at the log head.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use super::IndexingService;
use crate::error::{Error, Result};
use crate::events::{AccountStatus, CommitEvt, SeqEvt, SeqRow};
use crate::queue::{handler, DispatchQueue};
use crate::schema::with_connection;
use crate::sequencer::Sequencer;
use crate::types::{BlockMap, Cid, Did, RecordOp, Seq, WriteOpAction};

// =============================================================================
// Configuration
// =============================================================================

pub const DEFAULT_SERVICE: &str = "indexer";

pub const DEFAULT_PARTITIONS: usize = 16;

/// Pause before re-opening a tail after an error.
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Key of the persisted cursor.
    pub service: String,
    /// Number of `repo/<n>` topics.
    pub partitions: usize,
    pub retry_interval: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            service: DEFAULT_SERVICE.to_string(),
            partitions: DEFAULT_PARTITIONS,
            retry_interval: Duration::from_millis(DEFAULT_RETRY_INTERVAL_MS),
        }
    }
}

/// The dispatch topic carrying an account's events.
pub fn partition_topic(did: &Did, partitions: usize) -> String {
    let partition = xxh3_64(did.as_str().as_bytes()) % partitions.max(1) as u64;
    format!("repo/{}", partition)
}

// =============================================================================
// Event Handling
// =============================================================================

/// Applies one log row to the index.
///
/// A body that cannot be decoded still tells us the account exists, so it
/// degrades to an unforced handle refresh instead of failing.
pub async fn process_row(indexer: &IndexingService, row: &SeqRow) -> Result<()> {
    let evt = match row.decode() {
        Ok(evt) => evt,
        Err(e) => {
            warn!(seq = %row.seq, did = %row.did, kind = %row.event_type, error = %e, "undecodable event body");
            return indexer.index_handle(&row.did, row.sequenced_ms, false).await;
        }
    };

    match evt {
        SeqEvt::Commit(commit) => index_commit(indexer, &commit).await,
        SeqEvt::Identity(identity) => {
            indexer.index_handle(&identity.did, row.sequenced_ms, true).await
        }
        SeqEvt::Account(account) => match (account.active, account.status) {
            (false, Some(AccountStatus::Deleted)) => {
                indexer.delete_actor(&account.did).await.map(|_| ())
            }
            (active, status) => indexer.update_actor_status(&account.did, active, status).await,
        },
        SeqEvt::Tombstone(tombstone) => indexer.delete_actor(&tombstone.did).await.map(|_| ()),
    }
}

async fn index_commit(indexer: &IndexingService, evt: &CommitEvt) -> Result<()> {
    let did = &evt.repo;
    if evt.too_big {
        debug!(did = %did, commit = %evt.commit, "commit too big to ship, resyncing repo");
        indexer.index_repo(did, Some(evt.commit)).await?;
    } else {
        match evt.decode_blocks() {
            Ok(blocks) => index_ops(indexer, evt, &blocks).await,
            Err(e) => {
                warn!(did = %did, commit = %evt.commit, error = %e, "commit blocks undecodable");
                return indexer.index_handle(did, evt.time, false).await;
            }
        }
    }
    indexer.set_commit_last_seen(did, &evt.commit, &evt.rev).await?;
    indexer.index_handle(did, evt.time, false).await
}

/// Indexes each op of a commit. A bad record is logged and skipped.
async fn index_ops(indexer: &IndexingService, evt: &CommitEvt, blocks: &BlockMap) {
    for op in &evt.ops {
        let uri = match op.uri(&evt.repo) {
            Ok(uri) => uri,
            Err(e) => {
                warn!(did = %evt.repo, path = %op.path, error = %e, "skipping malformed op");
                continue;
            }
        };
        let result = match op.action {
            WriteOpAction::Delete => indexer.delete_record(&uri, true).await.map(|_| ()),
            action => match record_value(op, blocks) {
                Ok((cid, value)) => indexer.index_record(&uri, &cid, value, action, evt.time).await,
                Err(e) => Err(e),
            },
        };
        match result {
            Ok(()) => {}
            Err(e @ (Error::ValidationFailed { .. } | Error::Unprocessable(_))) => {
                warn!(did = %evt.repo, commit = %evt.commit, uri = %uri, error = %e, "skipping indexing of invalid record");
            }
            Err(e) => {
                error!(did = %evt.repo, commit = %evt.commit, uri = %uri, error = %e, "skipping indexing due to error processing record");
            }
        }
    }
}

fn record_value(op: &RecordOp, blocks: &BlockMap) -> Result<(Cid, Value)> {
    let cid = op
        .cid
        .ok_or_else(|| Error::Unprocessable(format!("{:?} op on {} has no cid", op.action, op.path)))?;
    let bytes = blocks
        .get(&cid)
        .ok_or_else(|| Error::Unprocessable(format!("record block {} missing from commit", cid)))?;
    let value = serde_json::from_slice(bytes)
        .map_err(|e| Error::Unprocessable(format!("record block {}: {}", cid, e)))?;
    Ok((cid, value))
}

// =============================================================================
// Subscription
// =============================================================================

struct SubscriptionInner {
    sequencer: Sequencer,
    queue: DispatchQueue,
    indexer: IndexingService,
    config: SubscriptionConfig,
}

/// A running log → queue → indexer pipeline.
pub struct RepoSubscription {
    inner: Arc<SubscriptionInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RepoSubscription {
    /// Registers one indexing handler per partition, starts the queue's
    /// dispatcher and starts tailing.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start(
        sequencer: Sequencer,
        queue: DispatchQueue,
        indexer: IndexingService,
        config: SubscriptionConfig,
    ) -> Self {
        for partition in 0..config.partitions.max(1) {
            let indexer = indexer.clone();
            queue.listen(
                format!("repo/{}", partition),
                handler(move |msg| {
                    let indexer = indexer.clone();
                    async move {
                        let row: SeqRow = serde_json::from_slice(&msg.payload)?;
                        process_row(&indexer, &row).await
                    }
                }),
            );
        }
        queue.start();

        let inner = Arc::new(SubscriptionInner {
            sequencer,
            queue,
            indexer,
            config,
        });
        let task = tokio::spawn(run(inner.clone()));
        info!(service = %inner.config.service, partitions = inner.config.partitions, "repo subscription started");
        Self {
            inner,
            task: Mutex::new(Some(task)),
        }
    }

    /// The last seq handed to the queue.
    pub async fn cursor(&self) -> Result<Option<Seq>> {
        load_cursor(&self.inner).await
    }

    /// Stops tailing. Messages already queued are still delivered.
    pub fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.abort();
            info!(service = %self.inner.config.service, "repo subscription stopped");
        }
    }
}

impl Drop for RepoSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(inner: Arc<SubscriptionInner>) {
    loop {
        match tail_once(&inner).await {
            Err(Error::OutdatedCursor { requested, earliest }) => {
                warn!(requested, earliest, "cursor outdated, backfilling all repos");
                if let Err(e) = backfill(&inner, earliest).await {
                    error!(error = %e, "backfill failed");
                    tokio::time::sleep(inner.config.retry_interval).await;
                }
            }
            Err(Error::QueueClosed) => {
                debug!("dispatch queue closed, subscription ending");
                return;
            }
            Err(e) => {
                error!(error = %e, "repo subscription error");
                tokio::time::sleep(inner.config.retry_interval).await;
            }
            Ok(()) => tokio::time::sleep(inner.config.retry_interval).await,
        }
    }
}

/// Tails from the persisted cursor until an error ends the tail.
async fn tail_once(inner: &SubscriptionInner) -> Result<()> {
    let from = load_cursor(inner).await?.map_or(Seq::FIRST, |seq| seq.next());
    let mut tail = inner.sequencer.tail(from).await?;

    while let Some(row) = tail.next().await {
        let row = row?;
        let topic = partition_topic(&row.did, inner.config.partitions);
        inner.queue.send(topic, serde_json::to_vec(&row)?).await?;
        store_cursor(inner, row.seq.as_raw()).await?;
    }
    Ok(())
}

async fn backfill(inner: &SubscriptionInner, earliest: u64) -> Result<()> {
    let head = inner.sequencer.current_seq().await?.map_or(0, |seq| seq.as_raw());
    inner.indexer.index_all_repos().await?;
    // Never resume below what the log still holds.
    store_cursor(inner, head.max(earliest.saturating_sub(1))).await
}

async fn load_cursor(inner: &SubscriptionInner) -> Result<Option<Seq>> {
    let service = inner.config.service.clone();
    let cursor: Option<i64> = with_connection(inner.indexer.connection(), move |conn| {
        Ok(conn
            .query_row(
                "SELECT cursor FROM subscription_cursor WHERE service = ?",
                [service],
                |row| row.get(0),
            )
            .optional()?)
    })
    .await?;
    Ok(cursor.filter(|c| *c > 0).map(|c| Seq::from_raw(c as u64)))
}

async fn store_cursor(inner: &SubscriptionInner, cursor: u64) -> Result<()> {
    let service = inner.config.service.clone();
    with_connection(inner.indexer.connection(), move |conn| {
        conn.execute(
            "INSERT INTO subscription_cursor (service, cursor) VALUES (?, ?)
             ON CONFLICT(service) DO UPDATE SET cursor = excluded.cursor",
            params![service, cursor as i64],
        )?;
        Ok(())
    })
    .await
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{compute_checksum, CarWriter};
    use crate::indexer::IdResolver;
    use crate::schema::Database;
    use crate::storage::{RepoStorage, StorageConfig};
    use crate::types::Rev;
    use async_trait::async_trait;
    use integer_encoding::VarInt;

    struct NobodyResolver;

    #[async_trait]
    impl IdResolver for NobodyResolver {
        async fn resolve_handle(&self, _did: &Did) -> Result<Option<String>> {
            Ok(None)
        }
        async fn resolve_did(&self, _handle: &str) -> Result<Option<Did>> {
            Ok(None)
        }
        async fn is_hosted(&self, _did: &Did) -> Result<Option<bool>> {
            Ok(Some(true))
        }
    }

    fn service() -> IndexingService {
        IndexingService::new(
            Database::open_in_memory().unwrap().into_connection(),
            RepoStorage::new(
                Database::open_in_memory().unwrap().into_connection(),
                StorageConfig::default(),
            ),
            Arc::new(NobodyResolver),
        )
    }

    #[test]
    fn test_partition_topic_is_stable_and_bounded() {
        let did = Did::new("did:example:alice");
        let topic = partition_topic(&did, 4);
        assert_eq!(topic, partition_topic(&did, 4));

        let n: usize = topic.strip_prefix("repo/").unwrap().parse().unwrap();
        assert!(n < 4);
        assert_eq!(partition_topic(&did, 0), "repo/0");
    }

    #[tokio::test]
    async fn test_undecodable_row_still_registers_actor() {
        let indexer = service();
        let payload = b"not json".to_vec();
        let row = SeqRow {
            seq: Seq::from_raw(7),
            did: Did::new("did:example:alice"),
            event_type: "commit".into(),
            checksum: compute_checksum(&payload),
            payload,
            sequenced_ms: 1_000,
        };

        process_row(&indexer, &row).await.unwrap();

        let actor = indexer.get_actor(&Did::new("did:example:alice")).await.unwrap();
        assert_eq!(actor.handle, None);
    }

    #[tokio::test]
    async fn test_tombstone_for_hosted_actor_is_ignored() {
        let indexer = service();
        let did = Did::new("did:example:alice");
        indexer.index_handle(&did, 1_000, true).await.unwrap();

        let evt = SeqEvt::Tombstone(crate::events::TombstoneEvt { did: did.clone() });
        let payload = evt.encode_payload().unwrap();
        let row = SeqRow {
            seq: Seq::FIRST,
            did: did.clone(),
            event_type: "tombstone".into(),
            checksum: compute_checksum(&payload),
            payload,
            sequenced_ms: 2_000,
        };

        process_row(&indexer, &row).await.unwrap();
        assert!(indexer.get_actor(&did).await.is_ok());
    }

    #[tokio::test]
    async fn test_corrupt_block_container_still_registers_actor() {
        let indexer = service();
        let did = Did::new("did:example:alice");
        let commit = Cid::for_bytes(b"commit node");

        // A valid header followed by a frame claiming an absurd length.
        let mut blocks = CarWriter::new(Vec::new(), &commit).unwrap().finish().unwrap();
        blocks.extend_from_slice(&(u64::MAX - 4).encode_var_vec());
        blocks.extend_from_slice(&[0u8; 40]);

        let evt = SeqEvt::Commit(CommitEvt {
            repo: did.clone(),
            commit,
            prev: None,
            rev: Rev::now(),
            since: None,
            ops: Vec::new(),
            blocks,
            too_big: false,
            time: 1_000,
        });
        let payload = evt.encode_payload().unwrap();
        let row = SeqRow {
            seq: Seq::FIRST,
            did: did.clone(),
            event_type: "commit".into(),
            checksum: compute_checksum(&payload),
            payload,
            sequenced_ms: 1_000,
        };

        process_row(&indexer, &row).await.unwrap();
        assert!(indexer.get_actor(&did).await.is_ok());
    }
}
