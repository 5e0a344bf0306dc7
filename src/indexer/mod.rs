//! # Indexer
//!
//! Materializes repository records into derived, queryable tables. The
//! derived tables are never a source of truth: everything here can be
//! rebuilt from the repository store with [`IndexingService::index_repo`].
//!
//! ```text
//!                ┌──────────────────────── IndexingService ──────────────────────┐
//!  commit ops ──►│ index_record / delete_record ──► RecordProcessor<Plugin>       │
//!                │                                   │ record, duplicate_record   │
//!  backfill   ──►│ index_repo (checkout diff)        │ post / like / repost / ... │
//!                │                                   │ post_agg, profile_agg      │
//!  identity   ──►│ index_handle ──► IdResolver       │ notification               │
//!  tombstone  ──►│ delete_actor ──► IdResolver       └────────────────────────────│
//!                └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ordering
//!
//! Deliveries are at-least-once and may arrive out of causal order (a reply
//! before its parent, a like before its subject). Every mutation is an upsert
//! keyed by a stable identity and every counter moves by an existence-guarded
//! delta, so the derived state converges regardless of order or repetition.
//!
//! Each operation runs in its own `BEGIN IMMEDIATE` transaction, so indexers
//! on other connections or processes can work on the same tables.

pub mod aggregates;
pub mod plugins;
pub mod processor;
pub mod subscription;
pub mod views;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::codec::current_time_ms;
use crate::error::{Error, Result};
use crate::events::AccountStatus;
use crate::repo::{Checkout, Repo};
use crate::schema::{share, with_connection, Database, SharedConnection};
use crate::storage::{RepoStorage, StorageConfig};
use crate::types::{AtUri, Cid, Did, Rev, WriteOpAction};

use aggregates::AggSubject;
use plugins::{FollowPlugin, LikePlugin, PostPlugin, ProfilePlugin, RepostPlugin};
use processor::{Processor, RecordProcessor};
use views::{ActorView, NotificationView, PostAggregates, ProfileAggregates, RecordView};

pub use subscription::{partition_topic, process_row, RepoSubscription, SubscriptionConfig};

/// Handles are re-resolved at most this often without a forced refresh.
pub const HANDLE_REVALIDATE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Accounts whose handle failed to verify are retried sooner.
pub const INVALID_HANDLE_REVALIDATE_INTERVAL: Duration = Duration::from_secs(60 * 60);

// =============================================================================
// Identity Resolution
// =============================================================================

/// Authoritative answers about accounts, from outside the index.
#[async_trait]
pub trait IdResolver: Send + Sync {
    /// The handle the account's identity document claims.
    async fn resolve_handle(&self, did: &Did) -> Result<Option<String>>;

    /// The account a handle points at.
    async fn resolve_did(&self, handle: &str) -> Result<Option<Did>>;

    /// Whether the account's origin still hosts its repository.
    ///
    /// `None` when the origin could not be asked.
    async fn is_hosted(&self, did: &Did) -> Result<Option<bool>>;
}

// =============================================================================
// Indexing Service
// =============================================================================

type Processors = HashMap<&'static str, Box<dyn Processor>>;

fn all_processors() -> Processors {
    let list: Vec<Box<dyn Processor>> = vec![
        Box::new(RecordProcessor::new(PostPlugin)),
        Box::new(RecordProcessor::new(LikePlugin)),
        Box::new(RecordProcessor::new(RepostPlugin)),
        Box::new(RecordProcessor::new(FollowPlugin)),
        Box::new(RecordProcessor::new(ProfilePlugin)),
    ];
    list.into_iter().map(|p| (p.collection(), p)).collect()
}

/// Outcome of one [`IndexingService::index_repo`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepoSyncReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Records that failed validation or could not be decoded.
    pub skipped: usize,
}

/// Last commit the index has seen for an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorSync {
    pub commit: Cid,
    pub rev: Rev,
    pub synced_ms: u64,
}

/// Handle to the index. Cheap to clone.
#[derive(Clone)]
pub struct IndexingService {
    db: SharedConnection,
    storage: Arc<Mutex<RepoStorage>>,
    resolver: Arc<dyn IdResolver>,
    processors: Arc<Processors>,
}

impl IndexingService {
    /// Builds a service over an index connection and a repository store to
    /// backfill from. The two may point at the same file.
    pub fn new(db: Connection, storage: RepoStorage, resolver: Arc<dyn IdResolver>) -> Self {
        Self {
            db: share(db),
            storage: Arc::new(Mutex::new(storage)),
            resolver,
            processors: Arc::new(all_processors()),
        }
    }

    /// Opens index and repository store on one database file.
    pub fn open(path: impl AsRef<Path>, resolver: Arc<dyn IdResolver>) -> Result<Self> {
        let path = path.as_ref();
        let db = Database::open(path)?.into_connection();
        let storage = RepoStorage::open(path, StorageConfig::default())?;
        Ok(Self::new(db, storage, resolver))
    }

    pub(crate) fn connection(&self) -> &SharedConnection {
        &self.db
    }

    /// Runs `f` in an immediate transaction on the blocking pool.
    async fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>, &Processors) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let processors = self.processors.clone();
        with_connection(&self.db, move |conn| in_transaction(conn, |tx| f(tx, &processors))).await
    }

    async fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        with_connection(&self.db, move |conn| f(conn)).await
    }

    // =========================================================================
    // Records
    // =========================================================================

    /// Indexes a created or updated record.
    ///
    /// Idempotent: indexing the same `(uri, cid, value)` again changes
    /// nothing. Records of collections without a plugin are ignored.
    ///
    /// # Errors
    ///
    /// `Error::ValidationFailed` if the value does not fit its collection;
    /// nothing is written in that case.
    pub async fn index_record(
        &self,
        uri: &AtUri,
        cid: &Cid,
        value: Value,
        action: WriteOpAction,
        timestamp_ms: u64,
    ) -> Result<()> {
        if action == WriteOpAction::Delete {
            return self.delete_record(uri, true).await.map(|_| ());
        }
        let uri = uri.clone();
        let cid = *cid;
        self.transact(move |tx, processors| {
            let processor = match processors.get(uri.collection()) {
                Some(processor) => processor,
                None => {
                    debug!(uri = %uri, "no indexer for collection");
                    return Ok(());
                }
            };
            match action {
                WriteOpAction::Create => processor.insert_record(tx, &uri, &cid, &value, timestamp_ms),
                _ => processor.update_record(tx, &uri, &cid, &value, timestamp_ms),
            }
        })
        .await
    }

    /// Removes a record from the index, promoting a duplicate if one exists.
    ///
    /// With `cascade_aggregates` false counters are left as they are and the
    /// subjects needing [`IndexingService::reconcile`] are returned.
    pub async fn delete_record(&self, uri: &AtUri, cascade_aggregates: bool) -> Result<Vec<AggSubject>> {
        let uri = uri.clone();
        self.transact(move |tx, processors| match processors.get(uri.collection()) {
            Some(processor) => processor.delete_record(tx, &uri, cascade_aggregates),
            None => Ok(Vec::new()),
        })
        .await
    }

    /// Recounts the counters of `subjects` from the derived tables.
    pub async fn reconcile(&self, subjects: Vec<AggSubject>) -> Result<()> {
        self.transact(move |tx, _| aggregates::reconcile(tx, &subjects)).await
    }

    // =========================================================================
    // Backfill
    // =========================================================================

    /// Makes the account's derived records match its repository exactly.
    ///
    /// Reads the repository at `head` (or its current head) and diffs its
    /// record set against the index. Does not replay events. Each record is
    /// applied in its own transaction, so an interrupted pass is simply
    /// resumed by running it again.
    pub async fn index_repo(&self, did: &Did, head: Option<Cid>) -> Result<RepoSyncReport> {
        let storage = self.storage.clone();
        let repo_did = did.clone();
        let checkout = tokio::task::spawn_blocking(move || {
            let storage = lock_storage(&storage)?;
            let repo = match head {
                Some(commit) => Repo::load_at(&storage, &repo_did, &commit)?,
                None => Repo::load(&storage, &repo_did)?.ok_or_else(|| Error::not_found(&repo_did))?,
            };
            repo.checkout(&storage)
        })
        .await
        .map_err(|e| Error::Schema(format!("checkout task failed: {}", e)))??;

        info!(did = %did, commit = %checkout.commit, records = checkout.records.len(), "indexing repo");
        let report = self.sync_checkout(checkout).await?;
        info!(
            did = %did,
            created = report.created,
            updated = report.updated,
            deleted = report.deleted,
            skipped = report.skipped,
            "repo indexed"
        );
        Ok(report)
    }

    /// Applies the difference between a checkout and the indexed records.
    ///
    /// The index connection is taken once per record, so handlers and reads
    /// on this service interleave with a long pass.
    async fn sync_checkout(&self, checkout: Checkout) -> Result<RepoSyncReport> {
        let did = checkout.did.clone();
        let mut current: HashMap<String, String> = self
            .read(move |conn| {
                let mut stmt = conn.prepare_cached("SELECT uri, cid FROM record WHERE did = ?")?;
                let rows = stmt.query_map([did.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))?;
                let indexed = rows.collect::<rusqlite::Result<HashMap<String, String>>>()?;
                Ok(indexed)
            })
            .await?;

        let now = current_time_ms();
        let mut report = RepoSyncReport::default();
        for record in checkout.records {
            let action = match current.remove(&record.uri.to_string()) {
                None => WriteOpAction::Create,
                Some(cid) if cid == record.cid.to_string() => continue,
                Some(_) => WriteOpAction::Update,
            };
            if !self.processors.contains_key(record.uri.collection()) {
                continue;
            }
            let uri = record.uri.clone();
            let applied = match record.value() {
                Ok(value) => {
                    self.transact(move |tx, processors| match processors.get(record.uri.collection()) {
                        Some(processor) if action == WriteOpAction::Create => {
                            processor.insert_record(tx, &record.uri, &record.cid, &value, now)
                        }
                        Some(processor) => processor.update_record(tx, &record.uri, &record.cid, &value, now),
                        None => Ok(()),
                    })
                    .await
                }
                Err(e) => Err(e),
            };
            match applied {
                Ok(()) if action == WriteOpAction::Create => report.created += 1,
                Ok(()) => report.updated += 1,
                Err(e @ (Error::ValidationFailed { .. } | Error::Unprocessable(_))) => {
                    warn!(uri = %uri, error = %e, "skipping invalid record");
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        // Whatever is left is indexed but no longer in the repository.
        let mut stale = Vec::new();
        for uri in current.into_keys() {
            let uri: AtUri = match uri.parse() {
                Ok(uri) => uri,
                Err(_) => continue,
            };
            if self.processors.contains_key(uri.collection()) {
                stale.extend(self.delete_record(&uri, false).await?);
                report.deleted += 1;
            }
        }
        if !stale.is_empty() {
            stale.sort();
            stale.dedup();
            self.reconcile(stale).await?;
        }

        let (did, commit, rev) = (checkout.did, checkout.commit, checkout.rev);
        self.transact(move |tx, _| {
            tx.prepare_cached(
                "INSERT INTO actor_sync (did, commit_cid, repo_rev, synced_ms) VALUES (?, ?, ?, ?)
                 ON CONFLICT(did) DO UPDATE SET
                     commit_cid = excluded.commit_cid,
                     repo_rev = excluded.repo_rev,
                     synced_ms = excluded.synced_ms
                 WHERE excluded.repo_rev >= actor_sync.repo_rev",
            )?
            .execute(params![did.as_str(), commit.to_string(), rev.as_str(), now as i64])?;
            Ok(())
        })
        .await?;
        Ok(report)
    }

    /// Backfills every repository in the store. Returns how many were indexed.
    ///
    /// A repository that fails is logged and skipped.
    pub async fn index_all_repos(&self) -> Result<usize> {
        let storage = self.storage.clone();
        let roots = tokio::task::spawn_blocking(move || lock_storage(&storage)?.list_repos())
            .await
            .map_err(|e| Error::Schema(format!("list task failed: {}", e)))??;

        info!(repos = roots.len(), "full backfill started");
        let mut indexed = 0;
        for root in roots {
            match self.index_repo(&root.did, Some(root.cid)).await {
                Ok(_) => indexed += 1,
                Err(e) => warn!(did = %root.did, error = %e, "backfill of repo failed"),
            }
        }
        info!(indexed, "full backfill finished");
        Ok(indexed)
    }

    // =========================================================================
    // Actors
    // =========================================================================

    /// Refreshes an account's handle from the resolver.
    ///
    /// Without `force` the cached handle is only replaced if there is none or
    /// it is stale relative to `observed_ms`: an old event arriving late never
    /// overwrites a newer resolution. A handle is kept only if it resolves
    /// back to `did`; another account holding the same handle loses it.
    pub async fn index_handle(&self, did: &Did, observed_ms: u64, force: bool) -> Result<()> {
        let lookup = did.clone();
        let existing: Option<(Option<String>, u64)> = self
            .read(move |conn| {
                Ok(conn
                    .prepare_cached("SELECT handle, indexed_ms FROM actor WHERE did = ?")?
                    .query_row([lookup.as_str()], |row| {
                        Ok((row.get(0)?, row.get::<_, i64>(1)? as u64))
                    })
                    .optional()?)
            })
            .await?;
        if !force && !needs_handle_reindex(existing.as_ref(), observed_ms) {
            return Ok(());
        }

        let handle = match self.resolver.resolve_handle(did).await? {
            Some(claimed) => match self.resolver.resolve_did(&claimed).await? {
                Some(owner) if &owner == did => Some(claimed.to_lowercase()),
                _ => None,
            },
            None => None,
        };

        let did = did.clone();
        self.transact(move |tx, _| {
            if let Some(handle) = &handle {
                let cleared = tx
                    .prepare_cached("UPDATE actor SET handle = NULL WHERE handle = ? AND did != ?")?
                    .execute(params![handle, did.as_str()])?;
                if cleared > 0 {
                    debug!(did = %did, handle = %handle, "handle taken from previous holder");
                }
            }
            tx.prepare_cached(
                "INSERT INTO actor (did, handle, indexed_ms) VALUES (?, ?, ?)
                 ON CONFLICT(did) DO UPDATE SET
                     handle = excluded.handle,
                     indexed_ms = excluded.indexed_ms",
            )?
            .execute(params![did.as_str(), handle, observed_ms as i64])?;
            Ok(())
        })
        .await
    }

    /// Records the latest commit seen for an account. Older revisions never
    /// replace newer ones.
    pub async fn set_commit_last_seen(&self, did: &Did, commit: &Cid, rev: &Rev) -> Result<()> {
        let (did, commit, rev) = (did.clone(), *commit, rev.clone());
        self.transact(move |tx, _| {
            tx.prepare_cached(
                "INSERT INTO actor_sync (did, commit_cid, repo_rev, synced_ms) VALUES (?, ?, ?, ?)
                 ON CONFLICT(did) DO UPDATE SET
                     commit_cid = excluded.commit_cid,
                     repo_rev = excluded.repo_rev,
                     synced_ms = excluded.synced_ms
                 WHERE excluded.repo_rev >= actor_sync.repo_rev",
            )?
            .execute(params![
                did.as_str(),
                commit.to_string(),
                rev.as_str(),
                current_time_ms() as i64
            ])?;
            Ok(())
        })
        .await
    }

    pub async fn get_actor_sync(&self, did: &Did) -> Result<Option<ActorSync>> {
        let did = did.clone();
        let row: Option<(String, String, i64)> = self
            .read(move |conn| {
                Ok(conn
                    .prepare_cached("SELECT commit_cid, repo_rev, synced_ms FROM actor_sync WHERE did = ?")?
                    .query_row([did.as_str()], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                    .optional()?)
            })
            .await?;
        match row {
            Some((commit, rev, synced_ms)) => Ok(Some(ActorSync {
                commit: commit.parse()?,
                rev: Rev::from_raw(rev),
                synced_ms: synced_ms as u64,
            })),
            None => Ok(None),
        }
    }

    /// Records an account's upstream hosting status.
    ///
    /// # Errors
    ///
    /// `Error::Unprocessable` for an inactive account without a status, or
    /// with `deleted` (deletion goes through [`IndexingService::delete_actor`]).
    pub async fn update_actor_status(
        &self,
        did: &Did,
        active: bool,
        status: Option<AccountStatus>,
    ) -> Result<()> {
        let upstream_status = match (active, status) {
            (true, _) => None,
            (false, Some(status @ (AccountStatus::Deactivated | AccountStatus::Suspended | AccountStatus::Takendown))) => {
                Some(status.as_str())
            }
            (false, other) => {
                return Err(Error::Unprocessable(format!(
                    "unrecognized account status {:?} for {}",
                    other.map(|s| s.as_str()),
                    did
                )))
            }
        };
        let did = did.clone();
        self.transact(move |tx, _| {
            tx.prepare_cached("UPDATE actor SET upstream_status = ? WHERE did = ?")?
                .execute(params![upstream_status, did.as_str()])?;
            Ok(())
        })
        .await
    }

    /// Removes an account's derived data, but only once its origin confirms
    /// the repository is gone. Returns whether anything was removed.
    ///
    /// If the origin still hosts the account, or cannot be asked, this is a
    /// no-op: a tombstone racing a migration must not erase a live account.
    pub async fn delete_actor(&self, did: &Did) -> Result<bool> {
        match self.resolver.is_hosted(did).await? {
            Some(false) => {}
            hosted => {
                debug!(did = %did, hosted = ?hosted, "actor still hosted, not deleting");
                return Ok(false);
            }
        }

        let target = did.clone();
        self.transact(move |tx, _| {
            tx.execute("DELETE FROM actor WHERE did = ?", [target.as_str()])?;
            tx.execute("DELETE FROM actor_sync WHERE did = ?", [target.as_str()])?;
            unindex_actor_in(tx, &target)?;
            tx.execute("DELETE FROM notification WHERE did = ?", [target.as_str()])?;
            Ok(())
        })
        .await?;
        info!(did = %did, "actor deleted from index");
        Ok(true)
    }

    /// Removes every derived row authored by the account. The actor row
    /// itself is kept.
    pub async fn unindex_actor(&self, did: &Did) -> Result<()> {
        let did = did.clone();
        self.transact(move |tx, _| unindex_actor_in(tx, &did)).await
    }

    // =========================================================================
    // Administrative Triggers
    // =========================================================================

    /// Hides (or with `None`, un-hides) an account and everything it authored.
    pub async fn takedown_actor(&self, did: &Did, reference: Option<String>) -> Result<()> {
        let did = did.clone();
        self.transact(move |tx, _| {
            tx.prepare_cached(
                "INSERT INTO actor (did, indexed_ms, takedown_ref) VALUES (?, 0, ?)
                 ON CONFLICT(did) DO UPDATE SET takedown_ref = excluded.takedown_ref",
            )?
            .execute(params![did.as_str(), reference])?;
            Ok(())
        })
        .await
    }

    /// Hides (or with `None`, un-hides) one record.
    pub async fn takedown_record(&self, uri: &AtUri, reference: Option<String>) -> Result<()> {
        let uri = uri.clone();
        self.transact(move |tx, _| {
            let updated = tx
                .prepare_cached("UPDATE record SET takedown_ref = ? WHERE uri = ?")?
                .execute(params![reference, uri.to_string()])?;
            if updated == 0 {
                return Err(Error::not_found(&uri));
            }
            Ok(())
        })
        .await
    }

    // =========================================================================
    // Views
    // =========================================================================

    pub async fn get_actor(&self, did: &Did) -> Result<ActorView> {
        let did = did.clone();
        self.read(move |conn| views::get_actor(conn, &did)).await
    }

    pub async fn get_record(&self, uri: &AtUri) -> Result<RecordView> {
        let uri = uri.clone();
        self.read(move |conn| views::get_record(conn, &uri)).await
    }

    pub async fn get_post_aggregates(&self, uri: &AtUri) -> Result<PostAggregates> {
        let uri = uri.clone();
        self.read(move |conn| views::get_post_aggregates(conn, &uri)).await
    }

    pub async fn get_profile_aggregates(&self, did: &Did) -> Result<ProfileAggregates> {
        let did = did.clone();
        self.read(move |conn| views::get_profile_aggregates(conn, &did)).await
    }

    pub async fn list_notifications(&self, did: &Did, limit: usize) -> Result<Vec<NotificationView>> {
        let did = did.clone();
        self.read(move |conn| views::list_notifications(conn, &did, limit)).await
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn lock_storage(storage: &Mutex<RepoStorage>) -> Result<MutexGuard<'_, RepoStorage>> {
    storage
        .lock()
        .map_err(|_| Error::Schema("repository store lock poisoned".to_string()))
}

fn in_transaction<T>(conn: &mut Connection, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let out = f(&tx)?;
    tx.commit()?;
    Ok(out)
}

fn needs_handle_reindex(existing: Option<&(Option<String>, u64)>, observed_ms: u64) -> bool {
    let (handle, indexed_ms) = match existing {
        Some(existing) => existing,
        None => return true,
    };
    let age = observed_ms.saturating_sub(*indexed_ms);
    if age > HANDLE_REVALIDATE_INTERVAL.as_millis() as u64 {
        return true;
    }
    handle.is_none() && age > INVALID_HANDLE_REVALIDATE_INTERVAL.as_millis() as u64
}

/// Deletes everything `did` authored and recounts the counters it touched.
fn unindex_actor_in(conn: &Connection, did: &Did) -> Result<()> {
    let did = did.as_str();
    let mut stale = vec![AggSubject::Profile(did.to_string())];
    for (sql, is_post) in [
        ("SELECT subject FROM post_like WHERE creator = ?", true),
        ("SELECT subject FROM repost WHERE creator = ?", true),
        ("SELECT reply_parent FROM post WHERE creator = ? AND reply_parent IS NOT NULL", true),
        ("SELECT subject_did FROM follow WHERE creator = ?", false),
    ] {
        let mut stmt = conn.prepare_cached(sql)?;
        let subjects = stmt.query_map([did], |row| row.get::<_, String>(0))?;
        for subject in subjects {
            let subject = subject?;
            stale.push(if is_post {
                AggSubject::Post(subject)
            } else {
                AggSubject::Profile(subject)
            });
        }
    }

    conn.execute(
        "DELETE FROM post_agg WHERE uri IN (SELECT uri FROM record WHERE did = ?)",
        [did],
    )?;
    for table in ["profile", "follow", "repost", "post_like", "post"] {
        conn.execute(&format!("DELETE FROM {} WHERE creator = ?", table), [did])?;
    }
    conn.execute("DELETE FROM notification WHERE author = ?", [did])?;
    conn.execute(
        "DELETE FROM duplicate_record
         WHERE uri IN (SELECT uri FROM record WHERE did = ?1)
            OR duplicate_of IN (SELECT uri FROM record WHERE did = ?1)",
        [did],
    )?;
    conn.execute("DELETE FROM record WHERE did = ?", [did])?;

    stale.sort();
    stale.dedup();
    aggregates::reconcile(conn, &stale)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use plugins::{FOLLOW_COLLECTION, LIKE_COLLECTION, POST_COLLECTION};
    use serde_json::json;

    #[derive(Default)]
    struct StaticResolver {
        handles: HashMap<String, String>,
        hosted: Option<bool>,
    }

    #[async_trait]
    impl IdResolver for StaticResolver {
        async fn resolve_handle(&self, did: &Did) -> Result<Option<String>> {
            Ok(self.handles.get(did.as_str()).cloned())
        }

        async fn resolve_did(&self, handle: &str) -> Result<Option<Did>> {
            Ok(self
                .handles
                .iter()
                .find(|(_, h)| h.as_str() == handle)
                .map(|(d, _)| Did::new(d.clone())))
        }

        async fn is_hosted(&self, _did: &Did) -> Result<Option<bool>> {
            Ok(self.hosted)
        }
    }

    fn service(resolver: StaticResolver) -> IndexingService {
        let db = Database::open_in_memory().unwrap().into_connection();
        let storage = RepoStorage::new(
            Database::open_in_memory().unwrap().into_connection(),
            StorageConfig::default(),
        );
        IndexingService::new(db, storage, Arc::new(resolver))
    }

    fn uri(did: &str, collection: &str, rkey: &str) -> AtUri {
        AtUri::new(Did::new(did), collection, rkey)
    }

    fn cid(value: &Value) -> Cid {
        Cid::for_bytes(value.to_string().as_bytes())
    }

    async fn create(svc: &IndexingService, uri: &AtUri, value: Value) {
        svc.index_record(uri, &cid(&value), value, WriteOpAction::Create, 1_000)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_record_is_rejected_without_writes() {
        let svc = service(StaticResolver::default());
        let post = uri("did:example:alice", POST_COLLECTION, "1");
        let bad = json!({ "createdAt": "2024-01-01T00:00:00Z" });

        let err = svc
            .index_record(&post, &cid(&bad), bad, WriteOpAction::Create, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValidationFailed { .. }));
        assert!(matches!(svc.get_record(&post).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_follow_counts_and_notifies_subject() {
        let svc = service(StaticResolver::default());
        let follow = uri("did:example:alice", FOLLOW_COLLECTION, "f1");
        create(
            &svc,
            &follow,
            json!({ "subject": "did:example:bob", "createdAt": "2024-01-01T00:00:00Z" }),
        )
        .await;

        let bob = Did::new("did:example:bob");
        let alice = Did::new("did:example:alice");
        assert_eq!(svc.get_profile_aggregates(&bob).await.unwrap().followers_count, 1);
        assert_eq!(svc.get_profile_aggregates(&alice).await.unwrap().follows_count, 1);

        let notifs = svc.list_notifications(&bob, 10).await.unwrap();
        assert_eq!(notifs.len(), 1);
        assert_eq!(notifs[0].reason, "follow");
        assert_eq!(notifs[0].author, alice);

        svc.delete_record(&follow, true).await.unwrap();
        assert_eq!(svc.get_profile_aggregates(&bob).await.unwrap().followers_count, 0);
        assert!(svc.list_notifications(&bob, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_self_like_does_not_notify() {
        let svc = service(StaticResolver::default());
        let post = uri("did:example:alice", POST_COLLECTION, "p1");
        create(&svc, &post, json!({ "text": "hi", "createdAt": "2024-01-01T00:00:00Z" })).await;
        create(
            &svc,
            &uri("did:example:alice", LIKE_COLLECTION, "l1"),
            json!({
                "subject": { "uri": post.to_string(), "cid": "x" },
                "createdAt": "2024-01-01T00:00:00Z"
            }),
        )
        .await;

        let alice = Did::new("did:example:alice");
        assert!(svc.list_notifications(&alice, 10).await.unwrap().is_empty());
        assert_eq!(svc.get_post_aggregates(&post).await.unwrap().like_count, 1);
    }

    #[tokio::test]
    async fn test_delete_without_cascade_leaves_counts_for_reconcile() {
        let svc = service(StaticResolver::default());
        let post = uri("did:example:bob", POST_COLLECTION, "p1");
        let like = uri("did:example:alice", LIKE_COLLECTION, "l1");
        create(&svc, &post, json!({ "text": "hi", "createdAt": "t" })).await;
        create(
            &svc,
            &like,
            json!({ "subject": { "uri": post.to_string(), "cid": "x" }, "createdAt": "t" }),
        )
        .await;

        let stale = svc.delete_record(&like, false).await.unwrap();
        assert_eq!(stale, vec![AggSubject::Post(post.to_string())]);
        assert_eq!(svc.get_post_aggregates(&post).await.unwrap().like_count, 1);

        svc.reconcile(stale).await.unwrap();
        assert_eq!(svc.get_post_aggregates(&post).await.unwrap().like_count, 0);
    }

    #[tokio::test]
    async fn test_update_replaces_derived_row() {
        let svc = service(StaticResolver::default());
        let post = uri("did:example:bob", POST_COLLECTION, "p1");
        create(&svc, &post, json!({ "text": "one", "createdAt": "t" })).await;

        let edited = json!({ "text": "two", "createdAt": "t" });
        svc.index_record(&post, &cid(&edited), edited.clone(), WriteOpAction::Update, 2_000)
            .await
            .unwrap();

        let view = svc.get_record(&post).await.unwrap();
        assert_eq!(view.value, edited);
        let bob = Did::new("did:example:bob");
        assert_eq!(svc.get_profile_aggregates(&bob).await.unwrap().posts_count, 1);
    }

    #[tokio::test]
    async fn test_handle_contention_and_unforced_refresh() {
        let mut resolver = StaticResolver::default();
        resolver.handles.insert("did:example:alice".into(), "Alice.Test".into());
        let svc = service(resolver);
        let alice = Did::new("did:example:alice");
        let bob = Did::new("did:example:bob");

        // Bob holds the handle from an older resolution.
        svc.transact(|tx, _| {
            tx.execute(
                "INSERT INTO actor (did, handle, indexed_ms) VALUES ('did:example:bob', 'alice.test', 0)",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        svc.index_handle(&alice, 1_000, false).await.unwrap();
        assert_eq!(svc.get_actor(&alice).await.unwrap().handle.as_deref(), Some("alice.test"));
        assert_eq!(svc.get_actor(&bob).await.unwrap().handle, None);

        // A late, unforced refresh leaves the cached handle alone.
        svc.transact(|tx, _| {
            tx.execute("UPDATE actor SET handle = 'kept.test' WHERE did = 'did:example:alice'", [])?;
            Ok(())
        })
        .await
        .unwrap();
        svc.index_handle(&alice, 500, false).await.unwrap();
        assert_eq!(svc.get_actor(&alice).await.unwrap().handle.as_deref(), Some("kept.test"));

        svc.index_handle(&alice, 500, true).await.unwrap();
        assert_eq!(svc.get_actor(&alice).await.unwrap().handle.as_deref(), Some("alice.test"));
    }

    #[tokio::test]
    async fn test_actor_status_and_takedown() {
        let svc = service(StaticResolver::default());
        let alice = Did::new("did:example:alice");
        svc.index_handle(&alice, 1_000, true).await.unwrap();

        svc.update_actor_status(&alice, false, Some(AccountStatus::Suspended))
            .await
            .unwrap();
        assert_eq!(
            svc.get_actor(&alice).await.unwrap().upstream_status.as_deref(),
            Some("suspended")
        );
        assert!(svc.update_actor_status(&alice, false, None).await.is_err());

        svc.takedown_actor(&alice, Some("mod-1".into())).await.unwrap();
        assert!(matches!(svc.get_actor(&alice).await, Err(Error::NotFound(_))));
        svc.takedown_actor(&alice, None).await.unwrap();
        assert!(svc.get_actor(&alice).await.is_ok());
    }

    #[tokio::test]
    async fn test_commit_last_seen_ignores_older_revisions() {
        let svc = service(StaticResolver::default());
        let alice = Did::new("did:example:alice");
        let newer = Cid::for_bytes(b"newer");
        let older = Cid::for_bytes(b"older");

        svc.set_commit_last_seen(&alice, &newer, &Rev::from_raw("3kzzzzzzzzzz2"))
            .await
            .unwrap();
        svc.set_commit_last_seen(&alice, &older, &Rev::from_raw("3aaaaaaaaaaa2"))
            .await
            .unwrap();

        let sync = svc.get_actor_sync(&alice).await.unwrap().unwrap();
        assert_eq!(sync.commit, newer);
    }

    #[test]
    fn test_needs_handle_reindex() {
        let day = HANDLE_REVALIDATE_INTERVAL.as_millis() as u64;
        let hour = INVALID_HANDLE_REVALIDATE_INTERVAL.as_millis() as u64;

        assert!(needs_handle_reindex(None, 0));
        assert!(!needs_handle_reindex(Some(&(Some("a".into()), 1_000)), 1_000 + hour * 2));
        assert!(needs_handle_reindex(Some(&(Some("a".into()), 1_000)), 1_000 + day + 1));
        assert!(needs_handle_reindex(Some(&(None, 1_000)), 1_000 + hour + 1));
        assert!(!needs_handle_reindex(Some(&(None, 5_000)), 1_000));
    }
}
