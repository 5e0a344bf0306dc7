//! # Host API
//!
//! [`RepoHost`] is the write-side entry point. It owns the repository store
//! and the event log and keeps them in step: every stored commit is followed
//! by its `commit` event, and every account change by the matching event.
//!
//! ```text
//!   apply_writes(did, writes)
//!        │
//!        ▼
//!   ┌─────────────────────── blocking pool ───────────────────────┐
//!   │ Repo::load ──► format_commit ──► RepoStorage::commit_staged │
//!   │      ▲                                  │                   │
//!   │      └──────── Misordered (bounded) ◄───┘                   │
//!   └────────────────────────────┬────────────────────────────────┘
//!                                │ CommitData
//!                                ▼
//!                     Sequencer::sequence_commit ──► seq
//! ```
//!
//! ## Ordering
//!
//! Store write and log append for one account happen under that account's
//! lock, so the log order of its commits always matches their chain order.
//! Different accounts write concurrently. Writers in other processes are
//! serialized only by the root compare-and-swap: their races surface as
//! `Misordered` and are retried against the new head.
//!
//! ## Identity
//!
//! The host is also the authority on the handles and hosting state of its own
//! accounts, and implements [`IdResolver`] so an indexer can ask it directly.
//! Handles are held in memory; an identity event re-announces them after a
//! restart.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::events::AccountStatus;
use crate::indexer::IdResolver;
use crate::repo::{RecordWrite, Repo};
use crate::sequencer::{Sequencer, SequencerConfig};
use crate::storage::{RepoRoot, RepoStorage, StorageConfig, DEFAULT_BLOCK_CACHE_SIZE};
use crate::types::{Cid, CommitData, Did, Rev, Seq};

// =============================================================================
// Configuration
// =============================================================================

/// Attempts at a commit before a lost root race is returned to the caller.
pub const DEFAULT_MAX_COMMIT_RETRIES: usize = 5;

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub max_commit_retries: usize,
    pub block_cache_size: usize,
    pub sequencer: SequencerConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_commit_retries: DEFAULT_MAX_COMMIT_RETRIES,
            block_cache_size: DEFAULT_BLOCK_CACHE_SIZE,
            sequencer: SequencerConfig::default(),
        }
    }
}

/// A stored and sequenced commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    pub commit: Cid,
    pub rev: Rev,
    pub seq: Seq,
}

// =============================================================================
// Account Locks
// =============================================================================

/// One async lock per account, dropped once nobody holds or waits on it.
#[derive(Default)]
struct AccountLocks {
    locks: Mutex<HashMap<Did, Weak<AsyncMutex<()>>>>,
}

impl AccountLocks {
    async fn acquire(&self, did: &Did) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| Error::Schema("account lock table poisoned".to_string()))?;
            match locks.get(did).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    locks.retain(|_, lock| lock.strong_count() > 0);
                    let lock = Arc::new(AsyncMutex::new(()));
                    locks.insert(did.clone(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        Ok(lock.lock_owned().await)
    }
}

// =============================================================================
// RepoHost
// =============================================================================

struct HostInner {
    storage: Arc<Mutex<RepoStorage>>,
    sequencer: Sequencer,
    handles: RwLock<HashMap<Did, String>>,
    account_locks: AccountLocks,
    config: HostConfig,
}

/// Handle to a repository host. Cheap to clone.
///
/// # Example
///
/// ```rust,ignore
/// let host = RepoHost::open("host.db", HostConfig::default())?;
/// let did = Did::new("did:example:alice");
/// host.create_repo(&did, Some("alice.test".into()), vec![]).await?;
/// host.apply_writes(&did, vec![RecordWrite::create(
///     "app.bsky.feed.post",
///     "3k2a",
///     json!({"$type": "app.bsky.feed.post", "text": "hi", "createdAt": "2024-01-01T00:00:00Z"}),
/// )]).await?;
/// ```
#[derive(Clone)]
pub struct RepoHost {
    inner: Arc<HostInner>,
}

impl RepoHost {
    /// Opens the store and the log on one database file.
    pub fn open(path: impl AsRef<Path>, config: HostConfig) -> Result<Self> {
        let path = path.as_ref();
        let storage = RepoStorage::open(
            path,
            StorageConfig {
                block_cache_size: config.block_cache_size,
            },
        )?;
        let sequencer = Sequencer::open(path, config.sequencer.clone())?;
        info!(path = %path.display(), "repo host opened");
        Ok(Self::new(storage, sequencer, config))
    }

    /// Builds a host from an existing store and log.
    pub fn new(storage: RepoStorage, sequencer: Sequencer, config: HostConfig) -> Self {
        Self {
            inner: Arc::new(HostInner {
                storage: Arc::new(Mutex::new(storage)),
                sequencer,
                handles: RwLock::new(HashMap::new()),
                account_locks: AccountLocks::default(),
                config,
            }),
        }
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.inner.sequencer
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Creates an account's repository with an initial set of records.
    ///
    /// # Errors
    ///
    /// `Error::Misordered` if the account already has a repository.
    pub async fn create_repo(
        &self,
        did: &Did,
        handle: Option<String>,
        writes: Vec<RecordWrite>,
    ) -> Result<WriteResult> {
        let _guard = self.inner.account_locks.acquire(did).await?;
        let repo_did = did.clone();
        let commit = self
            .with_storage(move |storage| {
                let commit = Repo::format_init_commit(&repo_did, &writes)?;
                storage.commit_staged(&repo_did, &commit, None)?;
                Ok(commit)
            })
            .await?;
        let result = self.sequence(did, &commit).await?;
        info!(did = %did, commit = %result.commit, "repo created");

        if let Some(handle) = handle {
            self.set_handle(did, Some(handle.clone()))?;
            self.inner.sequencer.sequence_identity(did, Some(handle)).await?;
        }
        Ok(result)
    }

    /// Applies record writes on top of the account's current head.
    ///
    /// A lost root race is retried against the new head up to
    /// `max_commit_retries` times.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` for an account without a repository
    /// - `Error::DuplicateConflict` / `Error::NotFound` for writes that do not
    ///   fit the current record set
    /// - `Error::Misordered` once retries are exhausted
    pub async fn apply_writes(&self, did: &Did, writes: Vec<RecordWrite>) -> Result<WriteResult> {
        let _guard = self.inner.account_locks.acquire(did).await?;
        let writes = Arc::new(writes);
        let mut attempt = 0;
        let commit = loop {
            let repo_did = did.clone();
            let writes = writes.clone();
            let outcome = self
                .with_storage(move |storage| {
                    let repo = Repo::load(storage, &repo_did)?
                        .ok_or_else(|| Error::not_found(format!("repository {}", repo_did)))?;
                    let commit = repo.format_commit(&writes)?;
                    storage.commit_staged(&repo_did, &commit, Some(repo.head()))?;
                    Ok(commit)
                })
                .await;
            match outcome {
                Err(e) if e.is_retryable() && attempt < self.inner.config.max_commit_retries => {
                    attempt += 1;
                    debug!(did = %did, attempt, error = %e, "commit lost root race, retrying");
                }
                other => break other?,
            }
        };
        self.sequence(did, &commit).await
    }

    async fn sequence(&self, did: &Did, commit: &CommitData) -> Result<WriteResult> {
        let seq = self.inner.sequencer.sequence_commit(did, commit).await?;
        Ok(WriteResult {
            commit: commit.cid,
            rev: commit.rev.clone(),
            seq,
        })
    }

    // =========================================================================
    // Account Events
    // =========================================================================

    /// Changes (or with `None`, clears) an account's handle.
    pub async fn update_handle(&self, did: &Did, handle: Option<String>) -> Result<Seq> {
        self.set_handle(did, handle.clone())?;
        self.inner.sequencer.sequence_identity(did, handle).await
    }

    pub async fn update_account_status(
        &self,
        did: &Did,
        active: bool,
        status: Option<AccountStatus>,
    ) -> Result<Seq> {
        self.inner.sequencer.sequence_account(did, active, status).await
    }

    /// Deletes an account's repository for good.
    ///
    /// The tombstone is the only event of the account left in the log.
    pub async fn delete_account(&self, did: &Did) -> Result<Seq> {
        let _guard = self.inner.account_locks.acquire(did).await?;
        let target = did.clone();
        self.with_storage(move |storage| storage.destroy_repo(&target)).await?;
        self.set_handle(did, None)?;

        let seq = self.inner.sequencer.sequence_tombstone(did).await?;
        let removed = self.inner.sequencer.delete_all_for_user(did, vec![seq]).await?;
        info!(did = %did, seq = %seq, events_removed = removed, "account deleted");
        Ok(seq)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get_root(&self, did: &Did) -> Result<Option<RepoRoot>> {
        let did = did.clone();
        self.with_storage(move |storage| storage.get_root(&did)).await
    }

    pub async fn list_repos(&self) -> Result<Vec<RepoRoot>> {
        self.with_storage(|storage| storage.list_repos()).await
    }

    /// Exports the commits made after `since` (or the whole history) as a
    /// block container.
    pub async fn export(&self, did: &Did, since: Option<Cid>) -> Result<Vec<u8>> {
        let did = did.clone();
        self.with_storage(move |storage| storage.export_car(&did, since.as_ref()))
            .await
    }

    /// Flushes the log writer.
    pub async fn shutdown(&self) {
        self.inner.sequencer.shutdown().await;
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn with_storage<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut RepoStorage) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let storage = self.inner.storage.clone();
        tokio::task::spawn_blocking(move || {
            let mut storage = lock(&storage)?;
            f(&mut storage)
        })
        .await
        .map_err(|e| Error::Schema(format!("storage task failed: {}", e)))?
    }

    fn set_handle(&self, did: &Did, handle: Option<String>) -> Result<()> {
        let mut handles = self
            .inner
            .handles
            .write()
            .map_err(|_| Error::Schema("handle table lock poisoned".to_string()))?;
        match handle {
            Some(handle) => handles.insert(did.clone(), handle),
            None => handles.remove(did),
        };
        Ok(())
    }
}

fn lock(storage: &Mutex<RepoStorage>) -> Result<MutexGuard<'_, RepoStorage>> {
    storage
        .lock()
        .map_err(|_| Error::Schema("repository store lock poisoned".to_string()))
}

#[async_trait]
impl IdResolver for RepoHost {
    async fn resolve_handle(&self, did: &Did) -> Result<Option<String>> {
        let handles = self
            .inner
            .handles
            .read()
            .map_err(|_| Error::Schema("handle table lock poisoned".to_string()))?;
        Ok(handles.get(did).cloned())
    }

    async fn resolve_did(&self, handle: &str) -> Result<Option<Did>> {
        let handles = self
            .inner
            .handles
            .read()
            .map_err(|_| Error::Schema("handle table lock poisoned".to_string()))?;
        Ok(handles
            .iter()
            .find(|(_, h)| h.eq_ignore_ascii_case(handle))
            .map(|(did, _)| did.clone()))
    }

    async fn is_hosted(&self, did: &Did) -> Result<Option<bool>> {
        Ok(Some(self.get_root(did).await?.is_some()))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::read_car;
    use serde_json::json;
    use tempfile::tempdir;

    fn post(text: &str) -> serde_json::Value {
        json!({"$type": "app.bsky.feed.post", "text": text, "createdAt": "2024-01-01T00:00:00Z"})
    }

    fn post_write(rkey: &str) -> Vec<RecordWrite> {
        vec![RecordWrite::create("app.bsky.feed.post", rkey, post("x"))]
    }

    #[tokio::test]
    async fn test_writes_are_stored_then_sequenced() {
        let dir = tempdir().unwrap();
        let host = RepoHost::open(dir.path().join("host.db"), HostConfig::default()).unwrap();
        let did = Did::new("did:example:alice");

        let created = host.create_repo(&did, None, vec![]).await.unwrap();
        let written = host
            .apply_writes(&did, vec![RecordWrite::create("app.bsky.feed.post", "a", post("hi"))])
            .await
            .unwrap();

        assert!(written.seq > created.seq);
        assert!(written.rev > created.rev);
        let root = host.get_root(&did).await.unwrap().unwrap();
        assert_eq!(root.cid, written.commit);

        let car = host.export(&did, Some(created.commit)).await.unwrap();
        let (root_cid, _) = read_car(&car).unwrap();
        assert_eq!(root_cid, written.commit);

        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_create_twice_is_misordered() {
        let dir = tempdir().unwrap();
        let host = RepoHost::open(dir.path().join("host.db"), HostConfig::default()).unwrap();
        let did = Did::new("did:example:alice");

        host.create_repo(&did, None, vec![]).await.unwrap();
        let err = host.create_repo(&did, None, vec![]).await.unwrap_err();
        assert!(matches!(err, Error::Misordered { .. }));
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_resolver_answers_from_host_state() {
        let dir = tempdir().unwrap();
        let host = RepoHost::open(dir.path().join("host.db"), HostConfig::default()).unwrap();
        let did = Did::new("did:example:alice");

        host.create_repo(&did, Some("alice.test".into()), vec![]).await.unwrap();
        assert_eq!(host.resolve_handle(&did).await.unwrap().as_deref(), Some("alice.test"));
        assert_eq!(host.resolve_did("Alice.Test").await.unwrap(), Some(did.clone()));
        assert_eq!(host.is_hosted(&did).await.unwrap(), Some(true));

        let tombstone = host.delete_account(&did).await.unwrap();
        assert_eq!(host.is_hosted(&did).await.unwrap(), Some(false));
        assert_eq!(host.resolve_handle(&did).await.unwrap(), None);

        let events = host.sequencer().read_events(Seq::FIRST, 100).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].seq, tombstone);
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_accounts_do_not_wait_on_each_other() {
        let dir = tempdir().unwrap();
        let host = RepoHost::open(dir.path().join("host.db"), HostConfig::default()).unwrap();
        let alice = Did::new("did:example:alice");
        let bob = Did::new("did:example:bob");
        host.create_repo(&alice, None, vec![]).await.unwrap();
        host.create_repo(&bob, None, vec![]).await.unwrap();

        let held = host.inner.account_locks.acquire(&alice).await.unwrap();
        let timeout = std::time::Duration::from_secs(5);
        tokio::time::timeout(timeout, host.apply_writes(&bob, post_write("b1")))
            .await
            .unwrap()
            .unwrap();

        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            host.apply_writes(&alice, post_write("a1")),
        )
        .await;
        assert!(blocked.is_err());
        drop(held);
        tokio::time::timeout(timeout, host.apply_writes(&alice, post_write("a1")))
            .await
            .unwrap()
            .unwrap();

        host.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_hosts_retry_on_the_root() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("host.db");
        let config = HostConfig {
            max_commit_retries: 100,
            ..HostConfig::default()
        };
        let first = RepoHost::open(&path, config.clone()).unwrap();
        let second = RepoHost::open(&path, config).unwrap();
        let did = Did::new("did:example:alice");
        first.create_repo(&did, None, vec![]).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..10 {
            let host = if i % 2 == 0 { first.clone() } else { second.clone() };
            let did = did.clone();
            tasks.push(tokio::spawn(async move {
                host.apply_writes(&did, post_write(&format!("p{}", i))).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let repo = first
            .with_storage(move |storage| Repo::load(storage, &did))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(repo.index().len(), 10);

        first.shutdown().await;
        second.shutdown().await;
    }
}
