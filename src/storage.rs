//! # Repository Store
//!
//! Per-account, content-addressed block storage plus an append-only commit
//! chain and a single mutable root pointer.
//!
//! ## Write Path
//!
//! ```text
//!   commit_staged(did, commit, prev_head)
//!   ┌──────────────────────── BEGIN IMMEDIATE ─────────────────────────┐
//!   │ (a) INSERT ipld_block ... ON CONFLICT DO NOTHING   (new blocks)  │
//!   │ (b) INSERT repo_commit_block                        (who added)  │
//!   │ (c) UPDATE repo_root SET cid = new                               │
//!   │         WHERE did = ? AND cid = prev_head   ── 0 rows? ─► ROLLBACK│
//!   │ (d) INSERT repo_commit_history (commit, prev)                     │
//!   └──────────────────────────── COMMIT ───────────────────────────────┘
//! ```
//!
//! The conditional update in (c) is the entire concurrency control for an
//! account: writers in other connections or other processes that race on the
//! same head serialize on SQLite's write lock, and all but one of them find
//! that the stored head no longer matches. They get [`Error::Misordered`] and
//! nothing they staged is visible.
//!
//! ## Reads
//!
//! Block reads are scoped by creator: `get_saved_bytes(did, cid)` only finds a
//! block that `did` itself stored, even if another account stored the same
//! bytes. Recently read blocks are kept in an LRU cache.

use std::cell::RefCell;
use std::collections::HashSet;
use std::io::Write;
use std::num::NonZeroUsize;

use lru::LruCache;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use crate::codec::{current_time_ms, CarWriter};
use crate::error::{Error, Result};
use crate::schema::Database;
use crate::types::{BlockMap, Cid, CommitData, Did, Rev};

// =============================================================================
// Configuration
// =============================================================================

/// Default number of blocks kept in the read cache.
pub const DEFAULT_BLOCK_CACHE_SIZE: usize = 1024;

/// Configuration for [`RepoStorage`].
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Maximum number of blocks kept in the read cache.
    pub block_cache_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            block_cache_size: DEFAULT_BLOCK_CACHE_SIZE,
        }
    }
}

/// The stored head of one account's repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRoot {
    pub did: Did,
    pub cid: Cid,
    pub rev: Rev,
    pub updated_ms: u64,
}

fn parse_cid(text: String) -> Result<Cid> {
    text.parse()
}

// =============================================================================
// Repository Storage
// =============================================================================

/// SQLite-backed repository store.
///
/// Owns one connection. Open one `RepoStorage` per thread or process that
/// writes; they coordinate only through the database.
pub struct RepoStorage {
    conn: Connection,
    cache: RefCell<LruCache<(Did, Cid), Vec<u8>>>,
}

impl RepoStorage {
    /// Wraps an initialized connection.
    pub fn new(conn: Connection, config: StorageConfig) -> Self {
        let capacity = NonZeroUsize::new(config.block_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            conn,
            cache: RefCell::new(LruCache::new(capacity)),
        }
    }

    /// Opens (and initializes if needed) a database file.
    pub fn open(path: impl AsRef<std::path::Path>, config: StorageConfig) -> Result<Self> {
        Ok(Self::new(Database::open(path)?.into_connection(), config))
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // =========================================================================
    // Root Pointer
    // =========================================================================

    /// Returns the current head commit, or `None` for an unknown account.
    ///
    /// `for_update` asks for exclusive access to the root row for the rest of
    /// the enclosing transaction. SQLite write transactions are opened with
    /// `BEGIN IMMEDIATE` and hold the database write lock, so inside one the
    /// read is already exclusive; outside one the flag has no effect and the
    /// compare-and-swap in [`RepoStorage::commit_staged`] still protects the
    /// write.
    pub fn get_head(&self, did: &Did, for_update: bool) -> Result<Option<Cid>> {
        if for_update && self.conn.is_autocommit() {
            debug!(did = %did, "for_update head read outside a transaction");
        }
        Ok(self.get_root(did)?.map(|root| root.cid))
    }

    /// Returns the head together with its revision and update time.
    pub fn get_root(&self, did: &Did) -> Result<Option<RepoRoot>> {
        read_root(&self.conn, did)
    }

    /// Lists every account that has a repository.
    pub fn list_repos(&self) -> Result<Vec<RepoRoot>> {
        let mut stmt = self
            .conn
            .prepare("SELECT did, cid, rev, updated_ms FROM repo_root ORDER BY did")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut roots = Vec::new();
        for row in rows {
            let (did, cid, rev, updated_ms) = row?;
            roots.push(RepoRoot {
                did: Did::new(did),
                cid: parse_cid(cid)?,
                rev: Rev::from_raw(rev),
                updated_ms: updated_ms as u64,
            });
        }
        Ok(roots)
    }

    // =========================================================================
    // Blocks
    // =========================================================================

    /// Stores one block for `did`. Storing an existing block is a no-op.
    pub fn put_block(&self, did: &Did, cid: &Cid, bytes: &[u8], rev: &Rev) -> Result<()> {
        insert_block(&self.conn, did, cid, bytes, rev)
    }

    /// Stores many blocks for `did` in one transaction.
    pub fn put_many(&mut self, did: &Did, blocks: &BlockMap, rev: &Rev) -> Result<()> {
        let tx = self.conn.transaction()?;
        for (cid, bytes) in blocks.iter() {
            insert_block(&tx, did, cid, bytes, rev)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Reads a block that `did` stored.
    pub fn get_saved_bytes(&self, did: &Did, cid: &Cid) -> Result<Option<Vec<u8>>> {
        let key = (did.clone(), *cid);
        if let Some(bytes) = self.cache.borrow_mut().get(&key) {
            return Ok(Some(bytes.clone()));
        }

        let bytes: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT content FROM ipld_block WHERE creator = ? AND cid = ?",
                params![did.as_str(), cid.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(ref bytes) = bytes {
            self.cache.borrow_mut().put(key, bytes.clone());
        }
        Ok(bytes)
    }

    /// Returns true if `did` stored this block.
    pub fn has_saved_block(&self, did: &Did, cid: &Cid) -> Result<bool> {
        if self.cache.borrow().contains(&(did.clone(), *cid)) {
            return Ok(true);
        }
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM ipld_block WHERE creator = ? AND cid = ?",
                params![did.as_str(), cid.to_string()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Reads many blocks, reporting the ones `did` does not have.
    pub fn get_blocks(&self, did: &Did, cids: &[Cid]) -> Result<(BlockMap, Vec<Cid>)> {
        let mut blocks = BlockMap::new();
        let mut missing = Vec::new();
        for cid in cids {
            match self.get_saved_bytes(did, cid)? {
                Some(bytes) => blocks.set(*cid, bytes),
                None => missing.push(*cid),
            }
        }
        Ok((blocks, missing))
    }

    // =========================================================================
    // Commits
    // =========================================================================

    /// Atomically stores a commit's blocks and makes it the head.
    ///
    /// # Errors
    ///
    /// - `Error::Misordered` if `prev_head` is not the stored head, or if it
    ///   disagrees with `commit.prev`. Nothing is written.
    /// - `Error::DuplicateConflict` if this commit is already in the chain.
    pub fn commit_staged(
        &mut self,
        did: &Did,
        commit: &CommitData,
        prev_head: Option<&Cid>,
    ) -> Result<()> {
        if commit.prev.as_ref() != prev_head {
            return Err(Error::Misordered {
                did: did.to_string(),
                expected: display_opt(prev_head),
                actual: format!("commit built on {}", display_opt(commit.prev.as_ref())),
            });
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let already_committed = tx
            .query_row(
                "SELECT 1 FROM repo_commit_history WHERE creator = ? AND commit_cid = ?",
                params![did.as_str(), commit.cid.to_string()],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if already_committed {
            return Err(Error::DuplicateConflict(format!(
                "commit {} is already in the chain of {}",
                commit.cid, did
            )));
        }

        // (a) blocks, (b) commit-block associations
        for (cid, bytes) in commit.new_blocks.iter() {
            insert_block(&tx, did, cid, bytes, &commit.rev)?;
            tx.execute(
                "INSERT OR IGNORE INTO repo_commit_block (creator, commit_cid, block) VALUES (?, ?, ?)",
                params![did.as_str(), commit.cid.to_string(), cid.to_string()],
            )?;
        }

        // (c) compare-and-swap the root
        let now_ms = current_time_ms() as i64;
        let swapped = match prev_head {
            Some(prev) => tx.execute(
                "UPDATE repo_root SET cid = ?1, rev = ?2, updated_ms = ?3
                 WHERE did = ?4 AND cid = ?5",
                params![
                    commit.cid.to_string(),
                    commit.rev.as_str(),
                    now_ms,
                    did.as_str(),
                    prev.to_string()
                ],
            )?,
            None => tx.execute(
                "INSERT INTO repo_root (did, cid, rev, updated_ms) VALUES (?, ?, ?, ?)
                 ON CONFLICT(did) DO NOTHING",
                params![did.as_str(), commit.cid.to_string(), commit.rev.as_str(), now_ms],
            )?,
        };

        if swapped == 0 {
            let actual = read_root(&tx, did)?.map(|root| root.cid);
            // Dropping the transaction rolls back (a) and (b).
            drop(tx);
            return Err(Error::Misordered {
                did: did.to_string(),
                expected: display_opt(prev_head),
                actual: display_opt(actual.as_ref()),
            });
        }

        // (d) chain edge
        tx.execute(
            "INSERT INTO repo_commit_history (creator, commit_cid, prev, rev) VALUES (?, ?, ?, ?)",
            params![
                did.as_str(),
                commit.cid.to_string(),
                commit.prev.map(|p| p.to_string()),
                commit.rev.as_str()
            ],
        )?;

        tx.commit()?;

        let mut cache = self.cache.borrow_mut();
        for (cid, bytes) in commit.new_blocks.iter() {
            cache.put((did.clone(), *cid), bytes.clone());
        }
        debug!(did = %did, commit = %commit.cid, rev = %commit.rev, blocks = commit.new_blocks.len(), "commit stored");
        Ok(())
    }

    /// Walks the chain from `latest` back to `earliest`, oldest first.
    ///
    /// `earliest` is exclusive and `latest` inclusive, so the result is
    /// exactly the commits made after `earliest`. With `earliest = None` the
    /// walk runs to the first commit.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` for an unknown account, an unknown `latest`, or an
    ///   `earliest` that is not an ancestor of `latest`
    /// - `Error::CorruptChain` if a link or a commit block is missing midway
    pub fn get_commit_path(
        &self,
        did: &Did,
        latest: &Cid,
        earliest: Option<&Cid>,
    ) -> Result<Vec<Cid>> {
        if self.get_root(did)?.is_none() {
            return Err(Error::not_found(format!("repository {}", did)));
        }

        let chain_len: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM repo_commit_history WHERE creator = ?",
            [did.as_str()],
            |row| row.get(0),
        )?;

        let mut path = Vec::new();
        let mut current = Some(*latest);
        while let Some(cid) = current {
            if Some(&cid) == earliest {
                break;
            }

            let prev: Option<Option<String>> = self
                .conn
                .query_row(
                    "SELECT prev FROM repo_commit_history WHERE creator = ? AND commit_cid = ?",
                    params![did.as_str(), cid.to_string()],
                    |row| row.get(0),
                )
                .optional()?;

            let prev = match prev {
                Some(prev) => prev,
                None if path.is_empty() => {
                    return Err(Error::not_found(format!("commit {} in {}", cid, did)))
                }
                None => {
                    return Err(Error::CorruptChain {
                        did: did.to_string(),
                        reason: format!("no history for ancestor commit {}", cid),
                    })
                }
            };

            if !self.has_saved_block(did, &cid)? {
                return Err(Error::CorruptChain {
                    did: did.to_string(),
                    reason: format!("commit block {} is missing", cid),
                });
            }

            path.push(cid);
            if path.len() as i64 > chain_len {
                return Err(Error::CorruptChain {
                    did: did.to_string(),
                    reason: "commit chain contains a cycle".to_string(),
                });
            }
            current = prev.map(parse_cid).transpose()?;
        }

        if let (Some(earliest), None) = (earliest, current) {
            return Err(Error::not_found(format!(
                "commit {} is not an ancestor of {}",
                earliest, latest
            )));
        }

        path.reverse();
        Ok(path)
    }

    /// Returns the blocks a commit introduced.
    pub fn get_commit_blocks(&self, did: &Did, commit: &Cid) -> Result<Vec<Cid>> {
        let mut stmt = self.conn.prepare(
            "SELECT block FROM repo_commit_block WHERE creator = ? AND commit_cid = ? ORDER BY block",
        )?;
        let rows = stmt.query_map(params![did.as_str(), commit.to_string()], |row| {
            row.get::<_, String>(0)
        })?;

        let mut blocks = Vec::new();
        for row in rows {
            blocks.push(parse_cid(row?)?);
        }
        Ok(blocks)
    }

    // =========================================================================
    // Export
    // =========================================================================

    /// Streams the blocks added after `since` into a container rooted at the
    /// current head.
    ///
    /// With `since = None` this is a full checkout; otherwise it is the diff a
    /// peer holding `since` needs to reach the head.
    pub fn write_car<W: Write>(&self, did: &Did, since: Option<&Cid>, out: W) -> Result<W> {
        let root = self
            .get_root(did)?
            .ok_or_else(|| Error::not_found(format!("repository {}", did)))?;
        let commits = self.get_commit_path(did, &root.cid, since)?;

        let mut car = CarWriter::new(out, &root.cid)?;
        let mut seen = HashSet::new();
        for commit in &commits {
            for block in self.get_commit_blocks(did, commit)? {
                if !seen.insert(block) {
                    continue;
                }
                let bytes = self.get_saved_bytes(did, &block)?.ok_or_else(|| Error::CorruptChain {
                    did: did.to_string(),
                    reason: format!("block {} of commit {} is missing", block, commit),
                })?;
                car.write_block(&block, &bytes)?;
            }
        }

        debug!(did = %did, commits = commits.len(), blocks = car.blocks_written(), "exported repository");
        car.finish()
    }

    /// Convenience wrapper around [`RepoStorage::write_car`].
    pub fn export_car(&self, did: &Did, since: Option<&Cid>) -> Result<Vec<u8>> {
        self.write_car(did, since, Vec::new())
    }

    // =========================================================================
    // Account Deletion
    // =========================================================================

    /// Removes every block, commit and root row of an account.
    pub fn destroy_repo(&mut self, did: &Did) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        for table in ["ipld_block", "repo_commit_block", "repo_commit_history"] {
            tx.execute(&format!("DELETE FROM {} WHERE creator = ?", table), [did.as_str()])?;
        }
        tx.execute("DELETE FROM repo_root WHERE did = ?", [did.as_str()])?;
        tx.commit()?;

        self.cache.borrow_mut().clear();
        Ok(())
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn display_opt(cid: Option<&Cid>) -> String {
    cid.map_or_else(|| "none".to_string(), |c| c.to_string())
}

fn read_root(conn: &Connection, did: &Did) -> Result<Option<RepoRoot>> {
    let row = conn
        .query_row(
            "SELECT cid, rev, updated_ms FROM repo_root WHERE did = ?",
            [did.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()?;

    row.map(|(cid, rev, updated_ms)| {
        Ok(RepoRoot {
            did: did.clone(),
            cid: parse_cid(cid)?,
            rev: Rev::from_raw(rev),
            updated_ms: updated_ms as u64,
        })
    })
    .transpose()
}

fn insert_block(conn: &Connection, did: &Did, cid: &Cid, bytes: &[u8], rev: &Rev) -> Result<()> {
    if !cid.verifies(bytes) {
        return Err(Error::Unprocessable(format!("block bytes do not hash to {}", cid)));
    }
    conn.execute(
        "INSERT INTO ipld_block (creator, cid, repo_rev, size, content) VALUES (?, ?, ?, ?, ?)
         ON CONFLICT DO NOTHING",
        params![did.as_str(), cid.to_string(), rev.as_str(), bytes.len() as i64, bytes],
    )?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
