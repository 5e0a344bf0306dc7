//! # Repository Structure
//!
//! The block layout of one account's repository. The store treats it as
//! opaque bytes; this module is the only place that knows what the blocks
//! mean.
//!
//! ```text
//!   commit node  {did, version, data, rev, prev}
//!        │ data
//!        ▼
//!   record index {"app.post/3k1": cid, "app.post/3k2": cid, ...}   (sorted)
//!        │
//!        ▼
//!   record blocks (JSON values)
//! ```
//!
//! A write never mutates a block. Formatting a commit produces new record
//! blocks, a new index block and a new commit node; the old ones stay
//! reachable through `prev`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::storage::RepoStorage;
use crate::types::{AtUri, BlockMap, Cid, CommitData, Did, RecordOp, Rev, WriteOpAction};

/// Layout version written into every commit node.
pub const REPO_VERSION: u32 = 3;

// =============================================================================
// Blocks
// =============================================================================

/// The root block of a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitNode {
    pub did: Did,
    pub version: u32,
    /// CID of the record index block.
    pub data: Cid,
    pub rev: Rev,
    pub prev: Option<Cid>,
}

/// Sorted map from `collection/rkey` to record CID.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordIndex(BTreeMap<String, Cid>);

impl RecordIndex {
    pub fn get(&self, path: &str) -> Option<&Cid> {
        self.0.get(path)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Cid)> {
        self.0.iter()
    }
}

// =============================================================================
// Writes
// =============================================================================

/// One requested change to a repository.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordWrite {
    Create {
        collection: String,
        rkey: String,
        record: Value,
    },
    Update {
        collection: String,
        rkey: String,
        record: Value,
    },
    Delete {
        collection: String,
        rkey: String,
    },
}

impl RecordWrite {
    pub fn create(collection: impl Into<String>, rkey: impl Into<String>, record: Value) -> Self {
        Self::Create {
            collection: collection.into(),
            rkey: rkey.into(),
            record,
        }
    }

    pub fn update(collection: impl Into<String>, rkey: impl Into<String>, record: Value) -> Self {
        Self::Update {
            collection: collection.into(),
            rkey: rkey.into(),
            record,
        }
    }

    pub fn delete(collection: impl Into<String>, rkey: impl Into<String>) -> Self {
        Self::Delete {
            collection: collection.into(),
            rkey: rkey.into(),
        }
    }

    /// The `collection/rkey` path this write targets.
    pub fn path(&self) -> String {
        match self {
            Self::Create { collection, rkey, .. }
            | Self::Update { collection, rkey, .. }
            | Self::Delete { collection, rkey } => format!("{}/{}", collection, rkey),
        }
    }
}

// =============================================================================
// Repo
// =============================================================================

/// A loaded repository head: the commit node plus its record index.
#[derive(Debug, Clone)]
pub struct Repo {
    commit: Cid,
    node: CommitNode,
    index: RecordIndex,
}

impl Repo {
    /// Loads the repository at its current head, or `None` if the account has
    /// no repository.
    pub fn load(storage: &RepoStorage, did: &Did) -> Result<Option<Repo>> {
        match storage.get_head(did, false)? {
            Some(head) => Self::load_at(storage, did, &head).map(Some),
            None => Ok(None),
        }
    }

    /// Loads the repository as of a specific commit.
    pub fn load_at(storage: &RepoStorage, did: &Did, commit: &Cid) -> Result<Repo> {
        let node: CommitNode = read_block(storage, did, commit)?;
        if &node.did != did {
            return Err(Error::CorruptChain {
                did: did.to_string(),
                reason: format!("commit {} belongs to {}", commit, node.did),
            });
        }
        let index: RecordIndex = read_block(storage, did, &node.data)?;
        Ok(Repo {
            commit: *commit,
            node,
            index,
        })
    }

    pub fn did(&self) -> &Did {
        &self.node.did
    }

    pub fn head(&self) -> &Cid {
        &self.commit
    }

    pub fn rev(&self) -> &Rev {
        &self.node.rev
    }

    pub fn index(&self) -> &RecordIndex {
        &self.index
    }

    /// Formats the first commit of a new repository.
    pub fn format_init_commit(did: &Did, writes: &[RecordWrite]) -> Result<CommitData> {
        build_commit(did, None, RecordIndex::default(), writes)
    }

    /// Formats a commit on top of this head.
    ///
    /// # Errors
    ///
    /// - `Error::DuplicateConflict` when creating a path that already exists
    /// - `Error::NotFound` when updating or deleting a path that does not
    pub fn format_commit(&self, writes: &[RecordWrite]) -> Result<CommitData> {
        build_commit(
            &self.node.did,
            Some((&self.commit, &self.node)),
            self.index.clone(),
            writes,
        )
    }

    /// Reads every record of this head.
    ///
    /// # Errors
    ///
    /// `Error::CorruptChain` if the index names a block the account does not
    /// have.
    pub fn checkout(&self, storage: &RepoStorage) -> Result<Checkout> {
        let did = self.did();
        let mut records = Vec::with_capacity(self.index.len());
        for (path, cid) in self.index.iter() {
            let bytes = storage
                .get_saved_bytes(did, cid)?
                .ok_or_else(|| Error::CorruptChain {
                    did: did.to_string(),
                    reason: format!("record block {} for {} is missing", cid, path),
                })?;
            records.push(CheckoutRecord {
                uri: AtUri::from_path(did, path)?,
                cid: *cid,
                bytes,
            });
        }
        Ok(Checkout {
            did: did.clone(),
            commit: self.commit,
            rev: self.node.rev.clone(),
            records,
        })
    }
}

/// The full record set of one repository head.
#[derive(Debug, Clone)]
pub struct Checkout {
    pub did: Did,
    pub commit: Cid,
    pub rev: Rev,
    pub records: Vec<CheckoutRecord>,
}

#[derive(Debug, Clone)]
pub struct CheckoutRecord {
    pub uri: AtUri,
    pub cid: Cid,
    pub bytes: Vec<u8>,
}

impl CheckoutRecord {
    /// Decodes the record value.
    pub fn value(&self) -> Result<Value> {
        serde_json::from_slice(&self.bytes)
            .map_err(|e| Error::Unprocessable(format!("record {}: {}", self.uri, e)))
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn read_block<T: serde::de::DeserializeOwned>(
    storage: &RepoStorage,
    did: &Did,
    cid: &Cid,
) -> Result<T> {
    let bytes = storage
        .get_saved_bytes(did, cid)?
        .ok_or_else(|| Error::CorruptChain {
            did: did.to_string(),
            reason: format!("block {} is missing", cid),
        })?;
    serde_json::from_slice(&bytes).map_err(|e| Error::CorruptChain {
        did: did.to_string(),
        reason: format!("block {} is not a repository node: {}", cid, e),
    })
}

fn build_commit(
    did: &Did,
    prev: Option<(&Cid, &CommitNode)>,
    mut index: RecordIndex,
    writes: &[RecordWrite],
) -> Result<CommitData> {
    let mut blocks = BlockMap::new();
    let mut removed = Vec::new();
    let mut ops = Vec::with_capacity(writes.len());

    for write in writes {
        let path = write.path();
        match write {
            RecordWrite::Create { record, .. } => {
                if index.0.contains_key(&path) {
                    return Err(Error::DuplicateConflict(format!(
                        "record {} already exists in {}",
                        path, did
                    )));
                }
                let cid = blocks.add(serde_json::to_vec(record)?);
                index.0.insert(path.clone(), cid);
                ops.push(RecordOp {
                    action: WriteOpAction::Create,
                    path,
                    cid: Some(cid),
                });
            }
            RecordWrite::Update { record, .. } => {
                let cid = blocks.add(serde_json::to_vec(record)?);
                let old = index
                    .0
                    .insert(path.clone(), cid)
                    .ok_or_else(|| Error::not_found(format!("record {} in {}", path, did)))?;
                removed.push(old);
                ops.push(RecordOp {
                    action: WriteOpAction::Update,
                    path,
                    cid: Some(cid),
                });
            }
            RecordWrite::Delete { .. } => {
                let old = index
                    .0
                    .remove(&path)
                    .ok_or_else(|| Error::not_found(format!("record {} in {}", path, did)))?;
                removed.push(old);
                ops.push(RecordOp {
                    action: WriteOpAction::Delete,
                    path,
                    cid: None,
                });
            }
        }
    }

    let data = blocks.add(serde_json::to_vec(&index)?);
    if let Some((_, node)) = prev {
        if node.data != data {
            removed.push(node.data);
        }
    }

    let node = CommitNode {
        did: did.clone(),
        version: REPO_VERSION,
        data,
        rev: Rev::next_after(prev.map(|(_, node)| &node.rev)),
        prev: prev.map(|(cid, _)| *cid),
    };
    let cid = blocks.add(serde_json::to_vec(&node)?);

    Ok(CommitData {
        cid,
        rev: node.rev,
        since: prev.map(|(_, node)| node.rev.clone()),
        prev: node.prev,
        new_blocks: blocks,
        removed_cids: removed,
        ops,
    })
}

// =============================================================================
// Tests
// =============================================================================
