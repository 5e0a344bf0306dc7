//! # Sequenced Events
//!
//! The event log carries exactly four kinds of event. They form a closed sum
//! type, [`SeqEvt`], so a consumer matches on them exhaustively and an
//! unrecognized kind is a typed error rather than something silently ignored.
//!
//! ## Envelope vs Body
//!
//! ```text
//! ┌─────────────────────────── SeqRow (envelope) ───────────────────────────┐
//! │ seq │ did │ event_type │ checksum │ sequenced_ms │ payload (body bytes) │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                                           │ decode()
//!                                                           ▼
//!                       SeqEvt::Commit | Identity | Account | Tombstone
//! ```
//!
//! The envelope is always usable. Decoding the body can fail (checksum
//! mismatch, truncated block container, unknown kind) and the consumer then
//! degrades to what the envelope alone allows.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{blocks_to_car, compute_checksum, current_time_ms, read_car};
use crate::error::{Error, Result};
use crate::types::{BlockMap, Cid, CommitData, Did, RecordOp, Rev, Seq};

/// Commits with more ops than this are sequenced without their blocks.
pub const MAX_COMMIT_OPS: usize = 200;

/// Commits whose new blocks exceed this many bytes are sequenced without them.
pub const MAX_COMMIT_BLOCK_BYTES: usize = 1024 * 1024;

// =============================================================================
// Event Kind
// =============================================================================

/// The closed set of event kinds stored in `repo_seq.event_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Commit,
    Identity,
    Account,
    Tombstone,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Commit => "commit",
            EventType::Identity => "identity",
            EventType::Account => "account",
            EventType::Tombstone => "tombstone",
        }
    }

    /// Parses a stored kind.
    ///
    /// # Errors
    ///
    /// `Error::UnknownEventKind` for anything outside the closed set.
    pub fn parse(kind: &str) -> Result<Self> {
        match kind {
            "commit" => Ok(EventType::Commit),
            "identity" => Ok(EventType::Identity),
            "account" => Ok(EventType::Account),
            "tombstone" => Ok(EventType::Tombstone),
            other => Err(Error::UnknownEventKind(other.to_string())),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Event Bodies
// =============================================================================

/// A repository commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitEvt {
    pub repo: Did,
    pub commit: Cid,
    pub prev: Option<Cid>,
    pub rev: Rev,
    pub since: Option<Rev>,
    pub ops: Vec<RecordOp>,
    /// Container of the blocks this commit introduced; empty when `too_big`.
    #[serde(with = "hex")]
    pub blocks: Vec<u8>,
    /// The commit was too large to ship inline; consumers must resync.
    pub too_big: bool,
    pub time: u64,
}

impl CommitEvt {
    /// Formats the event for a staged commit.
    pub fn from_commit(did: &Did, commit: &CommitData) -> Result<Self> {
        let too_big = commit.ops.len() > MAX_COMMIT_OPS
            || commit.new_blocks.byte_size() > MAX_COMMIT_BLOCK_BYTES;
        let blocks = if too_big {
            Vec::new()
        } else {
            blocks_to_car(&commit.cid, &commit.new_blocks)?
        };

        Ok(Self {
            repo: did.clone(),
            commit: commit.cid,
            prev: commit.prev,
            rev: commit.rev.clone(),
            since: commit.since.clone(),
            ops: commit.ops.clone(),
            blocks,
            too_big,
            time: current_time_ms(),
        })
    }

    /// Decodes the inline block container.
    ///
    /// # Errors
    ///
    /// `Error::Unprocessable` if the container is truncated or corrupt, or if
    /// its root is not this commit.
    pub fn decode_blocks(&self) -> Result<BlockMap> {
        let (root, blocks) = read_car(&self.blocks)?;
        if root != self.commit {
            return Err(Error::Unprocessable(format!(
                "block container rooted at {} but commit is {}",
                root, self.commit
            )));
        }
        Ok(blocks)
    }
}

/// A handle change (or a request to re-resolve one).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityEvt {
    pub did: Did,
    pub handle: Option<String>,
}

/// Upstream account states other than active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Deactivated,
    Suspended,
    Takendown,
    Deleted,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Deactivated => "deactivated",
            AccountStatus::Suspended => "suspended",
            AccountStatus::Takendown => "takendown",
            AccountStatus::Deleted => "deleted",
        }
    }
}

/// An account's hosting status changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEvt {
    pub did: Did,
    pub active: bool,
    pub status: Option<AccountStatus>,
}

/// The account is gone for good.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TombstoneEvt {
    pub did: Did,
}

/// Every event the log can carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeqEvt {
    Commit(CommitEvt),
    Identity(IdentityEvt),
    Account(AccountEvt),
    Tombstone(TombstoneEvt),
}

impl SeqEvt {
    pub fn event_type(&self) -> EventType {
        match self {
            SeqEvt::Commit(_) => EventType::Commit,
            SeqEvt::Identity(_) => EventType::Identity,
            SeqEvt::Account(_) => EventType::Account,
            SeqEvt::Tombstone(_) => EventType::Tombstone,
        }
    }

    /// The account the event is about.
    pub fn did(&self) -> &Did {
        match self {
            SeqEvt::Commit(evt) => &evt.repo,
            SeqEvt::Identity(evt) => &evt.did,
            SeqEvt::Account(evt) => &evt.did,
            SeqEvt::Tombstone(evt) => &evt.did,
        }
    }

    /// Serializes the body.
    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            SeqEvt::Commit(evt) => serde_json::to_vec(evt)?,
            SeqEvt::Identity(evt) => serde_json::to_vec(evt)?,
            SeqEvt::Account(evt) => serde_json::to_vec(evt)?,
            SeqEvt::Tombstone(evt) => serde_json::to_vec(evt)?,
        };
        Ok(bytes)
    }

    /// Deserializes a body of the given kind.
    ///
    /// # Errors
    ///
    /// `Error::Unprocessable` if the bytes are not a valid body of that kind.
    pub fn decode_payload(event_type: EventType, payload: &[u8]) -> Result<Self> {
        fn parse<T: serde::de::DeserializeOwned>(kind: EventType, payload: &[u8]) -> Result<T> {
            serde_json::from_slice(payload)
                .map_err(|e| Error::Unprocessable(format!("{} event body: {}", kind, e)))
        }

        Ok(match event_type {
            EventType::Commit => SeqEvt::Commit(parse(event_type, payload)?),
            EventType::Identity => SeqEvt::Identity(parse(event_type, payload)?),
            EventType::Account => SeqEvt::Account(parse(event_type, payload)?),
            EventType::Tombstone => SeqEvt::Tombstone(parse(event_type, payload)?),
        })
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// One row of the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeqRow {
    pub seq: Seq,
    pub did: Did,
    /// Stored kind, kept raw so that an unknown kind still yields an envelope.
    pub event_type: String,
    #[serde(with = "hex")]
    pub payload: Vec<u8>,
    pub checksum: i64,
    pub sequenced_ms: u64,
}

impl SeqRow {
    /// Decodes the body, verifying the stored checksum first.
    ///
    /// # Errors
    ///
    /// - `Error::Unprocessable` on a checksum mismatch or malformed body
    /// - `Error::UnknownEventKind` if the stored kind is not recognized
    pub fn decode(&self) -> Result<SeqEvt> {
        if compute_checksum(&self.payload) != self.checksum {
            return Err(Error::Unprocessable(format!(
                "checksum mismatch for event {}",
                self.seq
            )));
        }
        let kind = EventType::parse(&self.event_type)?;
        SeqEvt::decode_payload(kind, &self.payload)
    }
}

// =============================================================================
// Tests
// =============================================================================
