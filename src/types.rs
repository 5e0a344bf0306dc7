//! # Core Types for repohost
//!
//! Newtypes for every identifier that crosses a module boundary. Each wraps a
//! primitive but is a distinct type, so a `Seq` cannot be passed where a `Rev`
//! is expected and a `Did` cannot be confused with a handle string.
//!
//! ## Identifier Overview
//!
//! ```text
//! ┌──────────┬────────────────────────────┬──────────────────────────────────┐
//! │ Type     │ Example                    │ Meaning                          │
//! ├──────────┼────────────────────────────┼──────────────────────────────────┤
//! │ Did      │ did:plc:alice              │ account, scope of one repository │
//! │ Cid      │ 9f86d0...(64 hex)          │ SHA-256 of an immutable block    │
//! │ Rev      │ 3kd2n7wq5bm22              │ sortable commit revision (TID)   │
//! │ AtUri    │ at://did:plc:alice/c/rkey  │ one record in one repository     │
//! │ Seq      │ 1042                       │ position in the event log        │
//! └──────────┴────────────────────────────┴──────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use data_encoding::{Encoding, Specification};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::codec::current_time_ms;
use crate::error::{Error, Result};

// =============================================================================
// Account Identity
// =============================================================================

/// A durable account identifier.
///
/// The DID scopes a repository, its commit chain and every block the account
/// created. Handles change; DIDs do not.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Did(String);

impl Did {
    /// Creates a DID from any string-like value.
    pub fn new(did: impl Into<String>) -> Self {
        Self(did.into())
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Did {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Did {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Content Addressing
// =============================================================================

/// Content identifier: the SHA-256 digest of a block's bytes.
///
/// # Invariants
///
/// - Two blocks with equal bytes always have equal CIDs
/// - A CID never changes once computed (blocks are immutable)
///
/// Displayed and serialized as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cid([u8; 32]);

impl Cid {
    /// Length of the raw digest in bytes.
    pub const LEN: usize = 32;

    /// Computes the CID for a block.
    pub fn for_bytes(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut raw = [0u8; 32];
        raw.copy_from_slice(&digest);
        Self(raw)
    }

    /// Rebuilds a CID from its raw digest bytes.
    pub fn from_raw_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Unprocessable(format!("cid must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self(raw))
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns true if `data` hashes to this CID.
    pub fn verifies(&self, data: &[u8]) -> bool {
        Self::for_bytes(data) == *self
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self)
    }
}

impl FromStr for Cid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut raw = [0u8; 32];
        hex::decode_to_slice(s, &mut raw)
            .map_err(|e| Error::Unprocessable(format!("malformed cid '{}': {}", s, e)))?;
        Ok(Self(raw))
    }
}

impl Serialize for Cid {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A set of blocks keyed by CID.
///
/// Ordered so that exports and checksums are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockMap(BTreeMap<Cid, Vec<u8>>);

impl BlockMap {
    /// Creates an empty block map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a block, returning its CID.
    pub fn add(&mut self, data: Vec<u8>) -> Cid {
        let cid = Cid::for_bytes(&data);
        self.0.insert(cid, data);
        cid
    }

    /// Inserts a block under a CID the caller already computed.
    pub fn set(&mut self, cid: Cid, data: Vec<u8>) {
        self.0.insert(cid, data);
    }

    pub fn get(&self, cid: &Cid) -> Option<&Vec<u8>> {
        self.0.get(cid)
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.0.contains_key(cid)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total payload size in bytes.
    pub fn byte_size(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Cid, &Vec<u8>)> {
        self.0.iter()
    }

    pub fn cids(&self) -> impl Iterator<Item = &Cid> {
        self.0.keys()
    }

    /// Moves every block of `other` into this map.
    pub fn extend(&mut self, other: BlockMap) {
        self.0.extend(other.0);
    }
}

// =============================================================================
// Revisions
// =============================================================================

/// Sortable base32 alphabet: symbol order matches byte order.
const S32_ALPHABET: &str = "234567abcdefghijklmnopqrstuvwxyz";

fn tid_base32() -> &'static Encoding {
    static ENCODING: OnceLock<Encoding> = OnceLock::new();
    ENCODING.get_or_init(|| {
        let mut spec = Specification::new();
        spec.symbols.push_str(S32_ALPHABET);
        // BASE32HEX also sorts in symbol order, so revisions stay comparable.
        spec.encoding()
            .unwrap_or_else(|_| data_encoding::BASE32HEX_NOPAD.clone())
    })
}

/// A commit revision: a 13-character, base32-sortable timestamp identifier.
///
/// # Format
///
/// 53 bits of microseconds since the epoch followed by a 10-bit clock id,
/// big-endian, base32-encoded with an alphabet whose byte order matches
/// numeric order. Comparing two `Rev`s as strings therefore compares them in
/// time.
///
/// # Invariants
///
/// - Strictly increases along one account's commit chain
/// - [`Rev::next_after`] never returns a value `<=` its argument, even if the
///   wall clock stalls or steps backwards
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rev(String);

impl Rev {
    /// Wraps an existing revision string.
    pub fn from_raw(rev: impl Into<String>) -> Self {
        Self(rev.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Generates a revision from the current time.
    pub fn now() -> Self {
        let micros = current_time_ms().saturating_mul(1000);
        let clock_id = rand::random::<u64>() & 0x3ff;
        Self::from_parts(micros, clock_id)
    }

    /// Generates a revision strictly greater than `prev`.
    pub fn next_after(prev: Option<&Rev>) -> Self {
        let candidate = Self::now();
        match prev {
            Some(prev) if candidate <= *prev => match prev.decode() {
                Some(value) => Self::encode(value + 1),
                None => candidate,
            },
            _ => candidate,
        }
    }

    fn from_parts(micros: u64, clock_id: u64) -> Self {
        Self::encode(((micros & 0x1f_ffff_ffff_ffff) << 10) | (clock_id & 0x3ff))
    }

    fn encode(value: u64) -> Self {
        Self(tid_base32().encode(&value.to_be_bytes()))
    }

    fn decode(&self) -> Option<u64> {
        let raw: [u8; 8] = tid_base32().decode(self.0.as_bytes()).ok()?.try_into().ok()?;
        Some(u64::from_be_bytes(raw))
    }
}

impl fmt::Display for Rev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Event Log Position
// =============================================================================

/// Position in the event log.
///
/// # Invariants
///
/// - Strictly increasing in append order
/// - Gaps are legal (deleted or trimmed rows), reordering is not
/// - Starts at 1; "last seen = N" means resume from `N.next()`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seq(u64);

impl Seq {
    /// The first position in the log.
    pub const FIRST: Seq = Seq(1);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Record Addressing
// =============================================================================

/// Address of a record: `at://<did>/<collection>/<rkey>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AtUri {
    did: Did,
    collection: String,
    rkey: String,
}

impl AtUri {
    pub fn new(did: Did, collection: impl Into<String>, rkey: impl Into<String>) -> Self {
        Self {
            did,
            collection: collection.into(),
            rkey: rkey.into(),
        }
    }

    /// Builds a URI from a repository path of the form `collection/rkey`.
    pub fn from_path(did: &Did, path: &str) -> Result<Self> {
        let (collection, rkey) = path
            .split_once('/')
            .ok_or_else(|| Error::Unprocessable(format!("malformed record path '{}'", path)))?;
        Ok(Self::new(did.clone(), collection, rkey))
    }

    /// The repository that owns this record.
    pub fn host(&self) -> &Did {
        &self.did
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn rkey(&self) -> &str {
        &self.rkey
    }

    /// The `collection/rkey` path inside the repository.
    pub fn path(&self) -> String {
        format!("{}/{}", self.collection, self.rkey)
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at://{}/{}/{}", self.did, self.collection, self.rkey)
    }
}

impl FromStr for AtUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix("at://")
            .ok_or_else(|| Error::Unprocessable(format!("malformed at-uri '{}'", s)))?;
        let mut parts = rest.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(did), Some(collection), Some(rkey))
                if !did.is_empty() && !collection.is_empty() && !rkey.is_empty() =>
            {
                Ok(Self::new(Did::new(did), collection, rkey))
            }
            _ => Err(Error::Unprocessable(format!("malformed at-uri '{}'", s))),
        }
    }
}

impl Serialize for AtUri {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AtUri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Commits and Operations
// =============================================================================

/// What a write did to one record path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOpAction {
    Create,
    Update,
    Delete,
}

/// One record-level change carried by a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOp {
    pub action: WriteOpAction,
    /// `collection/rkey`
    pub path: String,
    /// New record CID; `None` for deletes.
    pub cid: Option<Cid>,
}

impl RecordOp {
    /// The record URI this op touches inside `did`'s repository.
    pub fn uri(&self, did: &Did) -> Result<AtUri> {
        AtUri::from_path(did, &self.path)
    }
}

/// A fully formatted commit, ready to be staged.
///
/// Produced by [`crate::repo::Repo`], consumed by
/// [`crate::storage::RepoStorage::commit_staged`] and then by
/// [`crate::sequencer::Sequencer::sequence_commit`].
#[derive(Debug, Clone)]
pub struct CommitData {
    /// The new commit node's CID.
    pub cid: Cid,
    /// Revision of the new commit.
    pub rev: Rev,
    /// Revision of the commit this one replaces.
    pub since: Option<Rev>,
    /// CID of the commit this one replaces.
    pub prev: Option<Cid>,
    /// Blocks introduced by this commit (commit node included).
    pub new_blocks: BlockMap,
    /// Blocks no longer reachable from the new head.
    pub removed_cids: Vec<Cid>,
    /// Record-level operations, in write order.
    pub ops: Vec<RecordOp>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cid_is_content_derived() {
        let a = Cid::for_bytes(b"hello");
        let b = Cid::for_bytes(b"hello");
        let c = Cid::for_bytes(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.verifies(b"hello"));
        assert!(!a.verifies(b"hellO"));
    }

    #[test]
    fn test_cid_string_form_parses_back() {
        let cid = Cid::for_bytes(b"block");
        let text = cid.to_string();
        assert_eq!(text.len(), 64);
        assert_eq!(text.parse::<Cid>().unwrap(), cid);
        assert!("not-a-cid".parse::<Cid>().is_err());
    }

    #[test]
    fn test_rev_is_sortable_and_monotonic() {
        let first = Rev::now();
        assert_eq!(first.as_str().len(), 13);

        // Even a revision far in the future is followed by a greater one.
        let future = Rev::from_raw("bzzzzzzzzzzz2");
        let next = Rev::next_after(Some(&future));
        assert!(next > future);

        let mut prev = Rev::next_after(None);
        for _ in 0..100 {
            let next = Rev::next_after(Some(&prev));
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_at_uri_parse_and_display() {
        let uri: AtUri = "at://did:plc:alice/app.bsky.feed.post/3k2".parse().unwrap();
        assert_eq!(uri.host().as_str(), "did:plc:alice");
        assert_eq!(uri.collection(), "app.bsky.feed.post");
        assert_eq!(uri.rkey(), "3k2");
        assert_eq!(uri.path(), "app.bsky.feed.post/3k2");
        assert_eq!(uri.to_string(), "at://did:plc:alice/app.bsky.feed.post/3k2");

        assert!("https://example.com".parse::<AtUri>().is_err());
        assert!("at://did:plc:alice/only-collection".parse::<AtUri>().is_err());
    }

    #[test]
    fn test_seq_ordering() {
        assert!(Seq::FIRST < Seq::FIRST.next());
        assert_eq!(Seq::from_raw(41).next().as_raw(), 42);
    }

    #[test]
    fn test_block_map_tracks_size() {
        let mut blocks = BlockMap::new();
        let cid = blocks.add(b"abc".to_vec());
        blocks.add(b"abc".to_vec());
        blocks.add(b"de".to_vec());
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks.byte_size(), 5);
        assert!(blocks.contains(&cid));
    }
}
