//! # repohost - Personal Data Repository Host
//!
//! repohost stores content-addressed per-account repositories, publishes every
//! change to an ordered event log, and materializes the records into
//! queryable tables. Everything runs on embedded SQLite.
//!
//! - **Repository store**: blocks, commit chains and a compare-and-swap root
//!   per account
//! - **Event sequencer**: a gap-tolerant, strictly increasing log with
//!   catch-up + live tailing
//! - **Dispatch queue**: durable topic fan-out with per-topic ordering and
//!   at-least-once delivery
//! - **Indexer**: order-independent, idempotent materialization of records,
//!   aggregates and notifications
//!
//! ## Architecture Overview
//!
//! ```text
//!  ┌──────────────────────────── RepoHost ────────────────────────────┐
//!  │ apply_writes ──► RepoStorage.commit_staged ──► Sequencer.append  │
//!  └───────────────────────────────────────────────┬──────────────────┘
//!                                                  │ repo_seq
//!                                                  ▼
//!                          RepoSubscription (tail from cursor)
//!                                                  │ repo/<n>
//!                                                  ▼
//!                                  DispatchQueue (message_queue)
//!                                     │         │         │
//!                                     ▼         ▼         ▼
//!                                   lane      lane      lane
//!                                     └────┬────┴─────────┘
//!                                          ▼
//!                                   IndexingService
//!                        record / post / like / follow / ... / post_agg
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Chain integrity**: a stored head is reachable back to the first
//!    commit through stored `prev` links
//! 2. **Atomic commits**: blocks, chain edge and root move together or not
//!    at all
//! 3. **Log order**: `seq` strictly increases and is never reused
//! 4. **Topic order**: messages of one topic are handled one at a time, in
//!    insertion order
//! 5. **Convergence**: the index reaches the same state whatever order and
//!    however many times events arrive
//!
//! ## Module Organization
//!
//! - [`error`]: one error enum for every failure mode
//! - [`schema`]: SQLite DDL and database initialization
//! - [`types`]: domain newtypes (Did, Cid, AtUri, Rev, Seq) and commit data
//! - [`codec`]: checksums, varints and the block container format
//! - [`repo`]: repository structure and commit formatting
//! - [`storage`]: the repository store
//! - [`events`]: event kinds and the log envelope
//! - [`writer`] / [`reader`] / [`subscription`] / [`sequencer`]: the event log
//! - [`queue`]: the dispatch queue
//! - [`indexer`]: materialization and the log subscription feeding it
//! - [`api`]: the host facade

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for repohost operations.
pub mod error;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// Domain types. Uses the newtype pattern for identifiers.
pub mod types;

/// Checksums, clocks and the block container codec.
pub mod codec;

/// Repository structure: commit nodes, record index, checkouts.
pub mod repo;

/// The repository store.
pub mod storage;

/// Event kinds carried by the log.
pub mod events;

/// Group-commit log writer.
///
/// Appends are collected over a short window and written in one transaction,
/// each inside its own SAVEPOINT so one bad event cannot sink its batch.
pub mod writer;

/// Log reads.
pub mod reader;

/// Commit notifications and catch-up + live tails.
pub mod subscription;

/// The event sequencer handle.
pub mod sequencer;

/// Durable topic-based dispatch.
pub mod queue;

/// Record materialization.
pub mod indexer;

/// Host facade. The main entry point is [`RepoHost`](api::RepoHost).
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::{HostConfig, RepoHost, WriteResult};
pub use error::{Error, Result};
pub use schema::Database;

pub use types::{AtUri, BlockMap, Cid, CommitData, Did, RecordOp, Rev, Seq, WriteOpAction};

pub use events::{AccountStatus, EventType, SeqEvt, SeqRow};
pub use repo::{RecordWrite, Repo};
pub use sequencer::{Sequencer, SequencerConfig};
pub use storage::{RepoRoot, RepoStorage, StorageConfig};
pub use subscription::EventTail;

pub use queue::{handler, DispatchQueue, ListenerRegistry, Message, QueueConfig};

pub use indexer::{
    IdResolver, IndexingService, RepoSubscription, RepoSyncReport, SubscriptionConfig,
};
