//! # Live Tailing of the Event Log
//!
//! A tail delivers every event at or after a starting seq: first the history
//! already in the log, then new events as they are committed, with no gap and
//! no duplicate at the boundary.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  tail(from = 100)                           head = 500                  │
//! │       │                                          │                      │
//! │       ▼                                          ▼                      │
//! │  ┌──────────────────────────────────┐  ┌────────────────────────────┐   │
//! │  │ Catch-up: read 100..500 in pages │─►│ Live: wait for a wake-up,  │   │
//! │  │ from SQLite                      │◄─│ then read from next seq    │   │
//! │  └──────────────────────────────────┘  └────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wake-ups, not payloads
//!
//! The broadcast channel only carries "seq N was committed". Events are always
//! read from the log itself, so:
//!
//! - a lagged receiver loses nothing (it just re-reads from its position)
//! - events appended by another process are picked up by the poll timer even
//!   though they never pass through this process's broadcast channel
//!
//! The receiver is subscribed before the first catch-up read, so a commit that
//! lands between the last empty read and the first wait is never missed.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::events::SeqRow;
use crate::types::Seq;

// =============================================================================
// Configuration
// =============================================================================

/// Default capacity of the wake-up channel.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// Default page size for catch-up reads.
pub const DEFAULT_CATCHUP_BATCH_SIZE: usize = 500;

/// Default interval at which a live tail re-reads the log without a wake-up.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 200;

// =============================================================================
// Subscription Manager
// =============================================================================

/// Fans commit notifications out to live tails.
///
/// Cloned into the writer thread; every clone shares one channel and head.
#[derive(Clone)]
pub struct SubscriptionManager {
    broadcast_tx: broadcast::Sender<Seq>,
    head: Arc<AtomicU64>,
}

impl SubscriptionManager {
    pub fn new(capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            broadcast_tx,
            head: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Seq> {
        self.broadcast_tx.subscribe()
    }

    /// Highest seq committed through this process, `Seq(0)` before any.
    pub fn head(&self) -> Seq {
        Seq::from_raw(self.head.load(Ordering::Acquire))
    }

    /// Called by the writer after a batch commits.
    pub fn notify_committed(&self, seq: Seq) {
        self.head.fetch_max(seq.as_raw(), Ordering::AcqRel);
        // No receivers is fine.
        let _ = self.broadcast_tx.send(seq);
    }

    pub fn subscriber_count(&self) -> usize {
        self.broadcast_tx.receiver_count()
    }
}

// =============================================================================
// Event Tail
// =============================================================================

type ReadFn = Box<dyn Fn(Seq, usize) -> BoxFuture<'static, Result<Vec<SeqRow>>> + Send + Sync>;

enum TailPhase {
    /// Paging through rows already in the log.
    CatchingUp,
    /// Waiting for the next wake-up.
    Live,
    Ended,
}

/// A catch-up + live stream of log rows.
///
/// # Example
///
/// ```rust,ignore
/// let mut tail = sequencer.tail(Seq::FIRST).await?;
/// while let Some(row) = tail.next().await {
///     let row = row?;
///     match row.decode() { ... }
/// }
/// ```
pub struct EventTail {
    phase: TailPhase,
    next_seq: Seq,
    read_fn: ReadFn,
    receiver: broadcast::Receiver<Seq>,
    receiver_closed: bool,
    batch_size: usize,
    poll_interval: Duration,
    buffer: VecDeque<SeqRow>,
}

impl EventTail {
    /// Creates a tail starting at `from`.
    ///
    /// `receiver` must already be subscribed; `read_fn(from, limit)` returns
    /// up to `limit` rows with `seq >= from` in order.
    pub fn new<F, Fut>(
        from: Seq,
        receiver: broadcast::Receiver<Seq>,
        read_fn: F,
        batch_size: usize,
        poll_interval: Duration,
    ) -> Self
    where
        F: Fn(Seq, usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<SeqRow>>> + Send + 'static,
    {
        Self {
            phase: TailPhase::CatchingUp,
            next_seq: from,
            read_fn: Box::new(move |seq, limit| Box::pin(read_fn(seq, limit))),
            receiver,
            receiver_closed: false,
            batch_size: batch_size.max(1),
            poll_interval,
            buffer: VecDeque::new(),
        }
    }

    /// Returns the next row, waiting for one if the log is drained.
    ///
    /// Returns `None` only after an error has been yielded.
    pub async fn next(&mut self) -> Option<Result<SeqRow>> {
        loop {
            if let Some(row) = self.buffer.pop_front() {
                self.next_seq = row.seq.next();
                return Some(Ok(row));
            }

            match self.phase {
                TailPhase::Ended => return None,

                TailPhase::CatchingUp => match (self.read_fn)(self.next_seq, self.batch_size).await {
                    Ok(rows) => {
                        if rows.len() < self.batch_size {
                            self.phase = TailPhase::Live;
                        }
                        self.buffer.extend(rows);
                    }
                    Err(e) => {
                        self.phase = TailPhase::Ended;
                        return Some(Err(e));
                    }
                },

                TailPhase::Live => {
                    self.wait_for_wakeup().await;
                    self.phase = TailPhase::CatchingUp;
                }
            }
        }
    }

    async fn wait_for_wakeup(&mut self) {
        if self.receiver_closed {
            tokio::time::sleep(self.poll_interval).await;
            return;
        }

        let poll = tokio::time::sleep(self.poll_interval);
        tokio::pin!(poll);
        let receiver = &mut self.receiver;
        let next_seq = self.next_seq;
        let closed = loop {
            tokio::select! {
                received = receiver.recv() => match received {
                    // Already delivered; keep waiting.
                    Ok(seq) if seq < next_seq => continue,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => break false,
                    Err(broadcast::error::RecvError::Closed) => break true,
                },
                _ = &mut poll => break false,
            }
        };
        self.receiver_closed = closed;
    }

    /// Whether the tail has caught up with the log.
    pub fn is_live(&self) -> bool {
        matches!(self.phase, TailPhase::Live)
    }

    /// The seq the next delivered row will have at least.
    pub fn position(&self) -> Seq {
        self.next_seq
    }
}

// =============================================================================
// Tests
// =============================================================================
