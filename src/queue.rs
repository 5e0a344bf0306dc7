//! # Dispatch Queue
//!
//! A durable, topic-partitioned work queue. `send` only inserts a row and
//! returns; delivery to handlers happens on separate tasks, so producers are
//! never throttled by slow consumers.
//!
//! ## Lanes
//!
//! ```text
//!   send(topic, payload)
//!        │ INSERT message_queue
//!        ▼
//!   ┌──────────────┐   route (in id order)   ┌──────────────────────────┐
//!   │ dispatcher   │────────────────────────►│ lane "repo/0"  (task)    │─► handlers
//!   │ task         │────────────────────────►│ lane "repo/1"  (task)    │─► handlers
//!   │ wake | sweep │────────────────────────►│ lane "*"       (task)    │─► wildcard handlers
//!   └──────────────┘                         └──────────────────────────┘
//! ```
//!
//! Each topic gets its own lane, a task draining an ordered channel, so one
//! topic's slow handler never delays another topic, and within a topic
//! messages reach handlers in submission order. Wildcard listeners share one
//! extra lane that sees every message, independently of the topic lanes.
//!
//! ## Startup
//!
//! A new queue accepts `send` at once but routes nothing until `start` (or
//! `process_all`) is called. Register listeners first: a message routed while
//! its topic has no listener counts as done.
//!
//! ## Progress
//!
//! A message is done when every lane it was routed to has run its handlers.
//! The consumer cursor in `message_queue_cursor` advances only over the
//! contiguous prefix of done messages, so after a restart the queue resumes
//! at the first unfinished one.
//!
//! ## Failures
//!
//! Handler errors and panics are caught per message and logged. The message
//! still counts as done: there is no automatic retry.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use rusqlite::{params, Connection};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::current_time_ms;
use crate::error::{Error, Result};
use crate::schema::{lock_connection, share, with_connection, Database, SharedConnection};

// =============================================================================
// Configuration
// =============================================================================

/// Topic that receives every message.
pub const WILDCARD: &str = "*";

/// Default consumer name.
pub const DEFAULT_CONSUMER: &str = "dispatch";

/// Default number of rows routed per database read.
pub const DEFAULT_FETCH_BATCH_SIZE: usize = 500;

/// Default interval between sweeps for rows inserted by other processes.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Configuration for a [`DispatchQueue`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Durable consumer name. Each name has its own cursor and sees every
    /// message; run at most one live queue per name.
    pub consumer: String,
    pub fetch_batch_size: usize,
    pub sweep_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            consumer: DEFAULT_CONSUMER.to_string(),
            fetch_batch_size: DEFAULT_FETCH_BATCH_SIZE,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

// =============================================================================
// Messages and Handlers
// =============================================================================

/// A queued message as delivered to handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u64,
    pub topic: String,
    pub payload: Vec<u8>,
}

/// A message handler.
pub type Handler = Arc<dyn Fn(Message) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wraps an async closure as a [`Handler`].
///
/// ```rust,ignore
/// queue.listen("repo/0", handler(|msg| async move {
///     println!("{}", msg.id);
///     Ok(())
/// }));
/// ```
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |msg| f(msg).boxed())
}

// =============================================================================
// Listener Registry
// =============================================================================

/// Topic → handlers map, owned by whoever builds the queue.
///
/// Not a global: two queues in one process each get their own registry, or
/// deliberately share one.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<HashMap<String, Vec<Handler>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for an exact topic or for [`WILDCARD`].
    pub fn listen(&self, topic: impl Into<String>, handler: Handler) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.entry(topic.into()).or_default().push(handler);
    }

    /// Handlers registered for exactly `topic`.
    pub fn handlers_for(&self, topic: &str) -> Vec<Handler> {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        listeners.get(topic).cloned().unwrap_or_default()
    }

    pub fn has_listeners(&self, topic: &str) -> bool {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        listeners.get(topic).map_or(false, |h| !h.is_empty())
    }
}

// =============================================================================
// Completion Tracking
// =============================================================================

/// Routed ids, tracking which prefix is complete.
#[derive(Debug, Default)]
struct ConsecutiveList {
    items: BTreeMap<u64, bool>,
}

impl ConsecutiveList {
    fn push(&mut self, id: u64) {
        self.items.insert(id, false);
    }

    /// Marks `id` done and returns the last id of the newly completed prefix.
    fn complete(&mut self, id: u64) -> Option<u64> {
        if let Some(done) = self.items.get_mut(&id) {
            *done = true;
        }
        let mut last = None;
        while let Some((&front, &true)) = self.items.first_key_value() {
            last = Some(front);
            self.items.pop_first();
        }
        last
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Lane {
    Topic(String),
    Wildcard,
}

struct RouteState {
    next_fetch: u64,
    lanes: HashMap<Lane, mpsc::UnboundedSender<Message>>,
    /// Lanes still holding each routed message.
    outstanding: HashMap<u64, usize>,
    completed: ConsecutiveList,
}

// =============================================================================
// Dispatch Queue
// =============================================================================

struct QueueInner {
    config: QueueConfig,
    conn: SharedConnection,
    registry: Arc<ListenerRegistry>,
    closed: AtomicBool,
    wake: Notify,
    state: Mutex<RouteState>,
    pending: watch::Sender<usize>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a dispatch queue. Cheap to clone.
#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<QueueInner>,
}

impl DispatchQueue {
    /// Opens a queue on a database file with its own registry.
    pub async fn open(path: impl AsRef<Path>, config: QueueConfig) -> Result<Self> {
        let conn = Database::open(path)?.into_connection();
        Self::with_registry(conn, Arc::new(ListenerRegistry::new()), config).await
    }

    /// Builds a queue on an initialized connection and an injected registry.
    ///
    /// Nothing is routed until [`start`](Self::start), so unfinished messages
    /// from a previous run wait for their listeners.
    pub async fn with_registry(
        conn: Connection,
        registry: Arc<ListenerRegistry>,
        config: QueueConfig,
    ) -> Result<Self> {
        let conn = share(conn);
        let consumer = config.consumer.clone();
        let cursor = with_connection(&conn, move |conn| ensure_cursor(conn, &consumer)).await?;

        let (pending, _) = watch::channel(0usize);
        let inner = Arc::new(QueueInner {
            config,
            conn,
            registry,
            closed: AtomicBool::new(false),
            wake: Notify::new(),
            state: Mutex::new(RouteState {
                next_fetch: cursor,
                lanes: HashMap::new(),
                outstanding: HashMap::new(),
                completed: ConsecutiveList::default(),
            }),
            pending,
            dispatcher: Mutex::new(None),
        });

        debug!(consumer = %inner.config.consumer, cursor, "dispatch queue opened");
        Ok(Self { inner })
    }

    /// Starts the dispatcher task, which routes pending rows as they appear.
    ///
    /// Call after registering listeners. Idempotent; a no-op after `destroy`.
    /// Must be called inside a Tokio runtime.
    pub fn start(&self) {
        let mut dispatcher = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if dispatcher.is_some() || self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        *dispatcher = Some(tokio::spawn(run_dispatcher(self.inner.clone())));
        self.inner.wake.notify_one();
        debug!(consumer = %self.inner.config.consumer, "dispatch queue started");
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.inner.registry
    }

    /// Registers a handler for `topic` (or [`WILDCARD`]).
    pub fn listen(&self, topic: impl Into<String>, handler: Handler) {
        self.inner.registry.listen(topic, handler);
    }

    /// Durably enqueues a message and returns its id.
    ///
    /// Never waits on handlers.
    pub async fn send(&self, topic: impl Into<String>, payload: Vec<u8>) -> Result<u64> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::QueueClosed);
        }
        let topic = topic.into();
        let id = with_connection(&self.inner.conn, move |conn| {
            conn.execute(
                "INSERT INTO message_queue (topic, payload, created_ms) VALUES (?, ?, ?)",
                params![topic, payload, current_time_ms() as i64],
            )?;
            Ok(conn.last_insert_rowid() as u64)
        })
        .await?;
        self.inner.wake.notify_one();
        Ok(id)
    }

    /// Routes everything pending, then waits until it has all been handled.
    ///
    /// Starts the dispatcher if it is not running yet.
    pub async fn process_all(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::QueueClosed);
        }
        self.start();
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || route_pending(&inner))
            .await
            .map_err(|e| Error::Schema(format!("routing task failed: {}", e)))??;
        self.on_idle().await;
        Ok(())
    }

    /// Waits until every routed message has been handled.
    ///
    /// In-flight handlers run to completion; returns at once after `destroy`.
    pub async fn on_idle(&self) {
        let mut rx = self.inner.pending.subscribe();
        loop {
            if *rx.borrow_and_update() == 0 || self.inner.closed.load(Ordering::Acquire) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Number of routed messages not yet handled.
    pub fn pending(&self) -> usize {
        *self.inner.pending.borrow()
    }

    /// Deletes rows that every consumer has passed.
    pub async fn prune(&self) -> Result<usize> {
        let deleted = with_connection(&self.inner.conn, |conn| {
            Ok(conn.execute(
                "DELETE FROM message_queue
                 WHERE id < (SELECT MIN(cursor) FROM message_queue_cursor)",
                [],
            )?)
        })
        .await?;
        debug!(deleted, "pruned message queue");
        Ok(deleted)
    }

    /// Stops accepting and routing messages.
    ///
    /// Handlers already running finish; messages still queued in lanes are
    /// left unhandled and the cursor stays before them.
    pub fn destroy(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        if let Ok(mut state) = self.inner.lock_state() {
            state.lanes.clear();
        }
        self.inner.pending.send_replace(0);
        info!(consumer = %self.inner.config.consumer, "dispatch queue destroyed");
    }
}

// =============================================================================
// Routing
// =============================================================================

impl QueueInner {
    fn lock_state(&self) -> Result<MutexGuard<'_, RouteState>> {
        self.state
            .lock()
            .map_err(|_| Error::Schema("queue state lock poisoned".to_string()))
    }

    /// Records that one lane finished a message.
    async fn complete_delivery(&self, id: u64) {
        let (done, advanced) = match self.lock_state() {
            Ok(mut state) => match state.outstanding.get_mut(&id) {
                Some(remaining) if *remaining > 1 => {
                    *remaining -= 1;
                    (false, None)
                }
                Some(_) => {
                    state.outstanding.remove(&id);
                    (true, state.completed.complete(id))
                }
                None => (false, None),
            },
            Err(e) => {
                error!(error = %e, "cannot record message completion");
                return;
            }
        };

        if let Some(last) = advanced {
            let consumer = self.config.consumer.clone();
            if let Err(e) =
                with_connection(&self.conn, move |conn| store_cursor(conn, &consumer, last + 1)).await
            {
                warn!(error = %e, "failed to persist queue cursor");
            }
        }
        if done {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
        }
    }
}

async fn run_dispatcher(inner: Arc<QueueInner>) {
    loop {
        tokio::select! {
            _ = inner.wake.notified() => {}
            _ = tokio::time::sleep(inner.config.sweep_interval) => {}
        }
        if inner.closed.load(Ordering::Acquire) {
            break;
        }

        let routing = inner.clone();
        match tokio::task::spawn_blocking(move || route_pending(&routing)).await {
            Ok(Ok(0)) => {}
            Ok(Ok(routed)) => debug!(routed, "messages routed"),
            Ok(Err(e)) => error!(error = %e, "message routing failed"),
            Err(e) => error!(error = %e, "message routing task failed"),
        }
    }
}

/// Moves every unrouted row into its lanes, in id order.
///
/// Runs on the blocking pool. The state lock is held for the whole pass, so
/// concurrent passes cannot interleave a topic's messages.
fn route_pending(inner: &Arc<QueueInner>) -> Result<usize> {
    let mut state = inner.lock_state()?;
    let mut routed = 0;
    let mut advanced = None;

    loop {
        if inner.closed.load(Ordering::Acquire) {
            break;
        }
        let rows = {
            let conn = lock_connection(&inner.conn)?;
            fetch_messages(&conn, state.next_fetch, inner.config.fetch_batch_size)?
        };
        let fetched = rows.len();

        for message in rows {
            state.next_fetch = message.id + 1;
            state.completed.push(message.id);

            let mut lanes = Vec::with_capacity(2);
            if inner.registry.has_listeners(&message.topic) {
                lanes.push(Lane::Topic(message.topic.clone()));
            }
            if inner.registry.has_listeners(WILDCARD) {
                lanes.push(Lane::Wildcard);
            }

            if lanes.is_empty() {
                if let Some(last) = state.completed.complete(message.id) {
                    advanced = Some(last);
                }
                continue;
            }

            state.outstanding.insert(message.id, lanes.len());
            inner.pending.send_modify(|n| *n += 1);
            for lane in lanes {
                let sender = state
                    .lanes
                    .entry(lane.clone())
                    .or_insert_with(|| spawn_lane(inner.clone(), lane));
                // A closed lane means the queue is being destroyed.
                let _ = sender.send(message.clone());
            }
            routed += 1;
        }

        if fetched < inner.config.fetch_batch_size {
            break;
        }
    }

    if let Some(last) = advanced {
        let conn = lock_connection(&inner.conn)?;
        store_cursor(&conn, &inner.config.consumer, last + 1)?;
    }
    Ok(routed)
}

fn spawn_lane(inner: Arc<QueueInner>, lane: Lane) -> mpsc::UnboundedSender<Message> {
    let (tx, rx) = mpsc::unbounded_channel();
    // Routing runs on the blocking pool; spawn back onto the runtime.
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(run_lane(inner, lane, rx));
        }
        Err(e) => error!(error = %e, "no runtime to run queue lane"),
    }
    tx
}

async fn run_lane(inner: Arc<QueueInner>, lane: Lane, mut rx: mpsc::UnboundedReceiver<Message>) {
    let topic = match &lane {
        Lane::Topic(topic) => topic.clone(),
        Lane::Wildcard => WILDCARD.to_string(),
    };

    while let Some(message) = rx.recv().await {
        if inner.closed.load(Ordering::Acquire) {
            break;
        }
        for handler in inner.registry.handlers_for(&topic) {
            deliver(&handler, message.clone()).await;
        }
        inner.complete_delivery(message.id).await;
    }
    debug!(topic = %topic, "queue lane stopped");
}

/// Runs one handler, containing errors and panics.
async fn deliver(handler: &Handler, message: Message) {
    let id = message.id;
    let topic = message.topic.clone();

    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(message))) {
        Ok(future) => future,
        Err(_) => {
            error!(id, topic = %topic, "message handler panicked");
            return;
        }
    };

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(id, topic = %topic, error = %e, "message handler failed"),
        Err(_) => error!(id, topic = %topic, "message handler panicked"),
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn ensure_cursor(conn: &Connection, consumer: &str) -> Result<u64> {
    conn.execute(
        "INSERT INTO message_queue_cursor (consumer, cursor) VALUES (?, 1)
         ON CONFLICT(consumer) DO NOTHING",
        [consumer],
    )?;
    let cursor: i64 = conn.query_row(
        "SELECT cursor FROM message_queue_cursor WHERE consumer = ?",
        [consumer],
        |row| row.get(0),
    )?;
    Ok(cursor as u64)
}

fn store_cursor(conn: &Connection, consumer: &str, cursor: u64) -> Result<()> {
    conn.execute(
        "UPDATE message_queue_cursor SET cursor = MAX(cursor, ?) WHERE consumer = ?",
        params![cursor as i64, consumer],
    )?;
    Ok(())
}

fn fetch_messages(conn: &Connection, from: u64, limit: usize) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, topic, payload FROM message_queue WHERE id >= ? ORDER BY id LIMIT ?",
    )?;
    let rows = stmt.query_map(params![from as i64, limit as i64], |row| {
        Ok(Message {
            id: row.get::<_, i64>(0)? as u64,
            topic: row.get(1)?,
            payload: row.get(2)?,
        })
    })?;

    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}

// =============================================================================
// Tests
// =============================================================================
