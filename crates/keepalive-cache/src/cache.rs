//! The keep-alive cache: per-destination queues of idle connections.
//!
//! # Architecture
//!
//! ```text
//! put(key, conn)
//!   → registry lock: make sure a reaper is alive, resolve TTL
//!     → TTL == 0          → close conn (after unlock)
//!     → queue lock: push  → close evicted tail, if any (after unlock)
//!
//! get(key)
//!   → registry lock: look up queue (released immediately)
//!     → queue lock: pop head if fresh
//!
//! reaper (every 5s)
//!   → snapshot queues → expire each under its own lock
//!     → close expired (no locks held) → remove emptied queues
//! ```
//!
//! Locks are always taken registry first, queue second. No lock is held
//! while a connection is closed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::{Deserialize, Deserializer, Error as _};
use serde::ser::{Error as _, Serialize, Serializer};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::clock::{Clock, TokioClock};
use crate::config::{KeepAliveConfig, TimeoutHint};
use crate::connection::KeepAliveConnection;
use crate::error::KeepAliveError;
use crate::key::ConnectionKey;
use crate::queue::ClientQueue;
use crate::reaper;

type SharedQueue<C> = Arc<Mutex<ClientQueue<C>>>;

/// Why a connection is being closed by the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CloseReason {
    /// Resolved TTL was zero.
    Rejected,
    /// Pushed out of a full queue.
    Evicted,
    /// Idle past its queue's TTL.
    Expired,
    /// Cache shut down or dropped.
    Shutdown,
}

impl CloseReason {
    fn as_str(self) -> &'static str {
        match self {
            CloseReason::Rejected => "rejected",
            CloseReason::Evicted => "evicted",
            CloseReason::Expired => "expired",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// Handle to the running reaper task.
struct ReaperSlot {
    handle: JoinHandle<()>,
    /// Spawn sequence number; a reaper whose generation no longer matches
    /// the slot exits at its next wake-up.
    generation: u64,
}

/// Registry state guarded by the registry lock.
struct State<C> {
    pools: HashMap<ConnectionKey, SharedQueue<C>>,
    reaper: Option<ReaperSlot>,
}

#[derive(Debug, Default)]
struct Counters {
    reaper_spawns: AtomicU64,
    reused: AtomicU64,
    misses: AtomicU64,
    evicted: AtomicU64,
    expired: AtomicU64,
    rejected: AtomicU64,
}

/// Cache internals shared with the reaper.
pub(crate) struct Shared<C: KeepAliveConnection> {
    state: Mutex<State<C>>,
    config: KeepAliveConfig,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

/// Snapshot of cache statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Destinations with a queue in the registry.
    pub destinations: usize,
    /// Idle connections across all queues.
    pub idle: usize,
    /// Whether a reaper task is currently alive.
    pub reaper_running: bool,
    /// Reaper tasks spawned over the cache's lifetime.
    pub reaper_spawns: u64,
    /// Successful `get` calls.
    pub reused: u64,
    /// `get` calls that returned nothing.
    pub misses: u64,
    /// Connections pushed out of a full queue.
    pub evicted: u64,
    /// Connections reclaimed by the reaper.
    pub expired: u64,
    /// Connections refused because their TTL resolved to zero.
    pub rejected: u64,
}

/// Keep-alive cache of idle connections keyed by destination.
///
/// Cloning the cache is cheap and yields another handle to the same
/// registry. Dropping the last handle closes every idle connection.
///
/// The cache deliberately exposes no map-like view of its queues, and it
/// refuses to be serialized or deserialized.
pub struct KeepAliveCache<C: KeepAliveConnection> {
    shared: Arc<Shared<C>>,
}

impl<C: KeepAliveConnection> KeepAliveCache<C> {
    /// Create a cache driven by tokio's clock.
    pub fn new(config: KeepAliveConfig) -> Self {
        Self::with_clock(config, Arc::new(TokioClock))
    }

    /// Create a cache with an injected clock.
    pub fn with_clock(config: KeepAliveConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    pools: HashMap::new(),
                    reaper: None,
                }),
                config,
                clock,
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &KeepAliveConfig {
        &self.shared.config
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared<C>> {
        &self.shared
    }

    /// Return an idle connection to the cache.
    ///
    /// The TTL hint and proxy flag are read from the connection itself.
    pub async fn put(&self, key: ConnectionKey, connection: C) {
        let hint = connection.keep_alive_timeout();
        let via_proxy = connection.using_proxy();
        self.put_with_hint(key, connection, hint, via_proxy).await;
    }

    /// Return an idle connection with an explicit TTL hint and role.
    ///
    /// If the TTL resolves to zero the connection is closed instead of
    /// pooled. If the destination's queue is full its oldest entry is
    /// closed to make room. Closing always happens after the locks are
    /// released.
    pub async fn put_with_hint(
        &self,
        key: ConnectionKey,
        connection: C,
        hint: TimeoutHint,
        via_proxy: bool,
    ) {
        let shared = &self.shared;
        let ttl = shared.config.resolve_ttl(hint, via_proxy);

        let (to_close, reason) = {
            let mut state = shared.state.lock().await;
            shared.ensure_reaper(&mut state);

            if ttl.is_zero() {
                (Some(connection), CloseReason::Rejected)
            } else {
                let queue = Arc::clone(state.pools.entry(key.clone()).or_insert_with(|| {
                    tracing::debug!(
                        destination = %key,
                        ttl_ms = ttl.as_millis() as u64,
                        via_proxy,
                        "created keep-alive queue"
                    );
                    Arc::new(Mutex::new(ClientQueue::new(ttl, shared.config.capacity())))
                }));
                let mut queue = queue.lock().await;
                let evicted = queue.push(connection, shared.clock.now());
                tracing::trace!(destination = %key, idle = queue.len(), "pooled idle connection");
                (evicted, CloseReason::Evicted)
            }
        };

        if let Some(connection) = to_close {
            match reason {
                CloseReason::Rejected => shared.counters.rejected.fetch_add(1, Ordering::Relaxed),
                _ => shared.counters.evicted.fetch_add(1, Ordering::Relaxed),
            };
            tracing::debug!(destination = %key, reason = reason.as_str(), "closing connection instead of pooling");
            close_connection(&key, connection, reason);
        }
    }

    /// Take a fresh idle connection for `key`, if one is available.
    ///
    /// Returns `None` when the destination has no queue, the queue is empty,
    /// or its most recently pooled connection is already stale. Stale
    /// entries are left for the reaper.
    pub async fn get(&self, key: &ConnectionKey) -> Option<C> {
        let queue = {
            let state = self.shared.state.lock().await;
            state.pools.get(key).cloned()
        };

        let connection = match queue {
            Some(queue) => {
                let mut queue = queue.lock().await;
                queue.get(self.shared.clock.now())
            }
            None => None,
        };

        let counter = if connection.is_some() {
            &self.shared.counters.reused
        } else {
            &self.shared.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        connection
    }

    /// Number of idle connections pooled for `key`.
    pub async fn idle_count(&self, key: &ConnectionKey) -> usize {
        let queue = {
            let state = self.shared.state.lock().await;
            state.pools.get(key).cloned()
        };
        let Some(queue) = queue else {
            return 0;
        };
        let queue = queue.lock().await;
        queue.len()
    }

    /// Whether the registry currently has a queue for `key`.
    pub async fn contains(&self, key: &ConnectionKey) -> bool {
        self.shared.state.lock().await.pools.contains_key(key)
    }

    /// Whether the registry has no queues at all.
    pub async fn is_empty(&self) -> bool {
        self.shared.state.lock().await.pools.is_empty()
    }

    /// Collect a statistics snapshot.
    pub async fn stats(&self) -> CacheStats {
        let (queues, reaper_running) = {
            let state = self.shared.state.lock().await;
            (self.shared.snapshot(&state), state.reaper_alive())
        };

        let mut idle = 0;
        for (_, queue) in &queues {
            idle += queue.lock().await.len();
        }

        let counters = &self.shared.counters;
        CacheStats {
            destinations: queues.len(),
            idle,
            reaper_running,
            reaper_spawns: counters.reaper_spawns.load(Ordering::Relaxed),
            reused: counters.reused.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            evicted: counters.evicted.load(Ordering::Relaxed),
            expired: counters.expired.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Log per-destination idle counts at `tracing::info` level.
    pub async fn log_stats(&self) {
        let queues = {
            let state = self.shared.state.lock().await;
            self.shared.snapshot(&state)
        };

        for (key, queue) in queues {
            let queue = queue.lock().await;
            tracing::info!(
                destination = %key,
                idle = queue.len(),
                capacity = queue.capacity(),
                ttl_ms = queue.ttl().as_millis() as u64,
                "keep-alive queue statistics"
            );
        }
    }

    /// Stop the reaper and close every idle connection.
    ///
    /// Returns the number of connections closed. The cache stays usable; a
    /// later `put` starts a new reaper.
    pub async fn shutdown(&self) -> usize {
        let queues: Vec<(ConnectionKey, SharedQueue<C>)> = {
            let mut state = self.shared.state.lock().await;
            // The detached reaper notices the empty slot and exits.
            state.reaper = None;
            state.pools.drain().collect()
        };

        let mut batch = Vec::new();
        for (key, queue) in queues {
            for connection in queue.lock().await.drain() {
                batch.push((key.clone(), connection));
            }
        }

        let closed = batch.len();
        close_all(batch, CloseReason::Shutdown);
        tracing::info!(closed, "keep-alive cache shut down");
        closed
    }
}

impl<C: KeepAliveConnection> Shared<C> {
    /// Spawn a reaper unless one is alive. Called with the registry lock held.
    fn ensure_reaper(self: &Arc<Self>, state: &mut State<C>) {
        if state.reaper_alive() {
            return;
        }
        if state.reaper.is_some() {
            tracing::warn!("keep-alive reaper died unexpectedly, respawning");
        }

        let generation = self.counters.reaper_spawns.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = tokio::spawn(reaper::run(
            Arc::downgrade(self),
            Arc::clone(&self.clock),
            generation,
        ));
        state.reaper = Some(ReaperSlot { handle, generation });
        tracing::debug!(generation, "spawned keep-alive reaper");
    }

    fn snapshot(&self, state: &State<C>) -> Vec<(ConnectionKey, SharedQueue<C>)> {
        state
            .pools
            .iter()
            .map(|(key, queue)| (key.clone(), Arc::clone(queue)))
            .collect()
    }

    /// One reaper pass. Returns `false` when the reaper of `generation`
    /// should exit.
    pub(crate) async fn sweep(&self, generation: u64) -> bool {
        let queues = {
            let state = self.state.lock().await;
            if !state.owns_reaper(generation) {
                return false;
            }
            self.snapshot(&state)
        };

        let now = self.clock.now();
        let mut expired = Vec::new();
        let mut emptied = Vec::new();
        let mut batch = Vec::new();

        for (key, queue) in queues {
            let mut queue = queue.lock().await;
            queue.expire(now, &mut batch);
            if queue.is_empty() {
                emptied.push(key.clone());
            }
            expired.extend(batch.drain(..).map(|connection| (key.clone(), connection)));
        }

        let reaped = expired.len();
        if reaped > 0 {
            self.counters
                .expired
                .fetch_add(reaped as u64, Ordering::Relaxed);
            close_all(expired, CloseReason::Expired);
        }

        let mut state = self.state.lock().await;
        for key in &emptied {
            Self::remove_vector(&mut state, key).await;
        }

        if reaped > 0 {
            tracing::info!(
                reaped,
                removed_queues = emptied.len(),
                remaining_queues = state.pools.len(),
                "reaped idle connections"
            );
        }

        if !state.owns_reaper(generation) {
            return false;
        }
        if state.pools.is_empty() {
            state.reaper = None;
            return false;
        }
        true
    }

    /// Drop the queue for `key` if it is still empty. A queue refilled by a
    /// `put` since the sweep looked at it is kept.
    async fn remove_vector(state: &mut State<C>, key: &ConnectionKey) {
        let Some(queue) = state.pools.get(key) else {
            return;
        };
        if queue.lock().await.is_empty() {
            state.pools.remove(key);
            tracing::debug!(destination = %key, "removed empty keep-alive queue");
        }
    }
}

impl<C> State<C> {
    fn reaper_alive(&self) -> bool {
        self.reaper
            .as_ref()
            .is_some_and(|slot| !slot.handle.is_finished())
    }

    fn owns_reaper(&self, generation: u64) -> bool {
        self.reaper
            .as_ref()
            .is_some_and(|slot| slot.generation == generation)
    }
}

impl<C: KeepAliveConnection> Drop for Shared<C> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(slot) = state.reaper.take() {
            slot.handle.abort();
        }

        let mut batch = Vec::new();
        for (key, queue) in state.pools.drain() {
            // Nothing else can hold the queue once the registry is gone.
            let Ok(mut queue) = queue.try_lock() else {
                continue;
            };
            for connection in queue.drain() {
                batch.push((key.clone(), connection));
            }
        }
        if !batch.is_empty() {
            tracing::debug!(closing = batch.len(), "keep-alive cache dropped");
            close_all(batch, CloseReason::Shutdown);
        }
    }
}

/// Close one connection, logging (not propagating) failures.
fn close_connection<C: KeepAliveConnection>(
    key: &ConnectionKey,
    mut connection: C,
    reason: CloseReason,
) -> bool {
    match connection.close_server() {
        Ok(()) => {
            tracing::trace!(destination = %key, reason = reason.as_str(), "closed connection");
            true
        }
        Err(source) => {
            let err = KeepAliveError::Close {
                destination: key.to_string(),
                source,
            };
            tracing::warn!(reason = reason.as_str(), error = %err, "failed to close connection");
            false
        }
    }
}

/// Close a batch. A failure never stops the rest of the batch.
fn close_all<C: KeepAliveConnection>(batch: Vec<(ConnectionKey, C)>, reason: CloseReason) -> usize {
    let mut failed = 0;
    for (key, connection) in batch {
        if !close_connection(&key, connection, reason) {
            failed += 1;
        }
    }
    failed
}

impl<C: KeepAliveConnection> Clone for KeepAliveCache<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: KeepAliveConnection> Default for KeepAliveCache<C> {
    fn default() -> Self {
        Self::new(KeepAliveConfig::default())
    }
}

// ── Debug impl (cannot auto-derive due to dyn trait) ────────────────

impl<C: KeepAliveConnection> fmt::Debug for KeepAliveCache<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeepAliveCache")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

// ── Persistence is refused ──────────────────────────────────────────

impl<C: KeepAliveConnection> Serialize for KeepAliveCache<C> {
    fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(S::Error::custom(KeepAliveError::Unsupported(
            "keep-alive cache state cannot be serialized",
        )))
    }
}

impl<'de, C: KeepAliveConnection> Deserialize<'de> for KeepAliveCache<C> {
    fn deserialize<D: Deserializer<'de>>(_deserializer: D) -> Result<Self, D::Error> {
        Err(D::Error::custom(KeepAliveError::Unsupported(
            "keep-alive cache state cannot be deserialized",
        )))
    }
}
