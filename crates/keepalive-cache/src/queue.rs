//! Per-destination queue of idle connections.
//!
//! Entries are kept in push order: the head is the most recently pushed
//! connection, the tail the oldest. Reuse is LIFO so callers get the
//! connection that idled the shortest time, which is the likeliest to still
//! be open on the server side and to have a warm congestion window.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::ser::{Error as _, Serialize, Serializer};

use crate::error::KeepAliveError;

/// An idle connection and the instant it went idle.
#[derive(Debug)]
pub struct QueueEntry<C> {
    connection: C,
    idle_since: Instant,
}

impl<C> QueueEntry<C> {
    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.idle_since)
    }
}

/// Bounded LIFO stack of idle connections for one destination.
///
/// Not synchronized; the cache wraps each queue in its own mutex.
#[derive(Debug)]
pub struct ClientQueue<C> {
    ttl: Duration,
    max_connections: usize,
    entries: VecDeque<QueueEntry<C>>,
}

impl<C> ClientQueue<C> {
    /// Create an empty queue holding at most `max_connections` entries, each
    /// usable for `ttl` after it went idle.
    pub fn new(ttl: Duration, max_connections: usize) -> Self {
        assert!(max_connections > 0, "keep-alive queue capacity must be positive");
        Self {
            ttl,
            max_connections,
            entries: VecDeque::with_capacity(max_connections),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_stale(&self, entry: &QueueEntry<C>, now: Instant) -> bool {
        entry.idle_for(now) > self.ttl
    }

    /// Push a connection that went idle at `now`.
    ///
    /// When the queue is full the oldest entry is removed and returned; the
    /// caller must close it once it no longer holds any lock.
    pub fn push(&mut self, connection: C, now: Instant) -> Option<C> {
        let evicted = if self.entries.len() >= self.max_connections {
            self.entries.pop_back().map(|entry| entry.connection)
        } else {
            None
        };
        self.entries.push_front(QueueEntry {
            connection,
            idle_since: now,
        });
        assert!(
            self.entries.len() <= self.max_connections,
            "keep-alive queue grew past its capacity"
        );
        evicted
    }

    /// Take the most recently pushed connection if it is still fresh.
    ///
    /// A stale head is left in place for the reaper and `None` is returned,
    /// telling the caller to open a new connection.
    pub fn get(&mut self, now: Instant) -> Option<C> {
        let head = self.entries.front()?;
        let idle = head.idle_for(now);
        if idle > self.ttl {
            return None;
        }
        let entry = self.entries.pop_front()?;
        tracing::trace!(idle_ms = idle.as_millis() as u64, "reusing idle connection");
        Some(entry.connection)
    }

    /// Pop stale entries from the tail into `expired`, returning how many
    /// were removed.
    ///
    /// Scanning stops at the first entry that is still fresh. Because reuse
    /// is LIFO the tail is normally the stalest entry, but a stale entry can
    /// still hide behind a fresher one and survive until the entries behind
    /// it expire.
    pub fn expire(&mut self, now: Instant, expired: &mut Vec<C>) -> usize {
        let mut removed = 0;
        while let Some(entry) = self.entries.pop_back() {
            if !self.is_stale(&entry, now) {
                self.entries.push_back(entry);
                break;
            }
            expired.push(entry.connection);
            removed += 1;
        }
        removed
    }

    /// Remove every entry, oldest last.
    pub fn drain(&mut self) -> Vec<C> {
        self.entries.drain(..).map(|entry| entry.connection).collect()
    }
}

impl<C> Serialize for ClientQueue<C> {
    fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(S::Error::custom(KeepAliveError::Unsupported(
            "keep-alive queues cannot be serialized",
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(5);

    fn queue(max: usize) -> ClientQueue<u32> {
        ClientQueue::new(TTL, max)
    }

    // ── Push ────────────────────────────────────────────────────────

    #[test]
    fn push_below_capacity_evicts_nothing() {
        let mut q = queue(3);
        let now = Instant::now();
        assert_eq!(q.push(1, now), None);
        assert_eq!(q.push(2, now), None);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn push_at_capacity_evicts_oldest() {
        let mut q = queue(2);
        let now = Instant::now();
        q.push(1, now);
        q.push(2, now);
        assert_eq!(q.push(3, now), Some(1));
        assert_eq!(q.push(4, now), Some(2));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn push_never_exceeds_capacity() {
        let mut q = queue(5);
        let now = Instant::now();
        let mut evicted = Vec::new();
        for i in 0..50 {
            if let Some(old) = q.push(i, now) {
                evicted.push(old);
            }
            assert!(q.len() <= 5);
        }
        // Evictions come out in push order: always the current tail.
        assert_eq!(evicted, (0..45).collect::<Vec<_>>());
    }

    #[test]
    #[should_panic(expected = "capacity must be positive")]
    fn zero_capacity_is_rejected() {
        let _ = ClientQueue::<u32>::new(TTL, 0);
    }

    // ── Get ─────────────────────────────────────────────────────────

    #[test]
    fn get_is_lifo() {
        let mut q = queue(5);
        let now = Instant::now();
        q.push(1, now);
        q.push(2, now);
        assert_eq!(q.get(now), Some(2));
        assert_eq!(q.get(now), Some(1));
        assert_eq!(q.get(now), None);
    }

    #[test]
    fn get_empty_returns_none() {
        let mut q = queue(5);
        assert_eq!(q.get(Instant::now()), None);
    }

    #[test]
    fn get_at_exact_ttl_is_still_fresh() {
        let mut q = queue(5);
        let start = Instant::now();
        q.push(1, start);
        assert_eq!(q.get(start + TTL), Some(1));
    }

    #[test]
    fn get_leaves_stale_head_in_place() {
        let mut q = queue(5);
        let start = Instant::now();
        q.push(1, start);
        let later = start + TTL + Duration::from_millis(1);
        assert_eq!(q.get(later), None);
        assert_eq!(q.len(), 1, "stale entry is left for the reaper");
    }

    #[test]
    fn get_only_considers_head() {
        let mut q = queue(5);
        let start = Instant::now();
        q.push(1, start);
        q.push(2, start + Duration::from_secs(4));
        // Head (2) is fresh even though the tail (1) is stale.
        assert_eq!(q.get(start + Duration::from_secs(6)), Some(2));
        assert_eq!(q.get(start + Duration::from_secs(6)), None);
    }

    // ── Expire ──────────────────────────────────────────────────────

    #[test]
    fn expire_pops_stale_tail_entries() {
        let mut q = queue(5);
        let start = Instant::now();
        q.push(1, start);
        q.push(2, start + Duration::from_secs(1));
        q.push(3, start + Duration::from_secs(10));

        let mut expired = Vec::new();
        let removed = q.expire(start + Duration::from_secs(7), &mut expired);
        assert_eq!(removed, 2);
        assert_eq!(expired, vec![1, 2]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn expire_everything_empties_queue() {
        let mut q = queue(5);
        let start = Instant::now();
        q.push(1, start);
        q.push(2, start);
        let mut expired = Vec::new();
        q.expire(start + Duration::from_secs(6), &mut expired);
        assert!(q.is_empty());
        assert_eq!(expired.len(), 2);
    }

    #[test]
    fn expire_stops_at_first_fresh_entry_from_tail() {
        // Queue order and idle order can diverge when an older idle instant
        // is pushed after a newer one.
        let mut q = queue(5);
        let start = Instant::now();
        q.push(1, start + Duration::from_secs(10));
        q.push(2, start);

        let mut expired = Vec::new();
        let removed = q.expire(start + Duration::from_secs(12), &mut expired);
        assert_eq!(removed, 0, "fresh tail shields the stale head");
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn expire_keeps_fresh_queue() {
        let mut q = queue(5);
        let now = Instant::now();
        q.push(1, now);
        let mut expired = Vec::new();
        assert_eq!(q.expire(now, &mut expired), 0);
        assert!(expired.is_empty());
    }

    #[test]
    fn drain_returns_all_entries() {
        let mut q = queue(5);
        let now = Instant::now();
        q.push(1, now);
        q.push(2, now);
        assert_eq!(q.drain(), vec![2, 1]);
        assert!(q.is_empty());
    }

    #[test]
    fn queue_refuses_serialization() {
        let q = queue(5);
        let err = serde_json::to_string(&q).unwrap_err();
        assert!(err.to_string().contains("cannot be serialized"));
    }
}
