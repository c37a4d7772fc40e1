//! Background reaper, one task per live cache.
//!
//! The reaper sleeps for [`REAP_INTERVAL`] on the cache's clock, then sweeps
//! every queue for expired entries. It holds only a weak reference to the
//! cache while sleeping, so dropping the cache stops it at the next wake-up.
//! It exits on its own after a sweep that leaves the cache empty; the next
//! `put` spawns a fresh one.

use std::sync::{Arc, Weak};

use crate::cache::Shared;
use crate::clock::Clock;
use crate::config::REAP_INTERVAL;
use crate::connection::KeepAliveConnection;

/// Reaper loop. Returns when the cache is dropped, observed empty, or has
/// handed its slot to a newer reaper generation.
pub(crate) async fn run<C: KeepAliveConnection>(
    cache: Weak<Shared<C>>,
    clock: Arc<dyn Clock>,
    generation: u64,
) {
    tracing::debug!(generation, "keep-alive reaper started");
    loop {
        clock.sleep(REAP_INTERVAL).await;

        let Some(shared) = cache.upgrade() else {
            tracing::debug!("keep-alive cache dropped, reaper exiting");
            return;
        };

        if !shared.sweep(generation).await {
            tracing::debug!(generation, "keep-alive reaper exiting");
            return;
        }
    }
}
