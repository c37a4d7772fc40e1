//! Keep-alive cache: bounded, time-based pools of idle connections keyed by
//! destination, with a background reaper.
//!
//! Callers hand idle connections back with [`KeepAliveCache::put`] and try to
//! reuse one with [`KeepAliveCache::get`] before opening a new connection.
//! Each destination ([`ConnectionKey`]) has its own bounded LIFO queue with a
//! TTL resolved from the server's keep-alive hint, the operator's
//! configuration, or built-in defaults. A single reaper task per cache closes
//! connections that idled past their TTL and drops emptied queues.
//!
//! ```text
//! caller ──put──▶ KeepAliveCache ──▶ ClientQueue (per destination, ≤ M idle)
//!        ◀─get───                          ▲
//!                                          │ every 5s
//!                                        reaper ──▶ close_server()
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod key;
pub mod queue;
mod reaper;
pub mod tcp;

pub use cache::{CacheStats, KeepAliveCache};
pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{KeepAliveConfig, TimeoutHint};
pub use connection::KeepAliveConnection;
pub use error::{KeepAliveError, KeepAliveResult};
pub use key::{ConnectionKey, IdentityToken};
pub use queue::ClientQueue;
pub use tcp::TcpConnection;
