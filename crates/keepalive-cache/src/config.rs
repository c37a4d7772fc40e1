//! Keep-alive configuration and TTL resolution.
//!
//! The TTL of a destination's queue is resolved once, when the queue is
//! created, with this priority:
//!
//! 1. a positive timeout negotiated with the server;
//! 2. the operator-configured timeout for the connection's role
//!    (proxy or direct server);
//! 3. built-in defaults (60s for proxies, 5s for servers).
//!
//! A resolved TTL of zero means the connection is not pooled at all.

use std::time::Duration;

/// Default maximum idle connections kept per destination.
pub const DEFAULT_MAX_CONNECTIONS: usize = 5;

/// Built-in idle TTL for connections through a proxy.
pub const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(60);

/// Built-in idle TTL for direct server connections.
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between reaper sweeps. Not configurable.
pub const REAP_INTERVAL: Duration = Duration::from_millis(5000);

/// Environment variable overriding [`KeepAliveConfig::max_connections`].
pub const ENV_MAX_CONNECTIONS: &str = "KEEPALIVE_MAX_CONNECTIONS";
/// Environment variable with the operator TTL for direct connections, in seconds.
pub const ENV_TIME_SERVER: &str = "KEEPALIVE_TIME_SERVER";
/// Environment variable with the operator TTL for proxied connections, in seconds.
pub const ENV_TIME_PROXY: &str = "KEEPALIVE_TIME_PROXY";

/// What the server told us about keeping a connection alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TimeoutHint {
    /// The server advertised an explicit idle timeout. Zero means "do not
    /// keep this connection".
    Negotiated(Duration),
    /// The server acknowledged keep-alive without giving a timeout.
    KeepAlive,
    /// The server said nothing about keep-alive (default).
    #[default]
    Unspecified,
    /// The server asked for the connection not to be reused.
    Disabled,
}

/// Configuration for the keep-alive cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeepAliveConfig {
    /// Maximum idle connections per destination (default: 5).
    pub max_connections: usize,
    /// Operator TTL for proxied connections. `None` falls back to the
    /// built-in default.
    pub proxy_timeout: Option<Duration>,
    /// Operator TTL for direct server connections. `None` falls back to the
    /// built-in default.
    pub server_timeout: Option<Duration>,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            proxy_timeout: None,
            server_timeout: None,
        }
    }
}

impl KeepAliveConfig {
    /// Build a configuration from the process environment.
    ///
    /// See [`from_lookup`](Self::from_lookup) for the parsing rules.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from a name → value lookup.
    ///
    /// - `KEEPALIVE_MAX_CONNECTIONS`: positive integer; zero, negative or
    ///   unparsable values keep the default of 5.
    /// - `KEEPALIVE_TIME_SERVER` / `KEEPALIVE_TIME_PROXY`: whole seconds;
    ///   negative or unparsable values leave the override unset. Zero
    ///   disables pooling for that role.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let max_connections = match lookup(ENV_MAX_CONNECTIONS).map(|v| v.trim().parse::<i64>()) {
            Some(Ok(n)) if n > 0 => usize::try_from(n).unwrap_or(DEFAULT_MAX_CONNECTIONS),
            Some(Ok(_)) => DEFAULT_MAX_CONNECTIONS,
            Some(Err(e)) => {
                tracing::warn!(name = ENV_MAX_CONNECTIONS, error = %e, "ignoring invalid keep-alive setting");
                DEFAULT_MAX_CONNECTIONS
            }
            None => DEFAULT_MAX_CONNECTIONS,
        };

        Self {
            max_connections,
            proxy_timeout: parse_seconds(ENV_TIME_PROXY, lookup(ENV_TIME_PROXY)),
            server_timeout: parse_seconds(ENV_TIME_SERVER, lookup(ENV_TIME_SERVER)),
        }
    }

    /// Effective per-destination capacity (never zero).
    pub fn capacity(&self) -> usize {
        if self.max_connections == 0 {
            DEFAULT_MAX_CONNECTIONS
        } else {
            self.max_connections
        }
    }

    /// Operator override for the given role, if any.
    fn operator_timeout(&self, via_proxy: bool) -> Option<Duration> {
        if via_proxy {
            self.proxy_timeout
        } else {
            self.server_timeout
        }
    }

    /// Resolve the idle TTL for a connection. Zero means "do not pool".
    pub fn resolve_ttl(&self, hint: TimeoutHint, via_proxy: bool) -> Duration {
        match hint {
            TimeoutHint::Negotiated(timeout) => timeout,
            // Same fallback for both roles when the server acknowledged
            // keep-alive without a timeout.
            TimeoutHint::KeepAlive => self
                .operator_timeout(via_proxy)
                .unwrap_or(DEFAULT_SERVER_TIMEOUT),
            TimeoutHint::Unspecified => self.operator_timeout(via_proxy).unwrap_or(if via_proxy {
                DEFAULT_PROXY_TIMEOUT
            } else {
                DEFAULT_SERVER_TIMEOUT
            }),
            TimeoutHint::Disabled => Duration::ZERO,
        }
    }
}

fn parse_seconds(name: &str, value: Option<String>) -> Option<Duration> {
    let value = value?;
    match value.trim().parse::<i64>() {
        Ok(secs) if secs >= 0 => Some(Duration::from_secs(secs.unsigned_abs())),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(name, value = %value, error = %e, "ignoring invalid keep-alive setting");
            None
        }
    }
}
