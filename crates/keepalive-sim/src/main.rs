//! keepalive-sim: drive the keep-alive cache with a synthetic workload.
//!
//! Workers repeatedly pick a destination, reuse an idle connection from the
//! cache or "open" a new one, hold it for a while, and hand it back. At the
//! end the simulator reports how many connections were opened versus reused
//! and how many the cache evicted or reaped.
//!
//! # Usage
//!
//! ```text
//! keepalive-sim --destinations 4 --workers 16 --requests 500 --think-ms 50
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::bail;
use clap::Parser;
use serde::Serialize;
use tracing::info;

use keepalive_cache::{ConnectionKey, KeepAliveCache, KeepAliveConfig, KeepAliveConnection};

#[derive(Parser)]
#[command(
    name = "keepalive-sim",
    about = "Simulate connection reuse through the keep-alive cache",
    version
)]
struct Cli {
    /// Number of distinct destinations.
    #[arg(long, default_value = "4")]
    destinations: usize,

    /// Concurrent workers.
    #[arg(long, default_value = "8")]
    workers: usize,

    /// Requests issued by each worker.
    #[arg(long, default_value = "200")]
    requests: usize,

    /// How long a request holds its connection, in milliseconds.
    #[arg(long, default_value = "5")]
    hold_ms: u64,

    /// Pause between requests, in milliseconds.
    #[arg(long, default_value = "20")]
    think_ms: u64,

    /// Override the per-destination idle limit (default: env or 5).
    #[arg(long)]
    max_connections: Option<usize>,

    /// Override the operator TTL for direct connections, in seconds.
    #[arg(long)]
    server_timeout: Option<u64>,

    /// Treat every connection as going through a proxy.
    #[arg(long)]
    proxy: bool,

    /// Output format: text or json.
    #[arg(long, default_value = "text")]
    format: String,
}

/// Synthetic connection; closing it only bumps a counter.
#[derive(Debug)]
struct SimConnection {
    id: u64,
    via_proxy: bool,
    closed: Arc<AtomicU64>,
    is_closed: bool,
}

impl KeepAliveConnection for SimConnection {
    fn close_server(&mut self) -> anyhow::Result<()> {
        if !self.is_closed {
            self.is_closed = true;
            self.closed.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(id = self.id, "closed simulated connection");
        }
        Ok(())
    }

    fn using_proxy(&self) -> bool {
        self.via_proxy
    }
}

#[derive(Debug, Serialize)]
struct Report {
    requests: u64,
    opened: u64,
    reused: u64,
    reuse_ratio: f64,
    evicted: u64,
    expired: u64,
    rejected: u64,
    closed: u64,
    closed_at_shutdown: usize,
    elapsed_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,keepalive_cache=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    if cli.format != "text" && cli.format != "json" {
        bail!("unknown format '{}': expected text or json", cli.format);
    }
    if cli.destinations == 0 || cli.workers == 0 {
        bail!("--destinations and --workers must be positive");
    }

    let mut config = KeepAliveConfig::from_env();
    if let Some(max) = cli.max_connections {
        config.max_connections = max;
    }
    if let Some(secs) = cli.server_timeout {
        config.server_timeout = Some(Duration::from_secs(secs));
    }

    let report = run(&cli, config).await;

    match cli.format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_text(&report),
    }
    Ok(())
}

async fn run(cli: &Cli, config: KeepAliveConfig) -> Report {
    info!(
        destinations = cli.destinations,
        workers = cli.workers,
        requests = cli.requests,
        ?config,
        "starting keep-alive simulation"
    );

    let cache: KeepAliveCache<SimConnection> = KeepAliveCache::new(config);
    let keys: Arc<Vec<ConnectionKey>> = Arc::new(
        (0..cli.destinations)
            .map(|i| ConnectionKey::new("http", &format!("backend-{i}.sim"), 8080))
            .collect(),
    );
    let opened = Arc::new(AtomicU64::new(0));
    let closed = Arc::new(AtomicU64::new(0));
    let hold = Duration::from_millis(cli.hold_ms);
    let think = Duration::from_millis(cli.think_ms);
    let started = Instant::now();

    let mut workers = Vec::with_capacity(cli.workers);
    for worker in 0..cli.workers {
        let cache = cache.clone();
        let keys = Arc::clone(&keys);
        let opened = Arc::clone(&opened);
        let closed = Arc::clone(&closed);
        let requests = cli.requests;
        let via_proxy = cli.proxy;

        workers.push(tokio::spawn(async move {
            for request in 0..requests {
                let key = &keys[(worker + request) % keys.len()];
                let connection = match cache.get(key).await {
                    Some(connection) => connection,
                    None => SimConnection {
                        id: opened.fetch_add(1, Ordering::Relaxed),
                        via_proxy,
                        closed: Arc::clone(&closed),
                        is_closed: false,
                    },
                };
                tokio::time::sleep(hold).await;
                cache.put(key.clone(), connection).await;
                tokio::time::sleep(think).await;
            }
        }));
    }

    for (worker, handle) in workers.into_iter().enumerate() {
        if let Err(e) = handle.await {
            tracing::error!(worker, error = %e, "simulation worker failed");
        }
    }

    cache.log_stats().await;
    let stats = cache.stats().await;
    let closed_at_shutdown = cache.shutdown().await;

    let requests = (cli.workers * cli.requests) as u64;
    Report {
        requests,
        opened: opened.load(Ordering::Relaxed),
        reused: stats.reused,
        reuse_ratio: if requests == 0 {
            0.0
        } else {
            stats.reused as f64 / requests as f64
        },
        evicted: stats.evicted,
        expired: stats.expired,
        rejected: stats.rejected,
        closed: closed.load(Ordering::Relaxed),
        closed_at_shutdown,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

fn print_text(report: &Report) {
    println!("requests            {}", report.requests);
    println!("connections opened  {}", report.opened);
    println!(
        "connections reused  {} ({:.1}%)",
        report.reused,
        report.reuse_ratio * 100.0
    );
    println!("evicted (full)      {}", report.evicted);
    println!("expired (reaped)    {}", report.expired);
    println!("rejected (ttl 0)    {}", report.rejected);
    println!("closed total        {}", report.closed);
    println!("closed at shutdown  {}", report.closed_at_shutdown);
    println!("elapsed             {} ms", report.elapsed_ms);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("keepalive-sim").chain(args.iter().copied()))
    }

    #[test]
    fn cli_defaults() {
        let cli = cli(&[]);
        assert_eq!(cli.destinations, 4);
        assert_eq!(cli.workers, 8);
        assert_eq!(cli.format, "text");
        assert!(!cli.proxy);
    }

    #[test]
    fn sim_connection_closes_once() {
        let closed = Arc::new(AtomicU64::new(0));
        let mut conn = SimConnection {
            id: 1,
            via_proxy: false,
            closed: Arc::clone(&closed),
            is_closed: false,
        };
        conn.close_server().unwrap();
        conn.close_server().unwrap();
        assert_eq!(closed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn single_worker_reuses_its_connection() {
        let cli = cli(&[
            "--destinations", "1", "--workers", "1", "--requests", "10", "--hold-ms", "0",
            "--think-ms", "0",
        ]);
        let report = run(&cli, KeepAliveConfig::default()).await;
        assert_eq!(report.requests, 10);
        assert_eq!(report.opened, 1);
        assert_eq!(report.reused, 9);
        assert_eq!(report.closed_at_shutdown, 1);
        assert_eq!(report.closed, 1);
    }
}
