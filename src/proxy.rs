//! Forwarder orchestration.
//!
//! Binds transports, runs the stats ticker, and reloads the configuration
//! on SIGHUP until Ctrl-C.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::config::Config;
use crate::error::Result;
use crate::handler::{Handler, Snapshot};
use crate::stats::Stats;
use crate::transport::{tcp::TcpServer, udp::UdpServer};

/// Configuration for the running forwarder.
pub struct ProxyConfig {
    /// File re-read on SIGHUP.
    pub config_path: PathBuf,
    pub config: Config,
    /// Local address to bind (e.g., 127.0.0.1:5353)
    pub bind_addr: SocketAddr,
    /// Log every answered query
    pub verbose: bool,
}

/// Run the forwarder until interrupted.
pub async fn run(proxy: ProxyConfig) -> Result<()> {
    let handler = Arc::new(Handler::new(Snapshot::from_config(&proxy.config)?));
    let stats = Arc::new(Stats::new());

    let udp = UdpServer::bind(proxy.bind_addr).await?;
    let tcp = TcpServer::bind(proxy.bind_addr).await?;

    let snapshot = handler.snapshot();
    info!(
        bind = %proxy.bind_addr,
        default_group = snapshot.fallback().name(),
        groups = snapshot.groups().len() + 1,
        "dns forwarder listening"
    );
    drop(snapshot);

    udp.start(handler.clone(), stats.clone(), proxy.verbose);
    tcp.start(handler.clone(), stats.clone(), proxy.verbose);

    // Print stats every minute
    let ticker_handler = handler.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.tick().await; // Skip first immediate tick
        loop {
            interval.tick().await;
            let stats = stats.snapshot_and_reset();
            let cache_len = ticker_handler.snapshot().cache().len();
            info!(
                uptime = stats.uptime_secs,
                cache = cache_len,
                requests = stats.requests,
                hosts = stats.hosts,
                cached = stats.cached,
                forwarded = stats.forwarded,
                disabled = stats.disabled,
                failed = stats.failed,
                avg_response_ms = stats.avg_response_ms,
                "stats"
            );
        }
    });

    #[cfg(unix)]
    watch_reload(proxy.config_path, proxy.bind_addr, handler.clone())?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handler.stop();

    Ok(())
}

#[cfg(unix)]
fn watch_reload(path: PathBuf, bind_addr: SocketAddr, handler: Arc<Handler>) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            // Reads list files and resolves upstream names.
            let task_path = path.clone();
            let task_handler = handler.clone();
            let reloaded = tokio::task::spawn_blocking(move || {
                reload(&task_path, bind_addr, &task_handler)
            })
            .await;
            match reloaded {
                Ok(Ok(generation)) => info!(config = %path.display(), generation, "configuration reloaded"),
                Ok(Err(e)) => error!(config = %path.display(), error = %e, "reload failed, keeping current configuration"),
                Err(e) => error!(config = %path.display(), error = %e, "reload task panicked"),
            }
        }
    });
    Ok(())
}

#[cfg(unix)]
/// Re-read `path` and swap it in. Blocking.
fn reload(path: &Path, bind_addr: SocketAddr, handler: &Handler) -> Result<u64> {
    let config = Config::load(path)?;
    if config.bind != bind_addr {
        info!(bind = %config.bind, "bind address changes need a restart");
    }
    handler.reload(&config)
}
