//! MeshLink Signal Server
//!
//! Rendezvous point agents use to exchange connection offers. Optionally
//! hosts the relay that peers without a direct path fall back to.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use meshlink_network::{RelayServer, RelayServerConfig, SignalConfig, SignalServer};

/// MeshLink Signal Server
#[derive(Parser)]
#[command(name = "meshlink-signal")]
#[command(author, version, about)]
struct Cli {
    /// Listen address for signal messages
    #[arg(short, long, default_value = "0.0.0.0:10000")]
    listen: String,

    /// Also run a relay on this address
    #[arg(short, long)]
    relay: Option<String>,

    /// How long undelivered messages are kept (seconds)
    #[arg(long, default_value = "30")]
    ttl: u64,

    /// Maximum relay allocations
    #[arg(long, default_value = "1000")]
    max_allocations: usize,

    /// Idle relay allocation lifetime (seconds)
    #[arg(long, default_value = "300")]
    allocation_ttl: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Starting MeshLink Signal Server v{}", env!("CARGO_PKG_VERSION"));

    let signal_config = SignalConfig {
        ttl: Duration::from_secs(cli.ttl),
        ..Default::default()
    };
    let signal = Arc::new(
        SignalServer::bind(&cli.listen, signal_config)
            .await
            .with_context(|| format!("Failed to bind signal server on {}", cli.listen))?,
    );
    let mut signal_task = tokio::spawn(signal.clone().run());

    let relay_task = match &cli.relay {
        Some(addr) => {
            let config = RelayServerConfig {
                max_allocations: cli.max_allocations,
                allocation_ttl: Duration::from_secs(cli.allocation_ttl),
            };
            let relay = Arc::new(
                RelayServer::bind(addr, config)
                    .await
                    .with_context(|| format!("Failed to bind relay on {}", addr))?,
            );
            Some(tokio::spawn(relay.run()))
        }
        None => None,
    };

    let mut stats = tokio::time::interval(Duration::from_secs(60));
    stats.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            result = &mut signal_task => {
                match result {
                    Ok(Err(e)) => error!("Signal server stopped: {}", e),
                    _ => error!("Signal server stopped"),
                }
                anyhow::bail!("Signal server exited");
            }
            _ = stats.tick() => {
                let s = signal.stats();
                info!("Stats: {} subscribers, {} mailboxes", s.subscribers, s.mailboxes);
            }
        }
    }

    signal_task.abort();
    if let Some(task) = relay_task {
        task.abort();
    }

    Ok(())
}
