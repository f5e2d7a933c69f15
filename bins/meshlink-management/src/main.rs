//! MeshLink Management Server
//!
//! Serves the management REST API and pushes network maps to agents.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use meshlink_control::{api, ControlPlane};

mod config;

use config::ManagementConfig;

/// MeshLink Management Server
#[derive(Parser)]
#[command(name = "meshlink-management")]
#[command(author, version, about)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "/etc/meshlink/management.toml")]
    config: PathBuf,

    /// Log level (overridden by RUST_LOG)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server, creating a default config if none exists
    Start {
        /// Override the listen address
        #[arg(long)]
        listen: Option<String>,
    },

    /// Print a default config
    GenConfig {
        /// Output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match cli.command {
        Commands::Start { listen } => cmd_start(cli.config, listen).await,
        Commands::GenConfig { output } => cmd_gen_config(output).await,
    }
}

async fn cmd_start(config_path: PathBuf, listen: Option<String>) -> Result<()> {
    info!("Starting MeshLink Management Server v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ManagementConfig::load_or_create(&config_path).await?;
    if let Some(listen) = listen {
        config.listen = listen;
    }
    config.validate()?;

    info!("Account: {}", config.control.account_id);
    info!("Overlay range: {}", config.control.network_range);
    if config.control.setup_keys.is_empty() {
        warn!("No setup keys configured; agents cannot join until one is created over the API");
    }

    let plane = ControlPlane::new(config.control.clone()).context("Failed to build control plane")?;

    let cancel = CancellationToken::new();
    let sync_task = plane.spawn_sync(cancel.clone());

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    let state = plane.api_state(config.admin_token.clone());

    tokio::select! {
        result = api::serve(listener, state) => {
            result.context("Management API stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    cancel.cancel();
    if let Err(e) = sync_task.await {
        warn!("Synchronizer task failed: {}", e);
    }

    Ok(())
}

async fn cmd_gen_config(output: Option<PathBuf>) -> Result<()> {
    let config = ManagementConfig::default();

    if let Some(path) = output {
        config.save(&path).await?;
        println!("Config written to {:?}", path);
    } else {
        println!("{}", toml::to_string_pretty(&config)?);
    }

    Ok(())
}
