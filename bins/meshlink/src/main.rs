//! MeshLink Client
//!
//! Joins this machine to a MeshLink mesh: a background daemon keeps
//! tunnels to the other peers and installs the routes the management
//! server pushes; the CLI controls it over a local socket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod client;
mod config;
mod daemon;

use config::ClientConfig;
use daemon::{IpcCommand, StatusResponse};
use meshlink_core::{AgentStatus, SessionState};

/// MeshLink - mesh VPN client
#[derive(Parser)]
#[command(name = "meshlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "~/.meshlink/config.toml")]
    config: PathBuf,

    /// Daemon IPC socket
    #[arg(long, default_value = daemon::SOCKET_PATH)]
    socket: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the mesh, starting the daemon if needed
    Up {
        /// Setup key issued by the management server
        #[arg(short, long)]
        setup_key: Option<String>,

        /// Management server URL
        #[arg(short, long)]
        management_url: Option<String>,
    },

    /// Disconnect from the mesh
    Down,

    /// Show connection status
    Status {
        /// List every peer
        #[arg(short, long)]
        detail: bool,
    },

    /// Reconnect with the stored configuration
    Restart,

    /// Run the daemon in the foreground
    Daemon,

    /// Show configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
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
        .with_thread_ids(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let config_path = expand_path(&cli.config)?;

    match cli.command {
        Commands::Up {
            setup_key,
            management_url,
        } => cmd_up(&config_path, &cli.socket, &cli.log_level, setup_key, management_url).await,
        Commands::Down => cmd_down(&cli.socket).await,
        Commands::Status { detail } => cmd_status(&cli.socket, detail).await,
        Commands::Restart => cmd_restart(&cli.socket).await,
        Commands::Daemon => daemon::run_daemon(config_path, cli.socket).await,
        Commands::Config => cmd_config(&config_path).await,
    }
}

async fn cmd_up(
    config_path: &Path,
    socket: &Path,
    log_level: &str,
    setup_key: Option<String>,
    management_url: Option<String>,
) -> Result<()> {
    if daemon::get_status(socket).await.is_err() {
        spawn_daemon(config_path, socket, log_level).await?;
    }

    let command = IpcCommand::Up {
        setup_key,
        management_url,
    };
    daemon::expect_ok(socket, &command).await?;

    println!("Connecting; run `meshlink status` to follow progress");
    Ok(())
}

/// Start `meshlink daemon` in the background and wait for its socket
async fn spawn_daemon(config_path: &Path, socket: &Path, log_level: &str) -> Result<()> {
    info!("Starting daemon...");
    let exe = std::env::current_exe().context("Failed to locate meshlink executable")?;

    tokio::process::Command::new(exe)
        .arg("--config")
        .arg(config_path)
        .arg("--socket")
        .arg(socket)
        .arg("--log-level")
        .arg(log_level)
        .arg("daemon")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .context("Failed to start daemon")?;

    for _ in 0..50 {
        if daemon::get_status(socket).await.is_ok() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    anyhow::bail!("Daemon did not come up on {}", socket.display())
}

async fn cmd_down(socket: &Path) -> Result<()> {
    daemon::expect_ok(socket, &IpcCommand::Down).await?;
    println!("Disconnected");
    Ok(())
}

async fn cmd_restart(socket: &Path) -> Result<()> {
    daemon::expect_ok(socket, &IpcCommand::Restart).await?;
    println!("Reconnected");
    Ok(())
}

async fn cmd_status(socket: &Path, detail: bool) -> Result<()> {
    let status = daemon::get_status(socket).await?;
    print!("{}", render_status(&status, detail));
    Ok(())
}

fn render_status(status: &StatusResponse, detail: bool) -> String {
    let mut out = String::new();
    out.push_str(&format!("Daemon status: {:?}\n", status.daemon));
    out.push_str(&format!("Management: {}\n", status.management_url));
    if let Some(error) = &status.last_error {
        out.push_str(&format!("Last error: {}\n", error));
    }

    let Some(agent) = &status.agent else {
        out.push_str("Peers count: 0/0 Connected\n");
        out.push_str("Networks: -\n");
        return out;
    };

    if let (Some(id), Some(ip)) = (&agent.peer_id, agent.overlay_ip) {
        out.push_str(&format!("Peer: {} ({})\n", id, ip));
    }
    out.push_str(&format!("Public key: {}\n", agent.public_key));
    out.push_str(&format!(
        "Peers count: {}/{} Connected\n",
        agent.connected_peers, agent.total_peers
    ));
    out.push_str(&format!("Networks: {}\n", networks(agent)));
    out.push_str(&format!(
        "Routes: {}\n",
        if agent.routes_converged { "applied" } else { "pending" }
    ));

    if detail {
        for session in &agent.sessions {
            let name = session
                .hostname
                .clone()
                .unwrap_or_else(|| session.public_key.short());
            let mode = match (session.state, session.mode) {
                (SessionState::Established, Some(mode)) => format!("{:?}", mode),
                _ => "-".to_string(),
            };
            out.push_str(&format!(
                "  {:<24} {:<12} {:<8} last keepalive {}s ago\n",
                name,
                session.state.to_string(),
                mode,
                session.last_keepalive_secs
            ));
        }
    }
    out
}

fn networks(agent: &AgentStatus) -> String {
    if agent.networks.is_empty() {
        return "-".to_string();
    }
    agent
        .networks
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

async fn cmd_config(config_path: &Path) -> Result<()> {
    let config = ClientConfig::load(config_path).await?;
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}

// Helper functions

fn expand_path(path: &Path) -> Result<PathBuf> {
    let path_str = path.to_string_lossy();
    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = directories::BaseDirs::new()
            .context("Failed to get home directory")?
            .home_dir()
            .to_path_buf();
        Ok(home.join(rest))
    } else {
        Ok(path.to_path_buf())
    }
}
