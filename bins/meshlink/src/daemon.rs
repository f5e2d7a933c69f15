//! Agent daemon and its local IPC

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use meshlink_control::LoginRequest;
use meshlink_core::{Agent, AgentSetup, AgentStatus, LinuxRouteApplier, LoggingApplier, RouteApplier};
use meshlink_network::SignalConfig;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::ManagementClient;
use crate::config::ClientConfig;

/// Default IPC socket path
pub const SOCKET_PATH: &str = "/tmp/meshlink.sock";

/// Period of status reports to the management server
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(30);

/// How long `down` waits for the connection task
const DOWN_GRACE: Duration = Duration::from_secs(10);

/// Connection state of the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonState {
    /// Not connected; waiting for `up`
    Idle,
    /// Logging in or waiting for the first map
    Connecting,
    /// Logged in and syncing
    Connected,
}

/// Status response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub daemon: DaemonState,
    pub management_url: String,
    pub last_error: Option<String>,
    pub agent: Option<AgentStatus>,
}

/// IPC commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IpcCommand {
    Up {
        setup_key: Option<String>,
        management_url: Option<String>,
    },
    Down,
    Status,
    Restart,
}

/// IPC responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IpcResponse {
    Status(StatusResponse),
    Ok,
    Error(String),
}

#[derive(Debug)]
struct LinkState {
    daemon: DaemonState,
    peer_id: Option<String>,
    last_error: Option<String>,
}

/// State shared between the daemon and its connection task
#[derive(Debug)]
struct Link {
    state: StdMutex<LinkState>,
}

impl Link {
    fn new() -> Self {
        Self {
            state: StdMutex::new(LinkState {
                daemon: DaemonState::Connecting,
                peer_id: None,
                last_error: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn connected(&self, peer_id: &str) {
        let mut state = self.lock();
        state.daemon = DaemonState::Connected;
        state.peer_id = Some(peer_id.to_string());
        state.last_error = None;
    }

    fn failed(&self, error: &anyhow::Error) {
        let mut state = self.lock();
        state.daemon = DaemonState::Connecting;
        state.last_error = Some(format!("{:#}", error));
    }

    fn peer_id(&self) -> Option<String> {
        self.lock().peer_id.clone()
    }
}

struct Connection {
    agent: Arc<Agent>,
    client: ManagementClient,
    link: Arc<Link>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// The agent daemon
pub struct Daemon {
    config_path: PathBuf,
    config: Mutex<ClientConfig>,
    connection: Mutex<Option<Connection>>,
}

impl Daemon {
    pub async fn new(config_path: PathBuf) -> Result<Arc<Self>> {
        let config = ClientConfig::load_or_create(&config_path).await?;
        config.validate()?;
        Ok(Arc::new(Self {
            config_path,
            config: Mutex::new(config),
            connection: Mutex::new(None),
        }))
    }

    /// Connect with the stored configuration, after applying overrides.
    /// Returns as soon as the connection task is running.
    pub async fn up(&self, setup_key: Option<String>, management_url: Option<String>) -> Result<()> {
        let config = {
            let mut config = self.config.lock().await;
            let mut changed = false;
            if let Some(key) = setup_key {
                changed |= config.setup_key.as_deref() != Some(key.as_str());
                config.setup_key = Some(key);
            }
            if let Some(url) = management_url {
                changed |= config.management_url != url;
                config.management_url = url;
            }
            config.validate()?;
            if config.setup_key.is_none() {
                anyhow::bail!("A setup key is required: meshlink up --setup-key <key>");
            }
            if changed {
                config.save(&self.config_path).await?;
            }

            if self.connection.lock().await.is_some() {
                if !changed {
                    debug!("Already up");
                    return Ok(());
                }
                drop(config);
                self.down().await?;
                self.config.lock().await.clone()
            } else {
                config.clone()
            }
        };

        let connection = connect(config)?;
        *self.connection.lock().await = Some(connection);
        Ok(())
    }

    /// Disconnect and remove routes
    pub async fn down(&self) -> Result<()> {
        let Some(connection) = self.connection.lock().await.take() else {
            debug!("Already down");
            return Ok(());
        };

        info!("Disconnecting");
        connection.cancel.cancel();
        let mut task = connection.task;
        if tokio::time::timeout(DOWN_GRACE, &mut task).await.is_err() {
            warn!("Connection task did not stop in time");
            task.abort();
        }

        if let Err(e) = connection.agent.stop().await {
            debug!("Agent stop: {}", e);
        }

        if let Some(peer_id) = connection.link.peer_id() {
            let report = connection.agent.status_report().await;
            if let Err(e) = connection.client.report_status(&peer_id, &report).await {
                debug!("Final status report failed: {:#}", e);
            }
        }
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        self.down().await?;
        self.up(None, None).await
    }

    pub async fn status(&self) -> StatusResponse {
        let management_url = self.config.lock().await.management_url.clone();
        let connection = self.connection.lock().await;
        match connection.as_ref() {
            Some(connection) => {
                let (daemon, last_error) = {
                    let state = connection.link.lock();
                    (state.daemon, state.last_error.clone())
                };
                StatusResponse {
                    daemon,
                    management_url,
                    last_error,
                    agent: Some(connection.agent.status().await),
                }
            }
            None => StatusResponse {
                daemon: DaemonState::Idle,
                management_url,
                last_error: None,
                agent: None,
            },
        }
    }

    async fn handle(&self, command: IpcCommand) -> IpcResponse {
        let result = match command {
            IpcCommand::Up {
                setup_key,
                management_url,
            } => self.up(setup_key, management_url).await,
            IpcCommand::Down => self.down().await,
            IpcCommand::Restart => self.restart().await,
            IpcCommand::Status => return IpcResponse::Status(self.status().await),
        };
        match result {
            Ok(()) => IpcResponse::Ok,
            Err(e) => IpcResponse::Error(format!("{:#}", e)),
        }
    }
}

/// Build the agent and spawn the connection task
fn connect(config: ClientConfig) -> Result<Connection> {
    let keys = config.keys()?;
    let client = ManagementClient::new(&config.management_url, keys.public)?;

    let applier: Arc<dyn RouteApplier> = if config.network.apply_routes {
        Arc::new(LinuxRouteApplier::new(config.network.interface.clone()))
    } else {
        Arc::new(LoggingApplier)
    };

    let setup = AgentSetup {
        keys,
        listen_addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), config.network.listen_port),
        signal_server: config.signal_addr()?,
        relay_server: config.relay_addr()?,
        signal: SignalConfig::default(),
        candidates: None,
    };
    let agent = Agent::new(setup, config.agent.clone(), applier).context("Invalid agent configuration")?;

    let link = Arc::new(Link::new());
    let cancel = CancellationToken::new();
    let setup_key = config.setup_key.clone().unwrap_or_default();
    let task = tokio::spawn(run_connection(
        agent.clone(),
        client.clone(),
        setup_key,
        config.hostname(),
        link.clone(),
        cancel.clone(),
    ));

    info!("Connecting to {}", config.management_url);
    Ok(Connection {
        agent,
        client,
        link,
        cancel,
        task,
    })
}

/// Start the agent, log in and follow network map updates until cancelled
async fn run_connection(
    agent: Arc<Agent>,
    client: ManagementClient,
    setup_key: String,
    hostname: String,
    link: Arc<Link>,
    cancel: CancellationToken,
) {
    let mut delay = RETRY_BASE;

    loop {
        match agent.start().await {
            Ok(()) => break,
            Err(e) => {
                let e = anyhow::Error::from(e).context("Agent failed to start");
                error!("{:#}", e);
                link.failed(&e);
            }
        }
        if !pause(&cancel, &mut delay).await {
            return;
        }
    }

    let login = loop {
        let request = LoginRequest {
            setup_key: setup_key.clone(),
            public_key: agent.public_key(),
            hostname: hostname.clone(),
            address_candidates: agent.candidates().await,
        };
        match client.login(&request).await {
            Ok(login) => break login,
            Err(e) => {
                warn!("Login failed: {:#}", e);
                link.failed(&e);
            }
        }
        if !pause(&cancel, &mut delay).await {
            return;
        }
    };

    let peer_id = login.peer.peer.id.clone();
    info!(
        "Logged in as {} ({})",
        peer_id, login.peer.peer.assigned_overlay_ip
    );
    link.connected(&peer_id);
    agent.apply_map(login.network_map).await;

    let reporter = tokio::spawn(report_loop(agent.clone(), client.clone(), peer_id.clone(), cancel.clone()));

    delay = RETRY_BASE;
    loop {
        let serial = agent.serial().await;
        let synced = tokio::select! {
            _ = cancel.cancelled() => break,
            synced = client.sync(&peer_id, serial) => synced,
        };
        match synced {
            Ok(Some(map)) => {
                delay = RETRY_BASE;
                link.connected(&peer_id);
                agent.apply_map(map).await;
                let report = agent.status_report().await;
                if let Err(e) = client.report_status(&peer_id, &report).await {
                    debug!("Status report failed: {:#}", e);
                }
            }
            Ok(None) => {
                delay = RETRY_BASE;
                link.connected(&peer_id);
            }
            Err(e) => {
                warn!("Sync failed: {:#}", e);
                link.failed(&e);
                if !pause(&cancel, &mut delay).await {
                    break;
                }
            }
        }
    }

    reporter.abort();
}

async fn report_loop(agent: Arc<Agent>, client: ManagementClient, peer_id: String, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let report = agent.status_report().await;
        if let Err(e) = client.report_status(&peer_id, &report).await {
            debug!("Status report failed: {:#}", e);
        }
    }
}

/// Sleep for `delay` and double it. False when cancelled.
async fn pause(cancel: &CancellationToken, delay: &mut Duration) -> bool {
    let wait = *delay;
    *delay = (*delay * 2).min(RETRY_CAP);
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(wait) => true,
    }
}

/// Run the daemon until interrupted
pub async fn run_daemon(config_path: PathBuf, socket_path: PathBuf) -> Result<()> {
    info!("Starting MeshLink daemon...");

    let daemon = Daemon::new(config_path).await?;

    // Reconnect after a restart if we were set up before
    let has_key = daemon.config.lock().await.setup_key.is_some();
    if has_key {
        if let Err(e) = daemon.up(None, None).await {
            warn!("Automatic connect failed: {:#}", e);
        }
    }

    let ipc_handle = tokio::spawn(run_ipc_server(daemon.clone(), socket_path.clone()));

    tokio::signal::ctrl_c().await?;

    info!("Daemon shutting down...");
    ipc_handle.abort();
    daemon.down().await?;
    let _ = std::fs::remove_file(&socket_path);

    Ok(())
}

/// Run the IPC server for receiving commands
async fn run_ipc_server(daemon: Arc<Daemon>, socket_path: PathBuf) -> Result<()> {
    // Remove old socket
    let _ = std::fs::remove_file(&socket_path);

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("Failed to bind IPC socket {}", socket_path.display()))?;

    info!("IPC server listening on {}", socket_path.display());

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let daemon = daemon.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_ipc_connection(daemon, stream).await {
                        debug!("IPC connection error: {:#}", e);
                    }
                });
            }
            Err(e) => {
                error!("IPC accept error: {}", e);
            }
        }
    }
}

async fn handle_ipc_connection(daemon: Arc<Daemon>, mut stream: UnixStream) -> Result<()> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;

    if buf.is_empty() {
        return Ok(());
    }

    let response = match serde_json::from_slice::<IpcCommand>(&buf) {
        Ok(command) => {
            debug!("IPC command: {:?}", command);
            daemon.handle(command).await
        }
        Err(e) => IpcResponse::Error(format!("Malformed command: {}", e)),
    };

    let response_bytes = serde_json::to_vec(&response)?;
    stream.write_all(&response_bytes).await?;
    stream.shutdown().await?;

    Ok(())
}

/// Send a command to the daemon
pub async fn send_command(socket_path: &Path, command: &IpcCommand) -> Result<IpcResponse> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .context("MeshLink daemon is not running")?;

    let command_bytes = serde_json::to_vec(command)?;
    stream.write_all(&command_bytes).await?;
    stream.shutdown().await?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;

    let response: IpcResponse = serde_json::from_slice(&buf).context("Malformed daemon response")?;
    Ok(response)
}

/// Send a command that answers `Ok`
pub async fn expect_ok(socket_path: &Path, command: &IpcCommand) -> Result<()> {
    match send_command(socket_path, command).await? {
        IpcResponse::Ok => Ok(()),
        IpcResponse::Error(e) => anyhow::bail!(e),
        IpcResponse::Status(_) => anyhow::bail!("Unexpected response"),
    }
}

/// Get daemon status
pub async fn get_status(socket_path: &Path) -> Result<StatusResponse> {
    match send_command(socket_path, &IpcCommand::Status).await? {
        IpcResponse::Status(status) => Ok(status),
        IpcResponse::Error(e) => anyhow::bail!(e),
        IpcResponse::Ok => anyhow::bail!("Unexpected response"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("meshlink-{}-{}", name, std::process::id()))
    }

    #[tokio::test]
    async fn test_ipc_status_and_up_without_key() {
        let dir = scratch("daemon");
        let socket = dir.join("ipc.sock");
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let daemon = Daemon::new(dir.join("config.toml")).await.unwrap();
        let server = tokio::spawn(run_ipc_server(daemon, socket.clone()));

        // Wait for the listener
        let mut status = None;
        for _ in 0..50 {
            if let Ok(s) = get_status(&socket).await {
                status = Some(s);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let status = status.unwrap();
        assert_eq!(status.daemon, DaemonState::Idle);
        assert!(status.agent.is_none());

        let err = expect_ok(
            &socket,
            &IpcCommand::Up {
                setup_key: None,
                management_url: None,
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("setup key"));

        // Down while idle is fine
        expect_ok(&socket, &IpcCommand::Down).await.unwrap();

        server.abort();
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
