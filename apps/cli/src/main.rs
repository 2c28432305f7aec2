//! hoplink CLI
//!
//! Runs the privileged tunnel daemon and talks to it as an operator.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use hoplink_daemon::platform::create_backends;
use hoplink_daemon::{DaemonConfig, DaemonService};
use hoplink_ipc_client::{default_socket_path, ActivationPlan, IpcClient, SessionEvent, SessionEvents, SessionState};
use hoplink_logging::{LogBuffer, LogLevel};

/// How long to wait for the daemon to answer a query
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Activation may sit in endpoint resolution backoff for a while
const ACTIVATE_TIMEOUT: Duration = Duration::from_secs(180);

/// hoplink - multi-hop tunnel daemon
#[derive(Parser)]
#[command(name = "hoplink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Socket path (or pipe name) for daemon communication
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (usually run by system service)
    Daemon {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show connection status
    Status,

    /// Bring up every hop described by a plan file
    Up {
        /// JSON activation plan
        #[arg(short, long)]
        plan: PathBuf,
    },

    /// Tear down active hops
    Down {
        /// Number of hops to deactivate, starting from the exit hop
        #[arg(short = 'n', long, default_value = "1")]
        hops: usize,
    },

    /// Print the daemon's buffered logs
    Logs,

    /// Empty the daemon's log buffer
    CleanLogs,

    /// Print the daemon's protocol version
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = LogLevel::from_verbose(cli.verbose);

    match cli.command {
        Commands::Daemon { config } => run_daemon(config, cli.socket, level).await,
        command => {
            hoplink_logging::init(level);
            let socket = cli.socket.unwrap_or_else(default_socket_path);
            run_command(command, &socket).await
        }
    }
}

async fn run_command(command: Commands, socket: &Path) -> Result<()> {
    match command {
        Commands::Daemon { .. } => bail!("`daemon` does not talk to a running daemon"),
        Commands::Status => status(socket).await,
        Commands::Up { plan } => up(socket, &plan).await,
        Commands::Down { hops } => down(socket, hops).await,
        Commands::Logs => logs(socket).await,
        Commands::CleanLogs => clean_logs(socket).await,
        Commands::Version => version(socket).await,
    }
}

// ============================================================================
// Daemon
// ============================================================================

enum Stop {
    Signal,
    Fatal(String),
    Server(std::result::Result<hoplink_daemon::Result<()>, tokio::task::JoinError>),
}

async fn run_daemon(config_path: Option<PathBuf>, socket: Option<PathBuf>, level: LogLevel) -> Result<()> {
    let mut config = match config_path {
        Some(path) => DaemonConfig::load(&path).with_context(|| format!("Failed to load config {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    if let Some(socket) = socket {
        config.socket_path = socket;
    }
    config.validate().context("Invalid daemon configuration")?;

    let logs = LogBuffer::new(config.log_buffer_bytes);
    hoplink_logging::try_init_with_buffer(level, logs.clone())
        .map_err(|e| anyhow::anyhow!("Failed to initialise logging: {}", e))?;

    info!("Starting hoplink daemon...");

    let backends = create_backends(&config).context("Failed to set up backends")?;
    let service = DaemonService::start(&config, backends, logs).context("Failed to start daemon core")?;

    let (shutdown, mut server_task) = spawn_server(&config, service.clone());

    let stop = tokio::select! {
        _ = tokio::signal::ctrl_c() => Stop::Signal,
        reason = service.fatal() => Stop::Fatal(reason),
        joined = &mut server_task => Stop::Server(joined),
    };

    if !matches!(stop, Stop::Server(_)) {
        let _ = shutdown.send(()).await;
        let _ = server_task.await;
    }
    service.shutdown().await;

    match stop {
        Stop::Signal => {
            info!("Daemon stopped");
            Ok(())
        }
        Stop::Fatal(reason) => bail!("Daemon core stopped: {}", reason),
        Stop::Server(Ok(result)) => result.context("IPC server failed"),
        Stop::Server(Err(e)) => bail!("IPC server task failed: {}", e),
    }
}

#[cfg(unix)]
fn spawn_server(
    config: &DaemonConfig,
    service: DaemonService,
) -> (mpsc::Sender<()>, JoinHandle<hoplink_daemon::Result<()>>) {
    use hoplink_daemon::{IpcConfig, IpcServer};

    let mut server = IpcServer::new(IpcConfig {
        socket_path: config.socket_path.clone(),
    });
    server.set_event_sender(service.event_sender());
    let shutdown = server.shutdown_handle();
    let task = tokio::spawn(async move { server.start(service).await });
    (shutdown, task)
}

#[cfg(windows)]
fn spawn_server(
    config: &DaemonConfig,
    service: DaemonService,
) -> (mpsc::Sender<()>, JoinHandle<hoplink_daemon::Result<()>>) {
    use hoplink_daemon::{WindowsPipeConfig, WindowsPipeServer};

    let mut server = WindowsPipeServer::new(WindowsPipeConfig {
        pipe_name: config.socket_path.to_string_lossy().into_owned(),
    });
    server.set_event_sender(service.event_sender());
    let shutdown = server.shutdown_handle();
    let task = tokio::spawn(async move { server.start(service).await });
    (shutdown, task)
}

// ============================================================================
// IPC Commands (using shared ipc-client crate)
// ============================================================================

struct Opened {
    client: IpcClient,
    events: SessionEvents,
    connected: bool,
    since: Option<String>,
}

async fn open(socket: &Path) -> Result<Opened> {
    let (client, mut events) = IpcClient::connect(socket)
        .await
        .with_context(|| format!("Failed to connect to {}", socket.display()))?;

    match next_event(&mut events, REPLY_TIMEOUT).await? {
        SessionEvent::Initialized {
            ok: true,
            connected,
            since,
        } => Ok(Opened {
            client,
            events,
            connected,
            since: since.map(|since| since.to_rfc3339()),
        }),
        SessionEvent::Initialized { ok: false, .. } => bail!("Daemon closed the connection during initialization"),
        other => bail!("Unexpected event before initialization: {:?}", other),
    }
}

async fn next_event(events: &mut SessionEvents, wait: Duration) -> Result<SessionEvent> {
    match tokio::time::timeout(wait, events.recv()).await {
        Ok(Some(event)) => Ok(event),
        Ok(None) => bail!("Daemon connection closed"),
        Err(_) => bail!("Timed out waiting for the daemon"),
    }
}

/// Collect the events the daemon raises before it answers a version query sent now
///
/// The daemon handles one connection's messages in order, so the version reply marks
/// the end of everything sent before it.
async fn settle(opened: &mut Opened, wait: Duration) -> Result<Vec<SessionEvent>> {
    opened.client.query_version();
    let mut seen = Vec::new();
    loop {
        let event = next_event(&mut opened.events, wait).await?;
        if opened.client.state() == SessionState::Disconnected {
            bail!("Daemon connection closed");
        }
        match event {
            SessionEvent::Version(_) => return Ok(seen),
            event => {
                debug!("Event: {:?}", event);
                seen.push(event);
            }
        }
    }
}

async fn status(socket: &Path) -> Result<()> {
    let mut opened = open(socket).await?;

    println!("hoplink Status");
    println!("==============");
    println!("Connected:     {}", opened.connected);
    if let Some(since) = &opened.since {
        println!("Since:         {}", since);
    }
    if !opened.connected {
        return Ok(());
    }

    opened.client.check_status();
    for event in settle(&mut opened, REPLY_TIMEOUT).await? {
        if let SessionEvent::StatusUpdated {
            server_ipv4_gateway,
            device_ipv4_address,
            tx_bytes,
            rx_bytes,
        } = event
        {
            println!("Gateway:       {}", server_ipv4_gateway);
            println!("Address:       {}", device_ipv4_address);
            println!("Sent:          {}", format_bytes(tx_bytes));
            println!("Received:      {}", format_bytes(rx_bytes));
        }
    }

    Ok(())
}

async fn up(socket: &Path, plan_path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(plan_path)
        .with_context(|| format!("Failed to read plan {}", plan_path.display()))?;
    let plan: ActivationPlan = serde_json::from_str(&text).context("Invalid activation plan")?;
    if plan.servers.is_empty() {
        bail!("Activation plan has no servers");
    }

    info!("Activating {} hop(s)...", plan.hop_count());
    let mut opened = open(socket).await?;
    opened.client.activate(&plan);

    let events = settle(&mut opened, ACTIVATE_TIMEOUT).await?;
    if events.contains(&SessionEvent::ControllerError) {
        bail!("Daemon reported a backend failure");
    }
    match events
        .iter()
        .rev()
        .find(|event| matches!(event, SessionEvent::Connected | SessionEvent::Disconnected))
    {
        Some(SessionEvent::Connected) => {
            println!("Connected through {} hop(s)", plan.hop_count());
            Ok(())
        }
        _ => bail!("Activation failed, see `hoplink logs`"),
    }
}

async fn down(socket: &Path, hops: usize) -> Result<()> {
    let mut opened = open(socket).await?;
    opened.client.deactivate_hops(hops);

    let events = settle(&mut opened, REPLY_TIMEOUT).await?;
    if events.contains(&SessionEvent::Disconnected) {
        println!("Disconnected");
    } else {
        println!("No active connection");
    }
    Ok(())
}

async fn logs(socket: &Path) -> Result<()> {
    let opened = open(socket).await?;
    let logs = tokio::time::timeout(REPLY_TIMEOUT, opened.client.backend_logs())
        .await
        .context("Timed out waiting for logs")??;
    print!("{}", logs);
    Ok(())
}

async fn clean_logs(socket: &Path) -> Result<()> {
    let mut opened = open(socket).await?;
    opened.client.cleanup_backend_logs();
    settle(&mut opened, REPLY_TIMEOUT).await?;
    println!("Daemon logs cleared");
    Ok(())
}

async fn version(socket: &Path) -> Result<()> {
    let mut opened = open(socket).await?;
    opened.client.query_version();
    loop {
        if let SessionEvent::Version(version) = next_event(&mut opened.events, REPLY_TIMEOUT).await? {
            println!("Protocol version {}", version);
            return Ok(());
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parsing() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_daemon_with_config() {
        let cli = Cli::try_parse_from(["hoplink", "daemon", "--config", "/etc/hoplink.json"]).unwrap();
        match cli.command {
            Commands::Daemon { config } => assert_eq!(config, Some(PathBuf::from("/etc/hoplink.json"))),
            _ => panic!("expected daemon"),
        }
    }

    #[test]
    fn test_up_requires_plan() {
        assert!(Cli::try_parse_from(["hoplink", "up"]).is_err());
        assert!(Cli::try_parse_from(["hoplink", "up", "--plan", "plan.json"]).is_ok());
    }

    #[test]
    fn test_down_defaults_to_one_hop() {
        let cli = Cli::try_parse_from(["hoplink", "--socket", "/tmp/x.socket", "down"]).unwrap();
        assert_eq!(cli.socket, Some(PathBuf::from("/tmp/x.socket")));
        assert!(matches!(cli.command, Commands::Down { hops: 1 }));
    }

    #[test]
    fn test_clean_logs_command() {
        assert!(Cli::try_parse_from(["hoplink", "clean-logs"]).is_ok());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
