//! Daemon service implementation
//!
//! The [`Daemon`] core lives on its own thread and is reached only through a
//! command channel, so every registry and backend access is serialized no matter
//! how many IPC connections are open. The same thread polls backend liveness.

use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::{Duration, Instant};

use hoplink_core::{
    hop_index_hint, parse_activate, DaemonMessage, Envelope, HopIndex, InterfaceConfig, StatusReport,
    PROTOCOL_VERSION,
};
use hoplink_logging::LogBuffer;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::backend::Backends;
use crate::config::DaemonConfig;
use crate::daemon::Daemon;
use crate::ipc::IpcHandler;
use crate::platform::InterfaceNamer;
use crate::{DaemonError, Result};

/// Commands sent to the core thread
enum CoreCommand {
    Activate(InterfaceConfig, oneshot::Sender<Result<()>>),
    Deactivate(HopIndex, oneshot::Sender<Result<()>>),
    Status(oneshot::Sender<StatusReport>),
    Shutdown(oneshot::Sender<()>),
}

/// Daemon service
#[derive(Clone)]
pub struct DaemonService {
    cmd_tx: std_mpsc::Sender<CoreCommand>,
    /// Event broadcast channel
    event_tx: broadcast::Sender<DaemonMessage>,
    fatal_rx: watch::Receiver<Option<String>>,
    namer: InterfaceNamer,
    logs: LogBuffer,
}

impl DaemonService {
    /// Sweep stale interfaces and start the core thread
    ///
    /// A stale interface that cannot be removed is returned as a fatal error.
    pub fn start(config: &DaemonConfig, backends: Backends, logs: LogBuffer) -> Result<Self> {
        info!("Starting daemon core with {:?}", backends);

        let namer = InterfaceNamer::new(config.interface_prefix.clone());
        let (event_tx, _) = broadcast::channel(64);
        let mut daemon = Daemon::new(backends, namer.clone(), event_tx.clone());
        daemon.sweep_stale_interfaces()?;

        let (cmd_tx, cmd_rx) = std_mpsc::channel();
        let (fatal_tx, fatal_rx) = watch::channel(None);
        let interval = config.monitor_interval();

        thread::Builder::new()
            .name("hoplink-core".to_string())
            .spawn(move || run_core(daemon, cmd_rx, fatal_tx, interval))?;

        Ok(Self {
            cmd_tx,
            event_tx,
            fatal_rx,
            namer,
            logs,
        })
    }

    /// Get the event broadcast sender (for IpcServer to clone)
    pub fn event_sender(&self) -> broadcast::Sender<DaemonMessage> {
        self.event_tx.clone()
    }

    pub fn namer(&self) -> &InterfaceNamer {
        &self.namer
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> CoreCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply_tx))
            .map_err(|_| DaemonError::CoreStopped)?;
        reply_rx.await.map_err(|_| DaemonError::CoreStopped)
    }

    pub async fn activate(&self, config: InterfaceConfig) -> Result<()> {
        self.request(|reply| CoreCommand::Activate(config, reply)).await?
    }

    pub async fn deactivate(&self, hop: HopIndex) -> Result<()> {
        self.request(|reply| CoreCommand::Deactivate(hop, reply)).await?
    }

    pub async fn status(&self) -> Result<StatusReport> {
        self.request(CoreCommand::Status).await
    }

    /// Tear down every hop and stop the core thread
    pub async fn shutdown(&self) {
        info!("Shutting down daemon core");
        if self.request(CoreCommand::Shutdown).await.is_err() {
            debug!("Daemon core already stopped");
        }
    }

    pub fn logs(&self) -> String {
        self.logs.contents()
    }

    pub fn clean_logs(&self) {
        self.logs.clear();
    }

    /// Resolves with the reason once the core hits a fatal error
    ///
    /// Never resolves if the core stops cleanly.
    pub async fn fatal(&self) -> String {
        let mut rx = self.fatal_rx.clone();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }

    async fn handle_activate(&self, envelope: &Envelope) -> Vec<DaemonMessage> {
        let hint = hop_index_hint(envelope.body());
        let config = match parse_activate(envelope.body(), |hop| self.namer.name_for(hop)) {
            Ok(config) => config,
            Err(e) => {
                warn!("Rejecting activate for hop {}: {}", hint, e);
                return vec![DaemonMessage::Disconnected { hop_index: hint }];
            }
        };

        let hop = config.hop_index;
        match self.activate(config).await {
            Ok(()) => Vec::new(),
            Err(e) => {
                error!("Activation of hop {} failed: {}", hop, e);
                vec![DaemonMessage::Disconnected { hop_index: hop }]
            }
        }
    }
}

impl IpcHandler for DaemonService {
    fn handle(
        &self,
        envelope: Envelope,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Vec<DaemonMessage>> + Send + '_>> {
        Box::pin(async move {
            debug!("Handling message: {}", envelope.kind());

            match envelope.kind() {
                "activate" => self.handle_activate(&envelope).await,

                "deactivate" => {
                    let hop = hop_index_hint(envelope.body());
                    if let Err(e) = self.deactivate(hop).await {
                        warn!("Deactivation of hop {} failed: {}", hop, e);
                    }
                    Vec::new()
                }

                "status" => {
                    let report = self.status().await.unwrap_or_else(|e| {
                        error!("Status unavailable: {}", e);
                        StatusReport::disconnected()
                    });
                    vec![DaemonMessage::Status(report)]
                }

                "logs" => vec![DaemonMessage::logs(&self.logs())],

                "cleanlogs" => {
                    self.clean_logs();
                    Vec::new()
                }

                "version" => vec![DaemonMessage::Version {
                    version: PROTOCOL_VERSION,
                }],

                other => {
                    warn!("Ignoring unknown message type: {}", other);
                    Vec::new()
                }
            }
        })
    }
}

/// Core thread: commands in arrival order, liveness poll in between
fn run_core(
    mut daemon: Daemon,
    commands: std_mpsc::Receiver<CoreCommand>,
    fatal: watch::Sender<Option<String>>,
    interval: Duration,
) {
    info!("Daemon core running");
    let mut next_check = Instant::now() + interval;

    loop {
        let timeout = next_check.saturating_duration_since(Instant::now());
        match commands.recv_timeout(timeout) {
            Ok(CoreCommand::Activate(config, reply)) => {
                let result = daemon.activate(config);
                let fatal_reason = result.as_ref().err().filter(|e| e.is_fatal()).map(ToString::to_string);
                let _ = reply.send(result);
                if let Some(reason) = fatal_reason {
                    error!("Fatal: {}", reason);
                    let _ = fatal.send(Some(reason));
                    break;
                }
            }
            Ok(CoreCommand::Deactivate(hop, reply)) => {
                let _ = reply.send(daemon.deactivate(hop, true));
            }
            Ok(CoreCommand::Status(reply)) => {
                let _ = reply.send(daemon.status());
            }
            Ok(CoreCommand::Shutdown(reply)) => {
                daemon.deactivate_all(true);
                let _ = reply.send(());
                break;
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                daemon.check_liveness();
                next_check = Instant::now() + interval;
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                daemon.deactivate_all(false);
                break;
            }
        }
    }

    info!("Daemon core stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MemoryBackend;

    fn service() -> (DaemonService, MemoryBackend) {
        let memory = MemoryBackend::new();
        let config = DaemonConfig {
            interface_prefix: "hl".to_string(),
            monitor_interval_ms: 20,
            ..DaemonConfig::default()
        };
        let service = DaemonService::start(&config, memory.backends(), LogBuffer::new(1024)).unwrap();
        (service, memory)
    }

    fn envelope(json: &str) -> Envelope {
        Envelope::parse(json.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn test_version_reply() {
        let (service, _) = service();
        let replies = service.handle(envelope(r#"{"type":"version"}"#)).await;
        assert_eq!(replies, vec![DaemonMessage::Version { version: 1 }]);
    }

    #[tokio::test]
    async fn test_unknown_type_is_ignored() {
        let (service, memory) = service();
        assert!(service.handle(envelope(r#"{"type":"reboot"}"#)).await.is_empty());
        assert!(memory.calls().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_activate_reports_hint() {
        let (service, memory) = service();
        let replies = service.handle(envelope(r#"{"type":"activate","hopindex":2}"#)).await;
        assert_eq!(replies, vec![DaemonMessage::Disconnected { hop_index: 2 }]);

        let replies = service.handle(envelope(r#"{"type":"activate","hopindex":"x"}"#)).await;
        assert_eq!(replies, vec![DaemonMessage::Disconnected { hop_index: 0 }]);
        assert!(memory.calls().is_empty());
    }

    #[tokio::test]
    async fn test_logs_and_cleanlogs() {
        let (service, _) = service();
        service.logs.append(b"first\nsecond\n");
        let replies = service.handle(envelope(r#"{"type":"logs"}"#)).await;
        assert_eq!(
            replies,
            vec![DaemonMessage::Logs {
                logs: "first|second|".to_string()
            }]
        );

        assert!(service.handle(envelope(r#"{"type":"cleanlogs"}"#)).await.is_empty());
        assert_eq!(service.logs(), "");
    }

    #[tokio::test]
    async fn test_startup_fails_on_unremovable_stale_interface() {
        let memory = MemoryBackend::new();
        memory.add_stale_interface("hl");
        memory.fail_on(crate::BackendStep::DeleteInterface);
        let config = DaemonConfig {
            interface_prefix: "hl".to_string(),
            ..DaemonConfig::default()
        };
        let err = DaemonService::start(&config, memory.backends(), LogBuffer::default()).err().unwrap();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_shutdown_stops_core() {
        let (service, _) = service();
        service.shutdown().await;
        assert!(matches!(service.status().await, Err(DaemonError::CoreStopped)));
    }
}
