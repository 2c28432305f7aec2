//! IPC server for newline-delimited JSON messages
//!
//! Each connection gets its own [`Framer`]; every complete message is handed to the
//! shared [`IpcHandler`]. Daemon events are broadcast to every connection.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use hoplink_core::{encode, DaemonMessage, Envelope, Framer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc};
#[cfg(unix)]
use tracing::error;
use tracing::{debug, info, warn};

use crate::{DaemonError, Result};

const READ_CHUNK: usize = 4096;

/// Maps one inbound message to the replies for the sending connection
pub trait IpcHandler: Send + Sync {
    fn handle(&self, envelope: Envelope) -> Pin<Box<dyn Future<Output = Vec<DaemonMessage>> + Send + '_>>;
}

/// IPC server configuration
#[derive(Debug, Clone)]
pub struct IpcConfig {
    /// Socket path (Unix) or pipe name (Windows)
    pub socket_path: PathBuf,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: crate::config::default_socket_path(),
        }
    }
}

/// IPC server with event streaming and graceful shutdown.
pub struct IpcServer {
    config: IpcConfig,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: Option<mpsc::Receiver<()>>,
    event_tx: Option<broadcast::Sender<DaemonMessage>>,
}

impl IpcServer {
    /// Create a new IPC server
    pub fn new(config: IpcConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Self {
            config,
            shutdown_tx,
            shutdown_rx: Some(shutdown_rx),
            event_tx: None,
        }
    }

    /// Set the event broadcast sender for streaming events to clients
    pub fn set_event_sender(&mut self, tx: broadcast::Sender<DaemonMessage>) {
        self.event_tx = Some(tx);
    }

    /// Handle that stops a running [`IpcServer::start`] loop
    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Start the IPC server
    #[cfg(unix)]
    pub async fn start<H: IpcHandler + 'static>(&mut self, handler: H) -> Result<()> {
        use tokio::net::UnixListener;

        let mut shutdown_rx = self
            .shutdown_rx
            .take()
            .ok_or_else(|| DaemonError::IpcError("server already started".to_string()))?;

        if let Some(parent) = self.config.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Remove existing socket file
        if self.config.socket_path.exists() {
            std::fs::remove_file(&self.config.socket_path)?;
        }

        let listener = UnixListener::bind(&self.config.socket_path)
            .map_err(|e| DaemonError::IpcError(format!("Failed to bind: {}", e)))?;

        info!("IPC server listening on {:?}", self.config.socket_path);

        let handler = Arc::new(handler);
        let event_tx = self.event_tx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            debug!("Client connected");
                            let handler = handler.clone();
                            let event_rx = event_tx.as_ref().map(|tx| tx.subscribe());
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, handler, event_rx).await {
                                    warn!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("IPC server shutting down");
                    break;
                }
            }
        }

        // Cleanup socket file
        let _ = std::fs::remove_file(&self.config.socket_path);

        Ok(())
    }

    /// Stop the IPC server
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    /// Get the socket path
    pub fn socket_path(&self) -> &PathBuf {
        &self.config.socket_path
    }
}

/// Drive one client connection until it closes
///
/// Reads, event forwarding and replies all happen on this one task, so writes never
/// interleave. Events raised while a message is handled are written before that
/// message's replies.
pub(crate) async fn serve_connection<S, H>(
    stream: S,
    handler: Arc<H>,
    mut event_rx: Option<broadcast::Receiver<DaemonMessage>>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: IpcHandler + ?Sized,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut framer = Framer::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            biased;

            event = next_event(&mut event_rx) => {
                match event {
                    Some(message) => write_message(&mut writer, &message).await?,
                    None => event_rx = None,
                }
            }

            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    debug!("Client disconnected");
                    break;
                }

                for envelope in framer.feed(&buf[..n]) {
                    let replies = handler.handle(envelope).await;
                    flush_events(&mut event_rx, &mut writer).await?;
                    for reply in &replies {
                        write_message(&mut writer, reply).await?;
                    }
                }
            }
        }
    }

    Ok(())
}

async fn next_event(rx: &mut Option<broadcast::Receiver<DaemonMessage>>) -> Option<DaemonMessage> {
    let Some(rx) = rx.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(message) => return Some(message),
            Err(RecvError::Lagged(n)) => warn!("Event stream lagged, missed {} events", n),
            Err(RecvError::Closed) => return None,
        }
    }
}

async fn flush_events<W>(rx: &mut Option<broadcast::Receiver<DaemonMessage>>, writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let Some(rx) = rx.as_mut() else {
        return Ok(());
    };
    loop {
        match rx.try_recv() {
            Ok(message) => write_message(writer, &message).await?,
            Err(TryRecvError::Lagged(n)) => warn!("Event stream lagged, missed {} events", n),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return Ok(()),
        }
    }
}

async fn write_message<W>(writer: &mut W, message: &DaemonMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode(message).map_err(|e| DaemonError::IpcError(format!("Serialize error: {}", e)))?;
    debug!("Sending: {}", String::from_utf8_lossy(&bytes).trim_end());
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader};

    /// Echoes the message type back; `ping` also raises a broadcast event
    struct EchoHandler {
        events: broadcast::Sender<DaemonMessage>,
    }

    impl IpcHandler for EchoHandler {
        fn handle(&self, envelope: Envelope) -> Pin<Box<dyn Future<Output = Vec<DaemonMessage>> + Send + '_>> {
            Box::pin(async move {
                if envelope.kind() == "ping" {
                    let _ = self.events.send(DaemonMessage::Connected { hop_index: 7 });
                }
                vec![DaemonMessage::logs(envelope.kind())]
            })
        }
    }

    #[test]
    fn test_default_config() {
        let config = IpcConfig::default();
        assert!(config.socket_path.to_str().unwrap().contains("hoplink"));
    }

    #[test]
    fn test_ipc_server_creation() {
        let config = IpcConfig {
            socket_path: PathBuf::from("/tmp/test.sock"),
        };
        let server = IpcServer::new(config.clone());
        assert_eq!(server.socket_path(), &config.socket_path);
    }

    #[tokio::test]
    async fn test_events_precede_replies() {
        let (events, _) = broadcast::channel(16);
        let handler = Arc::new(EchoHandler { events: events.clone() });
        let (client, server) = duplex(1024);
        let task = tokio::spawn(serve_connection(server, handler, Some(events.subscribe())));

        let (read_half, mut write_half) = tokio::io::split(client);
        let mut lines = BufReader::new(read_half).lines();

        // one chunk, two messages, one of them split by garbage
        write_half
            .write_all(b"{\"type\":\"ping\"}\nnot json\n\n{\"type\":\"status\"}\n")
            .await
            .unwrap();

        assert_eq!(lines.next_line().await.unwrap().unwrap(), r#"{"type":"connected","hopindex":7}"#);
        assert_eq!(lines.next_line().await.unwrap().unwrap(), r#"{"type":"logs","logs":"ping"}"#);
        assert_eq!(lines.next_line().await.unwrap().unwrap(), r#"{"type":"logs","logs":"status"}"#);

        drop(write_half);
        drop(lines);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_partial_message_waits_for_delimiter() {
        let (events, _) = broadcast::channel(16);
        let handler = Arc::new(EchoHandler { events: events.clone() });
        let (client, server) = duplex(1024);
        let task = tokio::spawn(serve_connection(server, handler, None));

        let (read_half, mut write_half) = tokio::io::split(client);
        let mut lines = BufReader::new(read_half).lines();

        write_half.write_all(b"{\"type\":\"lo").await.unwrap();
        write_half.flush().await.unwrap();
        tokio::task::yield_now().await;
        write_half.write_all(b"gs\"}\n").await.unwrap();

        assert_eq!(lines.next_line().await.unwrap().unwrap(), r#"{"type":"logs","logs":"logs"}"#);

        drop(write_half);
        drop(lines);
        task.await.unwrap().unwrap();
    }
}
