//! Windows Named Pipe IPC Server
//!
//! Serves the same newline-delimited protocol as [`crate::IpcServer`] over Windows
//! named pipes, sharing its per-connection loop.

use hoplink_core::DaemonMessage;
use tokio::sync::{broadcast, mpsc};

use crate::ipc::IpcHandler;
use crate::{DaemonError, Result};

/// Windows Named Pipe configuration
#[derive(Debug, Clone)]
pub struct WindowsPipeConfig {
    /// Pipe name (e.g., "\\\\.\\pipe\\hoplink")
    pub pipe_name: String,
}

impl Default for WindowsPipeConfig {
    fn default() -> Self {
        Self {
            pipe_name: r"\\.\pipe\hoplink".to_string(),
        }
    }
}

/// Windows Named Pipe IPC Server
pub struct WindowsPipeServer {
    config: WindowsPipeConfig,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: Option<mpsc::Receiver<()>>,
    event_tx: Option<broadcast::Sender<DaemonMessage>>,
}

impl WindowsPipeServer {
    /// Create a new Windows named pipe server
    pub fn new(config: WindowsPipeConfig) -> Self {
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

    /// Handle that stops a running [`WindowsPipeServer::start`] loop
    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    fn take_shutdown(&mut self) -> Result<mpsc::Receiver<()>> {
        self.shutdown_rx
            .take()
            .ok_or_else(|| DaemonError::IpcError("server already started".to_string()))
    }

    /// Start the named pipe server
    #[cfg(windows)]
    pub async fn start<H: IpcHandler + 'static>(&mut self, handler: H) -> Result<()> {
        use std::sync::Arc;

        use tokio::net::windows::named_pipe::{PipeMode, ServerOptions};
        use tracing::{debug, error, info, warn};

        use crate::ipc::serve_connection;

        let mut shutdown_rx = self.take_shutdown()?;
        info!("Starting Windows named pipe server on {}", self.config.pipe_name);

        let handler = Arc::new(handler);
        let pipe_name = self.config.pipe_name.clone();
        let event_tx = self.event_tx.clone();

        // Create the first pipe server instance
        let mut server = ServerOptions::new()
            .first_pipe_instance(true)
            .pipe_mode(PipeMode::Byte)
            .create(&pipe_name)
            .map_err(|e| DaemonError::IpcError(format!("Failed to create pipe: {}", e)))?;

        loop {
            tokio::select! {
                result = server.connect() => {
                    match result {
                        Ok(()) => {
                            debug!("Pipe client connected");
                            let handler = handler.clone();
                            let event_rx = event_tx.as_ref().map(|tx| tx.subscribe());
                            let connected_pipe = server;

                            // Create a new server for the next connection
                            server = ServerOptions::new()
                                .pipe_mode(PipeMode::Byte)
                                .create(&pipe_name)
                                .map_err(|e| DaemonError::IpcError(format!("Failed to create pipe: {}", e)))?;

                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(connected_pipe, handler, event_rx).await {
                                    warn!("Pipe connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept pipe connection: {}", e);
                        }
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("Named pipe server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Named pipes only exist on Windows
    #[cfg(not(windows))]
    pub async fn start<H: IpcHandler + 'static>(&mut self, _handler: H) -> Result<()> {
        self.take_shutdown()?;
        Err(DaemonError::IpcError(
            "Windows named pipes are only available on Windows".to_string(),
        ))
    }

    /// Stop the named pipe server
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    /// Get the pipe name
    pub fn pipe_name(&self) -> &str {
        &self.config.pipe_name
    }
}
