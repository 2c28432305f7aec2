//! hoplink IPC Client
//!
//! Client side of the daemon protocol: newline-delimited JSON over a local socket.
//!
//! ## Supported Platforms
//!
//! - **Unix (macOS/Linux)**: Unix domain sockets
//! - **Windows**: Named pipes
//!
//! ## Usage
//!
//! ```ignore
//! use hoplink_ipc_client::{default_socket_path, IpcClient, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (client, mut events) = IpcClient::connect(&default_socket_path()).await?;
//!
//!     if let Some(SessionEvent::Initialized { connected, .. }) = events.recv().await {
//!         println!("Connected: {}", connected);
//!     }
//!
//!     println!("{}", client.backend_logs().await?);
//!     Ok(())
//! }
//! ```

mod client;
mod protocol;
mod session;

pub use client::{IpcClient, SessionEvents};
pub use protocol::{ActivationPlan, Device, Server};
pub use session::{
    ClientSession, DeactivateReason, LogCallback, LogReply, SessionEvent, SessionState, Transition,
};

use std::path::PathBuf;

use thiserror::Error;

/// Socket of a system-wide daemon
#[cfg(unix)]
pub const DAEMON_SOCKET_PATH: &str = "/var/run/hoplink/daemon.socket";

/// Fallback socket for a daemon started without privileges
#[cfg(unix)]
pub const FALLBACK_SOCKET_PATH: &str = "/tmp/hoplink.socket";

/// Default named pipe path for Windows
#[cfg(windows)]
pub const DEFAULT_PIPE_PATH: &str = r"\\.\pipe\hoplink";

/// Socket the client should connect to
#[cfg(unix)]
pub fn default_socket_path() -> PathBuf {
    let system = PathBuf::from(DAEMON_SOCKET_PATH);
    if system.exists() {
        system
    } else {
        PathBuf::from(FALLBACK_SOCKET_PATH)
    }
}

#[cfg(windows)]
pub fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_PIPE_PATH)
}

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection to the daemon closed")]
    Disconnected,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Daemon not running")]
    DaemonNotRunning,
}

pub type Result<T> = std::result::Result<T, IpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_default_socket_path() {
        let path = default_socket_path();
        assert!(path == PathBuf::from(DAEMON_SOCKET_PATH) || path == PathBuf::from(FALLBACK_SOCKET_PATH));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_socket_means_not_running() {
        let err = IpcClient::connect(std::path::Path::new("/nonexistent/hoplink.socket"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, IpcError::DaemonNotRunning));
    }
}
