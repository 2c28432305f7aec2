//! hoplink Daemon
//!
//! Privileged background service that brings chained tunnel interfaces up and down
//! on behalf of an unprivileged client.
//!
//! ## Components
//!
//! - **Daemon**: per-hop activate / deactivate / switch orchestration over the
//!   [`Registry`] and the three backends
//! - **DaemonService**: owns the core on a dedicated thread and dispatches wire
//!   messages to it
//! - **IpcServer**: newline-delimited JSON over Unix sockets (macOS/Linux) or Named
//!   Pipes (Windows)
//!
//! ## Messages
//!
//! - `activate` - bring one hop up (or switch its server)
//! - `deactivate` - bring one hop down
//! - `status` - connectivity and byte counters of hop 0
//! - `logs` / `cleanlogs` - read or purge the daemon's log buffer
//! - `version` - protocol version
//!
//! ## Platform-Specific IPC
//!
//! - **macOS/Linux**: Unix domain sockets (`/var/run/hoplink/daemon.socket`)
//! - **Windows**: Named pipes (`\\.\pipe\hoplink`)

mod backend;
mod config;
mod daemon;
mod ipc;
pub mod platform;
mod registry;
pub mod resolver;
mod service;
mod windows_pipe;

pub use backend::{
    BackendError, BackendResult, BackendStep, Backends, DnsBackend, NetworkBackend, Throughput,
    TunnelBackend,
};
pub use config::{default_socket_path, BackendKind, DaemonConfig, ResolverPolicy, MAX_IFNAME_LEN};
pub use daemon::Daemon;
pub use ipc::{IpcConfig, IpcHandler, IpcServer};
pub use registry::{ConnectionState, Registry};
pub use service::DaemonService;
pub use windows_pipe::{WindowsPipeConfig, WindowsPipeServer};

use hoplink_core::{ConfigError, HopIndex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Stale interface {ifname} could not be removed: {source}")]
    StaleInterface {
        ifname: String,
        source: BackendError,
    },

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Invalid activate request: {0}")]
    InvalidRequest(#[from] ConfigError),

    #[error("Hop {0} is not active")]
    NotActive(HopIndex),

    #[error("Interface {0} does not exist")]
    InterfaceMissing(String),

    #[error("Interface name `{0}` is longer than 15 bytes")]
    InterfaceName(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Daemon core is not running")]
    CoreStopped,

    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl DaemonError {
    /// Errors after which the daemon must not keep running
    pub fn is_fatal(&self) -> bool {
        matches!(self, DaemonError::StaleInterface { .. })
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
