//! Daemon configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DaemonError, Result};

/// Longest interface name the kernel accepts (IFNAMSIZ minus the terminator)
pub const MAX_IFNAME_LEN: usize = 15;

/// Which backend set to drive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Linux on Linux, memory elsewhere
    #[default]
    Auto,
    Linux,
    Memory,
}

/// Backoff policy for peer endpoint resolution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverPolicy {
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for ResolverPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            multiplier: 1.2,
            max_delay_ms: 20_000,
            max_retries: 15,
        }
    }
}

/// Daemon settings, loaded from a JSON file; every field has a default
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Socket path (Unix) or pipe name (Windows)
    pub socket_path: PathBuf,
    pub interface_prefix: String,
    pub mtu: u16,
    pub log_buffer_bytes: usize,
    pub monitor_interval_ms: u64,
    pub resolver: ResolverPolicy,
    pub backend: BackendKind,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            interface_prefix: "hoplink".to_string(),
            mtu: 1420,
            log_buffer_bytes: hoplink_logging::DEFAULT_BUFFER_BYTES,
            monitor_interval_ms: 2_000,
            resolver: ResolverPolicy::default(),
            backend: BackendKind::Auto,
        }
    }
}

impl DaemonConfig {
    /// Read and validate a JSON config file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: DaemonConfig = serde_json::from_str(&text)
            .map_err(|e| DaemonError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let prefix = &self.interface_prefix;
        if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_') {
            return Err(DaemonError::Config(format!(
                "interface_prefix `{}` must be non-empty ASCII letters, digits, `-` or `_`",
                prefix
            )));
        }
        // leave room for "hop" plus a two digit index
        if prefix.len() + 5 > MAX_IFNAME_LEN {
            return Err(DaemonError::Config(format!(
                "interface_prefix `{}` is too long for relay hop names",
                prefix
            )));
        }
        if self.mtu < 1280 {
            return Err(DaemonError::Config(format!("mtu {} is below 1280", self.mtu)));
        }
        if self.monitor_interval_ms == 0 {
            return Err(DaemonError::Config("monitor_interval_ms must be positive".to_string()));
        }
        if self.resolver.multiplier.is_nan() || self.resolver.multiplier < 1.0 {
            return Err(DaemonError::Config("resolver.multiplier must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

/// Platform default socket path or pipe name
pub fn default_socket_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"\\.\pipe\hoplink")
    } else {
        PathBuf::from("/var/run/hoplink/daemon.socket")
    }
}
