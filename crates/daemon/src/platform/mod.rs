//! Platform policy: interface naming and backend selection

#[cfg(target_os = "linux")]
mod linux;
mod memory;

#[cfg(target_os = "linux")]
pub use linux::{LinuxBackend, LinuxDns};
pub use memory::{BackendCall, MemoryBackend};

use hoplink_core::HopIndex;
use tracing::info;

use crate::backend::Backends;
use crate::config::{BackendKind, DaemonConfig};
#[cfg(not(target_os = "linux"))]
use crate::DaemonError;
use crate::Result;

/// Maps hop indices to interface names: `<prefix>` for hop 0, `<prefix>hop<n>` otherwise
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceNamer {
    prefix: String,
}

impl InterfaceNamer {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn name_for(&self, hop: HopIndex) -> String {
        if hop == 0 {
            self.prefix.clone()
        } else {
            format!("{}hop{}", self.prefix, hop)
        }
    }
}

/// Build the backend set selected by `config.backend`
pub fn create_backends(config: &DaemonConfig) -> Result<Backends> {
    let kind = match config.backend {
        BackendKind::Auto if cfg!(target_os = "linux") => BackendKind::Linux,
        BackendKind::Auto => BackendKind::Memory,
        kind => kind,
    };
    info!("Using {:?} backend", kind);

    match kind {
        BackendKind::Memory | BackendKind::Auto => Ok(MemoryBackend::new().backends()),
        #[cfg(target_os = "linux")]
        BackendKind::Linux => {
            let backend = LinuxBackend::new(config.mtu, config.resolver);
            Ok(Backends {
                tunnel: Box::new(backend.clone()),
                network: Box::new(backend),
                dns: Box::new(LinuxDns::new()),
            })
        }
        #[cfg(not(target_os = "linux"))]
        BackendKind::Linux => Err(DaemonError::Config(
            "the linux backend is not available on this platform".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_names() {
        let namer = InterfaceNamer::new("hoplink");
        assert_eq!(namer.name_for(0), "hoplink");
        assert_eq!(namer.name_for(1), "hoplinkhop1");
        assert_eq!(namer.name_for(12), "hoplinkhop12");
    }

    #[test]
    fn test_memory_backend_selection() {
        let config = DaemonConfig {
            backend: BackendKind::Memory,
            ..DaemonConfig::default()
        };
        let backends = create_backends(&config).unwrap();
        assert_eq!(backends.tunnel.name(), "memory");
    }
}
