//! Daemon core: per-hop connection lifecycle

use hoplink_core::{DaemonMessage, HopIndex, InterfaceConfig, StatusReport};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::backend::{Backends, Throughput};
use crate::config::MAX_IFNAME_LEN;
use crate::platform::InterfaceNamer;
use crate::registry::{ConnectionState, Registry};
use crate::{DaemonError, Result};

/// Orchestrates the backends for every hop
///
/// Not thread safe by itself: [`crate::DaemonService`] confines it to one thread so
/// that registry and backend access is serialized.
pub struct Daemon {
    backends: Backends,
    registry: Registry,
    namer: InterfaceNamer,
    events: broadcast::Sender<DaemonMessage>,
}

impl Daemon {
    pub fn new(backends: Backends, namer: InterfaceNamer, events: broadcast::Sender<DaemonMessage>) -> Self {
        Self {
            backends,
            registry: Registry::new(),
            namer,
            events,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn namer(&self) -> &InterfaceNamer {
        &self.namer
    }

    /// Remove a hop 0 interface left behind by a previous run
    pub fn sweep_stale_interfaces(&mut self) -> Result<()> {
        let ifname = self.namer.name_for(0);
        self.remove_stale(&ifname)
    }

    /// Bring a hop up, or switch its server if it already is
    pub fn activate(&mut self, config: InterfaceConfig) -> Result<()> {
        let hop = config.hop_index;
        info!("Activating interface {}", config.ifname);

        if config.ifname.len() > MAX_IFNAME_LEN {
            return Err(DaemonError::InterfaceName(config.ifname));
        }

        let switchable = self
            .registry
            .get(hop)
            .map(|current| config.can_switch_from(&current.config) && self.backends.tunnel.supports_switching());

        match switchable {
            Some(true) => {
                info!("Hop {} already up, switching server in place", hop);
                self.backends.tunnel.configure_interface(&config)?;
                self.registry.insert(ConnectionState::new(config));
                self.emit(DaemonMessage::Connected { hop_index: hop });
                Ok(())
            }
            Some(false) => {
                info!("Hop {} already up, server switching not possible, reconnecting", hop);
                match self.deactivate(hop, false) {
                    // the entry is gone either way
                    Ok(()) | Err(DaemonError::InterfaceMissing(_)) => {}
                    Err(e) => return Err(e),
                }
                self.activate_from_down(config)
            }
            None => self.activate_from_down(config),
        }
    }

    fn activate_from_down(&mut self, config: InterfaceConfig) -> Result<()> {
        let hop = config.hop_index;
        let ifname = config.ifname.clone();
        debug!("Bringing up {:?}", config);

        self.remove_stale(&ifname)?;

        self.backends.tunnel.add_interface(&config)?;
        self.backends.tunnel.configure_interface(&config)?;

        if hop == 0 {
            self.backends.dns.update_resolvers(&ifname, &config.resolvers())?;
        }

        self.backends.network.add_interface_ips(&config)?;
        self.backends.network.set_mtu_and_up(&config)?;

        for range in &config.allowed_ip_ranges {
            if let Err(e) = self.backends.tunnel.add_route_prefix(range, &ifname) {
                error!("Routing configuration failed for {}: {}", ifname, e);
                return Err(e.into());
            }
        }

        self.registry.insert(ConnectionState::new(config));
        info!("Interface {} is up", ifname);
        self.emit(DaemonMessage::Connected { hop_index: hop });
        Ok(())
    }

    /// Bring a hop down; `emit` is false on the internal reconnect path
    pub fn deactivate(&mut self, hop: HopIndex, emit: bool) -> Result<()> {
        let ifname = match self.registry.get(hop) {
            Some(state) => state.config.ifname.clone(),
            None => {
                warn!("Hop {} is not active", hop);
                return Err(DaemonError::NotActive(hop));
            }
        };
        info!("Deactivating interface {}", ifname);

        if hop == 0 {
            self.backends.dns.restore_resolvers()?;
        }

        if !self.backends.tunnel.interface_exists(&ifname) {
            // Nothing left to tear down; keeping the entry would only wedge the hop.
            warn!("Interface {} no longer exists, forgetting hop {}", ifname, hop);
            self.registry.remove(hop);
            if emit {
                self.emit(DaemonMessage::Disconnected { hop_index: hop });
            }
            return Err(DaemonError::InterfaceMissing(ifname));
        }

        self.backends.tunnel.delete_interface(&ifname)?;
        self.registry.remove(hop);
        info!("Interface {} is down", ifname);

        if emit {
            self.emit(DaemonMessage::Disconnected { hop_index: hop });
        }
        Ok(())
    }

    /// Tear down every active hop, ascending from hop 0
    pub fn deactivate_all(&mut self, emit: bool) {
        for hop in self.registry.hops() {
            if let Err(e) = self.deactivate(hop, emit) {
                warn!("Failed to deactivate hop {}: {}", hop, e);
            }
        }
    }

    /// Connectivity snapshot of hop 0
    pub fn status(&self) -> StatusReport {
        let Some(state) = self.registry.get(0) else {
            return StatusReport::disconnected();
        };

        let ifname = &state.config.ifname;
        if !self.backends.tunnel.interface_exists(ifname) {
            warn!("Hop 0 is registered but {} is gone", ifname);
            return StatusReport::disconnected();
        }

        let throughput = self.backends.tunnel.get_throughput(ifname).unwrap_or_else(|e| {
            warn!("Unable to read counters of {}: {}", ifname, e);
            Throughput::default()
        });

        StatusReport {
            connected: true,
            server_ipv4_gateway: Some(state.config.server_ipv4_gateway.clone()),
            device_ipv4_address: Some(state.config.device_ipv4_address.clone()),
            date: Some(state.activated_at.to_rfc3339()),
            tx_bytes: Some(throughput.tx_bytes),
            rx_bytes: Some(throughput.rx_bytes),
        }
    }

    /// Poll the tunnel engine; on loss report `backendFailure` and tear everything down.
    ///
    /// Returns true when a failure was handled.
    pub fn check_liveness(&mut self) -> bool {
        if self.registry.is_empty() || self.backends.tunnel.is_alive() {
            return false;
        }

        error!(
            "Tunnel engine of {} backend stopped, tearing down {} hop(s)",
            self.backends.tunnel.name(),
            self.registry.len()
        );
        self.emit(DaemonMessage::BackendFailure);
        self.deactivate_all(true);
        true
    }

    fn remove_stale(&mut self, ifname: &str) -> Result<()> {
        if !self.backends.tunnel.interface_exists(ifname) {
            return Ok(());
        }

        warn!("Stale interface {} found, removing it", ifname);
        self.backends
            .tunnel
            .delete_interface(ifname)
            .map_err(|source| DaemonError::StaleInterface {
                ifname: ifname.to_string(),
                source,
            })
    }

    fn emit(&self, message: DaemonMessage) {
        debug!("Event: {:?}", message);
        // No subscribers just means no client is attached.
        let _ = self.events.send(message);
    }
}
