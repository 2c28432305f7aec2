//! In-memory backend
//!
//! Models interface existence, peers, routes and resolvers without touching the OS.
//! Every clone shares one state, so a test can keep a handle for inspection while
//! the daemon owns the boxed copies. Failures can be injected per step and the
//! tunnel engine can be "killed" to exercise the liveness monitor.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use hoplink_core::{InterfaceConfig, IpAddressRange};
use parking_lot::Mutex;
use tracing::debug;

use crate::backend::{
    BackendError, BackendResult, BackendStep, Backends, DnsBackend, NetworkBackend, Throughput,
    TunnelBackend,
};

/// A mutating backend call, as recorded by [`MemoryBackend`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    AddInterface(String),
    ConfigureInterface {
        ifname: String,
        peer: String,
        endpoint: String,
        allowed_ips: Vec<String>,
    },
    DeleteInterface(String),
    AddRoutePrefix {
        ifname: String,
        range: String,
    },
    UpdateResolvers {
        ifname: String,
        resolvers: Vec<String>,
    },
    RestoreResolvers,
    AddInterfaceIps(String),
    SetMtuAndUp(String),
}

#[derive(Debug, Default)]
struct InterfaceRecord {
    peer: Option<String>,
    routes: Vec<String>,
    up: bool,
    throughput: Throughput,
}

#[derive(Debug)]
struct MemoryState {
    interfaces: BTreeMap<String, InterfaceRecord>,
    resolvers: Option<(String, Vec<String>)>,
    calls: Vec<BackendCall>,
    failures: HashSet<BackendStep>,
    alive: bool,
    supports_switching: bool,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            interfaces: BTreeMap::new(),
            resolvers: None,
            calls: Vec::new(),
            failures: HashSet::new(),
            alive: true,
            supports_switching: true,
        }
    }
}

impl MemoryState {
    fn check(&self, step: BackendStep) -> BackendResult<()> {
        if self.failures.contains(&step) {
            debug!("Injected failure for {}", step);
            return Err(BackendError::new(step, "injected failure"));
        }
        Ok(())
    }

    fn interface_mut(&mut self, step: BackendStep, ifname: &str) -> BackendResult<&mut InterfaceRecord> {
        self.interfaces
            .get_mut(ifname)
            .ok_or_else(|| BackendError::new(step, format!("no interface named {}", ifname)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Boxed tunnel, network and DNS backends sharing this state
    pub fn backends(&self) -> Backends {
        Backends {
            tunnel: Box::new(self.clone()),
            network: Box::new(self.clone()),
            dns: Box::new(self.clone()),
        }
    }

    /// Mutating calls in the order they were made
    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Make every future call of `step` fail
    pub fn fail_on(&self, step: BackendStep) {
        self.state.lock().failures.insert(step);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Simulate the tunnel engine dying (or coming back)
    pub fn set_alive(&self, alive: bool) {
        self.state.lock().alive = alive;
    }

    pub fn set_supports_switching(&self, supported: bool) {
        self.state.lock().supports_switching = supported;
    }

    pub fn set_throughput(&self, ifname: &str, tx_bytes: u64, rx_bytes: u64) {
        if let Some(record) = self.state.lock().interfaces.get_mut(ifname) {
            record.throughput = Throughput { tx_bytes, rx_bytes };
        }
    }

    /// Create an interface behind the daemon's back, as a crashed run would leave it
    pub fn add_stale_interface(&self, ifname: &str) {
        self.state
            .lock()
            .interfaces
            .insert(ifname.to_string(), InterfaceRecord::default());
    }

    /// Delete an interface behind the daemon's back
    pub fn remove_interface_externally(&self, ifname: &str) {
        self.state.lock().interfaces.remove(ifname);
    }

    pub fn interface_exists_now(&self, ifname: &str) -> bool {
        self.state.lock().interfaces.contains_key(ifname)
    }

    pub fn interfaces(&self) -> Vec<String> {
        self.state.lock().interfaces.keys().cloned().collect()
    }

    pub fn is_up(&self, ifname: &str) -> bool {
        self.state.lock().interfaces.get(ifname).is_some_and(|record| record.up)
    }

    /// Public key of the peer programmed on `ifname`
    pub fn peer_of(&self, ifname: &str) -> Option<String> {
        self.state.lock().interfaces.get(ifname).and_then(|record| record.peer.clone())
    }

    pub fn routes_of(&self, ifname: &str) -> Vec<String> {
        self.state
            .lock()
            .interfaces
            .get(ifname)
            .map(|record| record.routes.clone())
            .unwrap_or_default()
    }

    /// Interface and addresses the resolver configuration currently points at
    pub fn resolvers(&self) -> Option<(String, Vec<String>)> {
        self.state.lock().resolvers.clone()
    }
}

impl TunnelBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn interface_exists(&self, ifname: &str) -> bool {
        self.interface_exists_now(ifname)
    }

    fn add_interface(&mut self, config: &InterfaceConfig) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::AddInterface(config.ifname.clone()));
        state.check(BackendStep::AddInterface)?;
        if state.interfaces.contains_key(&config.ifname) {
            return Err(BackendError::new(
                BackendStep::AddInterface,
                format!("{} already exists", config.ifname),
            ));
        }
        state.interfaces.insert(config.ifname.clone(), InterfaceRecord::default());
        Ok(())
    }

    fn configure_interface(&mut self, config: &InterfaceConfig) -> BackendResult<()> {
        let mut state = self.state.lock();
        let allowed_ips: Vec<String> = config.allowed_ip_ranges.iter().map(ToString::to_string).collect();
        state.calls.push(BackendCall::ConfigureInterface {
            ifname: config.ifname.clone(),
            peer: config.server_public_key.clone(),
            endpoint: format!("{}:{}", config.server_ipv4_addr_in, config.server_port),
            allowed_ips,
        });
        state.check(BackendStep::ConfigureInterface)?;
        let record = state.interface_mut(BackendStep::ConfigureInterface, &config.ifname)?;
        record.peer = Some(config.server_public_key.clone());
        Ok(())
    }

    fn delete_interface(&mut self, ifname: &str) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::DeleteInterface(ifname.to_string()));
        state.check(BackendStep::DeleteInterface)?;
        state
            .interfaces
            .remove(ifname)
            .map(|_| ())
            .ok_or_else(|| BackendError::new(BackendStep::DeleteInterface, format!("no interface named {}", ifname)))
    }

    fn add_route_prefix(&mut self, range: &IpAddressRange, ifname: &str) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::AddRoutePrefix {
            ifname: ifname.to_string(),
            range: range.to_string(),
        });
        state.check(BackendStep::AddRoutePrefix)?;
        let record = state.interface_mut(BackendStep::AddRoutePrefix, ifname)?;
        record.routes.push(range.to_string());
        Ok(())
    }

    fn get_throughput(&self, ifname: &str) -> BackendResult<Throughput> {
        let mut state = self.state.lock();
        state.check(BackendStep::GetThroughput)?;
        Ok(state.interface_mut(BackendStep::GetThroughput, ifname)?.throughput)
    }

    fn supports_switching(&self) -> bool {
        self.state.lock().supports_switching
    }

    fn is_alive(&self) -> bool {
        self.state.lock().alive
    }
}

impl NetworkBackend for MemoryBackend {
    fn add_interface_ips(&mut self, config: &InterfaceConfig) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::AddInterfaceIps(config.ifname.clone()));
        state.check(BackendStep::AddInterfaceIps)?;
        state.interface_mut(BackendStep::AddInterfaceIps, &config.ifname)?;
        Ok(())
    }

    fn set_mtu_and_up(&mut self, config: &InterfaceConfig) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::SetMtuAndUp(config.ifname.clone()));
        state.check(BackendStep::SetMtuAndUp)?;
        state.interface_mut(BackendStep::SetMtuAndUp, &config.ifname)?.up = true;
        Ok(())
    }
}

impl DnsBackend for MemoryBackend {
    fn update_resolvers(&mut self, ifname: &str, resolvers: &[String]) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::UpdateResolvers {
            ifname: ifname.to_string(),
            resolvers: resolvers.to_vec(),
        });
        state.check(BackendStep::UpdateResolvers)?;
        state.resolvers = Some((ifname.to_string(), resolvers.to_vec()));
        Ok(())
    }

    fn restore_resolvers(&mut self) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::RestoreResolvers);
        state.check(BackendStep::RestoreResolvers)?;
        state.resolvers = None;
        Ok(())
    }
}
