//! Backend capability traits
//!
//! The daemon core only talks to these three traits. One concrete implementation of
//! each is chosen at process start (see [`crate::platform`]).

use std::fmt;

use hoplink_core::{InterfaceConfig, IpAddressRange};
use thiserror::Error;

/// The OS-level step a backend call performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendStep {
    AddInterface,
    ConfigureInterface,
    DeleteInterface,
    AddRoutePrefix,
    GetThroughput,
    UpdateResolvers,
    RestoreResolvers,
    AddInterfaceIps,
    SetMtuAndUp,
}

impl BackendStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendStep::AddInterface => "addInterface",
            BackendStep::ConfigureInterface => "configureInterface",
            BackendStep::DeleteInterface => "deleteInterface",
            BackendStep::AddRoutePrefix => "addRoutePrefix",
            BackendStep::GetThroughput => "getThroughput",
            BackendStep::UpdateResolvers => "updateResolvers",
            BackendStep::RestoreResolvers => "restoreResolvers",
            BackendStep::AddInterfaceIps => "addInterfaceIPs",
            BackendStep::SetMtuAndUp => "setMTUAndUp",
        }
    }
}

impl fmt::Display for BackendStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed backend call: which step, plus a human-readable reason
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{step} failed: {message}")]
pub struct BackendError {
    pub step: BackendStep,
    pub message: String,
}

impl BackendError {
    pub fn new(step: BackendStep, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
        }
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Interface byte counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Throughput {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

/// Creates and destroys tunnel interfaces and programs their peer
pub trait TunnelBackend: Send {
    fn name(&self) -> &'static str;

    fn interface_exists(&self, ifname: &str) -> bool;

    fn add_interface(&mut self, config: &InterfaceConfig) -> BackendResult<()>;

    /// Idempotently (re)program keys, peer endpoint and allowed IPs
    fn configure_interface(&mut self, config: &InterfaceConfig) -> BackendResult<()>;

    fn delete_interface(&mut self, ifname: &str) -> BackendResult<()>;

    fn add_route_prefix(&mut self, range: &IpAddressRange, ifname: &str) -> BackendResult<()>;

    fn get_throughput(&self, ifname: &str) -> BackendResult<Throughput>;

    /// Whether an up interface can be reprogrammed in place on server switch
    fn supports_switching(&self) -> bool {
        true
    }

    /// Whether the tunnel engine behind this backend is still running
    fn is_alive(&self) -> bool {
        true
    }
}

/// Interface addressing
pub trait NetworkBackend: Send {
    fn add_interface_ips(&mut self, config: &InterfaceConfig) -> BackendResult<()>;

    fn set_mtu_and_up(&mut self, config: &InterfaceConfig) -> BackendResult<()>;
}

/// Resolver configuration; only hop 0 touches it
pub trait DnsBackend: Send {
    fn update_resolvers(&mut self, ifname: &str, resolvers: &[String]) -> BackendResult<()>;

    fn restore_resolvers(&mut self) -> BackendResult<()>;
}

/// The three backends the daemon core drives
pub struct Backends {
    pub tunnel: Box<dyn TunnelBackend>,
    pub network: Box<dyn NetworkBackend>,
    pub dns: Box<dyn DnsBackend>,
}

impl fmt::Debug for Backends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backends")
            .field("tunnel", &self.tunnel.name())
            .finish_non_exhaustive()
    }
}
