//! Activation plan types and the hop message builder

use hoplink_core::{ActivateRequest, ClientMessage, HopIndex, WireIpRange};
use serde::{Deserialize, Serialize};

/// One server in the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub public_key: String,
    pub ipv4_gateway: String,
    pub ipv6_gateway: String,
    pub ipv4_addr_in: String,
    pub ipv6_addr_in: String,
    pub port: u16,
}

/// Addresses assigned to this device by the exit server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub ipv4_address: String,
    pub ipv6_address: String,
}

/// Everything needed to bring a (multi-hop) connection up
///
/// `servers[0]` is the exit hop; the last entry is the entry hop the device talks to
/// directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationPlan {
    pub private_key: String,
    pub device: Device,
    pub servers: Vec<Server>,
    #[serde(rename = "allowedIPAddressRanges")]
    pub allowed_ip_ranges: Vec<WireIpRange>,
    #[serde(default)]
    pub ipv6_enabled: bool,
}

impl ActivationPlan {
    pub fn hop_count(&self) -> usize {
        self.servers.len()
    }

    /// `activate` messages in send order: hop N first, down to hop 0 last
    ///
    /// Relay hops get synthetic device addresses and route only their own gateways
    /// plus the ingress of the next inward hop.
    pub fn messages(&self) -> Vec<ClientMessage> {
        let mut messages = Vec::with_capacity(self.servers.len());

        for hop in (1..self.servers.len()).rev() {
            let server = &self.servers[hop];
            let next = &self.servers[hop - 1];
            let index = hop as HopIndex;

            messages.push(ClientMessage::Activate(ActivateRequest {
                hop_index: Some(index),
                private_key: self.private_key.clone(),
                device_ipv4_address: relay_device_ipv4(index),
                device_ipv6_address: relay_device_ipv6(index),
                server_ipv4_gateway: server.ipv4_gateway.clone(),
                server_ipv6_gateway: server.ipv6_gateway.clone(),
                server_public_key: server.public_key.clone(),
                server_ipv4_addr_in: server.ipv4_addr_in.clone(),
                server_ipv6_addr_in: server.ipv6_addr_in.clone(),
                server_port: server.port,
                ipv6_enabled: self.ipv6_enabled,
                allowed_ip_address_ranges: vec![
                    host_range(&server.ipv4_gateway, false),
                    host_range(&server.ipv6_gateway, true),
                    host_range(&next.ipv4_addr_in, false),
                    host_range(&next.ipv6_addr_in, true),
                ],
            }));
        }

        if let Some(exit) = self.servers.first() {
            messages.push(ClientMessage::Activate(ActivateRequest {
                hop_index: Some(0),
                private_key: self.private_key.clone(),
                device_ipv4_address: self.device.ipv4_address.clone(),
                device_ipv6_address: self.device.ipv6_address.clone(),
                server_ipv4_gateway: exit.ipv4_gateway.clone(),
                server_ipv6_gateway: exit.ipv6_gateway.clone(),
                server_public_key: exit.public_key.clone(),
                server_ipv4_addr_in: exit.ipv4_addr_in.clone(),
                server_ipv6_addr_in: exit.ipv6_addr_in.clone(),
                server_port: exit.port,
                ipv6_enabled: self.ipv6_enabled,
                allowed_ip_address_ranges: self.allowed_ip_ranges.clone(),
            }));
        }

        messages
    }
}

fn relay_device_ipv4(hop: HopIndex) -> String {
    format!("10.64.255.{}/32", hop)
}

fn relay_device_ipv6(hop: HopIndex) -> String {
    format!("fc00:bbbb:bbbb:bb01::{}:beef/128", hop)
}

fn host_range(address: &str, is_ipv6: bool) -> WireIpRange {
    WireIpRange {
        address: address.to_string(),
        range: if is_ipv6 { 128 } else { 32 },
        is_ipv6,
    }
}
