//! Connection registry: which hops are currently up

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hoplink_core::{HopIndex, InterfaceConfig};

/// One active hop
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub config: InterfaceConfig,
    pub activated_at: DateTime<Utc>,
}

impl ConnectionState {
    pub fn new(config: InterfaceConfig) -> Self {
        Self {
            config,
            activated_at: Utc::now(),
        }
    }
}

/// Map from hop index to active connection; absence means the hop is down
///
/// Iteration is always ascending by hop index.
#[derive(Debug, Default)]
pub struct Registry {
    connections: BTreeMap<HopIndex, ConnectionState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, hop: HopIndex) -> Option<&ConnectionState> {
        self.connections.get(&hop)
    }

    pub fn contains(&self, hop: HopIndex) -> bool {
        self.connections.contains_key(&hop)
    }

    /// Insert or replace the entry for `state.config.hop_index`
    pub fn insert(&mut self, state: ConnectionState) -> Option<ConnectionState> {
        self.connections.insert(state.config.hop_index, state)
    }

    pub fn remove(&mut self, hop: HopIndex) -> Option<ConnectionState> {
        self.connections.remove(&hop)
    }

    /// Active hop indices, ascending
    pub fn hops(&self) -> Vec<HopIndex> {
        self.connections.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hoplink_core::parse_activate;
    use serde_json::json;

    fn config(hop: HopIndex) -> InterfaceConfig {
        let body = json!({
            "type": "activate",
            "hopindex": hop,
            "privateKey": "AA==",
            "deviceIpv4Address": "10.0.0.2/32",
            "deviceIpv6Address": "fd00::2/128",
            "serverIpv4Gateway": "10.0.0.1",
            "serverIpv6Gateway": "fd00::1",
            "serverPublicKey": "BB==",
            "serverIpv4AddrIn": "203.0.113.5",
            "serverIpv6AddrIn": "2001:db8::5",
            "serverPort": 51820,
            "ipv6Enabled": false,
            "allowedIPAddressRanges": []
        });
        parse_activate(&body, |hop| format!("hl{}", hop)).unwrap()
    }

    #[test]
    fn test_hops_iterate_ascending() {
        let mut registry = Registry::new();
        for hop in [2, 0, 1] {
            registry.insert(ConnectionState::new(config(hop)));
        }
        assert_eq!(registry.hops(), vec![0, 1, 2]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_insert_replaces_same_hop() {
        let mut registry = Registry::new();
        assert!(registry.insert(ConnectionState::new(config(1))).is_none());
        assert!(registry.insert(ConnectionState::new(config(1))).is_some());
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(1).is_some());
        assert!(registry.is_empty());
        assert!(!registry.contains(1));
    }
}
