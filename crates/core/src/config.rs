//! Per-hop interface configuration

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

use crate::message::{ActivateRequest, WireIpRange};

/// Position of a hop in the chain: 0 is the exit hop, higher values are relays
pub type HopIndex = u32;

/// Address family tag of an allowed-IP range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// Largest prefix length for this family
    pub fn max_prefix(&self) -> u8 {
        match self {
            AddressFamily::Ipv4 => 32,
            AddressFamily::Ipv6 => 128,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, AddressFamily::Ipv6)
    }
}

/// A CIDR block routed through a hop's interface
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IpAddressRange {
    pub address: String,
    pub range: u8,
    pub family: AddressFamily,
}

impl IpAddressRange {
    pub fn new(address: impl Into<String>, range: u8, family: AddressFamily) -> Self {
        Self {
            address: address.into(),
            range,
            family,
        }
    }

    pub fn ipv4(address: impl Into<String>, range: u8) -> Self {
        Self::new(address, range, AddressFamily::Ipv4)
    }

    pub fn ipv6(address: impl Into<String>, range: u8) -> Self {
        Self::new(address, range, AddressFamily::Ipv6)
    }

    fn from_wire(wire: WireIpRange) -> Result<Self, ConfigError> {
        let family = if wire.is_ipv6 {
            AddressFamily::Ipv6
        } else {
            AddressFamily::Ipv4
        };

        let parsed_ok = match family {
            AddressFamily::Ipv4 => wire.address.parse::<Ipv4Addr>().is_ok(),
            AddressFamily::Ipv6 => wire.address.parse::<Ipv6Addr>().is_ok(),
        };
        if !parsed_ok {
            return Err(ConfigError::InvalidAddress {
                address: wire.address,
                family,
            });
        }

        let range = u8::try_from(wire.range)
            .ok()
            .filter(|range| *range <= family.max_prefix())
            .ok_or_else(|| ConfigError::InvalidPrefix {
                address: wire.address.clone(),
                range: wire.range,
            })?;

        Ok(Self {
            address: wire.address,
            range,
            family,
        })
    }

    fn to_wire(&self) -> WireIpRange {
        WireIpRange {
            address: self.address.clone(),
            range: u32::from(self.range),
            is_ipv6: self.family.is_ipv6(),
        }
    }

    /// Parsed network address, if the stored text is a valid IP
    pub fn ip(&self) -> Option<IpAddr> {
        self.address.parse().ok()
    }
}

impl fmt::Display for IpAddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.range)
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid activate message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Field `{field}` is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Address `{address}` is not a valid {family:?} address")]
    InvalidAddress {
        address: String,
        family: AddressFamily,
    },

    #[error("Prefix length {range} is out of bounds for `{address}`")]
    InvalidPrefix { address: String, range: u32 },
}

/// Immutable description of one hop's tunnel
///
/// Built only by parsing an `activate` message; IPv6 allowed-IP ranges are dropped
/// at construction time when `ipv6_enabled` is false.
#[derive(Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub hop_index: HopIndex,
    pub private_key: String,
    pub device_ipv4_address: String,
    pub device_ipv6_address: String,
    pub server_ipv4_gateway: String,
    pub server_ipv6_gateway: String,
    pub server_public_key: String,
    pub server_ipv4_addr_in: String,
    pub server_ipv6_addr_in: String,
    pub server_port: u16,
    pub ipv6_enabled: bool,
    pub allowed_ip_ranges: Vec<IpAddressRange>,
    pub ifname: String,
}

impl InterfaceConfig {
    /// Build a config from a decoded `activate` request
    ///
    /// `name_for` maps the hop index to the platform interface name.
    pub fn from_request(
        request: ActivateRequest,
        name_for: impl FnOnce(HopIndex) -> String,
    ) -> Result<Self, ConfigError> {
        let text_fields = [
            ("privateKey", &request.private_key),
            ("deviceIpv4Address", &request.device_ipv4_address),
            ("deviceIpv6Address", &request.device_ipv6_address),
            ("serverIpv4Gateway", &request.server_ipv4_gateway),
            ("serverIpv6Gateway", &request.server_ipv6_gateway),
            ("serverPublicKey", &request.server_public_key),
            ("serverIpv4AddrIn", &request.server_ipv4_addr_in),
            ("serverIpv6AddrIn", &request.server_ipv6_addr_in),
        ];
        for (field, value) in text_fields {
            if value.contains(['\n', '\r']) {
                return Err(ConfigError::InvalidField {
                    field,
                    reason: "contains a line break".to_string(),
                });
            }
        }

        let ipv6_enabled = request.ipv6_enabled;
        let mut allowed_ip_ranges = Vec::with_capacity(request.allowed_ip_address_ranges.len());
        for wire in request.allowed_ip_address_ranges {
            if wire.is_ipv6 && !ipv6_enabled {
                continue;
            }
            allowed_ip_ranges.push(IpAddressRange::from_wire(wire)?);
        }

        let hop_index = request.hop_index.unwrap_or(0);

        Ok(Self {
            hop_index,
            private_key: request.private_key,
            device_ipv4_address: request.device_ipv4_address,
            device_ipv6_address: request.device_ipv6_address,
            server_ipv4_gateway: request.server_ipv4_gateway,
            server_ipv6_gateway: request.server_ipv6_gateway,
            server_public_key: request.server_public_key,
            server_ipv4_addr_in: request.server_ipv4_addr_in,
            server_ipv6_addr_in: request.server_ipv6_addr_in,
            server_port: request.server_port,
            ipv6_enabled,
            allowed_ip_ranges,
            ifname: name_for(hop_index),
        })
    }

    /// Serialize back to the `activate` request this config was parsed from
    pub fn to_request(&self) -> ActivateRequest {
        ActivateRequest {
            hop_index: Some(self.hop_index),
            private_key: self.private_key.clone(),
            device_ipv4_address: self.device_ipv4_address.clone(),
            device_ipv6_address: self.device_ipv6_address.clone(),
            server_ipv4_gateway: self.server_ipv4_gateway.clone(),
            server_ipv6_gateway: self.server_ipv6_gateway.clone(),
            server_public_key: self.server_public_key.clone(),
            server_ipv4_addr_in: self.server_ipv4_addr_in.clone(),
            server_ipv6_addr_in: self.server_ipv6_addr_in.clone(),
            server_port: self.server_port,
            ipv6_enabled: self.ipv6_enabled,
            allowed_ip_address_ranges: self.allowed_ip_ranges.iter().map(IpAddressRange::to_wire).collect(),
        }
    }

    /// DNS resolvers for this hop: the peer gateway(s), IPv6 only when enabled
    pub fn resolvers(&self) -> Vec<String> {
        let mut resolvers = vec![self.server_ipv4_gateway.clone()];
        if self.ipv6_enabled {
            resolvers.push(self.server_ipv6_gateway.clone());
        }
        resolvers
    }

    /// Whether `self` can replace `current` by reprogramming the peer only.
    ///
    /// Keys and local/gateway addresses must match; peer endpoint and allowed IPs may
    /// differ.
    pub fn can_switch_from(&self, current: &InterfaceConfig) -> bool {
        self.hop_index == current.hop_index
            && self.private_key == current.private_key
            && self.device_ipv4_address == current.device_ipv4_address
            && self.device_ipv6_address == current.device_ipv6_address
            && self.server_ipv4_gateway == current.server_ipv4_gateway
            && self.server_ipv6_gateway == current.server_ipv6_gateway
    }
}

impl fmt::Debug for InterfaceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceConfig")
            .field("hop_index", &self.hop_index)
            .field("ifname", &self.ifname)
            .field("private_key", &"<redacted>")
            .field("device_ipv4_address", &self.device_ipv4_address)
            .field("device_ipv6_address", &self.device_ipv6_address)
            .field("server_ipv4_gateway", &self.server_ipv4_gateway)
            .field("server_ipv6_gateway", &self.server_ipv6_gateway)
            .field("server_public_key", &self.server_public_key)
            .field("server_ipv4_addr_in", &self.server_ipv4_addr_in)
            .field("server_ipv6_addr_in", &self.server_ipv6_addr_in)
            .field("server_port", &self.server_port)
            .field("ipv6_enabled", &self.ipv6_enabled)
            .field("allowed_ip_ranges", &self.allowed_ip_ranges)
            .finish()
    }
}

/// Parse the body of an `activate` message into an [`InterfaceConfig`]
pub fn parse_activate(
    body: &serde_json::Value,
    name_for: impl FnOnce(HopIndex) -> String,
) -> Result<InterfaceConfig, ConfigError> {
    let request = ActivateRequest::deserialize_from(body)?;
    InterfaceConfig::from_request(request, name_for)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn name(hop: HopIndex) -> String {
        if hop == 0 {
            "hoplink".to_string()
        } else {
            format!("hoplinkhop{}", hop)
        }
    }

    fn activate_body() -> serde_json::Value {
        json!({
            "type": "activate",
            "hopindex": 0,
            "privateKey": "AA==",
            "deviceIpv4Address": "10.0.0.2/32",
            "deviceIpv6Address": "fd00::2/128",
            "serverIpv4Gateway": "10.0.0.1",
            "serverIpv6Gateway": "fd00::1",
            "serverPublicKey": "BB==",
            "serverIpv4AddrIn": "203.0.113.5",
            "serverIpv6AddrIn": "2001:db8::5",
            "serverPort": 51820,
            "ipv6Enabled": true,
            "allowedIPAddressRanges": [
                {"address": "0.0.0.0", "range": 0, "isIpv6": false},
                {"address": "::", "range": 0, "isIpv6": true}
            ]
        })
    }

    #[test]
    fn test_parse_full_activate() {
        let config = parse_activate(&activate_body(), name).unwrap();
        assert_eq!(config.hop_index, 0);
        assert_eq!(config.ifname, "hoplink");
        assert_eq!(config.server_port, 51820);
        assert_eq!(config.allowed_ip_ranges.len(), 2);
        assert_eq!(config.allowed_ip_ranges[0], IpAddressRange::ipv4("0.0.0.0", 0));
        assert_eq!(config.allowed_ip_ranges[1].family, AddressFamily::Ipv6);
    }

    #[test]
    fn test_hopindex_defaults_to_zero() {
        let mut body = activate_body();
        body.as_object_mut().unwrap().remove("hopindex");
        let config = parse_activate(&body, name).unwrap();
        assert_eq!(config.hop_index, 0);
    }

    #[test]
    fn test_relay_hop_gets_relay_name() {
        let mut body = activate_body();
        body["hopindex"] = json!(2);
        let config = parse_activate(&body, name).unwrap();
        assert_eq!(config.ifname, "hoplinkhop2");
    }

    #[test]
    fn test_ipv6_ranges_dropped_when_disabled() {
        let mut body = activate_body();
        body["ipv6Enabled"] = json!(false);
        let config = parse_activate(&body, name).unwrap();
        assert_eq!(config.allowed_ip_ranges, vec![IpAddressRange::ipv4("0.0.0.0", 0)]);
        assert_eq!(config.resolvers(), vec!["10.0.0.1".to_string()]);
    }

    #[test]
    fn test_missing_field_rejected() {
        let mut body = activate_body();
        body.as_object_mut().unwrap().remove("serverPublicKey");
        let err = parse_activate(&body, name).unwrap_err();
        assert!(matches!(err, ConfigError::Decode(_)));
    }

    #[test]
    fn test_mistyped_fields_rejected() {
        for (field, value) in [
            ("serverPort", json!("51820")),
            ("ipv6Enabled", json!("true")),
            ("privateKey", json!(12)),
            ("hopindex", json!("1")),
            ("hopindex", json!(-1)),
            ("allowedIPAddressRanges", json!({})),
        ] {
            let mut body = activate_body();
            body[field] = value;
            assert!(parse_activate(&body, name).is_err(), "{} should be rejected", field);
        }
    }

    #[test]
    fn test_bad_range_entries_rejected() {
        let mut body = activate_body();
        body["allowedIPAddressRanges"] = json!([{"address": "10.0.0.0", "range": 33, "isIpv6": false}]);
        assert!(matches!(
            parse_activate(&body, name).unwrap_err(),
            ConfigError::InvalidPrefix { .. }
        ));

        body["allowedIPAddressRanges"] = json!([{"address": "fd00::", "range": 64, "isIpv6": false}]);
        assert!(matches!(
            parse_activate(&body, name).unwrap_err(),
            ConfigError::InvalidAddress { .. }
        ));

        body["allowedIPAddressRanges"] = json!([{"address": "10.0.0.0", "range": 8}]);
        assert!(parse_activate(&body, name).is_err());
    }

    #[test]
    fn test_line_break_in_field_rejected() {
        let mut body = activate_body();
        body["serverIpv4Gateway"] = json!("10.0.0.1\nPostUp = rm -rf /");
        assert!(matches!(
            parse_activate(&body, name).unwrap_err(),
            ConfigError::InvalidField { field: "serverIpv4Gateway", .. }
        ));
    }

    #[test]
    fn test_request_round_trip() {
        let config = parse_activate(&activate_body(), name).unwrap();
        let value = serde_json::to_value(config.to_request()).unwrap();
        let reparsed = parse_activate(&value, name).unwrap();
        assert_eq!(config, reparsed);
    }

    #[test]
    fn test_switch_eligibility() {
        let current = parse_activate(&activate_body(), name).unwrap();

        let mut body = activate_body();
        body["serverPublicKey"] = json!("CC==");
        body["serverIpv4AddrIn"] = json!("198.51.100.7");
        body["allowedIPAddressRanges"] = json!([{"address": "10.8.0.0", "range": 16, "isIpv6": false}]);
        let moved = parse_activate(&body, name).unwrap();
        assert!(moved.can_switch_from(&current));

        let mut body = activate_body();
        body["privateKey"] = json!("ZZ==");
        let rekeyed = parse_activate(&body, name).unwrap();
        assert!(!rekeyed.can_switch_from(&current));

        let mut body = activate_body();
        body["deviceIpv4Address"] = json!("10.0.0.3/32");
        let readdressed = parse_activate(&body, name).unwrap();
        assert!(!readdressed.can_switch_from(&current));
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let config = parse_activate(&activate_body(), name).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("AA=="));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_range_display() {
        assert_eq!(IpAddressRange::ipv4("10.0.0.0", 8).to_string(), "10.0.0.0/8");
        assert_eq!(IpAddressRange::ipv6("fd00::", 64).to_string(), "fd00::/64");
    }
}
