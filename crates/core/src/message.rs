//! Wire message schemas
//!
//! Client → daemon: `activate`, `deactivate`, `status`, `logs`, `cleanlogs`, `version`.
//! Daemon → client: `connected`, `disconnected`, `backendFailure`, `status`, `logs`,
//! `version`.

use serde::{Deserialize, Serialize};

use crate::config::HopIndex;

/// Version reported by the out-of-band `version` query
pub const PROTOCOL_VERSION: u32 = 1;

/// One allowed-IP entry as it appears on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireIpRange {
    pub address: String,
    pub range: u32,
    pub is_ipv6: bool,
}

/// Body of an `activate` message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateRequest {
    #[serde(rename = "hopindex", default, skip_serializing_if = "Option::is_none")]
    pub hop_index: Option<HopIndex>,
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
    #[serde(rename = "allowedIPAddressRanges")]
    pub allowed_ip_address_ranges: Vec<WireIpRange>,
}

impl ActivateRequest {
    pub(crate) fn deserialize_from(body: &serde_json::Value) -> serde_json::Result<Self> {
        Self::deserialize(body)
    }
}

/// Messages written by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "activate")]
    Activate(ActivateRequest),

    #[serde(rename = "deactivate")]
    Deactivate {
        #[serde(rename = "hopindex", default, skip_serializing_if = "Option::is_none")]
        hop_index: Option<HopIndex>,
    },

    #[serde(rename = "status")]
    Status,

    #[serde(rename = "logs")]
    Logs,

    #[serde(rename = "cleanlogs")]
    CleanLogs,

    #[serde(rename = "version")]
    Version,
}

/// Connectivity snapshot carried by a `status` reply
///
/// When hop 0 is down only `connected: false` is present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ipv4_gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_ipv4_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rx_bytes: Option<u64>,
}

impl StatusReport {
    pub fn disconnected() -> Self {
        Self::default()
    }
}

/// Messages written by the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DaemonMessage {
    Connected {
        #[serde(rename = "hopindex")]
        hop_index: HopIndex,
    },
    Disconnected {
        #[serde(rename = "hopindex")]
        hop_index: HopIndex,
    },
    BackendFailure,
    Status(StatusReport),
    Logs {
        logs: String,
    },
    Version {
        version: u32,
    },
}

impl DaemonMessage {
    /// Build a `logs` reply, flattening line breaks to `|`
    pub fn logs(raw: &str) -> Self {
        DaemonMessage::Logs {
            logs: raw.replace('\n', "|"),
        }
    }
}

/// Best-effort hop index of a message body, 0 when absent or not a valid index
pub fn hop_index_hint(body: &serde_json::Value) -> HopIndex {
    body.get("hopindex")
        .and_then(serde_json::Value::as_u64)
        .and_then(|value| HopIndex::try_from(value).ok())
        .unwrap_or(0)
}
