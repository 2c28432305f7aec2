//! hoplink core
//!
//! Types shared by the daemon and its clients.
//!
//! ## Components
//!
//! - **InterfaceConfig**: immutable description of one hop's tunnel, parsed from an
//!   `activate` message
//! - **Wire messages**: `ClientMessage` (client → daemon) and `DaemonMessage`
//!   (daemon → client)
//! - **Framer**: newline-delimited JSON framing over an arbitrary byte stream
//!
//! ## Wire format
//!
//! One compact JSON object per line, UTF-8, `\n` terminated. Every object carries a
//! string `type` field. There is no correlation id: ordering on a single connection
//! is the only synchronization primitive.

mod config;
mod framing;
mod message;

pub use config::{
    parse_activate, AddressFamily, ConfigError, HopIndex, InterfaceConfig, IpAddressRange,
};
pub use framing::{encode, Envelope, Framer, MESSAGE_DELIMITER};
pub use message::{
    hop_index_hint, ActivateRequest, ClientMessage, DaemonMessage, StatusReport, WireIpRange,
    PROTOCOL_VERSION,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Message has no string `type` field")]
    MissingType,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
