//! Newline-delimited JSON framing
//!
//! Both ends of the IPC channel feed raw socket reads into a [`Framer`] and get back
//! complete messages in arrival order. Partial lines stay buffered until their
//! delimiter arrives.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{CoreError, Result};

pub const MESSAGE_DELIMITER: u8 = b'\n';

/// How much of a raw line is echoed into the log
const LOG_PREFIX_BYTES: usize = 20;

/// A decoded message: its `type` plus the full JSON object
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    kind: String,
    body: serde_json::Value,
}

impl Envelope {
    /// Parse one line into an envelope
    pub fn parse(line: &[u8]) -> Result<Self> {
        let body: serde_json::Value =
            serde_json::from_slice(line).map_err(|e| CoreError::Malformed(e.to_string()))?;

        if !body.is_object() {
            return Err(CoreError::Malformed("object expected".to_string()));
        }

        let kind = body
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or(CoreError::MissingType)?
            .to_string();

        Ok(Self { kind, body })
    }

    /// The `type` field
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The whole JSON object, `type` included
    pub fn body(&self) -> &serde_json::Value {
        &self.body
    }

    /// Decode the body into a typed message
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.body)?)
    }
}

/// Accumulates stream chunks and splits them into messages
#[derive(Debug, Default)]
pub struct Framer {
    buffer: Vec<u8>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every complete message, in order.
    ///
    /// Blank lines are skipped. Lines that are not a JSON object with a string
    /// `type` are logged and dropped.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Envelope> {
        let mut envelopes = Vec::new();
        self.feed_with(chunk, |envelope| envelopes.push(envelope));
        envelopes
    }

    /// Like [`Framer::feed`], handing each message to `handler` as it is split off
    pub fn feed_with<F: FnMut(Envelope)>(&mut self, chunk: &[u8], mut handler: F) {
        self.buffer.extend_from_slice(chunk);

        while let Some(pos) = self.buffer.iter().position(|b| *b == MESSAGE_DELIMITER) {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = trim_ascii(&line[..line.len() - 1]);
            if line.is_empty() {
                continue;
            }

            debug!("Message received: {}", log_prefix(line));

            match Envelope::parse(line) {
                Ok(envelope) => handler(envelope),
                Err(e) => warn!("Dropping message: {}", e),
            }
        }
    }

    /// Bytes buffered while waiting for a delimiter
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Serialize a message as one compact JSON line
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(MESSAGE_DELIMITER);
    Ok(bytes)
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}

fn log_prefix(line: &[u8]) -> String {
    let end = line.len().min(LOG_PREFIX_BYTES);
    String::from_utf8_lossy(&line[..end]).into_owned()
}
