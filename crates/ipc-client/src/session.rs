//! Client session state machine
//!
//! Sans-io: every input returns a [`Transition`] listing the messages to write and
//! the events to surface. The async [`crate::IpcClient`] is one driver; tests drive
//! it directly.

use chrono::{DateTime, Utc};
use hoplink_core::{ClientMessage, Envelope, HopIndex};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::protocol::ActivationPlan;

/// Receives the daemon's log text, `""` when the request is dropped
pub type LogCallback = Box<dyn FnOnce(String) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport not connected yet
    Unknown,
    /// Connected, waiting for the first `status` reply
    Initializing,
    Ready,
    /// Terminal; start a new session to reconnect
    Disconnected,
}

/// Why the caller is deactivating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeactivateReason {
    #[default]
    None,
    /// Fast server switch: the next activate reprograms the hops in place
    Switching,
}

/// What the session surfaces to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Initialized {
        ok: bool,
        connected: bool,
        since: Option<DateTime<Utc>>,
    },
    Connected,
    Disconnected,
    StatusUpdated {
        server_ipv4_gateway: String,
        device_ipv4_address: String,
        tx_bytes: u64,
        rx_bytes: u64,
    },
    ControllerError,
    Version(u32),
}

/// A log request's answer, handed back to the caller instead of run under the session
pub struct LogReply {
    callback: LogCallback,
    logs: String,
}

impl LogReply {
    pub fn logs(&self) -> &str {
        &self.logs
    }

    pub fn deliver(self) {
        (self.callback)(self.logs)
    }
}

impl std::fmt::Debug for LogReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogReply").field("logs", &self.logs).finish()
    }
}

/// Output of one session step
#[derive(Debug, Default)]
pub struct Transition {
    pub outbound: Vec<ClientMessage>,
    pub events: Vec<SessionEvent>,
    /// Run by the driver once it no longer holds the session
    pub log_replies: Vec<LogReply>,
}

impl Transition {
    fn send(message: ClientMessage) -> Self {
        Self {
            outbound: vec![message],
            ..Self::default()
        }
    }

    fn surface(event: SessionEvent) -> Self {
        Self {
            events: vec![event],
            ..Self::default()
        }
    }

    fn reply(mut self, reply: Option<LogReply>) -> Self {
        self.log_replies.extend(reply);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.events.is_empty() && self.log_replies.is_empty()
    }

    /// Hand every log reply to its callback
    pub fn deliver_logs(&mut self) {
        for reply in self.log_replies.drain(..) {
            reply.deliver();
        }
    }
}

pub struct ClientSession {
    state: SessionState,
    hop_count: usize,
    log_callback: Option<LogCallback>,
}

impl ClientSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::Unknown,
            hop_count: 0,
            log_callback: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of hops sent by the last `activate`
    pub fn hop_count(&self) -> usize {
        self.hop_count
    }

    /// Adopt hops activated by an earlier session so `deactivate` covers them
    pub fn set_hop_count(&mut self, hops: usize) {
        self.hop_count = hops;
    }

    pub fn has_pending_logs(&self) -> bool {
        self.log_callback.is_some()
    }

    pub fn transport_connected(&mut self) -> Transition {
        if self.state != SessionState::Unknown {
            warn!("Transport connected in state {:?}", self.state);
            return Transition::default();
        }
        debug!("Daemon connected, requesting status");
        self.state = SessionState::Initializing;
        Transition::send(ClientMessage::Status)
    }

    /// The connection failed or closed; the session is over
    pub fn transport_error(&mut self) -> Transition {
        let previous = std::mem::replace(&mut self.state, SessionState::Disconnected);
        if previous == SessionState::Disconnected {
            return Transition::default();
        }

        let mut events = Vec::new();
        if previous == SessionState::Initializing {
            error!("Daemon connection failed during initialization");
            events.push(SessionEvent::Initialized {
                ok: false,
                connected: false,
                since: None,
            });
        } else {
            warn!("Daemon connection lost in state {:?}", previous);
        }
        events.push(SessionEvent::ControllerError);
        events.push(SessionEvent::Disconnected);

        Transition {
            events,
            ..Transition::default()
        }
        .reply(self.drop_pending_logs())
    }

    /// Bring every hop of `plan` up, entry hop first
    pub fn activate(&mut self, plan: &ActivationPlan) -> Transition {
        if self.state != SessionState::Ready {
            warn!("Activate requested in state {:?}", self.state);
            return Transition::surface(SessionEvent::Disconnected);
        }
        if plan.servers.is_empty() {
            warn!("Activate requested with no servers");
            return Transition::surface(SessionEvent::Disconnected);
        }

        info!("Activating {} hop(s)", plan.hop_count());
        self.hop_count = plan.hop_count();
        Transition {
            outbound: plan.messages(),
            ..Transition::default()
        }
    }

    pub fn deactivate(&mut self, reason: DeactivateReason) -> Transition {
        if self.state != SessionState::Ready {
            warn!("Deactivate requested in state {:?}", self.state);
            return Transition::surface(SessionEvent::Disconnected);
        }
        if reason == DeactivateReason::Switching {
            debug!("Switching servers, skipping deactivate");
            return Transition::surface(SessionEvent::Disconnected);
        }

        let outbound = (0..self.hop_count)
            .map(|hop| ClientMessage::Deactivate {
                hop_index: Some(hop as HopIndex),
            })
            .collect();
        self.hop_count = 0;
        Transition {
            outbound,
            ..Transition::default()
        }
    }

    pub fn check_status(&mut self) -> Transition {
        match self.state {
            SessionState::Ready | SessionState::Initializing => Transition::send(ClientMessage::Status),
            _ => Transition::default(),
        }
    }

    /// Ask for the daemon's logs; an earlier unanswered request is answered with `""`
    pub fn get_backend_logs(&mut self, callback: LogCallback) -> Transition {
        let superseded = self.drop_pending_logs();

        if self.state != SessionState::Ready {
            return Transition::default().reply(superseded).reply(Some(LogReply {
                callback,
                logs: String::new(),
            }));
        }

        self.log_callback = Some(callback);
        Transition::send(ClientMessage::Logs).reply(superseded)
    }

    pub fn cleanup_backend_logs(&mut self) -> Transition {
        let superseded = self.drop_pending_logs();

        if self.state != SessionState::Ready {
            return Transition::default().reply(superseded);
        }
        Transition::send(ClientMessage::CleanLogs).reply(superseded)
    }

    /// Out-of-band version query
    pub fn query_version(&mut self) -> Transition {
        match self.state {
            SessionState::Ready | SessionState::Initializing => Transition::send(ClientMessage::Version),
            _ => Transition::default(),
        }
    }

    /// Feed one message from the daemon
    pub fn handle(&mut self, envelope: &Envelope) -> Transition {
        let body = envelope.body();

        if envelope.kind() == "version" {
            return match body.get("version").and_then(Value::as_u64) {
                Some(version) => Transition::surface(SessionEvent::Version(version as u32)),
                None => {
                    warn!("Version reply without a version");
                    Transition::default()
                }
            };
        }

        match self.state {
            SessionState::Initializing if envelope.kind() == "status" => self.handle_initial_status(body),
            SessionState::Ready => self.handle_ready(envelope.kind(), body),
            state => {
                warn!("Unexpected command {} in state {:?}", envelope.kind(), state);
                Transition::default()
            }
        }
    }

    fn handle_initial_status(&mut self, body: &Value) -> Transition {
        self.state = SessionState::Ready;

        let connected = match body.get("connected") {
            Some(Value::Bool(connected)) => *connected,
            _ => {
                warn!("Status reply without a connected flag");
                false
            }
        };
        let since = if connected {
            let since = body.get("date").and_then(Value::as_str).and_then(parse_date);
            if since.is_none() {
                warn!("Status reply without a valid date");
            }
            since
        } else {
            None
        };

        info!("Daemon ready, connected: {}", connected);
        Transition::surface(SessionEvent::Initialized {
            ok: true,
            connected,
            since,
        })
    }

    fn handle_ready(&mut self, kind: &str, body: &Value) -> Transition {
        match kind {
            "status" => {
                let gateway = body.get("serverIpv4Gateway").and_then(Value::as_str);
                let device = body.get("deviceIpv4Address").and_then(Value::as_str);
                let tx = body.get("txBytes").and_then(Value::as_u64);
                let rx = body.get("rxBytes").and_then(Value::as_u64);

                match (gateway, device, tx, rx) {
                    (Some(gateway), Some(device), Some(tx_bytes), Some(rx_bytes)) => {
                        Transition::surface(SessionEvent::StatusUpdated {
                            server_ipv4_gateway: gateway.to_string(),
                            device_ipv4_address: device.to_string(),
                            tx_bytes,
                            rx_bytes,
                        })
                    }
                    _ => {
                        debug!("Status reply without a snapshot");
                        Transition::default()
                    }
                }
            }

            "connected" | "disconnected" => {
                let Some(hop) = body.get("hopindex").and_then(Value::as_u64) else {
                    warn!("{} event without a hop index", kind);
                    return Transition::default();
                };
                if hop != 0 {
                    debug!("Hop {} {}", hop, kind);
                    return Transition::default();
                }
                if kind == "connected" {
                    Transition::surface(SessionEvent::Connected)
                } else {
                    Transition::surface(SessionEvent::Disconnected)
                }
            }

            "backendFailure" => {
                error!("Daemon reported a backend failure");
                Transition::surface(SessionEvent::ControllerError)
            }

            "logs" => {
                let reply = self.log_callback.take().map(|callback| LogReply {
                    callback,
                    logs: body
                        .get("logs")
                        .and_then(Value::as_str)
                        .map(|logs| logs.replace('|', "\n"))
                        .unwrap_or_default(),
                });
                Transition::default().reply(reply)
            }

            other => {
                warn!("Unexpected command {}", other);
                Transition::default()
            }
        }
    }

    /// An unanswered log request, answered with `""`
    fn drop_pending_logs(&mut self) -> Option<LogReply> {
        self.log_callback.take().map(|callback| LogReply {
            callback,
            logs: String::new(),
        })
    }
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("state", &self.state)
            .field("hop_count", &self.hop_count)
            .field("pending_logs", &self.log_callback.is_some())
            .finish()
    }
}

fn parse_date(date: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(date)
        .ok()
        .map(|date| date.with_timezone(&Utc))
}
