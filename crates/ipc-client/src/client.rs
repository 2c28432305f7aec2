//! IPC Client implementation
//!
//! Owns one daemon connection and drives a [`ClientSession`] with it: a reader task
//! frames inbound bytes into the session, a writer task drains the session's
//! outbound messages. Session events are delivered on an unbounded channel.

use std::path::Path;
use std::sync::Arc;

use hoplink_core::{encode, ClientMessage, Framer};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::ActivationPlan;
use crate::session::{ClientSession, DeactivateReason, LogCallback, SessionState, Transition};
use crate::{IpcError, Result, SessionEvent};

const READ_CHUNK: usize = 4096;

/// Receiving end of a client's session events
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

type Outbound = mpsc::UnboundedSender<ClientMessage>;
type Events = mpsc::UnboundedSender<SessionEvent>;

/// IPC Client for communicating with the hoplink daemon
pub struct IpcClient {
    session: Arc<Mutex<ClientSession>>,
    outbound: Outbound,
    events: Events,
    tasks: Vec<JoinHandle<()>>,
}

impl IpcClient {
    /// Connect to the daemon socket and start a session
    #[cfg(unix)]
    pub async fn connect(path: &Path) -> Result<(Self, SessionEvents)> {
        let stream = tokio::net::UnixStream::connect(path)
            .await
            .map_err(connect_error)?;
        Ok(Self::from_stream(stream))
    }

    /// Connect to the daemon pipe and start a session
    #[cfg(windows)]
    pub async fn connect(path: &Path) -> Result<(Self, SessionEvents)> {
        let pipe = tokio::net::windows::named_pipe::ClientOptions::new()
            .open(path)
            .map_err(connect_error)?;
        Ok(Self::from_stream(pipe))
    }

    /// Start a session over an already connected stream
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream<S>(stream: S) -> (Self, SessionEvents)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let session = Arc::new(Mutex::new(ClientSession::new()));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let writer_task = tokio::spawn(write_loop(
            writer,
            outbound_rx,
            session.clone(),
            outbound_tx.clone(),
            event_tx.clone(),
        ));
        let reader_task = tokio::spawn(read_loop(
            reader,
            session.clone(),
            outbound_tx.clone(),
            event_tx.clone(),
        ));

        let client = Self {
            session,
            outbound: outbound_tx,
            events: event_tx,
            tasks: vec![reader_task, writer_task],
        };
        client.apply(ClientSession::transport_connected);
        (client, event_rx)
    }

    fn apply(&self, step: impl FnOnce(&mut ClientSession) -> Transition) {
        let transition = step(&mut self.session.lock());
        dispatch(transition, &self.outbound, &self.events);
    }

    pub fn state(&self) -> SessionState {
        self.session.lock().state()
    }

    pub fn hop_count(&self) -> usize {
        self.session.lock().hop_count()
    }

    pub fn activate(&self, plan: &ActivationPlan) {
        self.apply(|session| session.activate(plan));
    }

    pub fn deactivate(&self, reason: DeactivateReason) {
        self.apply(|session| session.deactivate(reason));
    }

    /// Deactivate hops this session did not activate itself
    pub fn deactivate_hops(&self, hops: usize) {
        self.apply(|session| {
            session.set_hop_count(hops);
            session.deactivate(DeactivateReason::None)
        });
    }

    pub fn check_status(&self) {
        self.apply(ClientSession::check_status);
    }

    pub fn get_backend_logs(&self, callback: LogCallback) {
        self.apply(|session| session.get_backend_logs(callback));
    }

    /// Fetch the daemon's logs
    ///
    /// Resolves with `""` if the request is superseded, the session is not ready,
    /// or the connection drops first.
    pub async fn backend_logs(&self) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.get_backend_logs(Box::new(move |logs| {
            let _ = tx.send(logs);
        }));
        rx.await.map_err(|_| IpcError::Disconnected)
    }

    pub fn cleanup_backend_logs(&self) {
        self.apply(ClientSession::cleanup_backend_logs);
    }

    pub fn query_version(&self) {
        self.apply(ClientSession::query_version);
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn connect_error(e: std::io::Error) -> IpcError {
    if e.kind() == std::io::ErrorKind::NotFound || e.kind() == std::io::ErrorKind::ConnectionRefused {
        IpcError::DaemonNotRunning
    } else {
        IpcError::ConnectionFailed(e.to_string())
    }
}

/// Must run with the session unlocked: log callbacks may call back into the client
fn dispatch(mut transition: Transition, outbound: &Outbound, events: &Events) {
    for message in transition.outbound.drain(..) {
        if outbound.send(message).is_err() {
            debug!("Writer stopped, dropping outbound message");
        }
    }
    for event in transition.events.drain(..) {
        let _ = events.send(event);
    }
    transition.deliver_logs();
}

async fn read_loop<S>(mut reader: ReadHalf<S>, session: Arc<Mutex<ClientSession>>, outbound: Outbound, events: Events)
where
    S: AsyncRead + AsyncWrite,
{
    let mut framer = Framer::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("Daemon closed the connection");
                break;
            }
            Ok(n) => {
                for envelope in framer.feed(&buf[..n]) {
                    let transition = session.lock().handle(&envelope);
                    dispatch(transition, &outbound, &events);
                }
            }
            Err(e) => {
                warn!("Read error: {}", e);
                break;
            }
        }
    }

    let transition = session.lock().transport_error();
    dispatch(transition, &outbound, &events);
}

async fn write_loop<S>(
    mut writer: WriteHalf<S>,
    mut messages: mpsc::UnboundedReceiver<ClientMessage>,
    session: Arc<Mutex<ClientSession>>,
    outbound: Outbound,
    events: Events,
) where
    S: AsyncRead + AsyncWrite,
{
    while let Some(message) = messages.recv().await {
        if let Err(e) = write_message(&mut writer, &message).await {
            warn!("Write error: {}", e);
            let transition = session.lock().transport_error();
            dispatch(transition, &outbound, &events);
            break;
        }
    }
}

async fn write_message<W>(writer: &mut W, message: &ClientMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode(message).map_err(|e| IpcError::InvalidMessage(e.to_string()))?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn test_session_over_stream() {
        let (client_side, daemon_side) = duplex(4096);
        let (client, mut events) = IpcClient::from_stream(client_side);

        let (read_half, mut write_half) = tokio::io::split(daemon_side);
        let mut lines = BufReader::new(read_half).lines();

        assert_eq!(lines.next_line().await.unwrap().unwrap(), r#"{"type":"status"}"#);
        write_half
            .write_all(b"{\"type\":\"status\",\"conn")
            .await
            .unwrap();
        write_half.write_all(b"ected\":false}\n").await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Initialized {
                ok: true,
                connected: false,
                since: None,
            }
        );
        assert_eq!(client.state(), SessionState::Ready);

        client.deactivate_hops(2);
        assert_eq!(lines.next_line().await.unwrap().unwrap(), r#"{"type":"deactivate","hopindex":0}"#);
        assert_eq!(lines.next_line().await.unwrap().unwrap(), r#"{"type":"deactivate","hopindex":1}"#);

        write_half
            .write_all(b"{\"type\":\"disconnected\",\"hopindex\":0}\n")
            .await
            .unwrap();
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Disconnected);

        drop(write_half);
        drop(lines);
        assert_eq!(events.recv().await.unwrap(), SessionEvent::ControllerError);
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Disconnected);
        assert_eq!(client.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_backend_logs_round_trip() {
        let (client_side, daemon_side) = duplex(4096);
        let (client, mut events) = IpcClient::from_stream(client_side);

        let (read_half, mut write_half) = tokio::io::split(daemon_side);
        let mut lines = BufReader::new(read_half).lines();
        lines.next_line().await.unwrap();
        write_half
            .write_all(b"{\"type\":\"status\",\"connected\":false}\n")
            .await
            .unwrap();
        events.recv().await.unwrap();

        let daemon = tokio::spawn(async move {
            assert_eq!(lines.next_line().await.unwrap().unwrap(), r#"{"type":"logs"}"#);
            write_half
                .write_all(b"{\"type\":\"logs\",\"logs\":\"a|b\"}\n")
                .await
                .unwrap();
            (lines, write_half)
        });

        assert_eq!(client.backend_logs().await.unwrap(), "a\nb");
        daemon.await.unwrap();
    }

    #[tokio::test]
    async fn test_log_callback_can_reenter_client() {
        let (client_side, daemon_side) = duplex(4096);
        let (client, mut events) = IpcClient::from_stream(client_side);
        let client = Arc::new(client);

        let (read_half, mut write_half) = tokio::io::split(daemon_side);
        let mut lines = BufReader::new(read_half).lines();
        lines.next_line().await.unwrap();
        write_half
            .write_all(b"{\"type\":\"status\",\"connected\":false}\n")
            .await
            .unwrap();
        events.recv().await.unwrap();

        let (tx, rx) = oneshot::channel();
        let reentrant = client.clone();
        client.get_backend_logs(Box::new(move |logs| {
            // asks again from inside the callback
            reentrant.get_backend_logs(Box::new(|_| {}));
            let _ = tx.send((logs, reentrant.state()));
        }));

        assert_eq!(lines.next_line().await.unwrap().unwrap(), r#"{"type":"logs"}"#);
        write_half
            .write_all(b"{\"type\":\"logs\",\"logs\":\"x\"}\n")
            .await
            .unwrap();

        let (logs, state) = tokio::time::timeout(std::time::Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(logs, "x");
        assert_eq!(state, SessionState::Ready);
        assert_eq!(lines.next_line().await.unwrap().unwrap(), r#"{"type":"logs"}"#);
    }

    #[tokio::test]
    async fn test_closed_during_initialization() {
        let (client_side, daemon_side) = duplex(4096);
        let (client, mut events) = IpcClient::from_stream(client_side);
        drop(daemon_side);

        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Initialized {
                ok: false,
                connected: false,
                since: None,
            }
        );
        assert_eq!(events.recv().await.unwrap(), SessionEvent::ControllerError);
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Disconnected);
        assert_eq!(client.backend_logs().await.unwrap(), "");
    }
}
