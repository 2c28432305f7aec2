//! End-to-end scenarios over a real UNIX socket:
//!   1. Raw activate → connected event → status reports connected
//!   2. Deactivate of an inactive hop → no mutation, no event
//!   3. Status with nothing active → exactly `{"type":"status","connected":false}`
//!   4. Session client drives a two-hop chain up and down

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use hoplink_daemon::platform::MemoryBackend;
use hoplink_daemon::{DaemonConfig, DaemonService, IpcConfig, IpcServer};
use hoplink_ipc_client::{
    ActivationPlan, DeactivateReason, Device, IpcClient, Server, SessionEvent, SessionEvents,
};
use hoplink_logging::LogBuffer;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

const ACTIVATE_HOP0: &str = r#"{"type":"activate","hopindex":0,"privateKey":"AA==","deviceIpv4Address":"10.0.0.2/32","deviceIpv6Address":"fd00::2/128","serverIpv4Gateway":"10.0.0.1","serverIpv6Gateway":"fd00::1","serverPublicKey":"BB==","serverIpv4AddrIn":"203.0.113.5","serverIpv6AddrIn":"2001:db8::5","serverPort":51820,"ipv6Enabled":true,"allowedIPAddressRanges":[{"address":"0.0.0.0","range":0,"isIpv6":false}]}"#;

struct Harness {
    socket: PathBuf,
    memory: MemoryBackend,
    service: DaemonService,
    shutdown: mpsc::Sender<()>,
    server: JoinHandle<hoplink_daemon::Result<()>>,
}

impl Harness {
    async fn start(name: &str) -> Self {
        let socket = std::env::temp_dir().join(format!("hoplink-{}-{}.socket", name, std::process::id()));
        let memory = MemoryBackend::new();
        let config = DaemonConfig {
            socket_path: socket.clone(),
            interface_prefix: "hltest".to_string(),
            ..DaemonConfig::default()
        };
        let service = DaemonService::start(&config, memory.backends(), LogBuffer::default()).unwrap();

        let mut server = IpcServer::new(IpcConfig {
            socket_path: socket.clone(),
        });
        server.set_event_sender(service.event_sender());
        let shutdown = server.shutdown_handle();
        let handler = service.clone();
        let server = tokio::spawn(async move { server.start(handler).await });

        wait_for_socket(&socket).await;
        Self {
            socket,
            memory,
            service,
            shutdown,
            server,
        }
    }

    async fn raw(&self) -> (Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf) {
        let stream = UnixStream::connect(&self.socket).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        (BufReader::new(read_half).lines(), write_half)
    }

    async fn stop(self) {
        self.shutdown.send(()).await.unwrap();
        self.server.await.unwrap().unwrap();
        self.service.shutdown().await;
        assert!(!self.socket.exists());
    }
}

async fn wait_for_socket(path: &Path) {
    for _ in 0..100 {
        if UnixStream::connect(path).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} never became reachable", path.display());
}

async fn send(writer: &mut OwnedWriteHalf, line: &str) {
    writer.write_all(line.as_bytes()).await.unwrap();
    writer.write_all(b"\n").await.unwrap();
}

async fn next_line(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> String {
    timeout(WAIT, lines.next_line()).await.unwrap().unwrap().unwrap()
}

async fn next_event(events: &mut SessionEvents) -> SessionEvent {
    timeout(WAIT, events.recv()).await.unwrap().unwrap()
}

// ── Scenario 1: activate then status ────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_activate_then_status() {
    let harness = Harness::start("activate").await;
    let (mut lines, mut writer) = harness.raw().await;

    send(&mut writer, ACTIVATE_HOP0).await;
    assert_eq!(next_line(&mut lines).await, r#"{"type":"connected","hopindex":0}"#);
    assert!(harness.memory.interface_exists_now("hltest"));

    send(&mut writer, r#"{"type":"status"}"#).await;
    let status: Value = serde_json::from_str(&next_line(&mut lines).await).unwrap();
    assert_eq!(status["type"], "status");
    assert_eq!(status["connected"], true);
    assert_eq!(status["serverIpv4Gateway"], "10.0.0.1");
    assert_eq!(status["deviceIpv4Address"], "10.0.0.2/32");
    assert_eq!(status["txBytes"], 0);
    assert_eq!(status["rxBytes"], 0);
    assert!(status["date"].is_string());

    harness.stop().await;
}

// ── Scenario 2: deactivate an inactive hop ──────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_deactivate_inactive_hop() {
    let harness = Harness::start("deactivate").await;
    let (mut lines, mut writer) = harness.raw().await;

    send(&mut writer, r#"{"type":"deactivate","hopindex":1}"#).await;
    send(&mut writer, r#"{"type":"status"}"#).await;

    // the status reply is the first thing written back
    assert_eq!(next_line(&mut lines).await, r#"{"type":"status","connected":false}"#);
    assert!(harness.memory.calls().is_empty());

    harness.stop().await;
}

// ── Scenario 3: status while idle ───────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_status_while_idle() {
    let harness = Harness::start("idle").await;
    let (mut lines, mut writer) = harness.raw().await;

    // split mid-message across two writes
    writer.write_all(b"{\"type\":\"sta").await.unwrap();
    writer.flush().await.unwrap();
    writer.write_all(b"tus\"}\n").await.unwrap();

    assert_eq!(next_line(&mut lines).await, r#"{"type":"status","connected":false}"#);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_activate_reports_disconnect() {
    let harness = Harness::start("invalid").await;
    let (mut lines, mut writer) = harness.raw().await;

    send(&mut writer, r#"{"type":"activate","hopindex":2,"privateKey":"AA=="}"#).await;
    assert_eq!(next_line(&mut lines).await, r#"{"type":"disconnected","hopindex":2}"#);
    assert!(harness.memory.calls().is_empty());

    send(&mut writer, "this is not json").await;
    send(&mut writer, r#"{"type":"version"}"#).await;
    assert_eq!(next_line(&mut lines).await, r#"{"type":"version","version":1}"#);

    harness.stop().await;
}

// ── Scenario 4: session client, two hops ────────────────────────────────────

fn plan() -> ActivationPlan {
    let server = |n: u8| Server {
        public_key: format!("key{}", n),
        ipv4_gateway: format!("10.{}.0.1", n),
        ipv6_gateway: format!("fd0{}::1", n),
        ipv4_addr_in: format!("203.0.113.{}", n + 1),
        ipv6_addr_in: format!("2001:db8::{}", n + 1),
        port: 51820,
    };
    ActivationPlan {
        private_key: "AA==".to_string(),
        device: Device {
            ipv4_address: "10.0.0.2/32".to_string(),
            ipv6_address: "fd00::2/128".to_string(),
        },
        servers: vec![server(0), server(1)],
        allowed_ip_ranges: vec![hoplink_core::WireIpRange {
            address: "0.0.0.0".to_string(),
            range: 0,
            is_ipv6: false,
        }],
        ipv6_enabled: false,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_session_client_two_hops() {
    let harness = Harness::start("session").await;
    let (client, mut events) = IpcClient::connect(&harness.socket).await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::Initialized {
            ok: true,
            connected: false,
            since: None,
        }
    );

    client.activate(&plan());
    // hop 1 comes up first but only the exit hop is surfaced
    assert_eq!(next_event(&mut events).await, SessionEvent::Connected);
    assert_eq!(harness.memory.interfaces(), vec!["hltest", "hltesthop1"]);
    assert_eq!(
        harness.memory.routes_of("hltesthop1"),
        vec!["10.1.0.1/32".to_string(), "203.0.113.1/32".to_string()]
    );

    client.check_status();
    match next_event(&mut events).await {
        SessionEvent::StatusUpdated {
            server_ipv4_gateway,
            device_ipv4_address,
            ..
        } => {
            assert_eq!(server_ipv4_gateway, "10.0.0.1");
            assert_eq!(device_ipv4_address, "10.0.0.2/32");
        }
        other => panic!("expected status, got {:?}", other),
    }

    assert_eq!(timeout(WAIT, client.backend_logs()).await.unwrap().unwrap(), "");

    client.deactivate(DeactivateReason::None);
    assert_eq!(next_event(&mut events).await, SessionEvent::Disconnected);
    client.query_version();
    assert_eq!(next_event(&mut events).await, SessionEvent::Version(1));
    assert!(harness.memory.interfaces().is_empty());

    drop(client);
    harness.stop().await;
}
