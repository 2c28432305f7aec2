//! Linux backend driving `ip`, `wg` and `resolvectl`
//!
//! Interfaces are kernel WireGuard links. Routes go into the main table; a `/0`
//! range is installed as two `/1` halves so the existing default route survives
//! for the peer endpoint, which gets a pinned host route via the path it used
//! before the tunnel came up.

use std::collections::HashMap;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::process::{Command, Stdio};
use std::sync::Arc;

use hoplink_core::{AddressFamily, InterfaceConfig, IpAddressRange};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{
    BackendError, BackendResult, BackendStep, DnsBackend, NetworkBackend, Throughput, TunnelBackend,
};
use crate::config::ResolverPolicy;
use crate::resolver;

/// Tunnel and addressing backend
#[derive(Debug, Clone)]
pub struct LinuxBackend {
    mtu: u16,
    resolver: ResolverPolicy,
    /// Host routes pinned for peer endpoints, by interface
    pinned: Arc<Mutex<HashMap<String, String>>>,
}

impl LinuxBackend {
    pub fn new(mtu: u16, resolver: ResolverPolicy) -> Self {
        Self {
            mtu,
            resolver,
            pinned: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Keep the peer endpoint reachable outside the tunnel
    fn pin_endpoint_route(&self, ifname: &str, endpoint: IpAddr) {
        let family = family_flag(endpoint.is_ipv6());
        let target = endpoint.to_string();
        let Ok(route) = output("ip", &[family, "route", "get", &target]) else {
            warn!("No existing route to endpoint of {}", ifname);
            return;
        };
        let Some(via) = parse_route_get(&route) else {
            debug!("Endpoint of {} is on-link, nothing to pin", ifname);
            return;
        };
        // Already going through one of our own tunnels (multi-hop): leave it alone.
        if self.pinned.lock().contains_key(&via.device) {
            return;
        }

        let prefix = format!("{}/{}", target, if endpoint.is_ipv6() { 128 } else { 32 });
        let mut args = vec![family, "route", "replace", prefix.as_str()];
        if let Some(gateway) = via.gateway.as_deref() {
            args.extend(["via", gateway]);
        }
        args.extend(["dev", via.device.as_str()]);

        match run("ip", &args) {
            Ok(()) => {
                self.pinned.lock().insert(ifname.to_string(), prefix);
            }
            Err(e) => warn!("Unable to pin endpoint route for {}: {}", ifname, e),
        }
    }

    fn unpin_endpoint_route(&self, ifname: &str) {
        if let Some(prefix) = self.pinned.lock().remove(ifname) {
            let family = family_flag(prefix.contains(':'));
            if let Err(e) = run("ip", &[family, "route", "del", &prefix]) {
                warn!("Unable to remove pinned route {}: {}", prefix, e);
            }
        }
    }
}

impl TunnelBackend for LinuxBackend {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn interface_exists(&self, ifname: &str) -> bool {
        run("ip", &["link", "show", "dev", ifname]).is_ok()
    }

    fn add_interface(&mut self, config: &InterfaceConfig) -> BackendResult<()> {
        run("ip", &["link", "add", "dev", &config.ifname, "type", "wireguard"])
            .map_err(|e| BackendError::new(BackendStep::AddInterface, e))
    }

    fn configure_interface(&mut self, config: &InterfaceConfig) -> BackendResult<()> {
        let step = BackendStep::ConfigureInterface;
        let ifname = config.ifname.as_str();

        let endpoint = resolver::resolve(&config.server_ipv4_addr_in, config.server_port, &self.resolver)
            .map_err(|e| BackendError::new(step, e.to_string()))?;

        // Switching servers: drop every peer but the new one.
        let peers = output("wg", &["show", ifname, "peers"]).map_err(|e| BackendError::new(step, e))?;
        for stale in peers.lines().map(str::trim).filter(|p| !p.is_empty() && *p != config.server_public_key) {
            run("wg", &["set", ifname, "peer", stale, "remove"]).map_err(|e| BackendError::new(step, e))?;
        }

        let endpoint_text = endpoint_string(endpoint);
        let allowed_ips = config
            .allowed_ip_ranges
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let mut args = vec![
            "set",
            ifname,
            "private-key",
            "/dev/stdin",
            "peer",
            config.server_public_key.as_str(),
            "endpoint",
            endpoint_text.as_str(),
        ];
        if !allowed_ips.is_empty() {
            args.extend(["allowed-ips", allowed_ips.as_str()]);
        }

        self.unpin_endpoint_route(ifname);
        self.pin_endpoint_route(ifname, endpoint.ip());

        run_with_stdin("wg", &args, config.private_key.as_bytes()).map_err(|e| BackendError::new(step, e))?;
        info!("Peer of {} set to {}", ifname, endpoint_text);
        Ok(())
    }

    fn delete_interface(&mut self, ifname: &str) -> BackendResult<()> {
        run("ip", &["link", "del", "dev", ifname]).map_err(|e| BackendError::new(BackendStep::DeleteInterface, e))?;
        self.unpin_endpoint_route(ifname);
        Ok(())
    }

    fn add_route_prefix(&mut self, range: &IpAddressRange, ifname: &str) -> BackendResult<()> {
        let family = family_flag(range.family.is_ipv6());
        for prefix in route_prefixes(range) {
            run("ip", &[family, "route", "replace", &prefix, "dev", ifname])
                .map_err(|e| BackendError::new(BackendStep::AddRoutePrefix, e))?;
        }
        Ok(())
    }

    fn get_throughput(&self, ifname: &str) -> BackendResult<Throughput> {
        let text = output("wg", &["show", ifname, "transfer"])
            .map_err(|e| BackendError::new(BackendStep::GetThroughput, e))?;
        Ok(parse_transfer(&text))
    }
}

impl NetworkBackend for LinuxBackend {
    fn add_interface_ips(&mut self, config: &InterfaceConfig) -> BackendResult<()> {
        let step = BackendStep::AddInterfaceIps;
        run("ip", &["-4", "address", "add", &config.device_ipv4_address, "dev", &config.ifname])
            .map_err(|e| BackendError::new(step, e))?;
        if config.ipv6_enabled {
            run("ip", &["-6", "address", "add", &config.device_ipv6_address, "dev", &config.ifname])
                .map_err(|e| BackendError::new(step, e))?;
        }
        Ok(())
    }

    fn set_mtu_and_up(&mut self, config: &InterfaceConfig) -> BackendResult<()> {
        let mtu = self.mtu.to_string();
        run("ip", &["link", "set", "dev", &config.ifname, "mtu", &mtu, "up"])
            .map_err(|e| BackendError::new(BackendStep::SetMtuAndUp, e))
    }
}

/// systemd-resolved per-link DNS
#[derive(Debug, Default)]
pub struct LinuxDns {
    /// Link whose DNS settings we changed
    link: Option<String>,
}

impl LinuxDns {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DnsBackend for LinuxDns {
    fn update_resolvers(&mut self, ifname: &str, resolvers: &[String]) -> BackendResult<()> {
        let step = BackendStep::UpdateResolvers;
        let mut args = vec!["dns", ifname];
        args.extend(resolvers.iter().map(String::as_str));
        run("resolvectl", &args).map_err(|e| BackendError::new(step, e))?;
        // Route every lookup through this link.
        run("resolvectl", &["domain", ifname, "~."]).map_err(|e| BackendError::new(step, e))?;
        self.link = Some(ifname.to_string());
        Ok(())
    }

    fn restore_resolvers(&mut self) -> BackendResult<()> {
        let Some(link) = self.link.take() else {
            return Ok(());
        };
        run("resolvectl", &["revert", &link]).map_err(|e| BackendError::new(BackendStep::RestoreResolvers, e))
    }
}

fn family_flag(ipv6: bool) -> &'static str {
    if ipv6 {
        "-6"
    } else {
        "-4"
    }
}

fn endpoint_string(endpoint: SocketAddr) -> String {
    match endpoint {
        SocketAddr::V4(addr) => addr.to_string(),
        SocketAddr::V6(addr) => format!("[{}]:{}", addr.ip(), addr.port()),
    }
}

/// Prefixes to install for one allowed-IP range
fn route_prefixes(range: &IpAddressRange) -> Vec<String> {
    if range.range != 0 {
        return vec![range.to_string()];
    }
    match range.family {
        AddressFamily::Ipv4 => vec!["0.0.0.0/1".to_string(), "128.0.0.0/1".to_string()],
        AddressFamily::Ipv6 => vec!["::/1".to_string(), "8000::/1".to_string()],
    }
}

#[derive(Debug, PartialEq, Eq)]
struct RouteVia {
    gateway: Option<String>,
    device: String,
}

/// Extract `via` and `dev` from `ip route get` output
fn parse_route_get(text: &str) -> Option<RouteVia> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let value_after = |key: &str| {
        tokens
            .windows(2)
            .find(|pair| pair[0] == key)
            .map(|pair| pair[1].to_string())
    };
    let gateway = value_after("via");
    let device = value_after("dev")?;
    gateway.as_ref()?;
    Some(RouteVia { gateway, device })
}

/// Sum `wg show <if> transfer` lines: `<peer>\t<rx>\t<tx>`
fn parse_transfer(text: &str) -> Throughput {
    text.lines().fold(Throughput::default(), |mut total, line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if let [_, rx, tx] = fields.as_slice() {
            total.rx_bytes += rx.parse::<u64>().unwrap_or(0);
            total.tx_bytes += tx.parse::<u64>().unwrap_or(0);
        }
        total
    })
}

fn run(program: &str, args: &[&str]) -> Result<(), String> {
    debug!("Running {} {}", program, args.join(" "));
    let status = Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| format!("{program} spawn failed: {e}"))?;
    if status.success() {
        return Ok(());
    }
    Err(format!("{program} exited unsuccessfully: {status}"))
}

fn output(program: &str, args: &[&str]) -> Result<String, String> {
    debug!("Running {} {}", program, args.join(" "));
    let out = Command::new(program)
        .args(args)
        .stderr(Stdio::null())
        .output()
        .map_err(|e| format!("{program} spawn failed: {e}"))?;
    if !out.status.success() {
        return Err(format!("{program} exited unsuccessfully: {}", out.status));
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// Run with `input` on stdin; the arguments are logged, the input is not
fn run_with_stdin(program: &str, args: &[&str], input: &[u8]) -> Result<(), String> {
    debug!("Running {} {}", program, args.join(" "));
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| format!("{program} spawn failed: {e}"))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input)
            .map_err(|e| format!("{program} stdin write failed: {e}"))?;
    }

    let status = child.wait().map_err(|e| format!("{program} wait failed: {e}"))?;
    if status.success() {
        return Ok(());
    }
    Err(format!("{program} exited unsuccessfully: {status}"))
}
