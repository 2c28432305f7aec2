//! Peer endpoint resolution with bounded backoff
//!
//! Blocking by nature: the caller (the daemon core thread) waits until an address
//! is found, a permanent failure is reported, or the retry budget runs out.

use std::net::{IpAddr, SocketAddr};
use std::thread::sleep;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ResolverPolicy;

/// Outcome of a single lookup attempt that found nothing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupFailure {
    /// Worth retrying (no network yet, resolver busy)
    Transient(String),
    /// Retrying cannot help (unknown name, invalid input)
    Permanent(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("`{host}` cannot be resolved: {reason}")]
    Permanent { host: String, reason: String },

    #[error("`{host}` still unresolved after {attempts} attempts: {reason}")]
    Exhausted {
        host: String,
        attempts: u32,
        reason: String,
    },
}

/// Delay before retry number `retry` (0-based)
pub fn retry_delay(policy: &ResolverPolicy, retry: u32) -> Duration {
    let factor = policy.multiplier.powi(retry.min(i32::MAX as u32) as i32);
    let delay_ms = (policy.initial_delay_ms as f64 * factor).min(policy.max_delay_ms as f64);
    Duration::from_millis(delay_ms.round() as u64)
}

/// Resolve `host:port` using the system resolver
pub fn resolve(host: &str, port: u16, policy: &ResolverPolicy) -> Result<SocketAddr, ResolveError> {
    resolve_with(host, port, policy, system_lookup, sleep)
}

/// Resolve with an explicit lookup function and sleeper
///
/// Literal IP addresses short-circuit without calling `lookup`.
pub fn resolve_with<L, S>(
    host: &str,
    port: u16,
    policy: &ResolverPolicy,
    mut lookup: L,
    mut sleeper: S,
) -> Result<SocketAddr, ResolveError>
where
    L: FnMut(&str, u16) -> Result<Vec<SocketAddr>, LookupFailure>,
    S: FnMut(Duration),
{
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let mut retry = 0;
    loop {
        let reason = match lookup(host, port) {
            Ok(addrs) => match addrs.into_iter().next() {
                Some(addr) => {
                    debug!("Resolved {} to {}", host, addr.ip());
                    return Ok(addr);
                }
                None => "no addresses returned".to_string(),
            },
            Err(LookupFailure::Permanent(reason)) => {
                warn!("Resolving {} failed permanently: {}", host, reason);
                return Err(ResolveError::Permanent {
                    host: host.to_string(),
                    reason,
                });
            }
            Err(LookupFailure::Transient(reason)) => reason,
        };

        if retry >= policy.max_retries {
            warn!("Giving up on resolving {} after {} attempts", host, retry + 1);
            return Err(ResolveError::Exhausted {
                host: host.to_string(),
                attempts: retry + 1,
                reason,
            });
        }

        let delay = retry_delay(policy, retry);
        debug!("Resolving {} failed ({}), retrying in {:?}", host, reason, delay);
        sleeper(delay);
        retry += 1;
    }
}

#[cfg(unix)]
fn system_lookup(host: &str, port: u16) -> Result<Vec<SocketAddr>, LookupFailure> {
    use std::ffi::CString;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::ptr;

    let node = CString::new(host).map_err(|_| LookupFailure::Permanent("host name contains NUL".to_string()))?;

    // SAFETY: addrinfo is plain old data; all-zero is a valid "no hints" value
    let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_family = libc::AF_UNSPEC;
    hints.ai_socktype = libc::SOCK_DGRAM;

    let mut list: *mut libc::addrinfo = ptr::null_mut();
    // SAFETY: node and hints outlive the call; list is released with freeaddrinfo below
    let code = unsafe { libc::getaddrinfo(node.as_ptr(), ptr::null(), &hints, &mut list) };
    if code != 0 {
        return Err(classify(code));
    }

    let mut addrs = Vec::new();
    let mut cursor = list;
    while !cursor.is_null() {
        // SAFETY: cursor walks the list getaddrinfo returned, which is still alive
        let info = unsafe { &*cursor };
        if !info.ai_addr.is_null() {
            match info.ai_family {
                libc::AF_INET => {
                    // SAFETY: AF_INET entries carry a sockaddr_in
                    let sin = unsafe { &*(info.ai_addr as *const libc::sockaddr_in) };
                    let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                    addrs.push(SocketAddr::new(IpAddr::V4(ip), port));
                }
                libc::AF_INET6 => {
                    // SAFETY: AF_INET6 entries carry a sockaddr_in6
                    let sin6 = unsafe { &*(info.ai_addr as *const libc::sockaddr_in6) };
                    let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                    addrs.push(SocketAddr::new(IpAddr::V6(ip), port));
                }
                _ => {}
            }
        }
        cursor = info.ai_next;
    }

    // SAFETY: list came from a successful getaddrinfo and is freed once
    unsafe { libc::freeaddrinfo(list) };
    Ok(addrs)
}

/// Map a getaddrinfo error code onto retry semantics
///
/// Unknown names, failed lookups and bad arguments are permanent; everything else
/// (EAI_AGAIN, EAI_MEMORY, EAI_SYSTEM, ...) is retried.
#[cfg(unix)]
fn classify(code: libc::c_int) -> LookupFailure {
    use std::ffi::CStr;

    // SAFETY: gai_strerror returns a static NUL-terminated string
    let reason = unsafe { CStr::from_ptr(libc::gai_strerror(code)) }
        .to_string_lossy()
        .into_owned();

    match code {
        libc::EAI_NONAME | libc::EAI_FAIL | libc::EAI_FAMILY | libc::EAI_SERVICE | libc::EAI_BADFLAGS => {
            LookupFailure::Permanent(reason)
        }
        _ => LookupFailure::Transient(reason),
    }
}

#[cfg(not(unix))]
fn system_lookup(host: &str, port: u16) -> Result<Vec<SocketAddr>, LookupFailure> {
    use std::io;
    use std::net::ToSocketAddrs;

    match (host, port).to_socket_addrs() {
        Ok(addrs) => Ok(addrs.collect()),
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => Err(LookupFailure::Permanent(e.to_string())),
        Err(e) => Err(LookupFailure::Transient(e.to_string())),
    }
}
