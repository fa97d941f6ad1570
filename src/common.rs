//! Common types and functions shared by the relay and transport modules.

use crate::error::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Buffer size for reading from stdin, stream sockets, and datagram sockets.
///
/// Large enough to receive any UDP datagram without truncation. Sends are
/// bounded separately by [`MAX_UDP_PAYLOAD_V4`] and [`MAX_UDP_PAYLOAD_V6`].
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Largest UDP payload that fits in one IPv4 datagram.
pub const MAX_UDP_PAYLOAD_V4: usize = 65_507;

/// Largest UDP payload that fits in one IPv6 datagram without jumbograms.
pub const MAX_UDP_PAYLOAD_V6: usize = 65_527;

/// Joins a host and port into a single address string.
///
/// Hosts containing a colon (IPv6 literals) are wrapped in brackets, so
/// `("::1", "80")` becomes `[::1]:80`. The host text is otherwise left as is.
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Parses a decimal port. An empty port means "any" (0).
pub fn parse_port(host: &str, port: &str) -> Result<u16> {
    if port.is_empty() {
        return Ok(0);
    }
    port.parse().map_err(|_| Error::InvalidAddress {
        addr: join_host_port(host, port),
        reason: "invalid port".to_string(),
    })
}

/// IP address family a network is restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    /// IPv4 or IPv6.
    Any,
    /// IPv4 only.
    V4,
    /// IPv6 only.
    V6,
}

impl AddressFamily {
    /// Returns true if `ip` belongs to this family.
    pub fn matches(self, ip: &IpAddr) -> bool {
        match self {
            AddressFamily::Any => true,
            AddressFamily::V4 => ip.is_ipv4(),
            AddressFamily::V6 => ip.is_ipv6(),
        }
    }

    /// Wildcard addresses used when listening on an empty host, in the order
    /// they should be tried.
    ///
    /// `Any` prefers `::`, which accepts IPv4 peers too on dual-stack hosts,
    /// and falls back to `0.0.0.0` where IPv6 is unavailable.
    pub fn unspecified(self) -> Vec<IpAddr> {
        match self {
            AddressFamily::Any => vec![
                IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ],
            AddressFamily::V4 => vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)],
            AddressFamily::V6 => vec![IpAddr::V6(Ipv6Addr::UNSPECIFIED)],
        }
    }

    /// Loopback address used when dialing an empty host.
    pub fn loopback(self) -> IpAddr {
        match self {
            AddressFamily::V6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
            _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

/// What a resolved address is going to be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Listen,
    Dial,
}

/// DNS resolver wrapper built lazily on first hostname lookup.
pub struct DnsResolver {
    resolver: Arc<Mutex<Option<hickory_resolver::Resolver<hickory_resolver::name_server::TokioConnectionProvider>>>>,
}

impl DnsResolver {
    /// Creates a new DNS resolver.
    pub fn new() -> Self {
        Self {
            resolver: Arc::new(Mutex::new(None)),
        }
    }

    /// Resolves `host`/`port` to the socket addresses usable for `purpose`.
    ///
    /// IP literals and the empty host never touch the network. Hostnames are
    /// looked up with hickory-resolver and filtered by `family`; the result is
    /// never empty.
    pub async fn resolve(
        &self,
        host: &str,
        port: &str,
        family: AddressFamily,
        purpose: Purpose,
    ) -> Result<Vec<SocketAddr>> {
        let port_num = parse_port(host, port)?;

        if host.is_empty() {
            let ips = match purpose {
                Purpose::Listen => family.unspecified(),
                Purpose::Dial => vec![family.loopback()],
            };
            return Ok(ips.into_iter().map(|ip| SocketAddr::new(ip, port_num)).collect());
        }

        let invalid = |reason: &str| Error::InvalidAddress {
            addr: join_host_port(host, port),
            reason: reason.to_string(),
        };

        if let Ok(ip) = host.parse::<IpAddr>() {
            if !family.matches(&ip) {
                return Err(invalid("address family mismatch"));
            }
            return Ok(vec![SocketAddr::new(ip, port_num)]);
        }

        // Zone-scoped IPv6 literal: fe80::1%eth0, ::1%1
        if let Some((ip, zone)) = host.split_once('%') {
            if let Ok(ip) = ip.parse::<Ipv6Addr>() {
                if family == AddressFamily::V4 {
                    return Err(invalid("address family mismatch"));
                }
                let scope_id = scope_id(zone).ok_or_else(|| invalid("unknown IPv6 zone"))?;
                return Ok(vec![SocketAddr::V6(SocketAddrV6::new(ip, port_num, 0, scope_id))]);
            }
        }

        let mut resolver_guard = self.resolver.lock().await;
        let resolver = match resolver_guard.take() {
            Some(resolver) => resolver,
            None => hickory_resolver::Resolver::builder_tokio()
                .map_err(|e| Error::Resolve {
                    host: host.to_string(),
                    reason: format!("failed to create DNS resolver: {}", e),
                })?
                .build(),
        };

        let lookup = resolver.lookup_ip(host).await;
        *resolver_guard = Some(resolver);

        let response = lookup.map_err(|e| Error::Resolve {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

        let addrs: Vec<SocketAddr> = response
            .iter()
            .filter(|ip| family.matches(ip))
            .map(|ip| SocketAddr::new(ip, port_num))
            .collect();

        if addrs.is_empty() {
            return Err(Error::Resolve {
                host: host.to_string(),
                reason: "no suitable address found".to_string(),
            });
        }

        Ok(addrs)
    }
}

/// Maps an IPv6 zone (numeric index or interface name) to a scope id.
fn scope_id(zone: &str) -> Option<u32> {
    if zone.is_empty() {
        return None;
    }
    zone.parse().ok().or_else(|| interface_index(zone))
}

#[cfg(unix)]
fn interface_index(name: &str) -> Option<u32> {
    let name = std::ffi::CString::new(name).ok()?;
    // SAFETY: `name` is a valid NUL-terminated string that outlives the call.
    // if_nametoindex() only reads it and returns 0 for unknown interfaces.
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    (index != 0).then_some(index)
}

#[cfg(not(unix))]
fn interface_index(_name: &str) -> Option<u32> {
    None
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}
