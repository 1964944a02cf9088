//! Node address discovery for node ports and locally-owned external IPs.

use ipnet::IpNet;
use std::collections::{BTreeSet, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    pub fn matches(&self, ip: &IpAddr) -> bool {
        Self::of(ip) == *self
    }

    /// Prefix length of a single-host CIDR.
    pub fn host_prefix(&self) -> u8 {
        match self {
            IpFamily::V4 => 32,
            IpFamily::V6 => 128,
        }
    }

    pub fn unspecified(&self) -> IpAddr {
        match self {
            IpFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

impl std::fmt::Display for IpFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpFamily::V4 => write!(f, "IPv4"),
            IpFamily::V6 => write!(f, "IPv6"),
        }
    }
}

/// `ip/32` or `ip/128`.
pub fn host_cidr(ip: &IpAddr) -> String {
    format!("{}/{}", ip, IpFamily::of(ip).host_prefix())
}

/// Source of the addresses configured on this host's interfaces.
pub trait NetworkInterfaces: Send + Sync {
    fn addresses(&self) -> std::io::Result<Vec<IpAddr>>;
}

/// Reads interface addresses with `getifaddrs(3)`.
#[derive(Debug, Clone, Default)]
pub struct SystemInterfaces;

impl NetworkInterfaces for SystemInterfaces {
    fn addresses(&self) -> std::io::Result<Vec<IpAddr>> {
        let ifaddrs = nix::ifaddrs::getifaddrs().map_err(std::io::Error::from)?;
        let mut addrs = Vec::new();
        for ifaddr in ifaddrs {
            let Some(storage) = ifaddr.address else {
                continue;
            };
            if let Some(sin) = storage.as_sockaddr_in() {
                addrs.push(IpAddr::V4(sin.ip()));
            } else if let Some(sin6) = storage.as_sockaddr_in6() {
                addrs.push(IpAddr::V6(sin6.ip()));
            }
        }
        Ok(addrs)
    }
}

/// An address node-port traffic is accepted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeAddress {
    /// Every local address; short-circuits any per-address handling.
    All,
    Addr(IpAddr),
}

/// Resolve the configured node-port CIDRs into concrete addresses.
///
/// No CIDRs, or a zero-length CIDR among them, means [`NodeAddress::All`].
/// Otherwise every interface address contained in one of the CIDRs is
/// returned, sorted and deduplicated. Addresses of either family are
/// returned; callers filter by family.
pub fn node_port_addresses(
    cidrs: &[IpNet],
    interfaces: &dyn NetworkInterfaces,
) -> std::io::Result<Vec<NodeAddress>> {
    if cidrs.is_empty() || cidrs.iter().any(|c| c.prefix_len() == 0) {
        return Ok(vec![NodeAddress::All]);
    }

    let mut selected = BTreeSet::new();
    for addr in interfaces.addresses()? {
        if cidrs.iter().any(|c| c.contains(&addr)) {
            selected.insert(addr);
        }
    }
    debug!("Node port addresses: {:?}", selected);
    Ok(selected.into_iter().map(NodeAddress::Addr).collect())
}

/// All addresses owned by this host.
pub fn local_addresses(interfaces: &dyn NetworkInterfaces) -> std::io::Result<HashSet<IpAddr>> {
    Ok(interfaces.addresses()?.into_iter().collect())
}
