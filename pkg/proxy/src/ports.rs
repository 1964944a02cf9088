//! Host port reservations.
//!
//! Node ports and locally-owned external IPs are backed by a listening
//! socket held by the proxy, so no other process can bind them while the
//! DNAT rules steer their traffic away. Reservations follow the pass:
//! a [`PortClaims`] collects what the new ruleset needs, then it is either
//! committed (stale sockets closed) or rolled back (new sockets closed).

use pkg_types::service::Protocol;
use socket2::{Domain, Socket, Type};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::error::{ProxyError, Result};
use crate::netif::IpFamily;

/// One reserved listen socket. `ip == None` means every address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalPort {
    pub description: String,
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub protocol: Protocol,
    pub family: IpFamily,
}

impl LocalPort {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip.unwrap_or_else(|| self.family.unspecified()), self.port)
    }
}

impl std::fmt::Display for LocalPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ip = self.ip.map(|ip| ip.to_string()).unwrap_or_default();
        write!(
            f,
            "{:?} ({}:{}/{})",
            self.description,
            ip,
            self.port,
            self.protocol.as_lower()
        )
    }
}

/// A held reservation. Dropping it also releases the port.
pub trait PortHandle: Send + Sync + std::fmt::Debug {
    fn close(self: Box<Self>) -> std::io::Result<()>;
}

/// The OS "bind and hold" primitive.
pub trait PortOpener: Send + Sync {
    fn open_local_port(&self, port: &LocalPort) -> std::io::Result<Box<dyn PortHandle>>;
}

#[derive(Debug)]
struct HeldSocket {
    _socket: Socket,
}

impl PortHandle for HeldSocket {
    fn close(self: Box<Self>) -> std::io::Result<()> {
        // The fd is closed when the socket drops.
        Ok(())
    }
}

/// Binds real sockets: TCP ports are bound and listened on, UDP ports bound.
#[derive(Debug, Clone, Default)]
pub struct SocketOpener;

impl PortOpener for SocketOpener {
    fn open_local_port(&self, port: &LocalPort) -> std::io::Result<Box<dyn PortHandle>> {
        let addr = port.bind_addr();
        let socket = match port.protocol {
            Protocol::Tcp => {
                let socket = Socket::new(
                    Domain::for_address(addr),
                    Type::STREAM,
                    Some(socket2::Protocol::TCP),
                )?;
                if addr.is_ipv6() {
                    socket.set_only_v6(true)?;
                }
                socket.bind(&addr.into())?;
                socket.listen(128)?;
                socket
            }
            Protocol::Udp => {
                let socket = Socket::new(
                    Domain::for_address(addr),
                    Type::DGRAM,
                    Some(socket2::Protocol::UDP),
                )?;
                if addr.is_ipv6() {
                    socket.set_only_v6(true)?;
                }
                socket.bind(&addr.into())?;
                socket
            }
            Protocol::Sctp => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "SCTP ports are not reserved",
                ));
            }
        };
        info!("Opened local port {}", port);
        Ok(Box::new(HeldSocket { _socket: socket }))
    }
}

/// Ports required by the pass in progress.
#[derive(Debug, Default)]
pub struct PortClaims {
    /// Already held before the pass and still needed.
    kept: HashSet<LocalPort>,
    /// Opened during this pass.
    acquired: HashMap<LocalPort, Box<dyn PortHandle>>,
}

impl PortClaims {
    pub fn contains(&self, port: &LocalPort) -> bool {
        self.kept.contains(port) || self.acquired.contains_key(port)
    }

    /// Ports opened during this pass.
    pub fn acquired(&self) -> usize {
        self.acquired.len()
    }
}

/// The set of ports currently held by the proxy.
pub struct PortReservations {
    opener: Arc<dyn PortOpener>,
    held: HashMap<LocalPort, Box<dyn PortHandle>>,
}

impl PortReservations {
    pub fn new(opener: Arc<dyn PortOpener>) -> Self {
        Self {
            opener,
            held: HashMap::new(),
        }
    }

    /// Record that the pass needs `port`, opening it unless already held.
    /// SCTP ports are never reserved and always succeed.
    pub fn claim(&self, claims: &mut PortClaims, port: LocalPort) -> Result<()> {
        if claims.contains(&port) {
            return Ok(());
        }
        if self.held.contains_key(&port) {
            claims.kept.insert(port);
            return Ok(());
        }
        if port.protocol == Protocol::Sctp {
            debug!("Not reserving SCTP port {}", port);
            return Ok(());
        }
        match self.opener.open_local_port(&port) {
            Ok(handle) => {
                claims.acquired.insert(port, handle);
                Ok(())
            }
            Err(e) => Err(ProxyError::PortOpen {
                port: port.to_string(),
                source: e,
            }),
        }
    }

    /// The new ruleset is installed: release ports nobody needs any more and
    /// adopt the newly acquired ones.
    pub fn commit(&mut self, claims: PortClaims) {
        let PortClaims { kept, acquired } = claims;
        let stale: Vec<LocalPort> = self
            .held
            .keys()
            .filter(|p| !kept.contains(p))
            .cloned()
            .collect();
        for port in stale {
            if let Some(handle) = self.held.remove(&port) {
                match handle.close() {
                    Ok(()) => info!("Closed local port {}", port),
                    Err(e) => error!("Failed to close local port {}: {}", port, e),
                }
            }
        }
        self.held.extend(acquired);
    }

    /// The new ruleset was rejected: release what this pass opened and keep
    /// the previously held set as is.
    pub fn rollback(&self, claims: PortClaims) {
        for (port, handle) in claims.acquired {
            match handle.close() {
                Ok(()) => info!("Released local port {} after failed apply", port),
                Err(e) => error!("Failed to release local port {}: {}", port, e),
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.held.len()
    }
}
