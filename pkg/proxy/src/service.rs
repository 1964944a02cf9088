//! Per-port service view consumed by the synthesizer.

use ipnet::IpNet;
use pkg_constants::network::DEFAULT_AFFINITY_TIMEOUT_SECS;
use pkg_types::service::{Protocol, Service, ServicePort, SessionAffinity, TrafficPolicy};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::warn;

use crate::chain;
use crate::netif::IpFamily;

/// Identity of one port of one service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServicePortName {
    pub namespace: String,
    pub name: String,
    pub port: String,
    pub protocol: Protocol,
}

impl ServicePortName {
    pub fn new(namespace: &str, name: &str, port: &str, protocol: Protocol) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            port: port.to_string(),
            protocol,
        }
    }
}

/// `namespace/name` or `namespace/name:port`.
impl std::fmt::Display for ServicePortName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)?;
        if !self.port.is_empty() {
            write!(f, ":{}", self.port)?;
        }
        Ok(())
    }
}

/// Everything needed to render one service port. Immutable once built;
/// chain names are computed here once instead of on every pass.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub cluster_ip: IpAddr,
    pub external_ips: Vec<IpAddr>,
    pub load_balancer_ingress: Vec<IpAddr>,
    pub load_balancer_source_ranges: Vec<IpNet>,
    pub port: u16,
    /// 0 = none.
    pub node_port: u16,
    /// 0 = none.
    pub health_check_node_port: u16,
    pub target_port: u16,
    pub protocol: Protocol,
    /// ClientIP affinity window in seconds, `None` without affinity.
    pub affinity_timeout_secs: Option<u32>,
    /// External traffic only goes to endpoints on this node.
    pub local_traffic_only: bool,

    name: String,
    service_chain: String,
    local_traffic_chain: String,
    firewall_chains: Vec<(IpAddr, String)>,
}

impl ServiceInfo {
    /// Build from one port of `service`. Addresses and CIDRs of the wrong
    /// family, and invalid source ranges, are dropped with a warning.
    /// Returns `None` for headless services and services whose cluster IP
    /// is of the other family.
    pub fn new(
        name: &ServicePortName,
        service: &Service,
        port: &ServicePort,
        family: IpFamily,
    ) -> Option<Self> {
        let spec = &service.spec;
        let cluster_ip = spec.cluster_ip?;
        if !family.matches(&cluster_ip) {
            return None;
        }

        let name_string = name.to_string();
        let protocol = port.protocol.as_lower();

        let external_ips = keep_family(&name_string, "external IP", &spec.external_ips, family);
        let load_balancer_ingress = keep_family(
            &name_string,
            "load balancer ingress",
            &service.load_balancer.ingress,
            family,
        );

        let mut source_ranges = Vec::new();
        for range in &spec.load_balancer_source_ranges {
            match range.trim().parse::<IpNet>() {
                Ok(net) if family.matches(&net.addr()) => source_ranges.push(net),
                Ok(net) => warn!(
                    "Service {}: ignoring {} source range {}",
                    name_string,
                    IpFamily::of(&net.addr()),
                    net
                ),
                Err(e) => warn!(
                    "Service {}: ignoring invalid source range {}: {}",
                    name_string, range, e
                ),
            }
        }

        let firewall_chains = load_balancer_ingress
            .iter()
            .map(|ip| (*ip, chain::firewall_chain(&name_string, protocol, &ip.to_string())))
            .collect();

        let affinity_timeout_secs = match spec.session_affinity {
            SessionAffinity::ClientIP => Some(
                spec.session_affinity_timeout_secs
                    .unwrap_or(DEFAULT_AFFINITY_TIMEOUT_SECS),
            ),
            SessionAffinity::None => None,
        };

        Some(Self {
            cluster_ip,
            external_ips,
            load_balancer_ingress,
            load_balancer_source_ranges: source_ranges,
            port: port.port,
            node_port: port.node_port.unwrap_or(0),
            health_check_node_port: spec.health_check_node_port.unwrap_or(0),
            target_port: port.target_port,
            protocol: port.protocol,
            affinity_timeout_secs,
            local_traffic_only: spec.external_traffic_policy == TrafficPolicy::Local,
            service_chain: chain::service_chain(&name_string, protocol),
            local_traffic_chain: chain::local_traffic_chain(&name_string, protocol),
            firewall_chains,
            name: name_string,
        })
    }

    /// `namespace/name:port`, as used in comments and chain hashing.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service_chain(&self) -> &str {
        &self.service_chain
    }

    pub fn local_traffic_chain(&self) -> &str {
        &self.local_traffic_chain
    }

    /// Firewall chain for each load balancer ingress address, in ingress order.
    pub fn firewall_chains(&self) -> &[(IpAddr, String)] {
        &self.firewall_chains
    }
}

fn keep_family(service: &str, what: &str, ips: &[IpAddr], family: IpFamily) -> Vec<IpAddr> {
    ips.iter()
        .filter(|ip| {
            let ok = family.matches(ip);
            if !ok {
                warn!("Service {}: ignoring {} {} of the other family", service, what, ip);
            }
            ok
        })
        .copied()
        .collect()
}

/// All service ports known to the proxy, in a stable order.
pub type ServicesSnapshot = BTreeMap<ServicePortName, Arc<ServiceInfo>>;
