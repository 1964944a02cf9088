//! Endpoint view and the snapshot builder that turns cluster objects into
//! the maps one pass consumes.

use pkg_types::endpoint::EndpointAddress;
use pkg_types::snapshot::StateSnapshot;
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::netif::IpFamily;
use crate::service::{ServiceInfo, ServicePortName, ServicesSnapshot};

/// One backend of a service, with its addresses split per family.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EndpointInfo {
    pub ipv4: Vec<Ipv4Addr>,
    pub ipv6: Vec<Ipv6Addr>,
    /// Runs on this node.
    pub is_local: bool,
    pub ready: bool,
    pub serving: bool,
    pub terminating: bool,
}

impl EndpointInfo {
    pub fn from_address(addr: &EndpointAddress, hostname: &str) -> Self {
        let mut info = Self {
            is_local: addr.node_name.as_deref() == Some(hostname),
            ready: addr.ready,
            serving: addr.serving.unwrap_or(addr.ready),
            terminating: addr.terminating,
            ..Default::default()
        };
        for ip in &addr.addresses {
            match ip {
                IpAddr::V4(v4) if !info.ipv4.contains(v4) => info.ipv4.push(*v4),
                IpAddr::V6(v6) if !info.ipv6.contains(v6) => info.ipv6.push(*v6),
                _ => {}
            }
        }
        info
    }

    /// Addresses of `family`, in order.
    pub fn addresses(&self, family: IpFamily) -> Vec<IpAddr> {
        match family {
            IpFamily::V4 => self.ipv4.iter().copied().map(IpAddr::V4).collect(),
            IpFamily::V6 => self.ipv6.iter().copied().map(IpAddr::V6).collect(),
        }
    }

    /// Whether the endpoint may receive traffic.
    ///
    /// Readiness is not consulted yet: every listed endpoint is eligible,
    /// including not-ready and terminating ones.
    pub fn is_usable(&self) -> bool {
        true
    }
}

/// Endpoints of every service port, in a stable order.
pub type EndpointsMap = BTreeMap<ServicePortName, Vec<EndpointInfo>>;

/// Expand cluster objects into per-port service and endpoint maps.
///
/// Every port of a service shares the service's endpoint list. Services
/// without a usable cluster IP for `family` are skipped.
pub fn build_snapshot(
    state: &StateSnapshot,
    family: IpFamily,
    hostname: &str,
) -> (ServicesSnapshot, EndpointsMap) {
    let mut by_service: HashMap<(&str, &str), Vec<EndpointInfo>> = HashMap::new();
    for eps in &state.endpoints {
        by_service
            .entry((eps.namespace.as_str(), eps.service_name.as_str()))
            .or_default()
            .extend(
                eps.endpoints
                    .iter()
                    .map(|addr| EndpointInfo::from_address(addr, hostname)),
            );
    }

    let mut services = ServicesSnapshot::new();
    let mut endpoints = EndpointsMap::new();
    for svc in &state.services {
        for port in &svc.spec.ports {
            let name = ServicePortName::new(&svc.namespace, &svc.name, &port.name, port.protocol);
            if services.contains_key(&name) {
                warn!("Duplicate service port {}, keeping the first", name);
                continue;
            }
            let Some(info) = ServiceInfo::new(&name, svc, port, family) else {
                debug!("Skipping service port {}: no {} cluster IP", name, family);
                continue;
            };
            let eps = by_service
                .get(&(svc.namespace.as_str(), svc.name.as_str()))
                .cloned()
                .unwrap_or_default();
            services.insert(name.clone(), Arc::new(info));
            endpoints.insert(name, eps);
        }
    }
    (services, endpoints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::service::Protocol;

    const STATE: &str = r#"
services:
  - name: foo
    namespace: ns
    spec:
      cluster_ip: 10.0.0.5
      ports:
        - name: http
          port: 80
          target_port: 8080
        - name: dns
          protocol: UDP
          port: 53
          target_port: 5353
  - name: headless
    namespace: ns
    spec:
      ports:
        - port: 80
          target_port: 80
endpoints:
  - service_name: foo
    namespace: ns
    endpoints:
      - addresses: [10.1.0.1, "fd00::1"]
        node_name: node-1
      - addresses: [10.1.0.2]
        node_name: node-2
        ready: false
"#;

    #[test]
    fn test_endpoint_info_splits_families() {
        let addr = EndpointAddress {
            addresses: vec![
                "10.1.0.1".parse().unwrap(),
                "fd00::1".parse().unwrap(),
                "10.1.0.1".parse().unwrap(),
            ],
            node_name: Some("node-1".to_string()),
            ready: true,
            serving: None,
            terminating: false,
        };
        let info = EndpointInfo::from_address(&addr, "node-1");
        assert_eq!(info.ipv4, vec!["10.1.0.1".parse::<Ipv4Addr>().unwrap()]);
        assert_eq!(info.ipv6.len(), 1);
        assert!(info.is_local);
        assert!(info.serving);
        assert_eq!(info.addresses(IpFamily::V6).len(), 1);
    }

    #[test]
    fn test_build_snapshot() {
        let state = StateSnapshot::from_yaml(STATE).unwrap();
        let (services, endpoints) = build_snapshot(&state, IpFamily::V4, "node-1");

        assert_eq!(services.len(), 2, "headless service is skipped");
        let http = ServicePortName::new("ns", "foo", "http", Protocol::Tcp);
        let dns = ServicePortName::new("ns", "foo", "dns", Protocol::Udp);
        assert!(services.contains_key(&http));
        assert_eq!(services[&dns].target_port, 5353);

        let eps = &endpoints[&http];
        assert_eq!(eps.len(), 2);
        assert!(eps[0].is_local);
        assert!(!eps[1].is_local);
        assert!(!eps[1].ready);
        assert!(eps.iter().all(EndpointInfo::is_usable));
        assert_eq!(endpoints[&dns].len(), 2);
    }

    #[test]
    fn test_build_snapshot_without_endpoints() {
        let state = StateSnapshot::from_yaml(
            "services:\n  - name: bar\n    namespace: ns\n    spec:\n      cluster_ip: 10.0.0.9\n      ports:\n        - port: 80\n          target_port: 80\n",
        )
        .unwrap();
        let (services, endpoints) = build_snapshot(&state, IpFamily::V4, "node-1");
        let name = ServicePortName::new("ns", "bar", "", Protocol::Tcp);
        assert!(services.contains_key(&name));
        assert!(endpoints[&name].is_empty());
    }
}
