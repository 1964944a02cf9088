//! One synthesis pass: snapshot + installed state in, restore text out.
//!
//! The pass writes both tables into a [`RuleSet`] in a fixed order: the
//! top-level chains and their static rules, one block per service port,
//! the deletion of stale generated chains, the node-port tail call and
//! the forwarding rules. Host ports needed by the new rules are claimed
//! along the way; whether they are kept is decided after the apply.

use pkg_constants::iptables::{
    EXTERNAL_SERVICES_CHAIN, FIREWALL_CHAIN, FORWARD_CHAIN, MARK_DROP_CHAIN, MARK_MASQ_CHAIN,
    NODE_PORTS_CHAIN, POSTROUTING_CHAIN, SERVICES_CHAIN,
};
use pkg_constants::network::{LOOPBACK_CIDR_V4, LOOPBACK_CIDR_V6};
use std::collections::HashSet;
use std::net::IpAddr;
use tracing::{debug, error};

use crate::chain;
use crate::endpoint::{EndpointInfo, EndpointsMap};
use crate::existing::ExistingChains;
use crate::local::LocalTrafficDetector;
use crate::netif::{IpFamily, NodeAddress, host_cidr};
use crate::ports::{LocalPort, PortClaims, PortReservations};
use crate::probability::ProbabilityTable;
use crate::rules::{RuleArgs, RuleSet};
use crate::service::{ServiceInfo, ServicesSnapshot};

/// Managed top-level chains, declared on every pass.
pub(crate) const FILTER_CHAINS: &[&str] = &[
    SERVICES_CHAIN,
    EXTERNAL_SERVICES_CHAIN,
    FORWARD_CHAIN,
    NODE_PORTS_CHAIN,
    FIREWALL_CHAIN,
];

pub(crate) const NAT_CHAINS: &[&str] = &[
    SERVICES_CHAIN,
    NODE_PORTS_CHAIN,
    POSTROUTING_CHAIN,
    MARK_MASQ_CHAIN,
    MARK_DROP_CHAIN,
];

/// `0x00004000`: a mark value with the given bit set.
pub(crate) fn mark_value(bit: u8) -> String {
    format!("{:#010x}", 1u32 << bit)
}

/// `0x00004000/0x00004000`: matches packets carrying the bit.
pub(crate) fn mark_match(bit: u8) -> String {
    let value = mark_value(bit);
    format!("{}/{}", value, value)
}

/// Inputs of a pass that are not owned by the proxier state.
pub(crate) struct SynthesisContext<'a> {
    pub family: IpFamily,
    pub node_ip: Option<IpAddr>,
    pub masquerade_all: bool,
    pub masquerade_bit: u8,
    pub drop_bit: u8,
    pub large_cluster_threshold: usize,
    pub detector: &'a LocalTrafficDetector,
    pub existing_filter: &'a ExistingChains,
    pub existing_nat: &'a ExistingChains,
    pub node_addresses: &'a [NodeAddress],
    pub local_addresses: &'a HashSet<IpAddr>,
}

/// Counters describing what a pass produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SynthesisStats {
    pub services: usize,
    pub services_without_endpoints: usize,
    pub endpoint_chains: usize,
    pub stale_chains: usize,
    pub port_errors: usize,
    pub filter_rules: usize,
    pub nat_rules: usize,
    pub nat_chains: usize,
}

/// A usable endpoint of the service being rendered.
struct Backend {
    ip: IpAddr,
    /// `ip:port`, the DNAT destination.
    endpoint: String,
    chain: String,
    is_local: bool,
}

pub(crate) struct RuleSynthesizer<'a> {
    ctx: SynthesisContext<'a>,
    rules: &'a mut RuleSet,
    probabilities: &'a mut ProbabilityTable,
    ports: &'a PortReservations,
    claims: &'a mut PortClaims,
    active_nat_chains: HashSet<String>,
    masquerade_mark: String,
    masquerade_match: String,
    drop_mark: String,
    drop_match: String,
    comments: bool,
    stats: SynthesisStats,
}

impl<'a> RuleSynthesizer<'a> {
    pub fn new(
        ctx: SynthesisContext<'a>,
        rules: &'a mut RuleSet,
        probabilities: &'a mut ProbabilityTable,
        ports: &'a PortReservations,
        claims: &'a mut PortClaims,
    ) -> Self {
        Self {
            masquerade_mark: mark_value(ctx.masquerade_bit),
            masquerade_match: mark_match(ctx.masquerade_bit),
            drop_mark: mark_value(ctx.drop_bit),
            drop_match: mark_match(ctx.drop_bit),
            ctx,
            rules,
            probabilities,
            ports,
            claims,
            active_nat_chains: HashSet::new(),
            comments: true,
            stats: SynthesisStats::default(),
        }
    }

    /// Render every service port into the rule set.
    pub fn run(mut self, services: &ServicesSnapshot, endpoints: &EndpointsMap) -> SynthesisStats {
        self.rules.reset();

        let total_endpoints: usize = endpoints.values().map(Vec::len).sum();
        self.comments = total_endpoints <= self.ctx.large_cluster_threshold;
        if !self.comments {
            debug!(
                "Synthesizer: {} endpoints above threshold {}, dropping rule comments",
                total_endpoints, self.ctx.large_cluster_threshold
            );
        }

        self.write_top_level_chains();

        let none = Vec::new();
        for (name, svc) in services {
            let eps = endpoints.get(name).unwrap_or(&none);
            self.write_service(svc, eps);
        }

        self.delete_stale_chains();
        self.write_node_ports_tail();
        self.write_forward_rules();

        self.rules.filter.commit();
        self.rules.nat.commit();

        self.stats.services = services.len();
        self.stats.filter_rules = self.rules.filter.rule_count();
        self.stats.nat_rules = self.rules.nat.rule_count();
        self.stats.nat_chains = self.rules.nat.chain_count();
        self.stats
    }

    fn declare_nat_chain(&mut self, chain: &str) {
        self.rules.nat.declare_chain(chain, self.ctx.existing_nat);
        self.active_nat_chains.insert(chain.to_string());
    }

    fn write_top_level_chains(&mut self) {
        for chain in FILTER_CHAINS {
            self.rules.filter.declare_chain(chain, self.ctx.existing_filter);
        }
        for chain in NAT_CHAINS {
            self.declare_nat_chain(chain);
        }

        let nat = &mut self.rules.nat;
        nat.append(
            POSTROUTING_CHAIN,
            &RuleArgs::new()
                .args(["-m", "mark", "!", "--mark"])
                .arg(self.masquerade_match.as_str())
                .jump("RETURN"),
        );
        // Clear the mark so a re-traversal does not masquerade twice.
        nat.append(
            POSTROUTING_CHAIN,
            &RuleArgs::new()
                .args(["-j", "MARK", "--xor-mark"])
                .arg(self.masquerade_mark.as_str())
                .into_vec(),
        );
        nat.append(
            POSTROUTING_CHAIN,
            &RuleArgs::new()
                .comment("kubernetes service traffic requiring SNAT")
                .jump("MASQUERADE"),
        );
        nat.append(
            MARK_MASQ_CHAIN,
            &RuleArgs::new()
                .args(["-j", "MARK", "--or-mark"])
                .arg(self.masquerade_mark.as_str())
                .into_vec(),
        );
        nat.append(
            MARK_DROP_CHAIN,
            &RuleArgs::new()
                .args(["-j", "MARK", "--or-mark"])
                .arg(self.drop_mark.as_str())
                .into_vec(),
        );

        self.rules.filter.append(
            FIREWALL_CHAIN,
            &RuleArgs::new()
                .comment("kubernetes firewall for dropping marked packets")
                .args(["-m", "mark", "--mark"])
                .arg(self.drop_match.as_str())
                .jump("DROP"),
        );
    }

    /// Comment clause for rules of the per-service chains, dropped in large clusters.
    fn service_comment(&self, svc: &ServiceInfo) -> RuleArgs {
        if self.comments {
            RuleArgs::new().comment(svc.name())
        } else {
            RuleArgs::new()
        }
    }

    fn backends(&self, svc: &ServiceInfo, endpoints: &[EndpointInfo]) -> Vec<Backend> {
        let protocol = svc.protocol.as_lower();
        let mut seen = HashSet::new();
        let mut backends = Vec::new();
        for ep in endpoints.iter().filter(|ep| ep.is_usable()) {
            for ip in ep.addresses(self.ctx.family) {
                let endpoint = match ip {
                    IpAddr::V4(v4) => format!("{}:{}", v4, svc.target_port),
                    IpAddr::V6(v6) => format!("[{}]:{}", v6, svc.target_port),
                };
                if !seen.insert(endpoint.clone()) {
                    continue;
                }
                backends.push(Backend {
                    ip,
                    chain: chain::endpoint_chain(svc.name(), protocol, &endpoint),
                    endpoint,
                    is_local: ep.is_local,
                });
            }
        }
        backends
    }

    fn claim_port(&mut self, port: LocalPort) -> bool {
        match self.ports.claim(self.claims, port) {
            Ok(()) => true,
            Err(e) => {
                error!("Synthesizer: {}, skipping it", e);
                self.stats.port_errors += 1;
                false
            }
        }
    }

    fn write_service(&mut self, svc: &ServiceInfo, endpoints: &[EndpointInfo]) {
        let protocol = svc.protocol.as_lower();
        let port = svc.port.to_string();
        let svc_chain = svc.service_chain();
        let xlb_chain = svc.local_traffic_chain();
        let backends = self.backends(svc, endpoints);
        let has_endpoints = !backends.is_empty();

        if has_endpoints {
            self.declare_nat_chain(svc_chain);
            if svc.local_traffic_only {
                self.declare_nat_chain(xlb_chain);
            }
        } else {
            self.stats.services_without_endpoints += 1;
        }

        let no_endpoints = format!("{} has no endpoints", svc.name());

        // Cluster IP.
        let cluster_args = RuleArgs::new()
            .comment(&format!("{} cluster IP", svc.name()))
            .protocol(protocol)
            .args(["-d", host_cidr(&svc.cluster_ip).as_str(), "--dport", port.as_str()]);
        if has_endpoints {
            if self.ctx.masquerade_all {
                self.rules
                    .nat
                    .append(svc_chain, &cluster_args.clone().jump(MARK_MASQ_CHAIN));
            } else if self.ctx.detector.is_implemented() {
                // Off-cluster sources reaching a cluster IP need SNAT to get the reply back.
                self.rules.nat.append(
                    svc_chain,
                    &cluster_args
                        .clone()
                        .args(self.ctx.detector.if_not_local())
                        .jump(MARK_MASQ_CHAIN),
                );
            }
            self.rules
                .nat
                .append(SERVICES_CHAIN, &cluster_args.jump(svc_chain));
        } else {
            self.rules.filter.append(
                SERVICES_CHAIN,
                &RuleArgs::new()
                    .comment(&no_endpoints)
                    .protocol(protocol)
                    .args(["-d", host_cidr(&svc.cluster_ip).as_str(), "--dport", port.as_str()])
                    .jump("REJECT"),
            );
        }

        // External IPs.
        for ip in &svc.external_ips {
            if self.ctx.local_addresses.contains(ip) {
                let lp = LocalPort {
                    description: format!("externalIP for {}", svc.name()),
                    ip: Some(*ip),
                    port: svc.port,
                    protocol: svc.protocol,
                    family: self.ctx.family,
                };
                if !self.claim_port(lp) {
                    continue;
                }
            }
            let dst = host_cidr(ip);
            if has_endpoints {
                let args = RuleArgs::new()
                    .comment(&format!("{} external IP", svc.name()))
                    .protocol(protocol)
                    .args(["-d", dst.as_str(), "--dport", port.as_str()]);
                let target = if svc.local_traffic_only {
                    xlb_chain
                } else {
                    self.rules
                        .nat
                        .append(svc_chain, &args.clone().jump(MARK_MASQ_CHAIN));
                    svc_chain
                };
                self.rules.nat.append(SERVICES_CHAIN, &args.jump(target));
            } else {
                self.rules.filter.append(
                    EXTERNAL_SERVICES_CHAIN,
                    &RuleArgs::new()
                        .comment(&no_endpoints)
                        .protocol(protocol)
                        .args(["-d", dst.as_str(), "--dport", port.as_str()])
                        .jump("REJECT"),
                );
            }
        }

        // Load balancer ingress.
        for (ingress, fw_chain) in svc.firewall_chains() {
            let dst = host_cidr(ingress);
            if !has_endpoints {
                self.rules.filter.append(
                    EXTERNAL_SERVICES_CHAIN,
                    &RuleArgs::new()
                        .comment(&no_endpoints)
                        .protocol(protocol)
                        .args(["-d", dst.as_str(), "--dport", port.as_str()])
                        .jump("REJECT"),
                );
                continue;
            }
            self.write_firewall_chain(svc, *ingress, fw_chain, &dst, &port);
        }

        // Node port.
        if svc.node_port != 0 {
            self.write_node_port(svc, has_endpoints, &no_endpoints);
        }

        // Health check node port.
        if svc.health_check_node_port != 0 {
            self.rules.filter.append(
                NODE_PORTS_CHAIN,
                &RuleArgs::new()
                    .comment(&format!("{} health check node port", svc.name()))
                    .protocol("tcp")
                    .args(["--dport", svc.health_check_node_port.to_string().as_str()])
                    .jump("ACCEPT"),
            );
        }

        if !has_endpoints {
            return;
        }

        self.write_endpoint_chains(svc, &backends);
        if svc.local_traffic_only {
            self.write_local_traffic_chain(svc, &backends);
        }
    }

    fn write_firewall_chain(
        &mut self,
        svc: &ServiceInfo,
        ingress: IpAddr,
        fw_chain: &str,
        dst: &str,
        port: &str,
    ) {
        self.declare_nat_chain(fw_chain);
        let args = RuleArgs::new()
            .comment(&format!("{} loadbalancer IP", svc.name()))
            .protocol(svc.protocol.as_lower())
            .args(["-d", dst, "--dport", port]);
        self.rules
            .nat
            .append(SERVICES_CHAIN, &args.clone().jump(fw_chain));

        let target = if svc.local_traffic_only {
            svc.local_traffic_chain()
        } else {
            self.rules
                .nat
                .append(fw_chain, &args.clone().jump(MARK_MASQ_CHAIN));
            svc.service_chain()
        };

        let ranges = &svc.load_balancer_source_ranges;
        if ranges.is_empty() {
            self.rules.nat.append(fw_chain, &args.clone().jump(target));
        } else {
            let mut allow_from_node = false;
            for range in ranges {
                self.rules.nat.append(
                    fw_chain,
                    &args
                        .clone()
                        .args(["-s", range.to_string().as_str()])
                        .jump(target),
                );
                if self.ctx.node_ip.is_some_and(|ip| range.contains(&ip)) {
                    allow_from_node = true;
                }
            }
            // Hairpin: the node itself sends to the load balancer, which
            // sends back with the ingress address as source.
            if allow_from_node {
                self.rules.nat.append(
                    fw_chain,
                    &args
                        .clone()
                        .args(["-s", host_cidr(&ingress).as_str()])
                        .jump(target),
                );
            }
        }
        self.rules.nat.append(fw_chain, &args.jump(MARK_DROP_CHAIN));
    }

    fn write_node_port(&mut self, svc: &ServiceInfo, has_endpoints: bool, no_endpoints: &str) {
        let mut wanted = Vec::new();
        for addr in self.ctx.node_addresses {
            let mut lp = LocalPort {
                description: format!("nodePort for {}", svc.name()),
                ip: None,
                port: svc.node_port,
                protocol: svc.protocol,
                family: self.ctx.family,
            };
            match addr {
                NodeAddress::All => {
                    wanted.push(lp);
                    break;
                }
                NodeAddress::Addr(ip) if self.ctx.family.matches(ip) => {
                    lp.ip = Some(*ip);
                    wanted.push(lp);
                }
                NodeAddress::Addr(_) => {}
            }
        }
        for lp in wanted {
            self.claim_port(lp);
        }

        let protocol = svc.protocol.as_lower();
        let node_port = svc.node_port.to_string();
        if !has_endpoints {
            self.rules.filter.append(
                EXTERNAL_SERVICES_CHAIN,
                &RuleArgs::new()
                    .comment(no_endpoints)
                    .args(["-m", "addrtype", "--dst-type", "LOCAL"])
                    .protocol(protocol)
                    .args(["--dport", node_port.as_str()])
                    .jump("REJECT"),
            );
            return;
        }

        let args = RuleArgs::new()
            .comment(svc.name())
            .protocol(protocol)
            .args(["--dport", node_port.as_str()]);
        if svc.local_traffic_only {
            let loopback = match self.ctx.family {
                IpFamily::V4 => LOOPBACK_CIDR_V4,
                IpFamily::V6 => LOOPBACK_CIDR_V6,
            };
            // Loopback-sourced traffic keeps a martian source after DNAT unless masqueraded.
            self.rules.nat.append(
                NODE_PORTS_CHAIN,
                &args.clone().args(["-s", loopback]).jump(MARK_MASQ_CHAIN),
            );
            self.rules
                .nat
                .append(NODE_PORTS_CHAIN, &args.jump(svc.local_traffic_chain()));
        } else {
            self.rules
                .nat
                .append(NODE_PORTS_CHAIN, &args.clone().jump(MARK_MASQ_CHAIN));
            self.rules
                .nat
                .append(NODE_PORTS_CHAIN, &args.jump(svc.service_chain()));
        }
    }

    /// Affinity checks for `targets`, each sending a known client back to
    /// the endpoint chain it was last sent to.
    fn write_affinity_rules(&mut self, chain: &str, svc: &ServiceInfo, targets: &[&Backend]) {
        let Some(timeout) = svc.affinity_timeout_secs else {
            return;
        };
        let seconds = timeout.to_string();
        for backend in targets {
            let args = self
                .service_comment(svc)
                .args(["-m", "recent", "--name", backend.chain.as_str(), "--rcheck"])
                .args(["--seconds", seconds.as_str(), "--reap"])
                .jump(&backend.chain);
            self.rules.nat.append(chain, &args);
        }
    }

    /// Uniform random choice among `targets`: rule `i` matches with
    /// probability `1/(n-i)`, the last one unconditionally.
    fn write_balancing_rules(
        &mut self,
        chain: &str,
        comment: impl Fn(usize) -> RuleArgs,
        targets: &[&Backend],
    ) {
        let n = targets.len();
        for (i, backend) in targets.iter().enumerate() {
            let mut args = comment(i);
            if i + 1 < n {
                let probability = self.probabilities.probability(n - i).to_string();
                args = args
                    .args(["-m", "statistic", "--mode", "random", "--probability"])
                    .arg(probability);
            }
            self.rules.nat.append(chain, &args.jump(&backend.chain));
        }
    }

    fn write_endpoint_chains(&mut self, svc: &ServiceInfo, backends: &[Backend]) {
        for backend in backends {
            self.declare_nat_chain(&backend.chain);
        }
        self.stats.endpoint_chains += backends.len();

        let svc_chain = svc.service_chain();
        let targets: Vec<&Backend> = backends.iter().collect();
        self.write_affinity_rules(svc_chain, svc, &targets);
        let comment = self.service_comment(svc);
        self.write_balancing_rules(svc_chain, |_| comment.clone(), &targets);

        let protocol = svc.protocol.as_lower();
        for backend in backends {
            let base = self.service_comment(svc);
            // Hairpin: an endpoint reaching itself through the service.
            self.rules.nat.append(
                &backend.chain,
                &base
                    .clone()
                    .args(["-s", host_cidr(&backend.ip).as_str()])
                    .jump(MARK_MASQ_CHAIN),
            );
            let mut args = base;
            if svc.affinity_timeout_secs.is_some() {
                args = args.args(["-m", "recent", "--name", backend.chain.as_str(), "--set"]);
            }
            let args = args
                .protocol(protocol)
                .args(["-j", "DNAT", "--to-destination", backend.endpoint.as_str()])
                .into_vec();
            self.rules.nat.append(&backend.chain, &args);
        }
    }

    fn write_local_traffic_chain(&mut self, svc: &ServiceInfo, backends: &[Backend]) {
        let xlb_chain = svc.local_traffic_chain();
        let svc_chain = svc.service_chain();

        if self.ctx.detector.is_implemented() {
            self.rules.nat.append(
                xlb_chain,
                &RuleArgs::new()
                    .comment("Redirect pods trying to reach external loadbalancer VIP to clusterIP")
                    .args(self.ctx.detector.if_local())
                    .jump(svc_chain),
            );
        }
        self.rules.nat.append(
            xlb_chain,
            &RuleArgs::new()
                .comment(&format!("masquerade LOCAL traffic for {} LB IP", svc.name()))
                .args(["-m", "addrtype", "--src-type", "LOCAL"])
                .jump(MARK_MASQ_CHAIN),
        );
        self.rules.nat.append(
            xlb_chain,
            &RuleArgs::new()
                .comment(&format!(
                    "route LOCAL traffic for {} LB IP to service chain",
                    svc.name()
                ))
                .args(["-m", "addrtype", "--src-type", "LOCAL"])
                .jump(svc_chain),
        );

        let local: Vec<&Backend> = backends.iter().filter(|b| b.is_local).collect();
        if local.is_empty() {
            self.rules.nat.append(
                xlb_chain,
                &RuleArgs::new()
                    .comment(&format!("{} has no local endpoints", svc.name()))
                    .jump(MARK_DROP_CHAIN),
            );
            return;
        }

        self.write_affinity_rules(xlb_chain, svc, &local);
        let comments = self.comments;
        let name = svc.name().to_string();
        self.write_balancing_rules(
            xlb_chain,
            |i| {
                if comments {
                    RuleArgs::new().comment(&format!("Balancing rule {} for {}", i, name))
                } else {
                    RuleArgs::new()
                }
            },
            &local,
        );
    }

    /// Flush and delete generated chains that are installed but no longer
    /// referenced. Chains outside the reserved prefixes are left alone.
    fn delete_stale_chains(&mut self) {
        let existing = self.ctx.existing_nat;
        let mut stale: Vec<&String> = existing
            .keys()
            .filter(|c| chain::is_generated(c) && !self.active_nat_chains.contains(*c))
            .collect();
        stale.sort();
        for name in stale {
            // Declaring flushes it; "-X" then deletes it.
            self.rules.nat.declare_chain(name, existing);
            self.rules.nat.delete_chain(name);
            self.stats.stale_chains += 1;
        }
    }

    fn write_node_ports_tail(&mut self) {
        let comment = "kubernetes service nodeports; NOTE: this must be the last rule in this chain";
        for addr in self.ctx.node_addresses {
            match addr {
                NodeAddress::All => {
                    self.rules.nat.append(
                        SERVICES_CHAIN,
                        &RuleArgs::new()
                            .comment(comment)
                            .args(["-m", "addrtype", "--dst-type", "LOCAL"])
                            .jump(NODE_PORTS_CHAIN),
                    );
                    break;
                }
                NodeAddress::Addr(ip) if !self.ctx.family.matches(ip) => {
                    error!(
                        "Synthesizer: node port address {} is not {}, skipping it",
                        ip, self.ctx.family
                    );
                }
                NodeAddress::Addr(ip) => {
                    self.rules.nat.append(
                        SERVICES_CHAIN,
                        &RuleArgs::new()
                            .comment(comment)
                            .args(["-d", host_cidr(ip).as_str()])
                            .jump(NODE_PORTS_CHAIN),
                    );
                }
            }
        }
    }

    fn write_forward_rules(&mut self) {
        let filter = &mut self.rules.filter;
        filter.append(
            FORWARD_CHAIN,
            &RuleArgs::new()
                .args(["-m", "conntrack", "--ctstate", "INVALID"])
                .jump("DROP"),
        );
        filter.append(
            FORWARD_CHAIN,
            &RuleArgs::new()
                .comment("kubernetes forwarding rules")
                .args(["-m", "mark", "--mark"])
                .arg(self.masquerade_match.as_str())
                .jump("ACCEPT"),
        );

        let established = ["-m", "conntrack", "--ctstate", "RELATED,ESTABLISHED"];
        if self.ctx.detector.is_implemented() {
            filter.append(
                FORWARD_CHAIN,
                &RuleArgs::new()
                    .comment("kubernetes forwarding conntrack pod source rule")
                    .args(self.ctx.detector.if_local())
                    .args(established)
                    .jump("ACCEPT"),
            );
            filter.append(
                FORWARD_CHAIN,
                &RuleArgs::new()
                    .comment("kubernetes forwarding conntrack pod destination rule")
                    .args(self.ctx.detector.if_local_destination())
                    .args(established)
                    .jump("ACCEPT"),
            );
        } else {
            filter.append(
                FORWARD_CHAIN,
                &RuleArgs::new()
                    .comment("kubernetes forwarding conntrack rule")
                    .args(established)
                    .jump("ACCEPT"),
            );
        }
    }
}
