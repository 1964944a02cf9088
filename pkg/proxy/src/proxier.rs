//! The proxier: owns the snapshot and host state, runs passes and applies
//! their output atomically.

use ipnet::IpNet;
use pkg_constants::iptables::{
    CHAIN_FORWARD, CHAIN_INPUT, CHAIN_OUTPUT, CHAIN_POSTROUTING, CHAIN_PREROUTING,
    DEFAULT_MASQUERADE_BIT, DROP_BIT, EXTERNAL_SERVICES_CHAIN, FIREWALL_CHAIN, FORWARD_CHAIN,
    NODE_PORTS_CHAIN, POSTROUTING_CHAIN, SERVICES_CHAIN,
};
use pkg_constants::network::{DEFAULT_HOSTNAME, DEFAULT_LARGE_CLUSTER_ENDPOINTS_THRESHOLD};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::endpoint::EndpointsMap;
use crate::error::{ProxyError, Result};
use crate::existing::read_existing_chains;
use crate::iptables::{Iptables, Table};
use crate::local::LocalTrafficDetector;
use crate::netif::{IpFamily, NetworkInterfaces, local_addresses, node_port_addresses};
use crate::ports::{PortClaims, PortOpener, PortReservations};
use crate::probability::ProbabilityTable;
use crate::rules::{RuleArgs, RuleSet};
use crate::service::ServicesSnapshot;
use crate::synthesizer::{RuleSynthesizer, SynthesisContext};

pub use crate::synthesizer::SynthesisStats;

/// A fixed jump from a built-in chain into a managed top-level chain.
/// Installed incrementally before every pass; everything below these
/// jumps is owned by the restore payload.
#[derive(Debug, Clone, Copy)]
pub struct JumpChain {
    pub table: Table,
    pub chain: &'static str,
    pub source: &'static str,
    pub comment: &'static str,
    pub extra: &'static [&'static str],
}

impl JumpChain {
    pub fn rule_args(&self) -> Vec<String> {
        RuleArgs::new()
            .comment_arg(self.comment)
            .args(self.extra.iter().copied())
            .jump(self.chain)
    }
}

pub const JUMP_CHAINS: &[JumpChain] = &[
    JumpChain {
        table: Table::Filter,
        chain: EXTERNAL_SERVICES_CHAIN,
        source: CHAIN_INPUT,
        comment: "kubernetes externally-visible service portals",
        extra: &["-m", "conntrack", "--ctstate", "NEW"],
    },
    JumpChain {
        table: Table::Filter,
        chain: EXTERNAL_SERVICES_CHAIN,
        source: CHAIN_FORWARD,
        comment: "kubernetes externally-visible service portals",
        extra: &["-m", "conntrack", "--ctstate", "NEW"],
    },
    JumpChain {
        table: Table::Filter,
        chain: NODE_PORTS_CHAIN,
        source: CHAIN_INPUT,
        comment: "kubernetes health check service ports",
        extra: &[],
    },
    JumpChain {
        table: Table::Filter,
        chain: SERVICES_CHAIN,
        source: CHAIN_FORWARD,
        comment: "kubernetes service portals",
        extra: &["-m", "conntrack", "--ctstate", "NEW"],
    },
    JumpChain {
        table: Table::Filter,
        chain: SERVICES_CHAIN,
        source: CHAIN_OUTPUT,
        comment: "kubernetes service portals",
        extra: &["-m", "conntrack", "--ctstate", "NEW"],
    },
    JumpChain {
        table: Table::Filter,
        chain: FORWARD_CHAIN,
        source: CHAIN_FORWARD,
        comment: "kubernetes forwarding rules",
        extra: &[],
    },
    JumpChain {
        table: Table::Filter,
        chain: FIREWALL_CHAIN,
        source: CHAIN_INPUT,
        comment: "kubernetes firewall for dropping marked packets",
        extra: &[],
    },
    JumpChain {
        table: Table::Filter,
        chain: FIREWALL_CHAIN,
        source: CHAIN_OUTPUT,
        comment: "kubernetes firewall for dropping marked packets",
        extra: &[],
    },
    JumpChain {
        table: Table::Nat,
        chain: SERVICES_CHAIN,
        source: CHAIN_OUTPUT,
        comment: "kubernetes service portals",
        extra: &[],
    },
    JumpChain {
        table: Table::Nat,
        chain: SERVICES_CHAIN,
        source: CHAIN_PREROUTING,
        comment: "kubernetes service portals",
        extra: &[],
    },
    JumpChain {
        table: Table::Nat,
        chain: POSTROUTING_CHAIN,
        source: CHAIN_POSTROUTING,
        comment: "kubernetes postrouting rules",
        extra: &[],
    },
];

/// Make sure every managed top-level chain exists and is reachable.
pub async fn ensure_jump_chains(iptables: &dyn Iptables) -> Result<()> {
    for jump in JUMP_CHAINS {
        if let Err(e) = iptables.ensure_chain(jump.table, jump.chain).await {
            error!(
                "Proxier: failed to ensure chain {} in table {}: {}",
                jump.chain, jump.table, e
            );
            return Err(e);
        }
        let args = jump.rule_args();
        if let Err(e) = iptables
            .ensure_rule(jump.table, jump.source, &args)
            .await
        {
            error!(
                "Proxier: failed to ensure jump {} -> {} in table {}: {}",
                jump.source, jump.chain, jump.table, e
            );
            return Err(e);
        }
    }
    Ok(())
}

/// Submit both tables in one atomic, non-flushing, counter-preserving restore.
pub async fn apply(iptables: &dyn Iptables, rules: &mut RuleSet) -> Result<()> {
    let data = rules.serialize();
    debug!("Proxier: restoring {} bytes", data.len());
    iptables.restore_all(data).await
}

#[derive(Debug, Clone)]
pub struct ProxierConfig {
    /// Node name; endpoints scheduled here are local.
    pub hostname: String,
    pub node_ip: Option<IpAddr>,
    pub family: IpFamily,
    pub masquerade_all: bool,
    pub masquerade_bit: u8,
    pub cluster_cidr: Option<IpNet>,
    /// Empty means every interface.
    pub node_port_addresses: Vec<IpNet>,
    pub large_cluster_endpoints_threshold: usize,
}

impl Default for ProxierConfig {
    fn default() -> Self {
        Self {
            hostname: DEFAULT_HOSTNAME.to_string(),
            node_ip: None,
            family: IpFamily::V4,
            masquerade_all: false,
            masquerade_bit: DEFAULT_MASQUERADE_BIT,
            cluster_cidr: None,
            node_port_addresses: Vec::new(),
            large_cluster_endpoints_threshold: DEFAULT_LARGE_CLUSTER_ENDPOINTS_THRESHOLD,
        }
    }
}

impl ProxierConfig {
    fn validate(&self, iptables: &dyn Iptables) -> Result<()> {
        if self.masquerade_bit > 31 || self.masquerade_bit == DROP_BIT {
            return Err(ProxyError::InvalidConfig(format!(
                "masquerade bit {} must be in 0..=31 and differ from the drop bit {}",
                self.masquerade_bit, DROP_BIT
            )));
        }
        if iptables.is_ipv6() != (self.family == IpFamily::V6) {
            return Err(ProxyError::InvalidConfig(format!(
                "proxier family {} does not match the packet filter",
                self.family
            )));
        }
        if let Some(cidr) = &self.cluster_cidr
            && !self.family.matches(&cidr.addr())
        {
            return Err(ProxyError::InvalidConfig(format!(
                "cluster CIDR {} is not {}",
                cidr, self.family
            )));
        }
        if let Some(ip) = &self.node_ip
            && !self.family.matches(ip)
        {
            return Err(ProxyError::InvalidConfig(format!(
                "node IP {} is not {}",
                ip, self.family
            )));
        }
        Ok(())
    }
}

/// Everything a pass reads and writes. Guarded by one lock: passes never
/// interleave.
struct ProxierState {
    /// Set by the first snapshot; passes before it would wipe every service.
    initialized: bool,
    services: ServicesSnapshot,
    endpoints: EndpointsMap,
    ports: PortReservations,
    probabilities: ProbabilityTable,
    rules: RuleSet,
    save_buffer: Vec<u8>,
}

pub struct Proxier {
    config: ProxierConfig,
    detector: LocalTrafficDetector,
    iptables: Arc<dyn Iptables>,
    interfaces: Arc<dyn NetworkInterfaces>,
    state: Mutex<ProxierState>,
}

impl Proxier {
    pub fn new(
        config: ProxierConfig,
        iptables: Arc<dyn Iptables>,
        interfaces: Arc<dyn NetworkInterfaces>,
        opener: Arc<dyn PortOpener>,
    ) -> Result<Self> {
        config.validate(iptables.as_ref())?;

        let detector = LocalTrafficDetector::new(config.cluster_cidr);
        if !config.masquerade_all && !detector.is_implemented() {
            warn!(
                "Proxier: no cluster CIDR and masquerade-all off, off-cluster traffic to cluster IPs is not masqueraded"
            );
        }
        info!(
            "Proxier: {} node {} (masquerade bit {}, masquerade-all {})",
            config.family, config.hostname, config.masquerade_bit, config.masquerade_all
        );

        Ok(Self {
            detector,
            iptables,
            interfaces,
            state: Mutex::new(ProxierState {
                initialized: false,
                services: ServicesSnapshot::new(),
                endpoints: EndpointsMap::new(),
                ports: PortReservations::new(opener),
                probabilities: ProbabilityTable::new(),
                rules: RuleSet::new(),
                save_buffer: Vec::new(),
            }),
            config,
        })
    }

    /// Hand a new snapshot to the proxier. It is rendered by the next pass.
    pub async fn update(&self, services: ServicesSnapshot, endpoints: EndpointsMap) {
        let mut state = self.state.lock().await;
        debug!(
            "Proxier: snapshot updated, {} service ports, {} endpoint lists",
            services.len(),
            endpoints.len()
        );
        state.initialized = true;
        state.services = services;
        state.endpoints = endpoints;
    }

    /// Run one full pass: make sure the jumps exist, read the installed
    /// state, synthesize, apply, then settle the host ports.
    pub async fn sync_proxy_rules(&self) -> Result<SynthesisStats> {
        let start = Instant::now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if !state.initialized {
            debug!("Proxier: no snapshot yet, skipping pass");
            return Ok(SynthesisStats::default());
        }

        ensure_jump_chains(self.iptables.as_ref()).await?;

        let existing_filter =
            read_existing_chains(self.iptables.as_ref(), Table::Filter, &mut state.save_buffer)
                .await;
        let existing_nat =
            read_existing_chains(self.iptables.as_ref(), Table::Nat, &mut state.save_buffer).await;

        let node_addresses =
            match node_port_addresses(&self.config.node_port_addresses, self.interfaces.as_ref()) {
                Ok(addrs) => addrs,
                Err(e) => {
                    error!("Proxier: failed to get node port addresses, node ports disabled: {}", e);
                    Vec::new()
                }
            };
        let local_addresses = match local_addresses(self.interfaces.as_ref()) {
            Ok(addrs) => addrs,
            Err(e) => {
                error!("Proxier: failed to list local addresses: {}", e);
                HashSet::new()
            }
        };

        let ctx = SynthesisContext {
            family: self.config.family,
            node_ip: self.config.node_ip,
            masquerade_all: self.config.masquerade_all,
            masquerade_bit: self.config.masquerade_bit,
            drop_bit: DROP_BIT,
            large_cluster_threshold: self.config.large_cluster_endpoints_threshold,
            detector: &self.detector,
            existing_filter: &existing_filter,
            existing_nat: &existing_nat,
            node_addresses: &node_addresses,
            local_addresses: &local_addresses,
        };
        let mut claims = PortClaims::default();
        let stats = RuleSynthesizer::new(
            ctx,
            &mut state.rules,
            &mut state.probabilities,
            &state.ports,
            &mut claims,
        )
        .run(&state.services, &state.endpoints);
        debug!(
            "Proxier: generated {} filter rules, {} nat rules, {} nat chains",
            stats.filter_rules, stats.nat_rules, stats.nat_chains
        );

        if let Err(e) = apply(self.iptables.as_ref(), &mut state.rules).await {
            error!("Proxier: failed to apply rules, keeping the previous ruleset: {}", e);
            state.ports.rollback(claims);
            return Err(e);
        }
        let opened = claims.acquired();
        state.ports.commit(claims);

        info!(
            "Proxier: synced {} service ports in {:?} ({} stale chains removed, {} host ports held, {} opened)",
            stats.services,
            start.elapsed(),
            stats.stale_chains,
            state.ports.len(),
            opened
        );
        Ok(stats)
    }

    #[cfg(test)]
    pub(crate) async fn held_ports(&self) -> usize {
        self.state.lock().await.ports.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain;
    use crate::endpoint::build_snapshot;
    use crate::testing::{FakeInterfaces, FakeIptables, FakePortOpener};
    use pkg_types::snapshot::StateSnapshot;

    const FOO: &str = r#"
services:
  - name: foo
    namespace: ns
    spec:
      cluster_ip: 10.0.0.5
      ports:
        - name: http
          port: 80
          target_port: 8080
          node_port: 30080
endpoints:
  - service_name: foo
    namespace: ns
    endpoints:
      - addresses: [10.1.0.1]
        node_name: node-1
      - addresses: [10.1.0.2]
        node_name: node-2
"#;

    const FOO_EMPTY: &str = r#"
services:
  - name: foo
    namespace: ns
    spec:
      cluster_ip: 10.0.0.5
      ports:
        - name: http
          port: 80
          target_port: 8080
          node_port: 30080
"#;

    struct Harness {
        iptables: Arc<FakeIptables>,
        opener: Arc<FakePortOpener>,
        proxier: Proxier,
    }

    fn make_proxier() -> Harness {
        let iptables = Arc::new(FakeIptables::new());
        let opener = Arc::new(FakePortOpener::new());
        let proxier = Proxier::new(
            ProxierConfig::default(),
            iptables.clone(),
            Arc::new(FakeInterfaces::new(&["192.168.1.10"])),
            opener.clone(),
        )
        .unwrap();
        Harness {
            iptables,
            opener,
            proxier,
        }
    }

    async fn load(proxier: &Proxier, yaml: &str) {
        let state = StateSnapshot::from_yaml(yaml).unwrap();
        let (services, endpoints) = build_snapshot(&state, IpFamily::V4, "node-1");
        proxier.update(services, endpoints).await;
    }

    /// Turn a restore payload into what a save would return afterwards.
    fn as_dump(restore: &str, table: &str) -> String {
        let header = format!("*{}", table);
        let mut out = String::new();
        let mut in_table = false;
        for line in restore.lines() {
            if line == header {
                in_table = true;
            } else if in_table && line == "COMMIT" {
                out.push_str("COMMIT\n");
                break;
            } else if !in_table || line.starts_with("-X") {
                continue;
            }
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    #[tokio::test]
    async fn test_sync_two_endpoints() {
        let h = make_proxier();
        load(&h.proxier, FOO).await;
        let stats = h.proxier.sync_proxy_rules().await.unwrap();

        let text = h.iptables.last_restore().unwrap();
        let svc = chain::service_chain("ns/foo:http", "tcp");
        let sep1 = chain::endpoint_chain("ns/foo:http", "tcp", "10.1.0.1:8080");
        let sep2 = chain::endpoint_chain("ns/foo:http", "tcp", "10.1.0.2:8080");
        assert!(text.contains(&format!(":{} - [0:0]", svc)));
        assert!(text.contains(&format!(
            "-A {} -m comment --comment \"ns/foo:http\" -m statistic --mode random --probability 0.5000000000 -j {}",
            svc, sep1
        )));
        assert!(text.contains(&format!("-A {} -m comment --comment \"ns/foo:http\" -j {}", svc, sep2)));
        assert_eq!(stats.endpoint_chains, 2);
        assert_eq!(h.proxier.held_ports().await, 1);
        assert_eq!(h.opener.opened()[0].port, 30080);
    }

    #[tokio::test]
    async fn test_no_pass_before_first_snapshot() {
        let h = make_proxier();
        h.proxier.sync_proxy_rules().await.unwrap();
        assert!(h.iptables.restores().is_empty());
        assert!(h.iptables.rules().is_empty());
    }

    #[tokio::test]
    async fn test_jump_rules_are_ensured() {
        let h = make_proxier();
        load(&h.proxier, FOO_EMPTY).await;
        h.proxier.sync_proxy_rules().await.unwrap();
        assert!(h.iptables.has_chain(Table::Nat, SERVICES_CHAIN));
        assert!(h.iptables.has_chain(Table::Filter, FIREWALL_CHAIN));
        assert_eq!(h.iptables.rules().len(), JUMP_CHAINS.len());
        let prerouting = h
            .iptables
            .rules()
            .into_iter()
            .find(|r| r.table == Table::Nat && r.chain == CHAIN_PREROUTING)
            .unwrap();
        assert_eq!(prerouting.args.last().map(String::as_str), Some(SERVICES_CHAIN));
    }

    #[tokio::test]
    async fn test_endpoints_removed_then_restored() {
        let h = make_proxier();
        load(&h.proxier, FOO).await;
        h.proxier.sync_proxy_rules().await.unwrap();
        let first = h.iptables.last_restore().unwrap();
        h.iptables.set_dump(Table::Nat, &as_dump(&first, "nat"));
        h.iptables.set_dump(Table::Filter, &as_dump(&first, "filter"));

        load(&h.proxier, FOO_EMPTY).await;
        let stats = h.proxier.sync_proxy_rules().await.unwrap();
        let second = h.iptables.last_restore().unwrap();
        let svc = chain::service_chain("ns/foo:http", "tcp");
        let sep1 = chain::endpoint_chain("ns/foo:http", "tcp", "10.1.0.1:8080");

        assert_eq!(stats.stale_chains, 3);
        assert!(second.contains(&format!("-X {}", svc)));
        assert!(second.contains(&format!("-X {}", sep1)));
        assert!(!second.contains(&format!("-A {}", svc)));
        assert!(second.contains("\"ns/foo:http has no endpoints\" -m tcp -p tcp -d 10.0.0.5/32 --dport 80 -j REJECT"));
        // The node port stays reserved while the service exists.
        assert_eq!(h.proxier.held_ports().await, 1);

        h.iptables.set_dump(Table::Nat, &as_dump(&second, "nat"));
        load(&h.proxier, FOO).await;
        h.proxier.sync_proxy_rules().await.unwrap();
        let third = h.iptables.last_restore().unwrap();
        assert!(third.contains(&format!("-A KUBE-SERVICES -m comment --comment \"ns/foo:http cluster IP\" -m tcp -p tcp -d 10.0.0.5/32 --dport 80 -j {}", svc)));
        assert!(!third.contains("REJECT"));
        assert!(!third.contains("-X "));
    }

    #[tokio::test]
    async fn test_counters_survive_passes() {
        let h = make_proxier();
        load(&h.proxier, FOO).await;
        h.proxier.sync_proxy_rules().await.unwrap();

        let svc = chain::service_chain("ns/foo:http", "tcp");
        let dump = format!(
            "*nat\n:PREROUTING ACCEPT [1:60]\n:KUBE-SERVICES - [42:2520]\n:{} - [17:1020]\n:CUSTOM-CHAIN - [2:120]\nCOMMIT\n",
            svc
        );
        h.iptables.set_dump(Table::Nat, &dump);
        h.proxier.sync_proxy_rules().await.unwrap();

        let text = h.iptables.last_restore().unwrap();
        assert!(text.contains(":KUBE-SERVICES - [42:2520]\n"));
        assert!(text.contains(&format!(":{} - [17:1020]\n", svc)));
        assert!(!text.contains("CUSTOM-CHAIN"));
        assert!(!text.contains("PREROUTING ACCEPT"));
    }

    #[tokio::test]
    async fn test_restore_failure_rolls_back_ports() {
        let h = make_proxier();
        h.iptables.fail_restore(true);
        load(&h.proxier, FOO).await;

        let err = h.proxier.sync_proxy_rules().await.unwrap_err();
        assert!(matches!(err, ProxyError::Restore(_)));
        assert_eq!(h.opener.opened().len(), 1);
        assert_eq!(h.opener.closed().len(), 1);
        assert_eq!(h.proxier.held_ports().await, 0);

        h.iptables.fail_restore(false);
        h.proxier.sync_proxy_rules().await.unwrap();
        assert_eq!(h.proxier.held_ports().await, 1);
        assert_eq!(h.opener.opened().len(), 2);
    }

    #[tokio::test]
    async fn test_ensure_failure_aborts_before_restore() {
        let h = make_proxier();
        h.iptables.fail_ensure_chain(POSTROUTING_CHAIN);
        load(&h.proxier, FOO).await;

        let err = h.proxier.sync_proxy_rules().await.unwrap_err();
        assert!(matches!(err, ProxyError::EnsureChain { .. }));
        assert!(h.iptables.restores().is_empty());
        assert!(h.opener.opened().is_empty());
    }

    #[tokio::test]
    async fn test_dump_failure_degrades() {
        let h = make_proxier();
        load(&h.proxier, FOO).await;
        h.iptables.set_dump(Table::Nat, "*nat\n:KUBE-SERVICES - [42:2520]\nCOMMIT\n");
        h.iptables.fail_save(true);

        h.proxier.sync_proxy_rules().await.unwrap();
        let text = h.iptables.last_restore().unwrap();
        assert!(text.contains(":KUBE-SERVICES - [0:0]"));
        assert!(!text.contains("[42:2520]"));
    }

    #[tokio::test]
    async fn test_interface_failure_disables_node_ports() {
        let iptables = Arc::new(FakeIptables::new());
        let opener = Arc::new(FakePortOpener::new());
        let config = ProxierConfig {
            node_port_addresses: vec!["192.168.1.0/24".parse().unwrap()],
            ..Default::default()
        };
        let proxier = Proxier::new(
            config,
            iptables.clone(),
            Arc::new(FakeInterfaces::failing()),
            opener.clone(),
        )
        .unwrap();
        load(&proxier, FOO).await;

        proxier.sync_proxy_rules().await.unwrap();
        assert!(opener.opened().is_empty());
        let text = iptables.last_restore().unwrap();
        assert!(!text.contains("-j KUBE-NODEPORTS"));
    }

    #[test]
    fn test_config_validation() {
        let ipt = FakeIptables::new();
        assert!(ProxierConfig::default().validate(&ipt).is_ok());

        let bad_bit = ProxierConfig {
            masquerade_bit: DROP_BIT,
            ..Default::default()
        };
        assert!(bad_bit.validate(&ipt).is_err());

        let v6 = ProxierConfig {
            family: IpFamily::V6,
            ..Default::default()
        };
        assert!(matches!(v6.validate(&ipt), Err(ProxyError::InvalidConfig(_))));
        assert!(v6.validate(&FakeIptables::new_v6()).is_ok());

        let wrong_cidr = ProxierConfig {
            cluster_cidr: Some("fd00::/48".parse().unwrap()),
            ..Default::default()
        };
        assert!(wrong_cidr.validate(&ipt).is_err());
    }

    #[test]
    fn test_jump_rule_args() {
        let args = JUMP_CHAINS[0].rule_args();
        assert_eq!(
            args.join(" "),
            "-m comment --comment kubernetes externally-visible service portals -m conntrack --ctstate NEW -j KUBE-EXTERNAL-SERVICES"
        );
    }

    #[test]
    fn test_jump_comments_carry_no_quotes() {
        for jump in JUMP_CHAINS {
            let args = jump.rule_args();
            let pos = args.iter().position(|a| a == "--comment").unwrap();
            assert_eq!(args[pos + 1], jump.comment);
            assert!(!args[pos + 1].contains('"'), "{}", args[pos + 1]);
        }
    }
}
