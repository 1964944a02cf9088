use anyhow::bail;
use clap::Parser;
use pkg_constants::iptables::DEFAULT_MASQUERADE_BIT;
use pkg_constants::network::{
    DEFAULT_HOSTNAME, DEFAULT_IPTABLES_WAIT_SECS, DEFAULT_LARGE_CLUSTER_ENDPOINTS_THRESHOLD,
    DEFAULT_MIN_SYNC_PERIOD_SECS, DEFAULT_SYNC_PERIOD_SECS,
};
use pkg_constants::paths::{DEFAULT_PROXY_CONFIG, DEFAULT_STATE_FILE};
use pkg_proxy::netif::IpFamily;
use pkg_proxy::proxier::ProxierConfig;
use pkg_types::config::ProxyConfigFile;
use pkg_types::validate::{parse_cidrs, validate_hostname, validate_masquerade_bit};
use std::net::IpAddr;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "svcgate", about = "Service VIP rule synthesizer for iptables")]
pub struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_PROXY_CONFIG)]
    pub config: String,

    /// Node name used to recognise local endpoints
    #[arg(long)]
    pub hostname: Option<String>,

    /// Primary node address
    #[arg(long)]
    pub node_ip: Option<IpAddr>,

    /// Program ip6tables instead of iptables
    #[arg(long)]
    pub ipv6: bool,

    /// SNAT all traffic sent to cluster IPs
    #[arg(long)]
    pub masquerade_all: bool,

    /// fwmark bit flagging packets for SNAT
    #[arg(long)]
    pub masquerade_bit: Option<u8>,

    /// Pod network CIDR; enables local traffic detection
    #[arg(long)]
    pub cluster_cidr: Option<String>,

    /// CIDRs selecting node port addresses (comma separated, empty = all)
    #[arg(long, value_delimiter = ',')]
    pub node_port_addresses: Vec<String>,

    /// Full resync period in seconds
    #[arg(long)]
    pub sync_period_secs: Option<u64>,

    /// Minimum seconds between two passes
    #[arg(long)]
    pub min_sync_period_secs: Option<u64>,

    /// Above this many endpoints, rule comments are dropped
    #[arg(long)]
    pub large_cluster_endpoints_threshold: Option<usize>,

    /// Service/endpoint snapshot to render
    #[arg(long)]
    pub state_file: Option<String>,

    /// Seconds to wait for the xtables lock
    #[arg(long)]
    pub iptables_wait_secs: Option<u64>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,

    /// Remove every installed rule and chain, then exit
    #[arg(long)]
    pub cleanup: bool,
}

/// Effective daemon settings after merging CLI, file and defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub proxier: ProxierConfig,
    pub sync_period: Duration,
    pub min_sync_period: Duration,
    pub state_file: String,
    pub iptables_wait_secs: u64,
}

impl Settings {
    /// Merge: CLI args > config file > defaults.
    pub fn merge(cli: &Cli, file_cfg: ProxyConfigFile) -> anyhow::Result<Self> {
        file_cfg.validate()?;

        let hostname = cli
            .hostname
            .clone()
            .or(file_cfg.hostname)
            .unwrap_or_else(|| DEFAULT_HOSTNAME.to_string());
        validate_hostname(&hostname)?;

        let masquerade_bit = cli
            .masquerade_bit
            .or(file_cfg.masquerade_bit)
            .unwrap_or(DEFAULT_MASQUERADE_BIT);
        validate_masquerade_bit(masquerade_bit)?;

        let cluster_cidr = match cli.cluster_cidr.clone().or(file_cfg.cluster_cidr) {
            Some(cidr) => parse_cidrs("cluster-cidr", &[cidr])?.pop(),
            None => None,
        };
        let node_port_addresses = if cli.node_port_addresses.is_empty() {
            file_cfg.node_port_addresses.unwrap_or_default()
        } else {
            cli.node_port_addresses.clone()
        };
        let node_port_addresses = parse_cidrs("node-port-addresses", &node_port_addresses)?;

        let sync_period_secs = cli
            .sync_period_secs
            .or(file_cfg.sync_period_secs)
            .unwrap_or(DEFAULT_SYNC_PERIOD_SECS);
        let min_sync_period_secs = cli
            .min_sync_period_secs
            .or(file_cfg.min_sync_period_secs)
            .unwrap_or(DEFAULT_MIN_SYNC_PERIOD_SECS);
        if sync_period_secs == 0 {
            bail!("sync-period-secs must be positive");
        }
        if min_sync_period_secs > sync_period_secs {
            bail!(
                "min-sync-period-secs ({}) must not exceed sync-period-secs ({})",
                min_sync_period_secs,
                sync_period_secs
            );
        }

        let family = if cli.ipv6 || file_cfg.ipv6.unwrap_or(false) {
            IpFamily::V6
        } else {
            IpFamily::V4
        };

        Ok(Self {
            proxier: ProxierConfig {
                hostname,
                node_ip: cli.node_ip.or(file_cfg.node_ip),
                family,
                masquerade_all: cli.masquerade_all || file_cfg.masquerade_all.unwrap_or(false),
                masquerade_bit,
                cluster_cidr,
                node_port_addresses,
                large_cluster_endpoints_threshold: cli
                    .large_cluster_endpoints_threshold
                    .or(file_cfg.large_cluster_endpoints_threshold)
                    .unwrap_or(DEFAULT_LARGE_CLUSTER_ENDPOINTS_THRESHOLD),
            },
            sync_period: Duration::from_secs(sync_period_secs),
            min_sync_period: Duration::from_secs(min_sync_period_secs),
            state_file: cli
                .state_file
                .clone()
                .or(file_cfg.state_file)
                .unwrap_or_else(|| DEFAULT_STATE_FILE.to_string()),
            iptables_wait_secs: cli
                .iptables_wait_secs
                .or(file_cfg.iptables_wait_secs)
                .unwrap_or(DEFAULT_IPTABLES_WAIT_SECS),
        })
    }
}
