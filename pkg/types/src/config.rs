use serde::{Deserialize, Serialize};

use crate::validate::{parse_cidrs, validate_hostname, validate_masquerade_bit};

/// Proxy daemon configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// hostname: worker-1
/// node-ip: 192.168.1.10
/// cluster-cidr: 10.42.0.0/16
/// node-port-addresses: [192.168.1.0/24]
/// masquerade-bit: 14
/// sync-period-secs: 30
/// min-sync-period-secs: 1
/// state-file: /var/lib/svcgate/state.yaml
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfigFile {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default, alias = "node-ip")]
    pub node_ip: Option<std::net::IpAddr>,
    #[serde(default)]
    pub ipv6: Option<bool>,
    #[serde(default, alias = "masquerade-all")]
    pub masquerade_all: Option<bool>,
    #[serde(default, alias = "masquerade-bit")]
    pub masquerade_bit: Option<u8>,
    #[serde(default, alias = "cluster-cidr")]
    pub cluster_cidr: Option<String>,
    #[serde(default, alias = "node-port-addresses")]
    pub node_port_addresses: Option<Vec<String>>,
    #[serde(default, alias = "sync-period-secs")]
    pub sync_period_secs: Option<u64>,
    #[serde(default, alias = "min-sync-period-secs")]
    pub min_sync_period_secs: Option<u64>,
    #[serde(default, alias = "large-cluster-endpoints-threshold")]
    pub large_cluster_endpoints_threshold: Option<usize>,
    #[serde(default, alias = "state-file")]
    pub state_file: Option<String>,
    #[serde(default, alias = "iptables-wait-secs")]
    pub iptables_wait_secs: Option<u64>,
}

impl ProxyConfigFile {
    /// Check the fields that are present; absent fields fall back to defaults later.
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(ref hostname) = self.hostname {
            validate_hostname(hostname)?;
        }
        if let Some(bit) = self.masquerade_bit {
            validate_masquerade_bit(bit)?;
        }
        if let Some(ref cidr) = self.cluster_cidr {
            parse_cidrs("cluster-cidr", std::slice::from_ref(cidr))?;
        }
        if let Some(ref cidrs) = self.node_port_addresses {
            parse_cidrs("node-port-addresses", cidrs)?;
        }
        if let (Some(min), Some(full)) = (self.min_sync_period_secs, self.sync_period_secs)
            && min > full
        {
            anyhow::bail!(
                "min-sync-period-secs ({}) must not exceed sync-period-secs ({})",
                min,
                full
            );
        }
        Ok(())
    }
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}
