use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoints;
use crate::service::Service;

/// The full desired state handed to the proxy by the state source.
///
/// Example `state.yaml`:
/// ```yaml
/// services:
///   - name: foo
///     namespace: ns
///     spec:
///       cluster_ip: 10.0.0.5
///       ports:
///         - name: http
///           port: 80
///           target_port: 8080
/// endpoints:
///   - service_name: foo
///     namespace: ns
///     endpoints:
///       - addresses: [10.1.0.1]
///         node_name: node-1
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub endpoints: Vec<Endpoints>,
}

impl StateSnapshot {
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(content).context("invalid state snapshot")
    }

    /// Read a snapshot from disk. Unlike config files, a missing snapshot is an error.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read state file {}", path))?;
        Self::from_yaml(&content)
    }
}
