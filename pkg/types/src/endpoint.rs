use serde::{Deserialize, Serialize};
use std::net::IpAddr;

fn default_true() -> bool {
    true
}

/// One backend of a Service. A backend may carry several addresses,
/// typically one per IP family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointAddress {
    pub addresses: Vec<IpAddr>,
    /// Node hosting the backend; compared against the proxy's own hostname
    /// to decide whether the endpoint is node-local.
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default = "default_true")]
    pub ready: bool,
    #[serde(default)]
    pub serving: Option<bool>,
    #[serde(default)]
    pub terminating: bool,
}

/// Endpoints represents the set of backend addresses for a Service.
/// Equivalent to the union of a Service's EndpointSlices in Kubernetes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoints {
    pub service_name: String,
    pub namespace: String,
    #[serde(default)]
    pub endpoints: Vec<EndpointAddress>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_defaults() {
        let yaml = r#"
service_name: foo
namespace: ns
endpoints:
  - addresses: [10.1.0.1, "fd00::1"]
"#;
        let eps: Endpoints = serde_yaml::from_str(yaml).unwrap();
        let ep = &eps.endpoints[0];
        assert!(ep.ready);
        assert!(!ep.terminating);
        assert!(ep.serving.is_none());
        assert_eq!(ep.addresses.len(), 2);
    }
}
