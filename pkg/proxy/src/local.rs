use ipnet::IpNet;

/// Tells pod-originated traffic apart from everything else.
///
/// With a cluster CIDR configured, "local" means "sourced from a pod on the
/// cluster network". Without one, the detector is a no-op and callers skip
/// the rules that depend on it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LocalTrafficDetector {
    #[default]
    NoOp,
    ClusterCidr(IpNet),
}

impl LocalTrafficDetector {
    pub fn new(cluster_cidr: Option<IpNet>) -> Self {
        match cluster_cidr {
            Some(cidr) => LocalTrafficDetector::ClusterCidr(cidr),
            None => LocalTrafficDetector::NoOp,
        }
    }

    pub fn is_implemented(&self) -> bool {
        matches!(self, LocalTrafficDetector::ClusterCidr(_))
    }

    /// Match fragment for pod-originated traffic.
    pub fn if_local(&self) -> Vec<String> {
        match self {
            LocalTrafficDetector::NoOp => Vec::new(),
            LocalTrafficDetector::ClusterCidr(cidr) => vec!["-s".into(), cidr.to_string()],
        }
    }

    /// Match fragment for traffic not originated by a pod.
    pub fn if_not_local(&self) -> Vec<String> {
        match self {
            LocalTrafficDetector::NoOp => Vec::new(),
            LocalTrafficDetector::ClusterCidr(cidr) => {
                vec!["!".into(), "-s".into(), cidr.to_string()]
            }
        }
    }

    /// Match fragment for traffic addressed to a pod.
    pub fn if_local_destination(&self) -> Vec<String> {
        match self {
            LocalTrafficDetector::NoOp => Vec::new(),
            LocalTrafficDetector::ClusterCidr(cidr) => vec!["-d".into(), cidr.to_string()],
        }
    }
}
