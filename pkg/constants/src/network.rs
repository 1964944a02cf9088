//! Network and scheduling constants.

/// Default node name used to recognise node-local endpoints.
pub const DEFAULT_HOSTNAME: &str = "node-1";

/// Default full resync interval, in seconds.
pub const DEFAULT_SYNC_PERIOD_SECS: u64 = 30;

/// Default minimum interval between two passes, in seconds.
pub const DEFAULT_MIN_SYNC_PERIOD_SECS: u64 = 1;

/// Above this many endpoints, per-endpoint rules are emitted without comments.
pub const DEFAULT_LARGE_CLUSTER_ENDPOINTS_THRESHOLD: usize = 1000;

/// Seconds the iptables tools wait for the xtables lock.
pub const DEFAULT_IPTABLES_WAIT_SECS: u64 = 5;

/// How often the state file is polled for changes, in milliseconds.
pub const STATE_FILE_POLL_MS: u64 = 500;

/// Default ClientIP session affinity window (3 hours), in seconds.
pub const DEFAULT_AFFINITY_TIMEOUT_SECS: u32 = 10_800;

/// Loopback source ranges, used for the node-port martian-source carve-out.
pub const LOOPBACK_CIDR_V4: &str = "127.0.0.0/8";
pub const LOOPBACK_CIDR_V6: &str = "::1/128";
