//! Packet-filter table, chain and mark constants.

// ─── Tables ────────────────────────────────────────────────────────────────

/// Name of the packet-filter table.
pub const TABLE_FILTER: &str = "filter";

/// Name of the address-translation table.
pub const TABLE_NAT: &str = "nat";

// ─── Built-in chains ──────────────────────────────────────────────────────

pub const CHAIN_INPUT: &str = "INPUT";
pub const CHAIN_OUTPUT: &str = "OUTPUT";
pub const CHAIN_FORWARD: &str = "FORWARD";
pub const CHAIN_PREROUTING: &str = "PREROUTING";
pub const CHAIN_POSTROUTING: &str = "POSTROUTING";

// ─── Managed top-level chains ─────────────────────────────────────────────

/// Entry point for all service VIP traffic (both tables).
pub const SERVICES_CHAIN: &str = "KUBE-SERVICES";

/// Rejects traffic to external addresses of services without endpoints.
pub const EXTERNAL_SERVICES_CHAIN: &str = "KUBE-EXTERNAL-SERVICES";

/// Node port dispatch (nat) and health-check accepts (filter).
pub const NODE_PORTS_CHAIN: &str = "KUBE-NODEPORTS";

/// Masquerades marked traffic on the way out.
pub const POSTROUTING_CHAIN: &str = "KUBE-POSTROUTING";

/// Sets the masquerade mark.
pub const MARK_MASQ_CHAIN: &str = "KUBE-MARK-MASQ";

/// Sets the drop mark.
pub const MARK_DROP_CHAIN: &str = "KUBE-MARK-DROP";

/// Forwarding accept rules.
pub const FORWARD_CHAIN: &str = "KUBE-FORWARD";

/// Filter chain dropping drop-marked packets.
pub const FIREWALL_CHAIN: &str = "KUBE-FIREWALL";

// ─── Generated chain prefixes ─────────────────────────────────────────────

pub const SERVICE_CHAIN_PREFIX: &str = "KUBE-SVC-";
pub const ENDPOINT_CHAIN_PREFIX: &str = "KUBE-SEP-";
pub const FIREWALL_CHAIN_PREFIX: &str = "KUBE-FW-";
pub const LOCAL_TRAFFIC_CHAIN_PREFIX: &str = "KUBE-XLB-";

/// Every generated chain starts with one of these. Stale-chain cleanup
/// only ever touches chains carrying one of them.
pub const RESERVED_CHAIN_PREFIXES: &[&str] = &[
    SERVICE_CHAIN_PREFIX,
    ENDPOINT_CHAIN_PREFIX,
    FIREWALL_CHAIN_PREFIX,
    LOCAL_TRAFFIC_CHAIN_PREFIX,
];

/// Hard ceiling the kernel puts on chain names.
pub const MAX_CHAIN_NAME_LEN: usize = 28;

/// Length of the hashed suffix of a generated chain name.
pub const CHAIN_HASH_LEN: usize = 16;

// ─── Marks ────────────────────────────────────────────────────────────────

/// Default fwmark bit used to flag packets for masquerading.
pub const DEFAULT_MASQUERADE_BIT: u8 = 14;

/// fwmark bit used by the drop-mark chain.
pub const DROP_BIT: u8 = 15;

/// Decimal digits used for statistic-match probabilities.
pub const PROBABILITY_PRECISION: usize = 10;
