//! Deterministic chain naming.
//!
//! Generated chain names are `<prefix><16 base32 chars>` where the suffix is
//! taken from a SHA-256 digest of the chain's identity. The same identity
//! always maps to the same name, which is what lets a pass reuse the
//! declaration line (and its counters) installed by the previous pass.

use pkg_constants::iptables::{
    CHAIN_HASH_LEN, ENDPOINT_CHAIN_PREFIX, FIREWALL_CHAIN_PREFIX, LOCAL_TRAFFIC_CHAIN_PREFIX,
    RESERVED_CHAIN_PREFIXES, SERVICE_CHAIN_PREFIX,
};
use sha2::{Digest, Sha256};

/// RFC 4648 base32 alphabet.
const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Hash `key` and append the truncated base32 digest to `prefix`.
pub fn hashed_name(prefix: &str, key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    let mut name = String::with_capacity(prefix.len() + CHAIN_HASH_LEN);
    name.push_str(prefix);
    // 10 bytes are exactly 16 base32 characters.
    encode_base32(&digest[..CHAIN_HASH_LEN * 5 / 8], &mut name);
    name
}

fn encode_base32(bytes: &[u8], out: &mut String) {
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for &b in bytes {
        buffer = (buffer << 8) | b as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
}

/// Per-service chain: cluster IP dispatch and endpoint fan-out.
pub fn service_chain(service_port_name: &str, protocol: &str) -> String {
    hashed_name(
        SERVICE_CHAIN_PREFIX,
        format!("{}{}", service_port_name, protocol).as_bytes(),
    )
}

/// Per-service chain used when external traffic must stay on this node.
pub fn local_traffic_chain(service_port_name: &str, protocol: &str) -> String {
    hashed_name(
        LOCAL_TRAFFIC_CHAIN_PREFIX,
        format!("{}{}", service_port_name, protocol).as_bytes(),
    )
}

/// Per (service, load balancer ingress address) source-range firewall chain.
pub fn firewall_chain(service_port_name: &str, protocol: &str, ingress: &str) -> String {
    hashed_name(
        FIREWALL_CHAIN_PREFIX,
        format!("{}{}{}", service_port_name, protocol, ingress).as_bytes(),
    )
}

/// Per (service, endpoint) chain doing the final DNAT. `endpoint` is `ip:port`.
pub fn endpoint_chain(service_port_name: &str, protocol: &str, endpoint: &str) -> String {
    hashed_name(
        ENDPOINT_CHAIN_PREFIX,
        format!("{}{}{}", service_port_name, protocol, endpoint).as_bytes(),
    )
}

/// Whether `chain` carries one of the generated-chain prefixes.
pub fn is_generated(chain: &str) -> bool {
    RESERVED_CHAIN_PREFIXES
        .iter()
        .any(|prefix| chain.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_constants::iptables::MAX_CHAIN_NAME_LEN;

    #[test]
    fn test_name_is_stable() {
        let a = service_chain("ns/foo:http", "tcp");
        let b = service_chain("ns/foo:http", "tcp");
        assert_eq!(a, b);
        assert!(a.starts_with("KUBE-SVC-"));
        assert_eq!(a.len(), "KUBE-SVC-".len() + CHAIN_HASH_LEN);
    }

    #[test]
    fn test_names_fit_ceiling() {
        for prefix in RESERVED_CHAIN_PREFIXES {
            let name = hashed_name(prefix, b"some/very-long-service-name:with-a-long-port-name");
            assert!(
                name.len() <= MAX_CHAIN_NAME_LEN,
                "{} exceeds {} chars",
                name,
                MAX_CHAIN_NAME_LEN
            );
        }
    }

    #[test]
    fn test_suffix_alphabet() {
        let name = endpoint_chain("ns/foo:http", "tcp", "10.1.0.1:8080");
        let suffix = &name[ENDPOINT_CHAIN_PREFIX.len()..];
        assert!(
            suffix
                .bytes()
                .all(|c| c.is_ascii_uppercase() || (b'2'..=b'7').contains(&c))
        );
    }

    #[test]
    fn test_identity_fields_matter() {
        let tcp = service_chain("ns/foo:http", "tcp");
        let udp = service_chain("ns/foo:http", "udp");
        assert_ne!(tcp, udp);

        let ep1 = endpoint_chain("ns/foo:http", "tcp", "10.1.0.1:8080");
        let ep2 = endpoint_chain("ns/foo:http", "tcp", "10.1.0.2:8080");
        assert_ne!(ep1, ep2);

        let fw1 = firewall_chain("ns/foo:http", "tcp", "1.2.3.4");
        let fw2 = firewall_chain("ns/foo:http", "tcp", "1.2.3.5");
        assert_ne!(fw1, fw2);
    }

    #[test]
    fn test_service_and_local_chain_share_suffix() {
        let svc = service_chain("ns/foo:http", "tcp");
        let xlb = local_traffic_chain("ns/foo:http", "tcp");
        assert_eq!(&svc["KUBE-SVC-".len()..], &xlb["KUBE-XLB-".len()..]);
    }

    #[test]
    fn test_base32_known_vector() {
        // RFC 4648 test vector: "foobar" -> "MZXW6YTBOI======"
        let mut out = String::new();
        encode_base32(b"foobar", &mut out);
        assert_eq!(out, "MZXW6YTBOI");
    }

    #[test]
    fn test_is_generated() {
        assert!(is_generated("KUBE-SVC-ABCDEFGHIJKLMNOP"));
        assert!(is_generated("KUBE-SEP-ABCDEFGHIJKLMNOP"));
        assert!(is_generated("KUBE-FW-ABCDEFGHIJKLMNOP"));
        assert!(is_generated("KUBE-XLB-ABCDEFGHIJKLMNOP"));
        assert!(!is_generated("KUBE-SERVICES"));
        assert!(!is_generated("KUBE-MARK-MASQ"));
        assert!(!is_generated("MY-CHAIN"));
    }
}
