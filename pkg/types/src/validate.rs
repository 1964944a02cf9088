use anyhow::{Result, bail};
use ipnet::IpNet;

/// Validate a node hostname as used to match endpoint `node_name`s.
/// Rules: lowercase `[a-z0-9-.]`, max 253 chars, no leading/trailing hyphen or dot.
pub fn validate_hostname(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("hostname must not be empty");
    }
    if name.len() > 253 {
        bail!("hostname '{}' exceeds 253 characters (got {})", name, name.len());
    }
    if name.starts_with(['-', '.']) || name.ends_with(['-', '.']) {
        bail!("hostname '{}' must not start or end with a hyphen or dot", name);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        bail!(
            "hostname '{}' must contain only lowercase letters, digits, hyphens and dots",
            name
        );
    }
    Ok(())
}

/// The masquerade mark is a single fwmark bit.
pub fn validate_masquerade_bit(bit: u8) -> Result<()> {
    if bit > 31 {
        bail!("masquerade-bit must be within 0..=31 (got {})", bit);
    }
    if bit == pkg_constants::iptables::DROP_BIT {
        bail!("masquerade-bit {} collides with the drop mark bit", bit);
    }
    Ok(())
}

/// Parse a list of CIDRs, naming the offending entry on failure.
pub fn parse_cidrs(field: &str, cidrs: &[String]) -> Result<Vec<IpNet>> {
    cidrs
        .iter()
        .map(|c| match c.parse::<IpNet>() {
            Ok(net) => Ok(net),
            Err(e) => bail!("{}: invalid CIDR '{}': {}", field, c, e),
        })
        .collect()
}
