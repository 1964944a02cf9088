//! Reading back the installed ruleset.

use std::collections::HashMap;
use tracing::warn;

use crate::iptables::{Iptables, Table};

/// Chain name -> raw declaration line (`:NAME POLICY [packets:bytes]`).
pub type ExistingChains = HashMap<String, String>;

/// Extract the chain declaration lines of `table` from a save-format dump.
///
/// Lines are kept verbatim so re-emitting them preserves counters. Only the
/// section belonging to `table` is scanned; it ends at `COMMIT`.
pub fn parse_chain_lines(table: Table, dump: &[u8]) -> ExistingChains {
    let text = String::from_utf8_lossy(dump);
    let header = format!("*{}", table);
    let mut chains = ExistingChains::new();
    let mut in_table = false;

    for line in text.lines() {
        if !in_table {
            in_table = line == header;
            continue;
        }
        if line == "COMMIT" || line.starts_with('*') {
            break;
        }
        if let Some(decl) = line.strip_prefix(':') {
            let name = decl.split_whitespace().next().unwrap_or_default();
            if !name.is_empty() {
                chains.insert(name.to_string(), line.to_string());
            }
        }
    }
    chains
}

/// Dump and parse `table`. A failed dump degrades to "nothing installed":
/// every chain is recreated from zero counters.
pub async fn read_existing_chains(
    iptables: &dyn Iptables,
    table: Table,
    buffer: &mut Vec<u8>,
) -> ExistingChains {
    buffer.clear();
    match iptables.save_into(table, buffer).await {
        Ok(()) => parse_chain_lines(table, buffer),
        Err(e) => {
            warn!(
                "Failed to read existing {} table, counters will reset: {}",
                table, e
            );
            ExistingChains::new()
        }
    }
}
