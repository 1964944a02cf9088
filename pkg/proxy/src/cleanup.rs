//! Removal of everything the proxier ever installed.

use std::collections::BTreeSet;
use tracing::{error, info};

use crate::chain;
use crate::error::Result;
use crate::existing::read_existing_chains;
use crate::iptables::{Iptables, Table};
use crate::proxier::JUMP_CHAINS;
use crate::rules::RuleSet;
use crate::synthesizer::{FILTER_CHAINS, NAT_CHAINS};

/// Delete the fixed jump rules, then flush and delete every managed chain
/// in both tables. Chains outside the managed namespace are untouched.
///
/// Jump-rule deletion failures are logged and do not stop the cleanup;
/// a rejected restore is returned.
pub async fn cleanup_leftovers(iptables: &dyn Iptables) -> Result<usize> {
    for jump in JUMP_CHAINS {
        if let Err(e) = iptables
            .delete_rule(jump.table, jump.source, &jump.rule_args())
            .await
        {
            error!(
                "Cleanup: failed to delete jump {} -> {} in table {}: {}",
                jump.source, jump.chain, jump.table, e
            );
        }
    }

    let mut buffer = Vec::new();
    let mut rules = RuleSet::new();
    let mut removed = 0;
    for table in [Table::Filter, Table::Nat] {
        let existing = read_existing_chains(iptables, table, &mut buffer).await;
        let managed: BTreeSet<&String> = existing
            .keys()
            .filter(|c| is_managed(table, c))
            .collect();
        let out = match table {
            Table::Filter => &mut rules.filter,
            Table::Nat => &mut rules.nat,
        };
        // Flush everything first: a chain can't go while another still jumps to it.
        for name in &managed {
            out.declare_chain(name, &existing);
        }
        for name in &managed {
            out.delete_chain(name);
        }
        out.commit();
        removed += managed.len();
    }

    if removed == 0 {
        info!("Cleanup: nothing to remove");
        return Ok(0);
    }
    iptables.restore_all(rules.serialize()).await?;
    info!("Cleanup: removed {} chains", removed);
    Ok(removed)
}

fn is_managed(table: Table, name: &str) -> bool {
    let top_level = match table {
        Table::Filter => FILTER_CHAINS,
        Table::Nat => NAT_CHAINS,
    };
    chain::is_generated(name) || top_level.contains(&name)
}
