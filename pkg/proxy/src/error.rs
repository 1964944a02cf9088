use thiserror::Error;

use crate::iptables::Table;

/// Errors surfaced by the proxy core.
///
/// Only `EnsureChain`, `EnsureRule` and `Restore` abort a pass; the others are
/// logged by the pass and degrade it.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to ensure chain {chain} in table {table}: {reason}")]
    EnsureChain {
        table: Table,
        chain: String,
        reason: String,
    },

    #[error("failed to ensure jump {from} -> {chain} in table {table}: {reason}")]
    EnsureRule {
        table: Table,
        from: String,
        chain: String,
        reason: String,
    },

    #[error("failed to dump table {table}: {reason}")]
    Save { table: Table, reason: String },

    #[error("atomic restore rejected: {0}")]
    Restore(String),

    #[error("failed to run {program}: {source}")]
    Command {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("can't open port {port}: {source}")]
    PortOpen {
        port: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid proxy configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
