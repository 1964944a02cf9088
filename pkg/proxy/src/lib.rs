//! Service VIP rule synthesis for a table/chain based packet filter.
//!
//! One [`proxier::Proxier`] owns the desired state (services + endpoints),
//! the reserved host ports and the reusable rule buffers. Every pass reads
//! the installed ruleset back, synthesizes a complete replacement for the
//! `filter` and `nat` tables and applies it atomically.

pub mod chain;
pub mod cleanup;
pub mod endpoint;
pub mod error;
pub mod existing;
pub mod iptables;
pub mod local;
pub mod netif;
pub mod ports;
pub mod probability;
pub mod proxier;
pub mod rules;
pub mod runner;
pub mod service;
mod synthesizer;

#[cfg(test)]
mod testing;

pub use error::{ProxyError, Result};
