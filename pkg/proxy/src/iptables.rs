//! Contract with the kernel packet-filter subsystem, plus the real
//! implementation that shells out to the iptables tools.

use async_trait::async_trait;
use pkg_constants::iptables::{TABLE_FILTER, TABLE_NAT};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{ProxyError, Result};
use crate::netif::IpFamily;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Filter,
    Nat,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Filter => TABLE_FILTER,
            Table::Nat => TABLE_NAT,
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations the proxy needs from the packet-filter subsystem.
/// Implementations: [`IptablesRunner`] (real tools), an in-memory fake in tests.
#[async_trait]
pub trait Iptables: Send + Sync {
    /// Create `chain` if missing. Returns true if it already existed.
    async fn ensure_chain(&self, table: Table, chain: &str) -> Result<bool>;

    /// Insert `args` at the head of `chain` if missing. Returns true if it already existed.
    async fn ensure_rule(&self, table: Table, chain: &str, args: &[String]) -> Result<bool>;

    /// Delete a rule if present. Missing rules are not an error.
    async fn delete_rule(&self, table: Table, chain: &str, args: &[String]) -> Result<()>;

    /// Append the current contents of `table` (save format) to `buffer`.
    async fn save_into(&self, table: Table, buffer: &mut Vec<u8>) -> Result<()>;

    /// Atomically install `data` (restore format, any number of tables).
    /// Chains not mentioned in `data` are left alone and counters in
    /// declaration lines are honored.
    async fn restore_all(&self, data: &[u8]) -> Result<()>;

    /// Whether this instance manages the IPv6 tables.
    fn is_ipv6(&self) -> bool;
}

/// Runs `iptables`, `iptables-save` and `iptables-restore` (or the `ip6tables`
/// variants) as subprocesses.
pub struct IptablesRunner {
    family: IpFamily,
    /// Seconds to wait for the xtables lock (`-w`).
    wait_secs: u64,
}

impl IptablesRunner {
    pub fn new(family: IpFamily, wait_secs: u64) -> Self {
        info!(
            "Using {} (lock wait {}s)",
            Self::binary_for(family),
            wait_secs
        );
        Self { family, wait_secs }
    }

    fn binary_for(family: IpFamily) -> &'static str {
        match family {
            IpFamily::V4 => "iptables",
            IpFamily::V6 => "ip6tables",
        }
    }

    fn binary(&self) -> &'static str {
        Self::binary_for(self.family)
    }

    fn save_binary(&self) -> &'static str {
        match self.family {
            IpFamily::V4 => "iptables-save",
            IpFamily::V6 => "ip6tables-save",
        }
    }

    fn restore_binary(&self) -> &'static str {
        match self.family {
            IpFamily::V4 => "iptables-restore",
            IpFamily::V6 => "ip6tables-restore",
        }
    }

    /// Run the main binary with `-w <secs>` and the given arguments.
    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        let wait = self.wait_secs.to_string();
        debug!("Running {} -w {} {}", self.binary(), wait, args.join(" "));
        Command::new(self.binary())
            .arg("-w")
            .arg(&wait)
            .args(args)
            .output()
            .await
            .map_err(|e| ProxyError::Command {
                program: self.binary().to_string(),
                source: e,
            })
    }

    /// `-C` exits 1 when the rule does not exist; anything else is a real failure.
    async fn check_rule(&self, table: Table, chain: &str, args: &[String]) -> Result<bool> {
        let mut argv = vec!["-t", table.as_str(), "-C", chain];
        argv.extend(args.iter().map(String::as_str));
        let output = self.run(&argv).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(ProxyError::EnsureRule {
                table,
                from: chain.to_string(),
                chain: args.last().cloned().unwrap_or_default(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }
}

#[async_trait]
impl Iptables for IptablesRunner {
    async fn ensure_chain(&self, table: Table, chain: &str) -> Result<bool> {
        let output = self.run(&["-t", table.as_str(), "-N", chain]).await?;
        if output.status.success() {
            return Ok(false);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.code() == Some(1) && stderr.contains("already exists") {
            return Ok(true);
        }
        Err(ProxyError::EnsureChain {
            table,
            chain: chain.to_string(),
            reason: stderr.trim().to_string(),
        })
    }

    async fn ensure_rule(&self, table: Table, chain: &str, args: &[String]) -> Result<bool> {
        if self.check_rule(table, chain, args).await? {
            return Ok(true);
        }
        let mut argv = vec!["-t", table.as_str(), "-I", chain];
        argv.extend(args.iter().map(String::as_str));
        let output = self.run(&argv).await?;
        if !output.status.success() {
            return Err(ProxyError::EnsureRule {
                table,
                from: chain.to_string(),
                chain: args.last().cloned().unwrap_or_default(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(false)
    }

    async fn delete_rule(&self, table: Table, chain: &str, args: &[String]) -> Result<()> {
        if !self.check_rule(table, chain, args).await? {
            return Ok(());
        }
        let mut argv = vec!["-t", table.as_str(), "-D", chain];
        argv.extend(args.iter().map(String::as_str));
        let output = self.run(&argv).await?;
        if !output.status.success() {
            return Err(ProxyError::EnsureRule {
                table,
                from: chain.to_string(),
                chain: args.last().cloned().unwrap_or_default(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn save_into(&self, table: Table, buffer: &mut Vec<u8>) -> Result<()> {
        let output = Command::new(self.save_binary())
            .args(["-t", table.as_str()])
            .output()
            .await
            .map_err(|e| ProxyError::Command {
                program: self.save_binary().to_string(),
                source: e,
            })?;
        if !output.status.success() {
            return Err(ProxyError::Save {
                table,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        buffer.extend_from_slice(&output.stdout);
        Ok(())
    }

    async fn restore_all(&self, data: &[u8]) -> Result<()> {
        let program = self.restore_binary();
        let command_error = |e| ProxyError::Command {
            program: program.to_string(),
            source: e,
        };

        let mut child = Command::new(program)
            .arg("-w")
            .arg(self.wait_secs.to_string())
            .arg("--noflush")
            .arg("--counters")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(command_error)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(data).await.map_err(command_error)?;
            // Dropping stdin closes the pipe so the restore can commit.
        }

        let output = child.wait_with_output().await.map_err(command_error)?;
        if !output.status.success() {
            return Err(ProxyError::Restore(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    fn is_ipv6(&self) -> bool {
        self.family == IpFamily::V6
    }
}
