//! In-memory stand-ins for the host: packet filter, port binding and
//! interface enumeration.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use crate::error::{ProxyError, Result};
use crate::iptables::{Iptables, Table};
use crate::netif::NetworkInterfaces;
use crate::ports::{LocalPort, PortHandle, PortOpener};

/// A rule recorded by [`FakeIptables`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRule {
    pub table: Table,
    pub chain: String,
    pub args: Vec<String>,
}

#[derive(Debug, Default)]
struct FakeIptablesState {
    dumps: HashMap<Table, String>,
    restores: Vec<String>,
    chains: HashSet<(Table, String)>,
    rules: Vec<RecordedRule>,
    deleted: Vec<RecordedRule>,
    fail_save: bool,
    fail_restore: bool,
    fail_chain: Option<String>,
}

/// Packet filter that records what it is asked to do.
#[derive(Debug, Default)]
pub struct FakeIptables {
    ipv6: bool,
    state: Mutex<FakeIptablesState>,
}

impl FakeIptables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_v6() -> Self {
        Self {
            ipv6: true,
            ..Default::default()
        }
    }

    /// What `save_into(table)` returns.
    pub fn set_dump(&self, table: Table, dump: &str) {
        self.state.lock().unwrap().dumps.insert(table, dump.to_string());
    }

    pub fn fail_save(&self, fail: bool) {
        self.state.lock().unwrap().fail_save = fail;
    }

    pub fn fail_restore(&self, fail: bool) {
        self.state.lock().unwrap().fail_restore = fail;
    }

    /// Make `ensure_chain` fail for `chain`.
    pub fn fail_ensure_chain(&self, chain: &str) {
        self.state.lock().unwrap().fail_chain = Some(chain.to_string());
    }

    /// Every payload handed to `restore_all`, accepted or not.
    pub fn restores(&self) -> Vec<String> {
        self.state.lock().unwrap().restores.clone()
    }

    pub fn last_restore(&self) -> Option<String> {
        self.state.lock().unwrap().restores.last().cloned()
    }

    pub fn rules(&self) -> Vec<RecordedRule> {
        self.state.lock().unwrap().rules.clone()
    }

    pub fn deleted_rules(&self) -> Vec<RecordedRule> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn has_chain(&self, table: Table, chain: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .chains
            .contains(&(table, chain.to_string()))
    }
}

#[async_trait]
impl Iptables for FakeIptables {
    async fn ensure_chain(&self, table: Table, chain: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.fail_chain.as_deref() == Some(chain) {
            return Err(ProxyError::EnsureChain {
                table,
                chain: chain.to_string(),
                reason: "permission denied".to_string(),
            });
        }
        Ok(!state.chains.insert((table, chain.to_string())))
    }

    async fn ensure_rule(&self, table: Table, chain: &str, args: &[String]) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let rule = RecordedRule {
            table,
            chain: chain.to_string(),
            args: args.to_vec(),
        };
        if state.rules.contains(&rule) {
            return Ok(true);
        }
        state.rules.push(rule);
        Ok(false)
    }

    async fn delete_rule(&self, table: Table, chain: &str, args: &[String]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let rule = RecordedRule {
            table,
            chain: chain.to_string(),
            args: args.to_vec(),
        };
        state.rules.retain(|r| r != &rule);
        state.deleted.push(rule);
        Ok(())
    }

    async fn save_into(&self, table: Table, buffer: &mut Vec<u8>) -> Result<()> {
        let state = self.state.lock().unwrap();
        if state.fail_save {
            return Err(ProxyError::Save {
                table,
                reason: "save failed".to_string(),
            });
        }
        if let Some(dump) = state.dumps.get(&table) {
            buffer.extend_from_slice(dump.as_bytes());
        }
        Ok(())
    }

    async fn restore_all(&self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.restores.push(String::from_utf8_lossy(data).into_owned());
        if state.fail_restore {
            return Err(ProxyError::Restore("line 7 failed".to_string()));
        }
        Ok(())
    }

    fn is_ipv6(&self) -> bool {
        self.ipv6
    }
}

#[derive(Debug)]
struct FakeHandle {
    port: LocalPort,
    closed: Arc<Mutex<Vec<LocalPort>>>,
}

impl PortHandle for FakeHandle {
    fn close(self: Box<Self>) -> std::io::Result<()> {
        self.closed.lock().unwrap().push(self.port.clone());
        Ok(())
    }
}

/// Port opener that never touches the network.
#[derive(Debug, Default)]
pub struct FakePortOpener {
    opened: Mutex<Vec<LocalPort>>,
    closed: Arc<Mutex<Vec<LocalPort>>>,
    failing: Mutex<HashSet<u16>>,
}

impl FakePortOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opening `port` on any address fails with `AddrInUse`.
    pub fn fail_port(&self, port: u16) {
        self.failing.lock().unwrap().insert(port);
    }

    pub fn opened(&self) -> Vec<LocalPort> {
        self.opened.lock().unwrap().clone()
    }

    pub fn closed(&self) -> Vec<LocalPort> {
        self.closed.lock().unwrap().clone()
    }
}

impl PortOpener for FakePortOpener {
    fn open_local_port(&self, port: &LocalPort) -> std::io::Result<Box<dyn PortHandle>> {
        if self.failing.lock().unwrap().contains(&port.port) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "address already in use",
            ));
        }
        self.opened.lock().unwrap().push(port.clone());
        Ok(Box::new(FakeHandle {
            port: port.clone(),
            closed: self.closed.clone(),
        }))
    }
}

/// Fixed interface address list.
#[derive(Debug, Default)]
pub struct FakeInterfaces {
    addresses: Vec<IpAddr>,
    fail: bool,
}

impl FakeInterfaces {
    pub fn new(addresses: &[&str]) -> Self {
        Self {
            addresses: addresses.iter().map(|a| a.parse().unwrap()).collect(),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            addresses: Vec::new(),
            fail: true,
        }
    }
}

impl NetworkInterfaces for FakeInterfaces {
    fn addresses(&self) -> std::io::Result<Vec<IpAddr>> {
        if self.fail {
            return Err(std::io::Error::other("interface listing failed"));
        }
        Ok(self.addresses.clone())
    }
}
