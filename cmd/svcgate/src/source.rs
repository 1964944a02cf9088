use anyhow::Context;
use pkg_constants::network::STATE_FILE_POLL_MS;
use pkg_proxy::endpoint::{EndpointsMap, build_snapshot};
use pkg_proxy::netif::IpFamily;
use pkg_proxy::proxier::Proxier;
use pkg_proxy::runner::SyncHandle;
use pkg_proxy::service::ServicesSnapshot;
use pkg_types::snapshot::StateSnapshot;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

/// Feeds the proxier from a YAML snapshot on disk, reloading it whenever
/// its modification time changes.
pub struct StateFileSource {
    path: String,
    hostname: String,
    family: IpFamily,
    last_modified: Option<SystemTime>,
    failing: bool,
}

impl StateFileSource {
    pub fn new(path: String, hostname: String, family: IpFamily) -> Self {
        Self {
            path,
            hostname,
            family,
            last_modified: None,
            failing: false,
        }
    }

    /// Load the snapshot if it changed since the last successful load.
    pub fn poll(&mut self) -> anyhow::Result<Option<(ServicesSnapshot, EndpointsMap)>> {
        let modified = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .with_context(|| format!("failed to stat state file {}", self.path))?;
        if self.last_modified == Some(modified) {
            return Ok(None);
        }
        let state = StateSnapshot::load(&self.path)?;
        self.last_modified = Some(modified);
        Ok(Some(build_snapshot(&state, self.family, &self.hostname)))
    }

    /// Start polling as a background task. Every new snapshot is handed to
    /// the proxier and followed by a pass request.
    pub fn start(mut self, proxier: Arc<Proxier>, handle: SyncHandle) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("StateFileSource watching {}", self.path);
            let mut interval = tokio::time::interval(Duration::from_millis(STATE_FILE_POLL_MS));
            loop {
                interval.tick().await;
                match self.poll() {
                    Ok(Some((services, endpoints))) => {
                        info!(
                            "StateFileSource: loaded {} service ports from {}",
                            services.len(),
                            self.path
                        );
                        self.failing = false;
                        proxier.update(services, endpoints).await;
                        handle.trigger();
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // Report once per failure streak.
                        if !self.failing {
                            warn!("StateFileSource: {:#}", e);
                            self.failing = true;
                        }
                    }
                }
            }
        })
    }
}
