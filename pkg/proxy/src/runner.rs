//! Bounded-frequency pass scheduling.
//!
//! Triggers coalesce into at most one pending pass and passes never
//! overlap. Two passes are at least `min_interval` apart, and a full
//! resync runs every `max_interval` even without triggers.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::proxier::Proxier;

/// Something that can run one pass.
#[async_trait]
pub trait RuleSync: Send + Sync {
    async fn sync(&self) -> Result<()>;
}

#[async_trait]
impl RuleSync for Proxier {
    async fn sync(&self) -> Result<()> {
        self.sync_proxy_rules().await.map(|_| ())
    }
}

/// Requests passes from a running [`SyncRunner`]. The runner stops once
/// every handle is dropped.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<()>,
}

impl SyncHandle {
    /// Ask for a pass. A no-op while one is already pending.
    pub fn trigger(&self) {
        if self.tx.try_send(()).is_err() {
            debug!("SyncRunner: pass already pending");
        }
    }
}

pub struct SyncRunner {
    target: Arc<dyn RuleSync>,
    min_interval: Duration,
    max_interval: Duration,
    rx: mpsc::Receiver<()>,
}

impl SyncRunner {
    pub fn new(
        target: Arc<dyn RuleSync>,
        min_interval: Duration,
        max_interval: Duration,
    ) -> (Self, SyncHandle) {
        let (tx, rx) = mpsc::channel(1);
        let runner = Self {
            target,
            min_interval,
            max_interval,
            rx,
        };
        (runner, SyncHandle { tx })
    }

    /// Start the loop as a background task. Nothing runs until the first
    /// trigger or the first `max_interval` tick, so the owner can load a
    /// snapshot before the initial pass.
    pub fn start(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "SyncRunner started (min={:?}, max={:?})",
                self.min_interval, self.max_interval
            );
            let mut interval =
                tokio::time::interval_at(Instant::now() + self.max_interval, self.max_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_run: Option<Instant> = None;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        debug!("SyncRunner: periodic resync");
                    }
                    msg = self.rx.recv() => {
                        if msg.is_none() {
                            info!("SyncRunner: all handles dropped, stopping");
                            break;
                        }
                    }
                }

                if let Some(last) = last_run {
                    let earliest = last + self.min_interval;
                    if Instant::now() < earliest {
                        tokio::time::sleep_until(earliest).await;
                    }
                }
                // Triggers that arrived while waiting are served by this pass.
                while self.rx.try_recv().is_ok() {}

                if let Err(e) = self.target.sync().await {
                    warn!("SyncRunner: pass failed: {}", e);
                }
                last_run = Some(Instant::now());
                interval.reset();
            }
        })
    }
}
