mod settings;
mod source;

use clap::Parser;
use pkg_proxy::cleanup::cleanup_leftovers;
use pkg_proxy::iptables::IptablesRunner;
use pkg_proxy::netif::SystemInterfaces;
use pkg_proxy::ports::SocketOpener;
use pkg_proxy::proxier::Proxier;
use pkg_proxy::runner::SyncRunner;
use pkg_types::config::{ProxyConfigFile, load_config_file};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::settings::{Cli, Settings};
use crate::source::StateFileSource;

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json);

    // Load config file (returns defaults if file not found)
    let file_cfg: ProxyConfigFile = load_config_file(&cli.config)?;
    info!("Config file: {}", cli.config);

    let settings = Settings::merge(&cli, file_cfg)?;
    let iptables = Arc::new(IptablesRunner::new(
        settings.proxier.family,
        settings.iptables_wait_secs,
    ));

    if cli.cleanup {
        let removed = cleanup_leftovers(iptables.as_ref()).await?;
        info!("Cleanup finished, {} chains removed", removed);
        return Ok(());
    }

    info!("Starting svcgate");
    info!("  Hostname:    {}", settings.proxier.hostname);
    info!("  Family:      {}", settings.proxier.family);
    info!("  State file:  {}", settings.state_file);
    info!(
        "  Sync period: {:?} (min {:?})",
        settings.sync_period, settings.min_sync_period
    );

    let proxier = Arc::new(Proxier::new(
        settings.proxier.clone(),
        iptables,
        Arc::new(SystemInterfaces),
        Arc::new(SocketOpener),
    )?);

    let (runner, handle) = SyncRunner::new(
        proxier.clone(),
        settings.min_sync_period,
        settings.sync_period,
    );
    let runner_task = runner.start();

    // The first pass runs once the snapshot has been loaded.
    let source = StateFileSource::new(
        settings.state_file.clone(),
        settings.proxier.hostname.clone(),
        settings.proxier.family,
    );
    let source_task = source.start(proxier, handle);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down svcgate");

    // Dropping the source's handle stops the runner after any pass in flight.
    source_task.abort();
    let _ = source_task.await;
    runner_task.await?;

    Ok(())
}
