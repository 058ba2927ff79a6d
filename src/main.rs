//! # Vigil Daemon
//!
//! Bootstraps the stores, the delivery channel, the DMS cycle engine, and
//! the scheduled dispatcher, then runs until interrupted.
//!
//! Usage:
//!   vigild                          # Start with ~/.vigil/config.toml
//!   vigild --config ./vigil.toml    # Explicit config
//!   vigild --dry-run                # Log sends instead of SMTP

use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use vigil_channels::{ConsoleSender, SmtpSender};
use vigil_core::traits::ChannelSender;
use vigil_core::{SystemClock, VigilConfig};
use vigil_dispatch::{DeliveryTracker, ScheduledDispatcher};
use vigil_dms::DmsEngine;
use vigil_store::SqliteStore;

#[derive(Parser)]
#[command(
    name = "vigild",
    version,
    about = "🕯️ Vigil — scheduled & Dead Man's Switch message delivery"
)]
struct Cli {
    /// Config file path (default: ~/.vigil/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database path override
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Poll interval override, in seconds
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Log sends instead of delivering via SMTP
    #[arg(long)]
    dry_run: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "vigil=debug,info" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let mut config = match &cli.config {
        Some(path) => VigilConfig::load_from(path)?,
        None => VigilConfig::load()?,
    };
    if let Some(secs) = cli.poll_interval {
        config.dispatcher.poll_interval_secs = secs;
    }
    if let Some(path) = &cli.db_path {
        config.storage.db_path = path.to_string_lossy().into_owned();
    }

    // Store and sender failures here are fatal — no message is touched
    // before the collaborators are reachable.
    let store = Arc::new(SqliteStore::open(Path::new(&config.storage.db_path))?);
    let sender: Arc<dyn ChannelSender> = if cli.dry_run || !config.smtp.is_configured() {
        tracing::warn!("⚠️ SMTP not configured — sends are logged, not delivered");
        Arc::new(ConsoleSender)
    } else {
        Arc::new(SmtpSender::new(&config.smtp)?)
    };
    let clock = Arc::new(SystemClock);

    let dms = Arc::new(DmsEngine::new(
        store.clone(),
        store.clone(),
        sender.clone(),
        store.clone(),
        clock.clone(),
    ));
    let tracker = Arc::new(DeliveryTracker::new(store.clone()));
    let dispatcher = Arc::new(ScheduledDispatcher::new(
        store.clone(),
        tracker,
        sender,
        store,
        clock,
        Some(dms),
        &config.dispatcher,
    ));

    dispatcher.start();
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    dispatcher.stop().await;
    Ok(())
}
