//! Parking coordinator - central authority for occupancy, billing and history
//!
//! Accepts floor-controller connections, reconciles their ENTRY/EXIT events
//! and answers statistics and facility-control requests.
//!
//! Usage:
//!   cargo run --bin parking-central -- --config config/parking.toml

use anyhow::Context;
use clap::Parser;
use parking_gateway::infra::logging::init_tracing;
use parking_gateway::infra::{Config, Metrics};
use parking_gateway::io::store::{JournalStore, MemoryStore, Store};
use parking_gateway::io::{prometheus, server};
use parking_gateway::services::{Coordinator, CoordinatorSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Parking coordinator
#[derive(Parser, Debug)]
#[command(name = "parking-central", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/parking.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let config_path = args.config.unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);
    info!(git_hash = env!("PARKING_GIT_HASH"), "parking_central_starting");
    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        bind = %config.central_bind_address(),
        port = config.central_port(),
        total_spaces = config.total_spaces(),
        price_per_minute = config.price_per_minute(),
        minimum_fee = config.minimum_fee(),
        unknown_exit_policy = ?config.unknown_exit_policy(),
        journal_file = config.journal_file().unwrap_or("-"),
        prometheus_port = config.prometheus_port(),
        "config_loaded"
    );

    let store: Arc<dyn Store> = match config.journal_file() {
        Some(path) => Arc::new(JournalStore::open(path).with_context(|| format!("opening journal {path}"))?),
        None => Arc::new(MemoryStore::new()),
    };

    let metrics = Arc::new(Metrics::new());
    let coordinator = Arc::new(Coordinator::new(CoordinatorSettings::from_config(&config), store, metrics.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = server::bind(&config).await.context("binding coordinator listener")?;
    let server_task = tokio::spawn(server::serve(listener, coordinator.clone(), shutdown_rx.clone()));

    // Prometheus endpoint (port 0 disables it)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let metrics = metrics.clone();
        let coordinator = coordinator.clone();
        let site = config.site_id().to_string();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = prometheus::start_metrics_server(prometheus_port, metrics, coordinator, site, shutdown).await {
                error!(error = %e, "prometheus_server_error");
            }
        });
    }

    // Periodic metrics report
    {
        let metrics = metrics.clone();
        let coordinator = coordinator.clone();
        let interval = Duration::from_secs(config.metrics_interval_secs().max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let occupancy = coordinator.occupancy();
                metrics.report(occupancy.occupied(), occupancy.total()).log();
            }
        });
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);
    let _ = server_task.await;

    let stats = coordinator.get_statistics();
    info!(occupied = stats.occupied, total = stats.total, revenue = stats.revenue_window, "parking_central_stopped");
    Ok(())
}
