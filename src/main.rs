//! Parking floor controller
//!
//! Drives the lanes of one floor: presence sensors and barriers over the
//! MODBUS RTU bus, plate capture, authorization by the coordinator, and the
//! free-space display.
//!
//! Module structure:
//! - `domain/` - Core business types (Event, Plate, VehicleSession, Tariff)
//! - `io/` - External interfaces (MODBUS bus, plate capture, coordinator link, store)
//! - `services/` - Business logic (lane state machine, coordinator, display)
//! - `infra/` - Infrastructure (Config, Metrics, logging)

use clap::Parser;
use parking_gateway::domain::LaneRole;
use parking_gateway::infra::logging::init_tracing;
use parking_gateway::infra::{Config, Metrics, OperatingMode};
use parking_gateway::io::lpr::{PlateCapture, PlatePool, SimulatedLpr};
use parking_gateway::io::sim_traffic::TrafficGenerator;
use parking_gateway::io::{create_bus_client, ClientSettings, CoordinatorClient};
use parking_gateway::services::{
    create_lane_worker, DisplayUpdater, LaneHandle, LaneMachine, LaneSettings, WorkerSettings,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

/// Parking floor controller
#[derive(Parser, Debug)]
#[command(name = "parking-floor", version, about)]
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
    info!(git_hash = env!("PARKING_GIT_HASH"), "parking_floor_starting");
    info!(
        config_file = %config.config_file(),
        mode = config.operating_mode().as_str(),
        floor = %config.floor_id(),
        central = %config.central_addr(),
        serial_device = %config.serial_device(),
        baud = config.serial_baud(),
        lanes = config.lanes().len(),
        auto_reset = config.auto_reset(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // One bus client per port; every lane shares it
    let (bus, simulated) = create_bus_client(&config, metrics.clone());

    let client = Arc::new(CoordinatorClient::new(ClientSettings::from_config(&config)).with_metrics(metrics.clone()));
    {
        let client = client.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { client.run(shutdown).await });
    }

    if config.operating_mode() == OperatingMode::Hardware {
        warn!("lpr_adapter_simulated: no camera integration configured, plates are simulated");
    }
    let pool = PlatePool::demo();

    let worker_settings = WorkerSettings::from_config(&config);
    let mut handles = Vec::new();
    let mut tasks = Vec::new();
    for lane in config.lanes() {
        let lpr: Arc<dyn PlateCapture> = Arc::new(SimulatedLpr::new(lane.role, pool.clone()));
        let machine = LaneMachine::new(
            LaneSettings::from_config(&config, lane),
            bus.clone(),
            lpr,
            client.clone(),
            metrics.clone(),
        );
        let (handle, worker) = create_lane_worker(machine, worker_settings.clone(), client.clone());
        tasks.push(tokio::spawn(worker.run(shutdown_rx.clone())));
        handles.push(handle);
    }
    info!(
        entry = config.lanes().iter().filter(|l| l.role == LaneRole::Entry).count(),
        exit = config.lanes().iter().filter(|l| l.role == LaneRole::Exit).count(),
        "lane_workers_started"
    );

    let display = DisplayUpdater::new(
        bus.clone(),
        client.clone(),
        Duration::from_millis(config.display_interval_ms()),
        metrics.clone(),
    );
    tasks.push(tokio::spawn(display.run(shutdown_rx.clone())));

    if let Some(simulated) = simulated {
        let traffic = Arc::new(TrafficGenerator::from_config(&config, simulated));
        tasks.push(tokio::spawn(traffic.run(shutdown_rx.clone())));
    }

    let handles = Arc::new(handles);
    tokio::spawn(operator_console(handles.clone()));

    // Periodic floor metrics, with lane states
    {
        let metrics = metrics.clone();
        let interval = Duration::from_secs(config.metrics_interval_secs().max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                metrics.report(0, 0).log_floor();
                for handle in handles.iter() {
                    let state = handle.state();
                    info!(lane = %handle.lane_id(), state = state.name(), "lane_status");
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }

    info!("parking_floor_stopped");
    Ok(())
}

/// Operator reset over stdin: `reset <lane-id>` or `reset all`
async fn operator_console(handles: Arc<Vec<LaneHandle>>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (Some("reset"), Some(target)) => {
                for handle in handles.iter().filter(|h| target == "all" || h.lane_id() == target) {
                    let state = handle.state();
                    if handle.reset() {
                        info!(lane = %handle.lane_id(), state = state.name(), "operator_reset");
                    } else if target != "all" {
                        warn!(lane = %handle.lane_id(), state = state.name(), "operator_reset_refused");
                    }
                }
            }
            (Some("status"), _) => {
                for handle in handles.iter() {
                    info!(lane = %handle.lane_id(), state = handle.state().name(), "lane_status");
                }
            }
            (None, _) => {}
            _ => warn!(line = %line, "operator_command_unknown"),
        }
    }
}
