//! Parking simulator and operator console
//!
//! Talks to a running coordinator over the floor protocol: injects ENTRY/EXIT
//! events, queries statistics, and issues facility controls.
//!
//! Usage:
//!   cargo run --bin parking-sim -- entry ABC1234
//!   cargo run --bin parking-sim -- exit ABC1234
//!   cargo run --bin parking-sim -- stats
//!   cargo run --bin parking-sim -- scenario --vehicles 20

use anyhow::{bail, Context};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use parking_gateway::domain::{Event, EventKind, FloorId, Plate};
use parking_gateway::infra::logging::init_tracing;
use parking_gateway::infra::Config;
use parking_gateway::io::protocol::{AdminCommand, AuthorizationResponse, EventSubmission};
use parking_gateway::io::{CentralLink, ClientSettings, CoordinatorClient};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "parking-sim", version, about = "Parking simulator and operator console")]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/parking.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Floor the events are reported from (default: [facility] floor_id)
    #[arg(long, global = true)]
    floor: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report a vehicle entering
    Entry {
        plate: String,
        /// Plate recognition confidence
        #[arg(long, default_value_t = 0.95)]
        confidence: f64,
        /// Backdate the entry by this many minutes
        #[arg(long, default_value_t = 0)]
        minutes_ago: i64,
    },
    /// Report a vehicle leaving
    Exit {
        plate: String,
        #[arg(long, default_value_t = 0.95)]
        confidence: f64,
    },
    /// Show facility statistics
    Stats,
    /// Close the facility to new entries
    Close,
    /// Reopen the facility
    Open,
    /// Block entries from a floor
    Block { floor_id: String },
    /// Unblock a floor
    Unblock { floor_id: String },
    /// Enter N vehicles with random dwell times, then exit them all
    Scenario {
        #[arg(long, default_value_t = 10)]
        vehicles: usize,
        /// Longest simulated dwell
        #[arg(long, default_value_t = 180)]
        max_dwell_minutes: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);
    let floor = args.floor.clone().map(FloorId::new).unwrap_or_else(|| config.floor_id().clone());

    let settings = ClientSettings::from_config(&config);
    let wait = settings.connect_timeout + Duration::from_secs(1);
    let client = Arc::new(CoordinatorClient::new(settings));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run(shutdown_rx).await })
    };

    if !client.wait_connected(wait).await {
        let _ = shutdown_tx.send(true);
        bail!("coordinator at {} is not reachable", config.central_addr());
    }

    let result = execute(&client, args.command, &floor).await;

    let _ = shutdown_tx.send(true);
    let _ = runner.await;
    result
}

async fn execute(client: &CoordinatorClient, command: Command, floor: &FloorId) -> anyhow::Result<()> {
    match command {
        Command::Entry { plate, confidence, minutes_ago } => {
            let event = Event::new(Plate::new(&plate), EventKind::Entry, confidence, floor.clone())
                .with_timestamp(Utc::now() - ChronoDuration::minutes(minutes_ago));
            let response = submit(client, &event).await?;
            print_json(&response)
        }
        Command::Exit { plate, confidence } => {
            let event = Event::new(Plate::new(&plate), EventKind::Exit, confidence, floor.clone());
            let response = submit(client, &event).await?;
            print_json(&response)
        }
        Command::Stats => {
            let stats = client.statistics().await.context("statistics query failed")?;
            print_json(&stats)
        }
        Command::Close => print_json(&client.admin(AdminCommand::CloseFacility).await?),
        Command::Open => print_json(&client.admin(AdminCommand::OpenFacility).await?),
        Command::Block { floor_id } => {
            print_json(&client.admin(AdminCommand::BlockFloor { floor_id: FloorId::new(floor_id) }).await?)
        }
        Command::Unblock { floor_id } => {
            print_json(&client.admin(AdminCommand::UnblockFloor { floor_id: FloorId::new(floor_id) }).await?)
        }
        Command::Scenario { vehicles, max_dwell_minutes } => scenario(client, floor, vehicles, max_dwell_minutes).await,
    }
}

async fn submit(client: &CoordinatorClient, event: &Event) -> anyhow::Result<AuthorizationResponse> {
    let response = client
        .submit(EventSubmission::from(event))
        .await
        .with_context(|| format!("{} for {} failed", event.kind.as_str(), event.plate))?;
    info!(
        plate = %event.plate,
        kind = event.kind.as_str(),
        granted = response.granted,
        fee = response.fee,
        reason = response.reason.map(|r| r.as_str()),
        "sim_event_answered"
    );
    Ok(response)
}

async fn scenario(client: &CoordinatorClient, floor: &FloorId, vehicles: usize, max_dwell: i64) -> anyhow::Result<()> {
    // ThreadRng is not Send: plan the whole run before the first await
    let plan: Vec<(Plate, i64)> = {
        let mut rng = rand::rng();
        let mut plan: Vec<(Plate, i64)> = (0..vehicles)
            .map(|i| {
                let plate = Plate::new(&format!("SIM{:04}", i));
                (plate, rng.random_range(0..=max_dwell.max(0)))
            })
            .collect();
        plan.shuffle(&mut rng);
        plan
    };

    let (mut entered, mut denied, mut revenue) = (Vec::new(), 0usize, 0.0);
    for (plate, dwell) in &plan {
        let event = Event::new(plate.clone(), EventKind::Entry, 0.95, floor.clone())
            .with_timestamp(Utc::now() - ChronoDuration::minutes(*dwell));
        if submit(client, &event).await?.granted {
            entered.push(plate.clone());
        } else {
            denied += 1;
        }
    }

    for plate in &entered {
        let event = Event::new(plate.clone(), EventKind::Exit, 0.95, floor.clone());
        let response = submit(client, &event).await?;
        revenue += response.fee.unwrap_or_default();
    }

    println!(
        "scenario: {} vehicles, {} entered, {} denied, revenue {:.2}",
        plan.len(),
        entered.len(),
        denied,
        revenue
    );
    print_json(&client.statistics().await?)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
