//! Simulated traffic for the simulated bus
//!
//! Plays the physical world around a floor: vehicles pull up to a lane
//! (presence register goes high), wait for the barrier coil to open, drive
//! through (presence clears) and occupy or free a space sensor. A vehicle
//! that is not let through within its patience turns away.

use crate::domain::types::LaneRole;
use crate::infra::config::Config;
use crate::io::bus::SimulatedBus;
use crate::io::modbus::{REG_SPACE_SENSORS, SPACE_SENSOR_COUNT};
use parking_lot::Mutex;
use rand::Rng;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct TrafficLane {
    pub id: String,
    pub role: LaneRole,
    pub coil: u16,
    pub presence_register: u16,
}

#[derive(Debug, Clone)]
pub struct TrafficSettings {
    /// Gap between vehicles at one lane
    pub interarrival_ms: Range<u64>,
    /// Time from barrier open to the vehicle clearing the sensor
    pub drive_through_ms: Range<u64>,
    /// How long a vehicle waits for the barrier before leaving
    pub patience: Duration,
    pub poll_interval: Duration,
}

impl Default for TrafficSettings {
    fn default() -> Self {
        Self {
            interarrival_ms: 5_000..20_000,
            drive_through_ms: 1_000..3_000,
            patience: Duration::from_secs(15),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleOutcome {
    Passed,
    TurnedAway,
}

pub struct TrafficGenerator {
    bus: Arc<SimulatedBus>,
    lanes: Vec<TrafficLane>,
    settings: TrafficSettings,
    /// Serializes read-modify-write of the space sensors across lanes
    sensors: Mutex<()>,
}

impl TrafficGenerator {
    pub fn new(bus: Arc<SimulatedBus>, lanes: Vec<TrafficLane>, settings: TrafficSettings) -> Self {
        Self { bus, lanes, settings, sensors: Mutex::new(()) }
    }

    pub fn from_config(config: &Config, bus: Arc<SimulatedBus>) -> Self {
        let lanes = config
            .lanes()
            .iter()
            .map(|lane| TrafficLane {
                id: lane.id.clone(),
                role: lane.role,
                coil: lane.coil(),
                presence_register: lane.presence_register(),
            })
            .collect();
        let settings = TrafficSettings {
            poll_interval: Duration::from_millis(config.poll_interval_ms().max(10) / 2),
            ..TrafficSettings::default()
        };
        Self::new(bus, lanes, settings)
    }

    /// Drive every lane until shutdown
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(lanes = self.lanes.len(), "sim_traffic_started");
        let mut tasks = Vec::with_capacity(self.lanes.len());
        for index in 0..self.lanes.len() {
            let generator = self.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move { generator.lane_loop(index, shutdown).await }));
        }
        for task in tasks {
            let _ = task.await;
        }
        info!("sim_traffic_stopped");
    }

    async fn lane_loop(&self, index: usize, mut shutdown: watch::Receiver<bool>) {
        let lane = &self.lanes[index];
        loop {
            let gap = Duration::from_millis(draw(&self.settings.interarrival_ms));
            tokio::select! {
                _ = tokio::time::sleep(gap) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            tokio::select! {
                outcome = self.drive_vehicle(lane) => {
                    debug!(lane = %lane.id, outcome = ?outcome, "sim_vehicle_done");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.bus.set_input_register(lane.presence_register, 0);
                        break;
                    }
                }
            }
        }
    }

    /// One vehicle at `lane`: arrive, wait for the barrier, pass or give up
    pub async fn drive_vehicle(&self, lane: &TrafficLane) -> VehicleOutcome {
        self.bus.set_input_register(lane.presence_register, 1);
        debug!(lane = %lane.id, "sim_vehicle_arrived");

        let gave_up_at = Instant::now() + self.settings.patience;
        while !self.bus.coil(lane.coil) {
            if Instant::now() >= gave_up_at {
                self.bus.set_input_register(lane.presence_register, 0);
                debug!(lane = %lane.id, "sim_vehicle_turned_away");
                return VehicleOutcome::TurnedAway;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }

        let drive = Duration::from_millis(draw(&self.settings.drive_through_ms));
        tokio::time::sleep(drive).await;
        self.bus.set_input_register(lane.presence_register, 0);

        match lane.role {
            LaneRole::Entry => self.park(),
            LaneRole::Exit => self.unpark(),
        }
        VehicleOutcome::Passed
    }

    /// Mark a free space sensor as occupied
    fn park(&self) {
        let _guard = self.sensors.lock();
        let free: Vec<u16> = self.sensor_addresses().filter(|&a| self.bus.input_register(a) == 0).collect();
        if let Some(address) = choose(&free) {
            self.bus.set_input_register(address, 1);
        }
    }

    /// Clear an occupied space sensor
    fn unpark(&self) {
        let _guard = self.sensors.lock();
        let taken: Vec<u16> = self.sensor_addresses().filter(|&a| self.bus.input_register(a) != 0).collect();
        if let Some(address) = choose(&taken) {
            self.bus.set_input_register(address, 0);
        }
    }

    fn sensor_addresses(&self) -> impl Iterator<Item = u16> {
        REG_SPACE_SENSORS..REG_SPACE_SENSORS + SPACE_SENSOR_COUNT
    }
}

fn draw(range: &Range<u64>) -> u64 {
    if range.is_empty() {
        range.start
    } else {
        rand::rng().random_range(range.clone())
    }
}

fn choose(addresses: &[u16]) -> Option<u16> {
    if addresses.is_empty() {
        None
    } else {
        Some(addresses[rand::rng().random_range(0..addresses.len())])
    }
}
