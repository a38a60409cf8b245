//! Plate capture adapters
//!
//! The recognition subsystem itself is external; the lane only needs
//! `capture() -> plate + confidence`. `SimulatedLpr` stands in for it when no
//! camera is attached. The entry and exit simulators of one floor share a
//! `PlatePool` so exits mostly read plates that are actually inside.

use crate::domain::types::{LaneRole, Plate};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct PlateRead {
    pub plate: Plate,
    /// Recognition confidence in [0, 1]
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureFault {
    #[error("capture timed out after {0:?}")]
    Timeout(Duration),
    #[error("no plate recognised")]
    NoRead,
    #[error("capture device error: {0}")]
    Device(String),
}

#[async_trait]
pub trait PlateCapture: Send + Sync {
    async fn capture(&self) -> Result<PlateRead, CaptureFault>;
}

/// Plates the simulation draws from, split into outside and inside
#[derive(Debug)]
pub struct PlatePool {
    outside: Vec<Plate>,
    inside: Vec<Plate>,
}

pub type SharedPlatePool = Arc<Mutex<PlatePool>>;

pub const DEMO_PLATES: [&str; 10] = [
    "ABC1234", "DEF5678", "GHI9012", "JKL3456", "MNO7890", "PQR1234", "STU5678", "VWX9012",
    "YZA3456", "BCD7890",
];

impl PlatePool {
    pub fn new(plates: impl IntoIterator<Item = Plate>) -> Self {
        Self { outside: plates.into_iter().collect(), inside: Vec::new() }
    }

    pub fn shared(plates: impl IntoIterator<Item = Plate>) -> SharedPlatePool {
        Arc::new(Mutex::new(Self::new(plates)))
    }

    pub fn demo() -> SharedPlatePool {
        Self::shared(DEMO_PLATES.iter().map(|p| Plate::new(p)))
    }

    pub fn inside(&self) -> &[Plate] {
        &self.inside
    }

    /// Move a random outside plate in. Falls back to an inside plate when
    /// everyone is parked (which the coordinator will reject as a duplicate).
    fn draw_arrival(&mut self, rng: &mut impl Rng) -> Option<Plate> {
        if self.outside.is_empty() {
            return pick(&self.inside, rng);
        }
        let plate = self.outside.swap_remove(rng.random_range(0..self.outside.len()));
        self.inside.push(plate.clone());
        Some(plate)
    }

    /// Move a random inside plate out. Falls back to an outside plate when the
    /// facility is empty (an exit with no matching entry).
    fn draw_departure(&mut self, rng: &mut impl Rng) -> Option<Plate> {
        if self.inside.is_empty() {
            return pick(&self.outside, rng);
        }
        let plate = self.inside.swap_remove(rng.random_range(0..self.inside.len()));
        self.outside.push(plate.clone());
        Some(plate)
    }
}

fn pick(plates: &[Plate], rng: &mut impl Rng) -> Option<Plate> {
    if plates.is_empty() {
        None
    } else {
        Some(plates[rng.random_range(0..plates.len())].clone())
    }
}

/// Simulated camera for one lane
pub struct SimulatedLpr {
    role: LaneRole,
    pool: SharedPlatePool,
    success_rate: f64,
    confidence: Range<f64>,
    delay_ms: Range<u64>,
}

impl SimulatedLpr {
    pub fn new(role: LaneRole, pool: SharedPlatePool) -> Self {
        Self { role, pool, success_rate: 0.9, confidence: 0.70..0.98, delay_ms: 1000..3000 }
    }

    pub fn with_success_rate(mut self, success_rate: f64) -> Self {
        self.success_rate = success_rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_confidence(mut self, confidence: Range<f64>) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_delay(mut self, delay_ms: Range<u64>) -> Self {
        self.delay_ms = delay_ms;
        self
    }
}

#[async_trait]
impl PlateCapture for SimulatedLpr {
    async fn capture(&self) -> Result<PlateRead, CaptureFault> {
        // ThreadRng is not Send: draw everything before the first await
        let (delay, outcome) = {
            let mut rng = rand::rng();
            let delay = if self.delay_ms.is_empty() {
                self.delay_ms.start
            } else {
                rng.random_range(self.delay_ms.clone())
            };
            let outcome = if rng.random_bool(self.success_rate) {
                let confidence = if self.confidence.is_empty() {
                    self.confidence.start
                } else {
                    rng.random_range(self.confidence.clone())
                };
                let mut pool = self.pool.lock();
                let plate = match self.role {
                    LaneRole::Entry => pool.draw_arrival(&mut rng),
                    LaneRole::Exit => pool.draw_departure(&mut rng),
                };
                plate.map(|plate| PlateRead { plate, confidence })
            } else {
                None
            };
            (delay, outcome)
        };

        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        match outcome {
            Some(read) => {
                debug!(role = self.role.as_str(), plate = %read.plate, confidence = read.confidence, "lpr_capture");
                Ok(read)
            }
            None => {
                debug!(role = self.role.as_str(), "lpr_no_read");
                Err(CaptureFault::NoRead)
            }
        }
    }
}
