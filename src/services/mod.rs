//! Services - business logic and state management
//!
//! - `coordinator` - Central event reconciliation, billing and facility controls
//! - `occupancy` - Bounded occupancy counter
//! - `lane` - Per-lane barrier state machine
//! - `lane_worker` - Task driving one lane, with reset and backoff
//! - `display` - Free-space display updater

pub mod coordinator;
pub mod display;
pub mod lane;
pub mod lane_worker;
pub mod occupancy;

pub use coordinator::{Coordinator, CoordinatorSettings, ReconciliationFault};
pub use display::DisplayUpdater;
pub use lane::{FaultReason, LaneMachine, LaneSettings, LaneState};
pub use lane_worker::{create_lane_worker, LaneHandle, LaneWorker, WorkerSettings};
pub use occupancy::OccupancyCounter;
