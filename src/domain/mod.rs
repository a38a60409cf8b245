//! Domain models - core business types
//!
//! This module contains the canonical data types used throughout the system:
//! - `Event` - an ENTRY/EXIT/FAULT/MAINTENANCE occurrence reported by a lane
//! - `Plate`, `FloorId` - identifiers
//! - `LaneRole` - entry or exit lane
//! - `VehicleSession` - one stay in the facility, opened on entry, closed on exit
//! - `Tariff` - dwell and fee computation

pub mod session;
pub mod types;

// Re-export commonly used types at module level
pub use session::{dwell_minutes, Tariff, VehicleSession};
pub use types::{Event, EventKind, EventStatus, FloorId, LaneRole, Plate};
