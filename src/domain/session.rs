//! Vehicle sessions and billing
//!
//! A session is opened when the coordinator accepts an ENTRY and closed
//! exactly once when a matching EXIT is accepted. Closing stamps the exit
//! time, dwell and fee; the session is immutable afterwards.

use crate::domain::types::{Event, FloorId, Plate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-minute billing with a floor on the charged amount
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tariff {
    pub price_per_minute: f64,
    pub minimum_fee: f64,
}

impl Tariff {
    pub fn new(price_per_minute: f64, minimum_fee: f64) -> Self {
        Self { price_per_minute, minimum_fee }
    }

    /// `max(dwell_minutes * price_per_minute, minimum_fee)` rounded to cents
    pub fn fee(&self, dwell_minutes: u32) -> f64 {
        let metered = round_cents(f64::from(dwell_minutes) * self.price_per_minute);
        round_cents(metered.max(self.minimum_fee))
    }
}

impl Default for Tariff {
    fn default() -> Self {
        Self { price_per_minute: 0.15, minimum_fee: 2.00 }
    }
}

fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// Whole minutes between entry and exit, any partial minute counted as a full one.
/// An exit stamped before its entry yields 0.
pub fn dwell_minutes(entry_time: DateTime<Utc>, exit_time: DateTime<Utc>) -> u32 {
    let elapsed_ms = (exit_time - entry_time).num_milliseconds();
    if elapsed_ms <= 0 {
        return 0;
    }
    let minutes = elapsed_ms / 60_000 + i64::from(elapsed_ms % 60_000 > 0);
    u32::try_from(minutes).unwrap_or(u32::MAX)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleSession {
    pub plate: Plate,
    pub entry_event_id: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub floor_id: FloorId,
    pub fee: Option<f64>,
    pub dwell_minutes: Option<u32>,
}

impl VehicleSession {
    /// Open a session from an accepted ENTRY event
    pub fn open(entry: &Event) -> Self {
        Self {
            plate: entry.plate.clone(),
            entry_event_id: entry.id.clone(),
            entry_time: entry.timestamp,
            exit_time: None,
            floor_id: entry.floor_id.clone(),
            fee: None,
            dwell_minutes: None,
        }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.exit_time.is_none()
    }

    /// Closed copy of this session billed at `exit_time`
    pub fn closed(&self, exit_time: DateTime<Utc>, tariff: &Tariff) -> Self {
        let dwell = dwell_minutes(self.entry_time, exit_time);
        Self {
            exit_time: Some(exit_time),
            fee: Some(tariff.fee(dwell)),
            dwell_minutes: Some(dwell),
            ..self.clone()
        }
    }
}
