//! Shared types for the parking gateway

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Normalised license plate (uppercase, no separators)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Plate(String);

impl Plate {
    /// Normalise a raw plate string: uppercase, strip spaces and hyphens
    pub fn new(raw: &str) -> Self {
        let normalised: String = raw
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .flat_map(char::to_uppercase)
            .collect();
        Self(normalised)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for Plate {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Plate::new(&raw))
    }
}

impl std::fmt::Display for Plate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Floor identifier (e.g. "ground", "level-1")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FloorId(pub String);

impl FloorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FloorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Entry,
    Exit,
    Fault,
    Maintenance,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Entry => "ENTRY",
            EventKind::Exit => "EXIT",
            EventKind::Fault => "FAULT",
            EventKind::Maintenance => "MAINTENANCE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Pending,
    Processing,
    Done,
    Error,
}

/// Which way a lane moves traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaneRole {
    Entry,
    Exit,
}

impl LaneRole {
    /// Event kind emitted when a vehicle is captured on this lane
    pub fn event_kind(&self) -> EventKind {
        match self {
            LaneRole::Entry => EventKind::Entry,
            LaneRole::Exit => EventKind::Exit,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LaneRole::Entry => "entry",
            LaneRole::Exit => "exit",
        }
    }
}

/// A single lane occurrence reported by a floor controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub plate: Plate,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub lpr_confidence: f64,
    pub floor_id: FloorId,
    pub status: EventStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed_fee: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dwell_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// Capture confidence was below the floor's configured minimum
    #[serde(default)]
    pub low_confidence: bool,
}

impl Event {
    /// New PENDING event stamped now with a time-ordered id
    pub fn new(plate: Plate, kind: EventKind, lpr_confidence: f64, floor_id: FloorId) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            plate,
            kind,
            timestamp: Utc::now(),
            lpr_confidence: lpr_confidence.clamp(0.0, 1.0),
            floor_id,
            status: EventStatus::Pending,
            computed_fee: None,
            dwell_minutes: None,
            error_detail: None,
            low_confidence: false,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_low_confidence(mut self, low_confidence: bool) -> Self {
        self.low_confidence = low_confidence;
        self
    }
}
