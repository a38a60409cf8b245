//! Floor ↔ coordinator wire protocol
//!
//! Newline-delimited JSON: each line is one `Envelope` carrying a message id
//! and a tagged body. Responses reuse the id of the request they answer, so
//! a connection may interleave requests from several lanes.
//!
//! ```text
//! {"msg_id":7,"body":{"type":"event_submission","data":{"id":"...","plate":"ABC1234",...}}}
//! {"msg_id":7,"body":{"type":"authorization_response","data":{"event_id":"...","granted":true}}}
//! ```

use crate::domain::types::{Event, EventKind, EventStatus, FloorId, Plate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub msg_id: u64,
    pub body: Message,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Message {
    EventSubmission(EventSubmission),
    AuthorizationResponse(AuthorizationResponse),
    StatisticsQuery,
    StatisticsReply(Statistics),
    AdminCommand(AdminCommand),
    AdminAck(AdminAck),
    /// Request could not be decoded or handled
    Error { detail: String },
}

impl Message {
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::EventSubmission(_) => "event_submission",
            Message::AuthorizationResponse(_) => "authorization_response",
            Message::StatisticsQuery => "statistics_query",
            Message::StatisticsReply(_) => "statistics_reply",
            Message::AdminCommand(_) => "admin_command",
            Message::AdminAck(_) => "admin_ack",
            Message::Error { .. } => "error",
        }
    }
}

/// An event as a floor controller reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSubmission {
    pub id: String,
    pub plate: Plate,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub lpr_confidence: f64,
    pub floor_id: FloorId,
    #[serde(default)]
    pub low_confidence: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<&Event> for EventSubmission {
    fn from(event: &Event) -> Self {
        Self {
            id: event.id.clone(),
            plate: event.plate.clone(),
            kind: event.kind,
            timestamp: event.timestamp,
            lpr_confidence: event.lpr_confidence,
            floor_id: event.floor_id.clone(),
            low_confidence: event.low_confidence,
            detail: event.error_detail.clone(),
        }
    }
}

impl From<EventSubmission> for Event {
    fn from(submission: EventSubmission) -> Self {
        Self {
            id: submission.id,
            plate: submission.plate,
            kind: submission.kind,
            timestamp: submission.timestamp,
            lpr_confidence: submission.lpr_confidence.clamp(0.0, 1.0),
            floor_id: submission.floor_id,
            status: EventStatus::Pending,
            computed_fee: None,
            dwell_minutes: None,
            error_detail: submission.detail,
            low_confidence: submission.low_confidence,
        }
    }
}

/// Why a response was not a plain grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    DuplicateEntry,
    NoMatchingEntry,
    FacilityFull,
    FacilityClosed,
    FloorBlocked,
    LowConfidence,
    Recorded,
    StorageUnavailable,
    InvalidPlate,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::DuplicateEntry => "duplicate_entry",
            Reason::NoMatchingEntry => "no_matching_entry",
            Reason::FacilityFull => "facility_full",
            Reason::FacilityClosed => "facility_closed",
            Reason::FloorBlocked => "floor_blocked",
            Reason::LowConfidence => "low_confidence",
            Reason::Recorded => "recorded",
            Reason::StorageUnavailable => "storage_unavailable",
            Reason::InvalidPlate => "invalid_plate",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationResponse {
    pub event_id: String,
    pub granted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dwell_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
}

impl AuthorizationResponse {
    pub fn granted(event_id: &str) -> Self {
        Self { event_id: event_id.to_string(), granted: true, fee: None, dwell_minutes: None, reason: None }
    }

    pub fn denied(event_id: &str, reason: Reason) -> Self {
        Self {
            event_id: event_id.to_string(),
            granted: false,
            fee: None,
            dwell_minutes: None,
            reason: Some(reason),
        }
    }

    pub fn with_fee(mut self, fee: f64, dwell_minutes: u32) -> Self {
        self.fee = Some(fee);
        self.dwell_minutes = Some(dwell_minutes);
        self
    }

    pub fn with_reason(mut self, reason: Reason) -> Self {
        self.reason = Some(reason);
        self
    }
}

/// Best-known facility state; never fails to produce
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub occupied: u32,
    pub free: u32,
    pub total: u32,
    pub revenue_window: f64,
    pub window_secs: u64,
    pub entries_window: u64,
    pub exits_window: u64,
    pub anomalies_window: u64,
    pub facility_closed: bool,
    pub blocked_floors: Vec<FloorId>,
    pub connected_clients: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum AdminCommand {
    CloseFacility,
    OpenFacility,
    BlockFloor { floor_id: FloorId },
    UnblockFloor { floor_id: FloorId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminAck {
    pub ok: bool,
    /// State after the command was applied
    pub detail: String,
}

/// Encode one envelope as a newline-terminated line
pub fn encode_line(envelope: &Envelope) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(envelope)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line(line: &str) -> Result<Envelope, serde_json::Error> {
    serde_json::from_str(line.trim_end())
}

/// Best-effort recovery of the message id from an undecodable line
pub fn salvage_msg_id(line: &str) -> u64 {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|value| value.get("msg_id").and_then(serde_json::Value::as_u64))
        .unwrap_or(0)
}
