//! Lane state machine - one instance per physical entry or exit point
//!
//! ```text
//! IDLE -> VEHICLE_DETECTED -> CAPTURING_PLATE -> AWAITING_AUTHORIZATION
//!      -> OPENING_BARRIER -> AWAITING_PASSAGE -> CLOSING_BARRIER -> IDLE
//! ```
//!
//! Any bus, capture or transport failure moves the lane to FAULT, where it
//! stays until `reset()` is called from outside. Nothing in here retries.
//! Each `step()` performs at most one transition; the lane worker decides
//! how often to call it.

use crate::domain::types::{Event, EventKind, FloorId, LaneRole, Plate};
use crate::infra::config::{Config, LaneConfig};
use crate::infra::metrics::Metrics;
use crate::io::bus::BusClient;
use crate::io::lpr::PlateCapture;
use crate::io::protocol::{AuthorizationResponse, EventSubmission};
use crate::io::transport::{CentralLink, TransportFault};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultReason {
    LprTimeout,
    Denied,
    CentralUnreachable,
    BusFault,
}

impl FaultReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultReason::LprTimeout => "LPR_TIMEOUT",
            FaultReason::Denied => "DENIED",
            FaultReason::CentralUnreachable => "CENTRAL_UNREACHABLE",
            FaultReason::BusFault => "BUS_FAULT",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaneFault {
    pub reason: FaultReason,
    pub detail: String,
    /// State the lane was in when the fault happened
    pub from: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LaneState {
    Idle,
    VehicleDetected,
    CapturingPlate,
    AwaitingAuthorization,
    OpeningBarrier,
    AwaitingPassage,
    ClosingBarrier,
    Fault(LaneFault),
}

impl LaneState {
    pub fn name(&self) -> &'static str {
        match self {
            LaneState::Idle => "IDLE",
            LaneState::VehicleDetected => "VEHICLE_DETECTED",
            LaneState::CapturingPlate => "CAPTURING_PLATE",
            LaneState::AwaitingAuthorization => "AWAITING_AUTHORIZATION",
            LaneState::OpeningBarrier => "OPENING_BARRIER",
            LaneState::AwaitingPassage => "AWAITING_PASSAGE",
            LaneState::ClosingBarrier => "CLOSING_BARRIER",
            LaneState::Fault(_) => "FAULT",
        }
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, LaneState::Fault(_))
    }

    /// States where the worker paces steps by the poll interval
    pub fn is_polling(&self) -> bool {
        matches!(self, LaneState::Idle | LaneState::AwaitingPassage)
    }
}

#[derive(Debug, Clone)]
pub struct LaneSettings {
    pub id: String,
    pub role: LaneRole,
    pub floor_id: FloorId,
    pub coil: u16,
    pub presence_register: u16,
    pub capture_timeout: Duration,
    pub authorization_timeout: Duration,
    pub passage_timeout: Duration,
    pub min_confidence: f64,
}

impl LaneSettings {
    pub fn from_config(config: &Config, lane: &LaneConfig) -> Self {
        Self {
            id: lane.id.clone(),
            role: lane.role,
            floor_id: config.floor_id().clone(),
            coil: lane.coil(),
            presence_register: lane.presence_register(),
            capture_timeout: Duration::from_millis(config.capture_timeout_ms()),
            authorization_timeout: Duration::from_millis(config.central_request_timeout_ms()),
            passage_timeout: Duration::from_millis(config.passage_timeout_ms()),
            min_confidence: config.min_confidence(),
        }
    }
}

/// Per-attempt data, cleared whenever the lane returns to IDLE
#[derive(Debug, Default)]
struct Attempt {
    capture_deadline: Option<Instant>,
    passage_deadline: Option<Instant>,
    event: Option<Event>,
    response: Option<AuthorizationResponse>,
    /// Set before the open write; cleared once a close is acknowledged
    barrier_may_be_open: bool,
}

pub struct LaneMachine {
    settings: LaneSettings,
    state: LaneState,
    attempt: Attempt,
    passages: u64,
    bus: Arc<dyn BusClient>,
    lpr: Arc<dyn PlateCapture>,
    central: Arc<dyn CentralLink>,
    metrics: Arc<Metrics>,
}

impl LaneMachine {
    pub fn new(
        settings: LaneSettings,
        bus: Arc<dyn BusClient>,
        lpr: Arc<dyn PlateCapture>,
        central: Arc<dyn CentralLink>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            settings,
            state: LaneState::Idle,
            attempt: Attempt::default(),
            passages: 0,
            bus,
            lpr,
            central,
            metrics,
        }
    }

    pub fn id(&self) -> &str {
        &self.settings.id
    }

    pub fn settings(&self) -> &LaneSettings {
        &self.settings
    }

    pub fn state(&self) -> &LaneState {
        &self.state
    }

    /// Completed passages since start
    pub fn passages(&self) -> u64 {
        self.passages
    }

    /// Event of the current attempt, once a plate was captured
    pub fn current_event(&self) -> Option<&Event> {
        self.attempt.event.as_ref()
    }

    pub fn last_authorization(&self) -> Option<&AuthorizationResponse> {
        self.attempt.response.as_ref()
    }

    /// Advance by at most one transition
    pub async fn step(&mut self) -> &LaneState {
        match self.state {
            LaneState::Idle => self.poll_presence().await,
            LaneState::VehicleDetected => self.transition(LaneState::CapturingPlate),
            LaneState::CapturingPlate => self.capture_plate().await,
            LaneState::AwaitingAuthorization => self.request_authorization().await,
            LaneState::OpeningBarrier => self.open_barrier().await,
            LaneState::AwaitingPassage => self.watch_passage().await,
            LaneState::ClosingBarrier => self.close_barrier().await,
            LaneState::Fault(_) => {}
        }
        &self.state
    }

    /// External acknowledgement of a fault. Only FAULT can be reset.
    pub fn reset(&mut self) -> bool {
        let LaneState::Fault(fault) = &self.state else {
            return false;
        };
        info!(lane = %self.settings.id, reason = fault.reason.as_str(), "lane_reset");
        self.metrics.record_lane_reset();
        self.attempt = Attempt::default();
        self.transition(LaneState::Idle);
        true
    }

    /// FAULT event describing the current fault, for reporting to central
    pub fn fault_event(&self) -> Option<Event> {
        let LaneState::Fault(fault) = &self.state else {
            return None;
        };
        let (plate, confidence) = match &self.attempt.event {
            Some(event) => (event.plate.clone(), event.lpr_confidence),
            None => (Plate::new(""), 0.0),
        };
        let mut event = Event::new(plate, EventKind::Fault, confidence, self.settings.floor_id.clone());
        event.error_detail =
            Some(format!("{} lane={} from={} {}", fault.reason.as_str(), self.settings.id, fault.from, fault.detail));
        Some(event)
    }

    /// Close the barrier if this attempt may have opened it. Used on shutdown.
    pub async fn close_if_open(&mut self) {
        if !self.attempt.barrier_may_be_open {
            return;
        }
        match self.bus.write_coil(self.settings.coil, false).await {
            Ok(()) => {
                self.attempt.barrier_may_be_open = false;
                info!(lane = %self.settings.id, state = self.state.name(), "lane_barrier_closed_on_stop");
            }
            Err(e) => warn!(lane = %self.settings.id, error = %e, "lane_barrier_close_failed"),
        }
    }

    async fn poll_presence(&mut self) {
        match self.bus.read_input_registers(self.settings.presence_register, 1).await {
            Ok(values) if values.first().copied().unwrap_or(0) > 0 => {
                self.attempt.capture_deadline = Some(Instant::now() + self.settings.capture_timeout);
                self.transition(LaneState::VehicleDetected);
            }
            Ok(_) => trace!(lane = %self.settings.id, "lane_idle_poll"),
            Err(e) => self.fail(FaultReason::BusFault, e.to_string()).await,
        }
    }

    async fn capture_plate(&mut self) {
        let deadline = self
            .attempt
            .capture_deadline
            .unwrap_or_else(|| Instant::now() + self.settings.capture_timeout);

        let read = match tokio::time::timeout_at(deadline, self.lpr.capture()).await {
            Ok(Ok(read)) => read,
            Ok(Err(e)) => return self.fail(FaultReason::LprTimeout, e.to_string()).await,
            Err(_) => {
                let detail = format!("no plate within {:?}", self.settings.capture_timeout);
                return self.fail(FaultReason::LprTimeout, detail).await;
            }
        };

        let low_confidence = read.confidence < self.settings.min_confidence;
        let event = Event::new(read.plate, self.settings.role.event_kind(), read.confidence, self.settings.floor_id.clone())
            .with_low_confidence(low_confidence);
        info!(
            lane = %self.settings.id,
            event_id = %event.id,
            plate = %event.plate,
            confidence = event.lpr_confidence,
            low_confidence,
            "lane_plate_captured"
        );
        self.attempt.event = Some(event);
        self.transition(LaneState::AwaitingAuthorization);
    }

    async fn request_authorization(&mut self) {
        let Some(event) = self.attempt.event.as_ref() else {
            return self.fail(FaultReason::CentralUnreachable, "no event to submit".to_string()).await;
        };
        let submission = EventSubmission::from(event);
        let timeout = self.settings.authorization_timeout;

        let result = match tokio::time::timeout(timeout, self.central.submit(submission)).await {
            Ok(result) => result,
            Err(_) => Err(TransportFault::Timeout(timeout)),
        };

        match result {
            Ok(response) if response.granted => {
                info!(
                    lane = %self.settings.id,
                    event_id = %response.event_id,
                    fee = response.fee,
                    reason = response.reason.map(|r| r.as_str()),
                    "lane_authorized"
                );
                self.attempt.response = Some(response);
                self.transition(LaneState::OpeningBarrier);
            }
            Ok(response) => {
                let detail = response.reason.map(|r| r.as_str()).unwrap_or("denied").to_string();
                self.attempt.response = Some(response);
                self.fail(FaultReason::Denied, detail).await;
            }
            Err(e) => self.fail(FaultReason::CentralUnreachable, e.to_string()).await,
        }
    }

    async fn open_barrier(&mut self) {
        self.attempt.barrier_may_be_open = true;
        match self.bus.write_coil(self.settings.coil, true).await {
            Ok(()) => {
                self.attempt.passage_deadline = Some(Instant::now() + self.settings.passage_timeout);
                self.transition(LaneState::AwaitingPassage);
            }
            Err(e) => self.fail(FaultReason::BusFault, e.to_string()).await,
        }
    }

    async fn watch_passage(&mut self) {
        let present = match self.bus.read_input_registers(self.settings.presence_register, 1).await {
            Ok(values) => values.first().copied().unwrap_or(0) > 0,
            Err(e) => return self.fail(FaultReason::BusFault, e.to_string()).await,
        };

        if !present {
            self.transition(LaneState::ClosingBarrier);
        } else if self.attempt.passage_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            warn!(lane = %self.settings.id, timeout_ms = self.settings.passage_timeout.as_millis() as u64, "lane_passage_timeout");
            self.transition(LaneState::ClosingBarrier);
        } else {
            trace!(lane = %self.settings.id, "lane_passage_poll");
        }
    }

    async fn close_barrier(&mut self) {
        match self.bus.write_coil(self.settings.coil, false).await {
            Ok(()) => {
                self.passages += 1;
                self.metrics.record_passage();
                self.attempt = Attempt::default();
                self.transition(LaneState::Idle);
            }
            Err(e) => self.fail(FaultReason::BusFault, e.to_string()).await,
        }
    }

    /// Enter FAULT. The barrier is closed best-effort if it may be open.
    async fn fail(&mut self, reason: FaultReason, detail: String) {
        let from = self.state.name();
        self.metrics.record_lane_fault();
        warn!(lane = %self.settings.id, reason = reason.as_str(), from, detail = %detail, "lane_fault");

        self.close_if_open().await;
        self.transition(LaneState::Fault(LaneFault { reason, detail, from }));
    }

    fn transition(&mut self, next: LaneState) {
        info!(lane = %self.settings.id, from = self.state.name(), to = next.name(), "lane_transition");
        self.state = next;
    }
}
