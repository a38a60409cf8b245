//! Central coordinator - reconciles lane events, bills exits, authorizes passage
//!
//! Every event is handled under a per-plate lock, so an EXIT racing another
//! EXIT (or an ENTRY) for the same plate is serialized and a session can be
//! closed at most once. Different plates proceed in parallel.
//!
//! Idempotency: an event id that already reached DONE/ERROR in the ledger is
//! answered from the stored record without touching sessions or occupancy.

use crate::domain::session::{Tariff, VehicleSession};
use crate::domain::types::{Event, EventKind, EventStatus, FloorId, Plate};
use crate::infra::config::{Config, UnknownExitPolicy};
use crate::infra::metrics::Metrics;
use crate::io::protocol::{
    AdminAck, AdminCommand, AuthorizationResponse, EventSubmission, Reason, Statistics,
};
use crate::io::store::Store;
use crate::io::transport::{CentralLink, TransportFault};
use crate::services::occupancy::OccupancyCounter;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconciliationFault {
    #[error("plate {0} already has an unresolved entry")]
    DuplicateEntry(Plate),
    #[error("no unresolved entry for plate {0}")]
    NoMatchingEntry(Plate),
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub tariff: Tariff,
    pub total_spaces: u32,
    pub unknown_exit_policy: UnknownExitPolicy,
    pub revenue_window_secs: u64,
    pub min_confidence: f64,
    pub deny_low_confidence_entry: bool,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tariff: config.tariff(),
            total_spaces: config.total_spaces(),
            unknown_exit_policy: config.unknown_exit_policy(),
            revenue_window_secs: config.revenue_window_secs(),
            min_confidence: config.min_confidence(),
            deny_low_confidence_entry: config.deny_low_confidence_entry(),
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Lazily created per-plate mutexes, dropped again once nobody holds them
#[derive(Default)]
struct PlateLocks {
    slots: Mutex<FxHashMap<Plate, Arc<Mutex<()>>>>,
}

impl PlateLocks {
    fn acquire(&self, plate: &Plate) -> PlateSlot<'_> {
        let mutex = self.slots.lock().entry(plate.clone()).or_default().clone();
        PlateSlot { locks: self, plate: plate.clone(), mutex }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

struct PlateSlot<'a> {
    locks: &'a PlateLocks,
    plate: Plate,
    mutex: Arc<Mutex<()>>,
}

impl Drop for PlateSlot<'_> {
    fn drop(&mut self) {
        let mut slots = self.locks.slots.lock();
        // One reference in the map, one here: nobody else is waiting
        if Arc::strong_count(&self.mutex) == 2 {
            slots.remove(&self.plate);
        }
    }
}

#[derive(Debug, Default)]
struct FacilityControls {
    closed: bool,
    blocked_floors: FxHashSet<FloorId>,
}

pub struct Coordinator {
    settings: CoordinatorSettings,
    store: Arc<dyn Store>,
    occupancy: OccupancyCounter,
    plate_locks: PlateLocks,
    controls: RwLock<FacilityControls>,
    connected_clients: AtomicU64,
    metrics: Arc<Metrics>,
}

impl Coordinator {
    /// Build a coordinator over `store`, seeding occupancy from its open sessions
    pub fn new(settings: CoordinatorSettings, store: Arc<dyn Store>, metrics: Arc<Metrics>) -> Self {
        let open = u32::try_from(store.open_session_count()).unwrap_or(u32::MAX);
        if open > settings.total_spaces {
            warn!(open_sessions = open, total = settings.total_spaces, "coordinator_over_capacity_on_start");
        }
        let occupancy = OccupancyCounter::with_occupied(settings.total_spaces, open);
        info!(
            total = settings.total_spaces,
            occupied = occupancy.occupied(),
            price_per_minute = settings.tariff.price_per_minute,
            minimum_fee = settings.tariff.minimum_fee,
            unknown_exit_policy = ?settings.unknown_exit_policy,
            "coordinator_started"
        );
        Self {
            settings,
            store,
            occupancy,
            plate_locks: PlateLocks::default(),
            controls: RwLock::new(FacilityControls::default()),
            connected_clients: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn occupancy(&self) -> &OccupancyCounter {
        &self.occupancy
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Decide on one lane event. Never fails: faults become denials or
    /// anomaly-flagged grants.
    pub fn handle_event(&self, event: Event) -> AuthorizationResponse {
        let start = Instant::now();
        let slot = self.plate_locks.acquire(&event.plate);
        let _serialized = slot.mutex.lock();

        let response = match self.store.event(&event.id) {
            Some(settled) if matches!(settled.status, EventStatus::Done | EventStatus::Error) => {
                self.metrics.record_replay();
                debug!(event_id = %event.id, plate = %event.plate, "coordinator_event_replayed");
                response_for(&settled)
            }
            _ => self.process(event),
        };

        self.metrics.record_event_handled(start.elapsed().as_micros() as u64);
        response
    }

    fn process(&self, mut event: Event) -> AuthorizationResponse {
        event.status = EventStatus::Processing;
        let response = match event.kind {
            EventKind::Entry => self.admit(&mut event),
            EventKind::Exit => self.release(&mut event),
            EventKind::Fault | EventKind::Maintenance => self.record(&mut event),
        };
        if let Err(e) = self.store.record_event(&event) {
            error!(event_id = %event.id, error = %e, "coordinator_event_persist_failed");
        }
        response
    }

    fn admit(&self, event: &mut Event) -> AuthorizationResponse {
        if event.plate.is_empty() {
            return self.deny(event, Reason::InvalidPlate);
        }
        {
            let controls = self.controls.read();
            if controls.closed {
                return self.deny(event, Reason::FacilityClosed);
            }
            if controls.blocked_floors.contains(&event.floor_id) {
                return self.deny(event, Reason::FloorBlocked);
            }
        }

        let low_confidence =
            event.low_confidence || event.lpr_confidence < self.settings.min_confidence;
        if low_confidence {
            event.low_confidence = true;
            if self.settings.deny_low_confidence_entry {
                return self.deny(event, Reason::LowConfidence);
            }
            warn!(plate = %event.plate, confidence = event.lpr_confidence, "coordinator_low_confidence_entry");
        }

        if let Err(fault) = self.check_entry(&event.plate) {
            warn!(event_id = %event.id, fault = %fault, "coordinator_duplicate_entry");
            self.metrics.record_duplicate_entry();
            return self.deny(event, Reason::DuplicateEntry);
        }

        if !self.occupancy.try_occupy() {
            return self.deny(event, Reason::FacilityFull);
        }

        let session = VehicleSession::open(event);
        if let Err(e) = self.store.insert_session(&session) {
            self.occupancy.release();
            error!(plate = %event.plate, error = %e, "coordinator_session_insert_failed");
            return self.deny(event, Reason::StorageUnavailable);
        }

        event.status = EventStatus::Done;
        self.metrics.record_entry_granted();
        info!(
            event_id = %event.id,
            plate = %event.plate,
            floor = %event.floor_id,
            occupied = self.occupancy.occupied(),
            "coordinator_entry_granted"
        );
        AuthorizationResponse::granted(&event.id)
    }

    fn release(&self, event: &mut Event) -> AuthorizationResponse {
        let session = match self.reconcile_exit(&event.plate) {
            Ok(session) => session,
            Err(fault) => return self.unknown_exit(event, fault),
        };

        let closed = session.closed(event.timestamp, &self.settings.tariff);
        let (fee, dwell) = (closed.fee.unwrap_or_default(), closed.dwell_minutes.unwrap_or_default());
        event.computed_fee = Some(fee);
        event.dwell_minutes = Some(dwell);
        event.status = EventStatus::Done;

        if let Err(e) = self.store.close_session(&closed) {
            // The barrier still opens; the session stays open for manual settlement
            error!(plate = %event.plate, error = %e, "coordinator_session_close_failed");
            event.error_detail = Some(Reason::StorageUnavailable.to_string());
            self.metrics.record_exit_granted(None);
            return AuthorizationResponse::granted(&event.id)
                .with_fee(fee, dwell)
                .with_reason(Reason::StorageUnavailable);
        }

        self.occupancy.release();
        self.metrics.record_exit_granted(Some(fee));
        info!(
            event_id = %event.id,
            plate = %event.plate,
            dwell_minutes = dwell,
            fee = format!("{:.2}", fee),
            occupied = self.occupancy.occupied(),
            "coordinator_exit_granted"
        );
        AuthorizationResponse::granted(&event.id).with_fee(fee, dwell)
    }

    fn unknown_exit(&self, event: &mut Event, fault: ReconciliationFault) -> AuthorizationResponse {
        self.metrics.record_unknown_exit();
        warn!(
            event_id = %event.id,
            plate = %event.plate,
            fault = %fault,
            policy = ?self.settings.unknown_exit_policy,
            "coordinator_exit_anomaly"
        );
        match self.settings.unknown_exit_policy {
            UnknownExitPolicy::Grant => {
                event.status = EventStatus::Done;
                event.error_detail = Some(Reason::NoMatchingEntry.to_string());
                self.metrics.record_exit_granted(None);
                AuthorizationResponse::granted(&event.id).with_reason(Reason::NoMatchingEntry)
            }
            UnknownExitPolicy::Deny => self.deny(event, Reason::NoMatchingEntry),
        }
    }

    fn record(&self, event: &mut Event) -> AuthorizationResponse {
        event.status = EventStatus::Done;
        self.metrics.record_event_recorded();
        warn!(
            event_id = %event.id,
            kind = event.kind.as_str(),
            floor = %event.floor_id,
            detail = event.error_detail.as_deref().unwrap_or(""),
            "coordinator_event_recorded"
        );
        AuthorizationResponse::denied(&event.id, Reason::Recorded)
    }

    fn deny(&self, event: &mut Event, reason: Reason) -> AuthorizationResponse {
        event.status = EventStatus::Error;
        event.error_detail = Some(reason.to_string());
        self.metrics.record_denial();
        info!(
            event_id = %event.id,
            plate = %event.plate,
            kind = event.kind.as_str(),
            reason = %reason,
            "coordinator_event_denied"
        );
        AuthorizationResponse::denied(&event.id, reason)
    }

    /// Unresolved entries are unique per plate
    pub fn check_entry(&self, plate: &Plate) -> Result<(), ReconciliationFault> {
        match self.store.open_session(plate) {
            Some(_) => Err(ReconciliationFault::DuplicateEntry(plate.clone())),
            None => Ok(()),
        }
    }

    /// The single open session an EXIT for `plate` closes
    pub fn reconcile_exit(&self, plate: &Plate) -> Result<VehicleSession, ReconciliationFault> {
        self.store
            .open_session(plate)
            .ok_or_else(|| ReconciliationFault::NoMatchingEntry(plate.clone()))
    }

    /// Best-known facility state; a pure read
    pub fn get_statistics(&self) -> Statistics {
        let window = chrono::Duration::seconds(i64::try_from(self.settings.revenue_window_secs).unwrap_or(i64::MAX / 1000));
        let since = Utc::now() - window;

        let mut revenue = 0.0;
        let (mut entries, mut exits, mut anomalies) = (0u64, 0u64, 0u64);
        for event in self.store.events_since(since) {
            match (event.kind, event.status) {
                (EventKind::Entry, EventStatus::Done) => entries += 1,
                (EventKind::Exit, _) if event.error_detail.as_deref() == Some(Reason::NoMatchingEntry.as_str()) => {
                    anomalies += 1
                }
                (EventKind::Exit, EventStatus::Done) => {
                    exits += 1;
                    revenue += event.computed_fee.unwrap_or_default();
                }
                _ => {}
            }
        }

        let (facility_closed, blocked_floors) = {
            let controls = self.controls.read();
            let mut blocked: Vec<FloorId> = controls.blocked_floors.iter().cloned().collect();
            blocked.sort_by(|a, b| a.as_str().cmp(b.as_str()));
            (controls.closed, blocked)
        };

        Statistics {
            occupied: self.occupancy.occupied(),
            free: self.occupancy.free(),
            total: self.occupancy.total(),
            revenue_window: (revenue * 100.0).round() / 100.0,
            window_secs: self.settings.revenue_window_secs,
            entries_window: entries,
            exits_window: exits,
            anomalies_window: anomalies,
            facility_closed,
            blocked_floors,
            connected_clients: self.connected_clients.load(Ordering::Relaxed),
        }
    }

    pub fn close_facility(&self) {
        self.controls.write().closed = true;
        info!("coordinator_facility_closed");
    }

    pub fn open_facility(&self) {
        self.controls.write().closed = false;
        info!("coordinator_facility_opened");
    }

    pub fn block_floor(&self, floor_id: &FloorId) {
        self.controls.write().blocked_floors.insert(floor_id.clone());
        info!(floor = %floor_id, "coordinator_floor_blocked");
    }

    pub fn unblock_floor(&self, floor_id: &FloorId) {
        self.controls.write().blocked_floors.remove(floor_id);
        info!(floor = %floor_id, "coordinator_floor_unblocked");
    }

    pub fn apply_admin(&self, command: &AdminCommand) -> AdminAck {
        match command {
            AdminCommand::CloseFacility => self.close_facility(),
            AdminCommand::OpenFacility => self.open_facility(),
            AdminCommand::BlockFloor { floor_id } => self.block_floor(floor_id),
            AdminCommand::UnblockFloor { floor_id } => self.unblock_floor(floor_id),
        }
        let controls = self.controls.read();
        AdminAck {
            ok: true,
            detail: format!(
                "facility {}, {} floor(s) blocked",
                if controls.closed { "closed" } else { "open" },
                controls.blocked_floors.len()
            ),
        }
    }

    pub fn client_connected(&self) -> u64 {
        self.connected_clients.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn client_disconnected(&self) -> u64 {
        let previous = self
            .connected_clients
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }
}

/// Rebuild the response for an event that already settled
fn response_for(event: &Event) -> AuthorizationResponse {
    let reason = event
        .error_detail
        .as_ref()
        .and_then(|detail| serde_json::from_value::<Reason>(serde_json::Value::String(detail.clone())).ok());

    match (event.kind, event.status) {
        (EventKind::Fault | EventKind::Maintenance, _) => {
            AuthorizationResponse::denied(&event.id, Reason::Recorded)
        }
        (_, EventStatus::Done) => AuthorizationResponse {
            event_id: event.id.clone(),
            granted: true,
            fee: event.computed_fee,
            dwell_minutes: event.dwell_minutes,
            reason,
        },
        _ => AuthorizationResponse {
            event_id: event.id.clone(),
            granted: false,
            fee: None,
            dwell_minutes: None,
            reason,
        },
    }
}

/// In-process link, used when lanes and coordinator share a process
#[async_trait]
impl CentralLink for Coordinator {
    async fn submit(&self, submission: EventSubmission) -> Result<AuthorizationResponse, TransportFault> {
        Ok(self.handle_event(submission.into()))
    }

    async fn statistics(&self) -> Result<Statistics, TransportFault> {
        Ok(self.get_statistics())
    }
}
