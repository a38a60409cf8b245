//! Event and session ledger
//!
//! The coordinator persists through the `Store` trait: one record per event
//! (upserted by id) plus vehicle sessions, with lookups by plate, by open
//! state and by timestamp.
//!
//! - `MemoryStore` keeps everything in indexed maps
//! - `JournalStore` wraps it and appends every mutation to a JSONL file,
//!   replaying the file on open so sessions survive a restart

use crate::domain::session::VehicleSession;
use crate::domain::types::{Event, Plate};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("plate {0} already has an open session")]
    SessionAlreadyOpen(Plate),
    #[error("plate {0} has no open session")]
    SessionNotOpen(Plate),
}

pub trait Store: Send + Sync {
    /// Insert or replace the event with this id
    fn record_event(&self, event: &Event) -> Result<(), StoreError>;

    fn event(&self, id: &str) -> Option<Event>;

    /// Events for a plate, oldest first
    fn events_for_plate(&self, plate: &Plate) -> Vec<Event>;

    /// Events stamped at or after `since`, oldest first
    fn events_since(&self, since: DateTime<Utc>) -> Vec<Event>;

    fn open_session(&self, plate: &Plate) -> Option<VehicleSession>;

    fn open_session_count(&self) -> usize;

    /// Closed sessions for a plate, oldest first
    fn history(&self, plate: &Plate) -> Vec<VehicleSession>;

    fn insert_session(&self, session: &VehicleSession) -> Result<(), StoreError>;

    /// Replace the open session for `session.plate` with its closed form
    fn close_session(&self, session: &VehicleSession) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct Ledger {
    events: FxHashMap<String, Event>,
    by_plate: FxHashMap<Plate, Vec<String>>,
    by_time: BTreeSet<(DateTime<Utc>, String)>,
    open: FxHashMap<Plate, VehicleSession>,
    closed: FxHashMap<Plate, Vec<VehicleSession>>,
}

impl Ledger {
    fn upsert_event(&mut self, event: &Event) {
        match self.events.insert(event.id.clone(), event.clone()) {
            Some(previous) => {
                if previous.timestamp != event.timestamp {
                    self.by_time.remove(&(previous.timestamp, previous.id.clone()));
                    self.by_time.insert((event.timestamp, event.id.clone()));
                }
            }
            None => {
                self.by_plate.entry(event.plate.clone()).or_default().push(event.id.clone());
                self.by_time.insert((event.timestamp, event.id.clone()));
            }
        }
    }

    fn check_insert(&self, session: &VehicleSession) -> Result<(), StoreError> {
        if self.open.contains_key(&session.plate) {
            return Err(StoreError::SessionAlreadyOpen(session.plate.clone()));
        }
        Ok(())
    }

    fn check_close(&self, session: &VehicleSession) -> Result<(), StoreError> {
        if !self.open.contains_key(&session.plate) {
            return Err(StoreError::SessionNotOpen(session.plate.clone()));
        }
        Ok(())
    }

    fn insert_session(&mut self, session: &VehicleSession) {
        self.open.insert(session.plate.clone(), session.clone());
    }

    fn close_session(&mut self, session: &VehicleSession) {
        self.open.remove(&session.plate);
        self.closed.entry(session.plate.clone()).or_default().push(session.clone());
    }
}

/// In-memory indexed store
#[derive(Debug, Default)]
pub struct MemoryStore {
    ledger: RwLock<Ledger>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn record_event(&self, event: &Event) -> Result<(), StoreError> {
        self.ledger.write().upsert_event(event);
        Ok(())
    }

    fn event(&self, id: &str) -> Option<Event> {
        self.ledger.read().events.get(id).cloned()
    }

    fn events_for_plate(&self, plate: &Plate) -> Vec<Event> {
        let ledger = self.ledger.read();
        let mut events: Vec<Event> = ledger
            .by_plate
            .get(plate)
            .map(|ids| ids.iter().filter_map(|id| ledger.events.get(id).cloned()).collect())
            .unwrap_or_default();
        events.sort_by_key(|e| e.timestamp);
        events
    }

    fn events_since(&self, since: DateTime<Utc>) -> Vec<Event> {
        let ledger = self.ledger.read();
        ledger
            .by_time
            .range((since, String::new())..)
            .filter_map(|(_, id)| ledger.events.get(id).cloned())
            .collect()
    }

    fn open_session(&self, plate: &Plate) -> Option<VehicleSession> {
        self.ledger.read().open.get(plate).cloned()
    }

    fn open_session_count(&self) -> usize {
        self.ledger.read().open.len()
    }

    fn history(&self, plate: &Plate) -> Vec<VehicleSession> {
        self.ledger.read().closed.get(plate).cloned().unwrap_or_default()
    }

    fn insert_session(&self, session: &VehicleSession) -> Result<(), StoreError> {
        let mut ledger = self.ledger.write();
        ledger.check_insert(session)?;
        ledger.insert_session(session);
        Ok(())
    }

    fn close_session(&self, session: &VehicleSession) -> Result<(), StoreError> {
        let mut ledger = self.ledger.write();
        ledger.check_close(session)?;
        ledger.close_session(session);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Event(Event),
    SessionOpened(VehicleSession),
    SessionClosed(VehicleSession),
}

/// `MemoryStore` backed by an append-only JSONL journal.
///
/// A mutation is appended to the journal before it becomes visible in
/// memory; a failed append leaves the in-memory ledger untouched.
pub struct JournalStore {
    memory: MemoryStore,
    path: PathBuf,
    file: Mutex<File>,
}

impl JournalStore {
    /// Open (or create) the journal at `path` and replay it
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let memory = MemoryStore::new();
        let mut replayed = 0usize;
        let mut skipped = 0usize;

        let mut torn_tail = false;

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            torn_tail = !content.is_empty() && !content.ends_with('\n');
            let mut ledger = memory.ledger.write();
            for (index, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JournalRecord>(line) {
                    Ok(JournalRecord::Event(event)) => ledger.upsert_event(&event),
                    Ok(JournalRecord::SessionOpened(session)) => ledger.insert_session(&session),
                    Ok(JournalRecord::SessionClosed(session)) => ledger.close_session(&session),
                    Err(e) => {
                        warn!(line = index + 1, error = %e, "store_journal_line_skipped");
                        skipped += 1;
                        continue;
                    }
                }
                replayed += 1;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if torn_tail {
            // Terminate a partial record left by a crash so the next append starts clean
            writeln!(file)?;
        }
        info!(
            path = %path.display(),
            replayed = replayed,
            skipped = skipped,
            open_sessions = memory.open_session_count(),
            "store_journal_opened"
        );

        Ok(Self { memory, path, file: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, record: &JournalRecord) -> Result<(), StoreError> {
        let line = serde_json::to_string(record)?;
        let mut file = self.file.lock();
        writeln!(file, "{}", line).and_then(|()| file.flush()).map_err(|e| {
            error!(path = %self.path.display(), error = %e, "store_journal_write_failed");
            StoreError::Io(e)
        })?;
        debug!(bytes = line.len(), "store_journal_written");
        Ok(())
    }
}

impl Store for JournalStore {
    fn record_event(&self, event: &Event) -> Result<(), StoreError> {
        self.append(&JournalRecord::Event(event.clone()))?;
        self.memory.record_event(event)
    }

    fn event(&self, id: &str) -> Option<Event> {
        self.memory.event(id)
    }

    fn events_for_plate(&self, plate: &Plate) -> Vec<Event> {
        self.memory.events_for_plate(plate)
    }

    fn events_since(&self, since: DateTime<Utc>) -> Vec<Event> {
        self.memory.events_since(since)
    }

    fn open_session(&self, plate: &Plate) -> Option<VehicleSession> {
        self.memory.open_session(plate)
    }

    fn open_session_count(&self) -> usize {
        self.memory.open_session_count()
    }

    fn history(&self, plate: &Plate) -> Vec<VehicleSession> {
        self.memory.history(plate)
    }

    fn insert_session(&self, session: &VehicleSession) -> Result<(), StoreError> {
        self.memory.ledger.read().check_insert(session)?;
        self.append(&JournalRecord::SessionOpened(session.clone()))?;
        self.memory.ledger.write().insert_session(session);
        Ok(())
    }

    fn close_session(&self, session: &VehicleSession) -> Result<(), StoreError> {
        self.memory.ledger.read().check_close(session)?;
        self.append(&JournalRecord::SessionClosed(session.clone()))?;
        self.memory.ledger.write().close_session(session);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::session::Tariff;
    use crate::domain::types::{EventKind, EventStatus, FloorId};
    use chrono::{Duration, TimeZone};
    use std::fs;
    use tempfile::tempdir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    fn entry(plate: &str, at: DateTime<Utc>) -> Event {
        Event::new(Plate::new(plate), EventKind::Entry, 0.9, FloorId::new("ground")).with_timestamp(at)
    }

    #[test]
    fn test_event_upsert_and_indexes() {
        let store = MemoryStore::new();
        let mut first = entry("ABC1234", t0());
        let second = entry("ABC1234", t0() + Duration::minutes(5));
        let other = entry("XYZ9876", t0() + Duration::minutes(1));

        store.record_event(&second).unwrap();
        store.record_event(&first).unwrap();
        store.record_event(&other).unwrap();

        first.status = EventStatus::Done;
        store.record_event(&first).unwrap();

        assert_eq!(store.event(&first.id).unwrap().status, EventStatus::Done);
        let for_plate = store.events_for_plate(&Plate::new("ABC1234"));
        assert_eq!(for_plate.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), vec![
            first.id.as_str(),
            second.id.as_str()
        ]);

        let recent = store.events_since(t0() + Duration::seconds(30));
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, other.id);
    }

    #[test]
    fn test_session_lifecycle() {
        let store = MemoryStore::new();
        let session = VehicleSession::open(&entry("ABC1234", t0()));

        store.insert_session(&session).unwrap();
        assert!(matches!(store.insert_session(&session), Err(StoreError::SessionAlreadyOpen(_))));
        assert_eq!(store.open_session_count(), 1);

        let closed = session.closed(t0() + Duration::minutes(20), &Tariff::default());
        store.close_session(&closed).unwrap();
        assert!(store.open_session(&session.plate).is_none());
        assert_eq!(store.history(&session.plate), vec![closed.clone()]);
        assert!(matches!(store.close_session(&closed), Err(StoreError::SessionNotOpen(_))));
    }

    #[test]
    fn test_journal_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger").join("parking.jsonl");

        let parked = VehicleSession::open(&entry("ABC1234", t0()));
        let departed = VehicleSession::open(&entry("XYZ9876", t0()));
        {
            let store = JournalStore::open(&path).unwrap();
            store.insert_session(&parked).unwrap();
            store.insert_session(&departed).unwrap();
            store
                .close_session(&departed.closed(t0() + Duration::minutes(3), &Tariff::default()))
                .unwrap();
            store.record_event(&entry("ABC1234", t0())).unwrap();
        }

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 4);
        assert!(content.lines().all(|l| serde_json::from_str::<serde_json::Value>(l).is_ok()));

        let reopened = JournalStore::open(&path).unwrap();
        assert_eq!(reopened.open_session_count(), 1);
        assert_eq!(reopened.open_session(&parked.plate), Some(parked));
        assert_eq!(reopened.history(&departed.plate).len(), 1);
        assert_eq!(reopened.events_for_plate(&Plate::new("ABC1234")).len(), 1);
    }

    #[test]
    fn test_journal_skips_torn_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("parking.jsonl");
        let session = VehicleSession::open(&entry("ABC1234", t0()));
        {
            let store = JournalStore::open(&path).unwrap();
            store.insert_session(&session).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"op\":\"session_clo").unwrap();
        drop(file);

        let reopened = JournalStore::open(&path).unwrap();
        assert_eq!(reopened.open_session(&session.plate), Some(session));
    }

    #[test]
    fn test_rejected_mutation_not_journaled() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("parking.jsonl");
        let store = JournalStore::open(&path).unwrap();
        let session = VehicleSession::open(&entry("ABC1234", t0()));
        store.insert_session(&session).unwrap();
        assert!(store.insert_session(&session).is_err());
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 1);
    }
}
