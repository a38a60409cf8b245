//! Lane worker - drives one `LaneMachine` as its own task
//!
//! The worker owns the machine, so state mutation for a lane is never
//! concurrent. Operators reach it through a `LaneHandle`: reset commands go
//! in over an mpsc channel, state snapshots come out over a watch channel.
//! Optional auto-reset issues the external reset itself, after a delay that
//! doubles per consecutive fault.

use crate::infra::config::Config;
use crate::io::protocol::EventSubmission;
use crate::io::transport::CentralLink;
use crate::services::lane::{FaultReason, LaneMachine, LaneState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneCommand {
    /// Acknowledge a fault and return the lane to IDLE
    Reset,
}

/// Exponential delay for the automatic reset trigger
#[derive(Debug, Clone)]
pub struct ResetBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ResetBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self { initial, max, current: initial }
    }

    /// Delay before the next reset; doubles the one after it
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub auto_reset: bool,
    pub backoff: ResetBackoff,
    /// Give up on reporting a fault to central after this long
    pub report_timeout: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms()),
            auto_reset: config.auto_reset(),
            backoff: ResetBackoff::new(
                Duration::from_millis(config.reset_backoff_initial_ms()),
                Duration::from_millis(config.reset_backoff_max_ms()),
            ),
            report_timeout: Duration::from_millis(config.central_request_timeout_ms()),
        }
    }
}

/// Operator side of a lane worker
#[derive(Clone)]
pub struct LaneHandle {
    lane_id: String,
    cmd_tx: mpsc::Sender<LaneCommand>,
    state_rx: watch::Receiver<LaneState>,
}

impl LaneHandle {
    pub fn lane_id(&self) -> &str {
        &self.lane_id
    }

    pub fn state(&self) -> LaneState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LaneState> {
        self.state_rx.clone()
    }

    /// Acknowledge the current fault. Refused (false) unless the lane is in
    /// FAULT, or when the worker is gone or busy.
    pub fn reset(&self) -> bool {
        if !self.state_rx.borrow().is_fault() {
            return false;
        }
        self.cmd_tx.try_send(LaneCommand::Reset).is_ok()
    }
}

pub struct LaneWorker {
    machine: LaneMachine,
    settings: WorkerSettings,
    cmd_rx: mpsc::Receiver<LaneCommand>,
    state_tx: watch::Sender<LaneState>,
    central: Arc<dyn CentralLink>,
}

impl LaneWorker {
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            lane = %self.machine.id(),
            role = self.machine.settings().role.as_str(),
            auto_reset = self.settings.auto_reset,
            "lane_worker_started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.machine.state().is_fault() {
                if !self.await_reset(&mut shutdown).await {
                    break;
                }
            } else {
                if self.machine.state().is_polling() {
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.poll_interval) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                let passages = self.machine.passages();
                self.machine.step().await;

                if self.machine.passages() > passages {
                    self.settings.backoff.reset();
                }
                if self.machine.state().is_fault() {
                    self.discard_stale_commands();
                    self.report_fault();
                }
            }

            self.state_tx.send_if_modified(|state| {
                if *state == *self.machine.state() {
                    false
                } else {
                    *state = self.machine.state().clone();
                    true
                }
            });
        }

        self.machine.close_if_open().await;
        info!(lane = %self.machine.id(), state = self.machine.state().name(), "lane_worker_stopped");
    }

    /// Wait in FAULT for an operator or automatic reset.
    /// Returns false when shutdown was requested.
    async fn await_reset(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let auto_delay = self.settings.auto_reset.then(|| self.settings.backoff.next_delay());
        if let Some(delay) = auto_delay {
            debug!(lane = %self.machine.id(), delay_ms = delay.as_millis() as u64, "lane_auto_reset_scheduled");
        }

        tokio::select! {
            Some(LaneCommand::Reset) = self.cmd_rx.recv() => {
                info!(lane = %self.machine.id(), "lane_reset_requested");
                self.machine.reset();
                true
            }
            _ = sleep_opt(auto_delay) => {
                info!(lane = %self.machine.id(), "lane_auto_reset");
                self.machine.reset();
                true
            }
            changed = shutdown.changed() => !(changed.is_err() || *shutdown.borrow()),
        }
    }

    /// Commands queued before this fault was published acknowledge nothing
    fn discard_stale_commands(&mut self) {
        let mut discarded = 0usize;
        while self.cmd_rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(lane = %self.machine.id(), discarded, "lane_stale_commands_discarded");
        }
    }

    /// Best-effort FAULT event to central. Denials are central's own decision
    /// and are not echoed back.
    fn report_fault(&self) {
        let LaneState::Fault(fault) = self.machine.state() else {
            return;
        };
        if fault.reason == FaultReason::Denied {
            return;
        }
        let Some(event) = self.machine.fault_event() else {
            return;
        };

        let central = self.central.clone();
        let lane = self.machine.id().to_string();
        let timeout = self.settings.report_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, central.submit(EventSubmission::from(&event))).await {
                Ok(Ok(_)) => debug!(lane = %lane, event_id = %event.id, "lane_fault_reported"),
                Ok(Err(e)) => warn!(lane = %lane, error = %e, "lane_fault_report_failed"),
                Err(_) => warn!(lane = %lane, "lane_fault_report_timeout"),
            }
        });
    }
}

async fn sleep_opt(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

/// Wrap a lane machine in a worker and the handle that controls it
pub fn create_lane_worker(
    machine: LaneMachine,
    settings: WorkerSettings,
    central: Arc<dyn CentralLink>,
) -> (LaneHandle, LaneWorker) {
    let (cmd_tx, cmd_rx) = mpsc::channel(4);
    let (state_tx, state_rx) = watch::channel(machine.state().clone());
    let handle = LaneHandle { lane_id: machine.id().to_string(), cmd_tx, state_rx };
    let worker = LaneWorker { machine, settings, cmd_rx, state_tx, central };
    (handle, worker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{FloorId, LaneRole, Plate};
    use crate::io::bus::{SimFault, SimulatedBus};
    use crate::io::lpr::{CaptureFault, PlateCapture, PlateRead};
    use crate::io::protocol::{AuthorizationResponse, Statistics};
    use crate::io::transport::TransportFault;
    use crate::infra::metrics::Metrics;
    use crate::services::lane::LaneSettings;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = ResetBackoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    struct Camera;

    #[async_trait]
    impl PlateCapture for Camera {
        async fn capture(&self) -> Result<PlateRead, CaptureFault> {
            Ok(PlateRead { plate: Plate::new("ABC1234"), confidence: 0.95 })
        }
    }

    #[derive(Default)]
    struct RecordingCentral {
        seen: Mutex<Vec<EventSubmission>>,
    }

    #[async_trait]
    impl CentralLink for RecordingCentral {
        async fn submit(&self, submission: EventSubmission) -> Result<AuthorizationResponse, TransportFault> {
            let response = AuthorizationResponse::granted(&submission.id);
            self.seen.lock().push(submission);
            Ok(response)
        }

        async fn statistics(&self) -> Result<Statistics, TransportFault> {
            Err(TransportFault::NotConnected)
        }
    }

    fn worker(bus: &Arc<SimulatedBus>, central: &Arc<RecordingCentral>, auto_reset: bool) -> (LaneHandle, LaneWorker) {
        let metrics = Arc::new(Metrics::new());
        let lane = LaneSettings {
            id: "entry-1".to_string(),
            role: LaneRole::Entry,
            floor_id: FloorId::new("ground"),
            coil: 0x01,
            presence_register: 0x08,
            capture_timeout: Duration::from_secs(5),
            authorization_timeout: Duration::from_secs(3),
            passage_timeout: Duration::from_secs(30),
            min_confidence: 0.8,
        };
        let machine = LaneMachine::new(lane, bus.clone(), Arc::new(Camera), central.clone(), metrics);
        let settings = WorkerSettings {
            poll_interval: Duration::from_millis(200),
            auto_reset,
            backoff: ResetBackoff::new(Duration::from_secs(1), Duration::from_secs(60)),
            report_timeout: Duration::from_secs(3),
        };
        create_lane_worker(machine, settings, central.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_held_until_reset() {
        let bus = Arc::new(SimulatedBus::new(1, Duration::ZERO));
        let central = Arc::new(RecordingCentral::default());
        bus.inject_fault(SimFault::Timeout);

        let (handle, worker) = worker(&bus, &central, false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(worker.run(shutdown_rx));

        let mut states = handle.subscribe();
        states.wait_for(LaneState::is_fault).await.unwrap();

        // Held in FAULT well past any backoff
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(handle.state().is_fault());
        assert_eq!(central.seen.lock().len(), 1);

        assert!(handle.reset());
        states.wait_for(|s| *s == LaneState::Idle).await.unwrap();

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_before_fault_does_not_acknowledge_it() {
        let bus = Arc::new(SimulatedBus::new(1, Duration::ZERO));
        let central = Arc::new(RecordingCentral::default());

        let (handle, mut worker) = worker(&bus, &central, false);
        // A command already sitting in the queue when the fault happens
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        cmd_tx.try_send(LaneCommand::Reset).unwrap();
        worker.cmd_rx = cmd_rx;
        let handle = LaneHandle { cmd_tx, ..handle };

        // Refused while the lane is healthy
        assert!(!handle.reset());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(worker.run(shutdown_rx));
        bus.inject_fault(SimFault::Timeout);

        let mut states = handle.subscribe();
        states.wait_for(LaneState::is_fault).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(handle.state().is_fault());

        assert!(handle.reset());
        states.wait_for(|s| *s == LaneState::Idle).await.unwrap();

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_reset_then_passage() {
        let bus = Arc::new(SimulatedBus::new(1, Duration::ZERO));
        let central = Arc::new(RecordingCentral::default());
        bus.inject_fault(SimFault::Timeout);

        let (handle, worker) = worker(&bus, &central, true);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(worker.run(shutdown_rx));

        let mut states = handle.subscribe();
        states.wait_for(LaneState::is_fault).await.unwrap();
        states.wait_for(|s| *s == LaneState::Idle).await.unwrap();

        bus.set_input_register(0x08, 1);
        states.wait_for(|s| *s == LaneState::AwaitingPassage).await.unwrap();
        assert!(bus.coil(0x01));
        bus.set_input_register(0x08, 0);
        states.wait_for(|s| *s == LaneState::Idle).await.unwrap();
        assert!(!bus.coil(0x01));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
