//! End-to-end floor tests with lanes and coordinator in one process

use parking_gateway::domain::{FloorId, LaneRole, Plate};
use parking_gateway::infra::Metrics;
use parking_gateway::io::lpr::{CaptureFault, PlateCapture, PlateRead};
use parking_gateway::io::protocol::Reason;
use parking_gateway::io::sim_traffic::{TrafficGenerator, TrafficLane, TrafficSettings};
use parking_gateway::io::{MemoryStore, PlatePool, SimFault, SimulatedBus, SimulatedLpr, Store};
use parking_gateway::services::lane_worker::ResetBackoff;
use parking_gateway::services::{
    create_lane_worker, Coordinator, CoordinatorSettings, FaultReason, LaneHandle, LaneMachine, LaneSettings,
    LaneState, WorkerSettings,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

struct FixedCamera(&'static str);

#[async_trait::async_trait]
impl PlateCapture for FixedCamera {
    async fn capture(&self) -> Result<PlateRead, CaptureFault> {
        Ok(PlateRead { plate: Plate::new(self.0), confidence: 0.91 })
    }
}

fn coordinator(store: Arc<dyn Store>) -> Arc<Coordinator> {
    Arc::new(Coordinator::new(CoordinatorSettings::default(), store, Arc::new(Metrics::new())))
}

fn lane(role: LaneRole) -> LaneSettings {
    let (coil, presence_register) = match role {
        LaneRole::Entry => (0x01, 0x08),
        LaneRole::Exit => (0x02, 0x09),
    };
    LaneSettings {
        id: format!("{}-1", role.as_str()),
        role,
        floor_id: FloorId::new("ground"),
        coil,
        presence_register,
        capture_timeout: Duration::from_secs(5),
        authorization_timeout: Duration::from_secs(3),
        passage_timeout: Duration::from_secs(30),
        min_confidence: 0.8,
    }
}

fn worker_settings(auto_reset: bool) -> WorkerSettings {
    WorkerSettings {
        poll_interval: Duration::from_millis(200),
        auto_reset,
        backoff: ResetBackoff::new(Duration::from_secs(1), Duration::from_secs(30)),
        report_timeout: Duration::from_secs(3),
    }
}

fn spawn_lane(
    settings: LaneSettings,
    bus: &Arc<SimulatedBus>,
    lpr: Arc<dyn PlateCapture>,
    central: &Arc<Coordinator>,
    auto_reset: bool,
    shutdown: &watch::Receiver<bool>,
) -> (LaneHandle, tokio::task::JoinHandle<()>) {
    let metrics = Arc::new(Metrics::new());
    let machine = LaneMachine::new(settings, bus.clone(), lpr, central.clone(), metrics);
    let (handle, worker) = create_lane_worker(machine, worker_settings(auto_reset), central.clone());
    let task = tokio::spawn(worker.run(shutdown.clone()));
    (handle, task)
}

#[tokio::test(start_paused = true)]
async fn test_entry_then_exit_bills_the_stay() {
    let bus = Arc::new(SimulatedBus::new(1, Duration::ZERO));
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let central = coordinator(store.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (entry, entry_task) =
        spawn_lane(lane(LaneRole::Entry), &bus, Arc::new(FixedCamera("FLOW123")), &central, false, &shutdown_rx);
    let (exit, exit_task) =
        spawn_lane(lane(LaneRole::Exit), &bus, Arc::new(FixedCamera("FLOW123")), &central, false, &shutdown_rx);

    let mut entry_states = entry.subscribe();
    bus.set_input_register(0x08, 1);
    entry_states.wait_for(|s| *s == LaneState::AwaitingPassage).await.unwrap();
    assert!(bus.coil(0x01));
    bus.set_input_register(0x08, 0);
    entry_states.wait_for(|s| *s == LaneState::Idle).await.unwrap();
    assert!(!bus.coil(0x01));

    assert_eq!(central.occupancy().occupied(), 1);
    assert!(store.open_session(&Plate::new("FLOW123")).is_some());

    let mut exit_states = exit.subscribe();
    bus.set_input_register(0x09, 1);
    exit_states.wait_for(|s| *s == LaneState::AwaitingPassage).await.unwrap();
    bus.set_input_register(0x09, 0);
    exit_states.wait_for(|s| *s == LaneState::Idle).await.unwrap();

    assert_eq!(central.occupancy().occupied(), 0);
    let history = store.history(&Plate::new("FLOW123"));
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].fee, Some(2.00));

    let stats = central.get_statistics();
    assert_eq!((stats.entries_window, stats.exits_window), (1, 1));
    assert_eq!(stats.revenue_window, 2.00);

    shutdown_tx.send(true).unwrap();
    entry_task.await.unwrap();
    exit_task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_corrupt_open_ack_leaves_barrier_closed() {
    let bus = Arc::new(SimulatedBus::new(1, Duration::ZERO));
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let central = coordinator(store.clone());
    let metrics = Arc::new(Metrics::new());
    let mut machine =
        LaneMachine::new(lane(LaneRole::Entry), bus.clone(), Arc::new(FixedCamera("CRC0001")), central.clone(), metrics);

    bus.set_input_register(0x08, 1);
    while *machine.state() != LaneState::OpeningBarrier {
        assert!(!machine.step().await.is_fault());
    }

    bus.inject_fault(SimFault::CorruptCrc);
    machine.step().await;

    match machine.state() {
        LaneState::Fault(fault) => {
            assert_eq!(fault.reason, FaultReason::BusFault);
            assert_eq!(fault.from, "OPENING_BARRIER");
        }
        other => panic!("unexpected state {other:?}"),
    }
    assert!(!bus.coil(0x01));

    // Central already granted; the vehicle never passed, so a retry for the
    // same plate is a duplicate until an operator settles the session
    assert_eq!(central.occupancy().occupied(), 1);
    assert!(machine.reset());
    while !machine.step().await.is_fault() {}
    match machine.state() {
        LaneState::Fault(fault) => {
            assert_eq!(fault.reason, FaultReason::Denied);
            assert_eq!(fault.detail, Reason::DuplicateEntry.as_str());
        }
        other => panic!("unexpected state {other:?}"),
    }
    assert!(!bus.coil(0x01));
}

#[tokio::test(start_paused = true)]
async fn test_lane_fault_reported_to_coordinator() {
    let bus = Arc::new(SimulatedBus::new(1, Duration::ZERO));
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let central = coordinator(store.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    bus.inject_fault(SimFault::Exception(0x04));
    let (entry, task) =
        spawn_lane(lane(LaneRole::Entry), &bus, Arc::new(FixedCamera("UNUSED1")), &central, false, &shutdown_rx);

    let mut states = entry.subscribe();
    states.wait_for(LaneState::is_fault).await.unwrap();
    // Let the background report land
    tokio::time::sleep(Duration::from_millis(50)).await;

    let recorded: Vec<_> = store
        .events_since(chrono::Utc::now() - chrono::Duration::minutes(1))
        .into_iter()
        .filter(|e| e.kind == parking_gateway::domain::EventKind::Fault)
        .collect();
    assert_eq!(recorded.len(), 1);
    let detail = recorded[0].error_detail.as_deref().unwrap_or_default();
    assert!(detail.starts_with("BUS_FAULT lane=entry-1"), "{detail}");
    assert_eq!(central.occupancy().occupied(), 0);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_simulated_floor_stays_consistent() {
    let bus = Arc::new(SimulatedBus::new(1, Duration::from_millis(5)));
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let central = coordinator(store.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool = PlatePool::demo();
    let camera = |role| -> Arc<dyn PlateCapture> {
        Arc::new(
            SimulatedLpr::new(role, pool.clone())
                .with_success_rate(1.0)
                .with_confidence(0.85..0.99)
                .with_delay(100..400),
        )
    };
    let (_entry, entry_task) = spawn_lane(lane(LaneRole::Entry), &bus, camera(LaneRole::Entry), &central, true, &shutdown_rx);
    let (_exit, exit_task) = spawn_lane(lane(LaneRole::Exit), &bus, camera(LaneRole::Exit), &central, true, &shutdown_rx);

    let traffic = Arc::new(TrafficGenerator::new(
        bus.clone(),
        vec![
            TrafficLane { id: "entry-1".to_string(), role: LaneRole::Entry, coil: 0x01, presence_register: 0x08 },
            TrafficLane { id: "exit-1".to_string(), role: LaneRole::Exit, coil: 0x02, presence_register: 0x09 },
        ],
        TrafficSettings::default(),
    ));
    let traffic_task = tokio::spawn(traffic.run(shutdown_rx.clone()));

    tokio::time::sleep(Duration::from_secs(15 * 60)).await;
    shutdown_tx.send(true).unwrap();
    traffic_task.await.unwrap();
    entry_task.await.unwrap();
    exit_task.await.unwrap();

    let stats = central.get_statistics();
    assert!(stats.entries_window > 0);
    assert!(stats.occupied <= stats.total);
    assert_eq!(stats.occupied + stats.free, stats.total);
    assert_eq!(stats.occupied as usize, store.open_session_count());
    assert!(!bus.coil(0x01) && !bus.coil(0x02));
}
