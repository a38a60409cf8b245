//! Integration tests for the floor ↔ coordinator link over loopback TCP

use parking_gateway::domain::{Event, EventKind, FloorId, LaneRole, Plate};
use parking_gateway::infra::{Config, Metrics};
use parking_gateway::io::lpr::{CaptureFault, PlateCapture, PlateRead};
use parking_gateway::io::protocol::{AdminCommand, EventSubmission, Reason};
use parking_gateway::io::server;
use parking_gateway::io::{
    CentralLink, ClientSettings, CoordinatorClient, MemoryStore, SimulatedBus, TransportFault,
};
use parking_gateway::services::{Coordinator, CoordinatorSettings, FaultReason, LaneMachine, LaneSettings, LaneState};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct FixedCamera(&'static str);

#[async_trait::async_trait]
impl PlateCapture for FixedCamera {
    async fn capture(&self) -> Result<PlateRead, CaptureFault> {
        Ok(PlateRead { plate: Plate::new(self.0), confidence: 0.93 })
    }
}

struct Central {
    coordinator: Arc<Coordinator>,
    port: u16,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

async fn start_central() -> Central {
    let config = Config::default().with_central("127.0.0.1", 0);
    let listener = server::bind(&config).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let coordinator = Arc::new(Coordinator::new(
        CoordinatorSettings::from_config(&config),
        Arc::new(MemoryStore::new()),
        Arc::new(Metrics::new()),
    ));
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(server::serve(listener, coordinator.clone(), shutdown_rx));
    Central { coordinator, port, shutdown, task }
}

fn client_settings(port: u16, request_timeout: Duration) -> ClientSettings {
    ClientSettings {
        addr: format!("127.0.0.1:{port}"),
        connect_timeout: Duration::from_secs(1),
        request_timeout,
        reconnect_delay: Duration::from_millis(100),
    }
}

async fn connect(port: u16, request_timeout: Duration) -> (Arc<CoordinatorClient>, watch::Sender<bool>) {
    let client = Arc::new(CoordinatorClient::new(client_settings(port, request_timeout)));
    let (shutdown, shutdown_rx) = watch::channel(false);
    let runner = client.clone();
    tokio::spawn(async move { runner.run(shutdown_rx).await });
    assert!(client.wait_connected(Duration::from_secs(5)).await, "client never connected");
    (client, shutdown)
}

fn lane(role: LaneRole, coil: u16, presence_register: u16, authorization_timeout: Duration) -> LaneSettings {
    LaneSettings {
        id: format!("{}-1", role.as_str()),
        role,
        floor_id: FloorId::new("ground"),
        coil,
        presence_register,
        capture_timeout: Duration::from_secs(2),
        authorization_timeout,
        passage_timeout: Duration::from_secs(10),
        min_confidence: 0.8,
    }
}

async fn step_until(machine: &mut LaneMachine, done: impl Fn(&LaneState) -> bool) {
    for _ in 0..20 {
        if done(machine.step().await) {
            return;
        }
    }
    panic!("lane {} stuck in {:?}", machine.id(), machine.state());
}

#[tokio::test]
async fn test_round_trip_over_loopback() {
    let central = start_central().await;
    let (client, client_shutdown) = connect(central.port, Duration::from_secs(2)).await;

    let entry = Event::new(Plate::new("LOOP001"), EventKind::Entry, 0.95, FloorId::new("ground"));
    let response = client.submit(EventSubmission::from(&entry)).await.unwrap();
    assert!(response.granted);
    assert_eq!(response.event_id, entry.id);

    let stats = client.statistics().await.unwrap();
    assert_eq!((stats.occupied, stats.free), (1, 7));
    assert_eq!(stats.connected_clients, 1);

    let ack = client.admin(AdminCommand::CloseFacility).await.unwrap();
    assert!(ack.ok);
    let refused = Event::new(Plate::new("LOOP002"), EventKind::Entry, 0.95, FloorId::new("ground"));
    let response = client.submit(EventSubmission::from(&refused)).await.unwrap();
    assert_eq!(response.reason, Some(Reason::FacilityClosed));

    // Exits still flow while closed
    let exit = Event::new(Plate::new("LOOP001"), EventKind::Exit, 0.95, FloorId::new("ground"));
    let response = client.submit(EventSubmission::from(&exit)).await.unwrap();
    assert!(response.granted);
    assert_eq!(response.fee, Some(2.00));
    assert_eq!(client.pending_requests(), 0);

    client_shutdown.send(true).unwrap();
    central.shutdown.send(true).unwrap();
    central.task.await.unwrap();
}

#[tokio::test]
async fn test_concurrent_requests_share_one_connection() {
    let central = start_central().await;
    let (client, client_shutdown) = connect(central.port, Duration::from_secs(2)).await;

    let requests: Vec<_> = (0..6)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                let event = Event::new(Plate::new(&format!("MUX{:03}", i)), EventKind::Entry, 0.95, FloorId::new("ground"));
                let response = client.submit(EventSubmission::from(&event)).await.unwrap();
                (event.id, response)
            })
        })
        .collect();

    for request in requests {
        let (id, response) = request.await.unwrap();
        assert_eq!(response.event_id, id);
        assert!(response.granted);
    }
    assert_eq!(central.coordinator.occupancy().occupied(), 6);

    client_shutdown.send(true).unwrap();
    central.shutdown.send(true).unwrap();
}

#[tokio::test]
async fn test_lane_cycle_over_tcp() {
    let central = start_central().await;
    let (client, client_shutdown) = connect(central.port, Duration::from_secs(2)).await;
    let bus = Arc::new(SimulatedBus::new(1, Duration::ZERO));
    let metrics = Arc::new(Metrics::new());

    let mut entry = LaneMachine::new(
        lane(LaneRole::Entry, 0x01, 0x08, Duration::from_secs(2)),
        bus.clone(),
        Arc::new(FixedCamera("TCP1234")),
        client.clone(),
        metrics.clone(),
    );
    bus.set_input_register(0x08, 1);
    step_until(&mut entry, |s| *s == LaneState::AwaitingPassage).await;
    assert!(bus.coil(0x01));
    bus.set_input_register(0x08, 0);
    step_until(&mut entry, |s| *s == LaneState::Idle).await;
    assert!(!bus.coil(0x01));
    assert_eq!(central.coordinator.occupancy().occupied(), 1);

    let mut exit = LaneMachine::new(
        lane(LaneRole::Exit, 0x02, 0x09, Duration::from_secs(2)),
        bus.clone(),
        Arc::new(FixedCamera("TCP1234")),
        client.clone(),
        metrics,
    );
    bus.set_input_register(0x09, 1);
    step_until(&mut exit, |s| *s == LaneState::OpeningBarrier).await;
    assert_eq!(exit.last_authorization().and_then(|r| r.fee), Some(2.00));
    step_until(&mut exit, |s| *s == LaneState::AwaitingPassage).await;
    bus.set_input_register(0x09, 0);
    step_until(&mut exit, |s| *s == LaneState::Idle).await;

    assert_eq!(central.coordinator.occupancy().occupied(), 0);
    assert_eq!(central.coordinator.get_statistics().revenue_window, 2.00);

    client_shutdown.send(true).unwrap();
    central.shutdown.send(true).unwrap();
}

#[tokio::test]
async fn test_silent_central_faults_lane_without_opening() {
    // Accepts connections and never answers
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let silent = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let (client, client_shutdown) = connect(port, Duration::from_millis(300)).await;
    let bus = Arc::new(SimulatedBus::new(1, Duration::ZERO));
    let mut machine = LaneMachine::new(
        lane(LaneRole::Entry, 0x01, 0x08, Duration::from_secs(1)),
        bus.clone(),
        Arc::new(FixedCamera("QUIET01")),
        client.clone(),
        Arc::new(Metrics::new()),
    );

    bus.set_input_register(0x08, 1);
    step_until(&mut machine, LaneState::is_fault).await;

    match machine.state() {
        LaneState::Fault(fault) => {
            assert_eq!(fault.reason, FaultReason::CentralUnreachable);
            assert_eq!(fault.from, "AWAITING_AUTHORIZATION");
        }
        other => panic!("unexpected state {other:?}"),
    }
    assert_eq!(bus.coil_writes(0x01), 0);
    assert!(!bus.coil(0x01));
    assert_eq!(client.pending_requests(), 0);

    client_shutdown.send(true).unwrap();
    silent.abort();
}

#[tokio::test]
async fn test_requests_fail_fast_after_central_goes_away() {
    let central = start_central().await;
    let (client, client_shutdown) = connect(central.port, Duration::from_secs(2)).await;

    central.shutdown.send(true).unwrap();
    central.task.await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while client.is_connected() {
        assert!(tokio::time::Instant::now() < deadline, "client still connected");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let event = Event::new(Plate::new("LATE001"), EventKind::Entry, 0.95, FloorId::new("ground"));
    assert_eq!(client.submit(EventSubmission::from(&event)).await, Err(TransportFault::NotConnected));

    client_shutdown.send(true).unwrap();
}
