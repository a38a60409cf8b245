//! Hardware bus clients
//!
//! `BusClient` is the capability the lane state machines and the display
//! updater talk to. Two implementations exist and are selected at startup
//! from configuration:
//! - `RtuBusClient` drives a real RS485 port (MODBUS RTU master)
//! - `SimulatedBus` answers from an in-memory device image
//!
//! One client instance owns the serial port; lanes share it through an
//! `Arc<dyn BusClient>` and transactions are serialized by an async mutex.

use crate::infra::config::{Config, OperatingMode};
use crate::infra::metrics::Metrics;
use crate::io::modbus::{self, BusFault, Request, Response};
use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, warn};

#[async_trait]
pub trait BusClient: Send + Sync {
    async fn write_coil(&self, address: u16, value: bool) -> Result<(), BusFault>;

    async fn read_input_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, BusFault>;

    async fn write_holding_register(&self, address: u16, value: u16) -> Result<(), BusFault>;
}

/// Build the bus client for the configured operating mode.
///
/// In simulation the concrete device is returned as well so the caller can
/// attach a traffic generator to it.
pub fn create_bus_client(
    config: &Config,
    metrics: Arc<Metrics>,
) -> (Arc<dyn BusClient>, Option<Arc<SimulatedBus>>) {
    match config.operating_mode() {
        OperatingMode::Hardware => (Arc::new(RtuBusClient::new(config, metrics)), None),
        OperatingMode::Simulation => {
            let bus = Arc::new(
                SimulatedBus::new(config.serial_slave_id(), SIMULATED_LATENCY)
                    .with_timeout(Duration::from_millis(config.serial_timeout_ms()))
                    .with_metrics(metrics),
            );
            (bus.clone(), Some(bus))
        }
    }
}

/// Round trip of an 8 byte frame plus reply at 9600 baud
const SIMULATED_LATENCY: Duration = Duration::from_millis(20);

fn expect_unit(response: Response) -> Result<(), BusFault> {
    match response {
        Response::CoilWritten { .. } | Response::RegisterWritten { .. } => Ok(()),
        Response::InputRegisters(_) => Err(BusFault::Malformed("register data in write reply".into())),
    }
}

fn expect_registers(response: Response) -> Result<Vec<u16>, BusFault> {
    match response {
        Response::InputRegisters(values) => Ok(values),
        _ => Err(BusFault::Malformed("write echo in read reply".into())),
    }
}

/// Read one response frame for `request`, giving up once `timeout` has elapsed.
///
/// The first byte after the request is the frame start, whatever address it
/// carries, so a reply from another slave reaches `decode_response` whole.
/// Only zero bytes ahead of it are dropped: address 0 is broadcast and no
/// slave ever answers from it.
pub async fn read_response<R>(
    reader: &mut R,
    request: &Request,
    timeout: Duration,
) -> Result<Vec<u8>, BusFault>
where
    R: AsyncRead + Unpin,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut frame: Vec<u8> = Vec::with_capacity(request.expected_response_len());
    let mut chunk = [0u8; 64];

    loop {
        if let Some(needed) = modbus::response_len(request, &frame) {
            if frame.len() >= needed {
                if frame.len() > needed {
                    tracing::trace!(leftover = frame.len() - needed, "bus_frame_leftover_bytes");
                    frame.truncate(needed);
                }
                return Ok(frame);
            }
        }

        match tokio::time::timeout_at(deadline, reader.read(&mut chunk)).await {
            Ok(Ok(0)) => return Err(BusFault::Io("serial stream closed".into())),
            Ok(Ok(n)) => {
                let mut received = &chunk[..n];
                if frame.is_empty() {
                    let idle = received.iter().take_while(|&&b| b == 0).count();
                    if idle > 0 {
                        debug!(discarded = idle, "bus_idle_bytes_discarded");
                    }
                    received = &received[idle..];
                }
                frame.extend_from_slice(received);
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Ok(Err(e)) => return Err(BusFault::Io(e.to_string())),
            Err(_) => return Err(BusFault::Timeout(timeout)),
        }
    }
}

/// One request/response exchange over an already-open byte stream
pub async fn transact<S>(
    stream: &mut S,
    slave: u8,
    request: &Request,
    timeout: Duration,
) -> Result<Response, BusFault>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    request.validate()?;
    let frame = request.encode(slave);
    tracing::trace!(tx = %hex::encode(&frame), "bus_tx");

    match tokio::time::timeout(timeout, stream.write_all(&frame)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(BusFault::Io(e.to_string())),
        Err(_) => return Err(BusFault::Timeout(timeout)),
    }

    let reply = read_response(stream, request, timeout).await?;
    tracing::trace!(rx = %hex::encode(&reply), "bus_rx");

    modbus::decode_response(slave, request, &reply).inspect_err(|fault| {
        warn!(
            fault = %fault,
            function = request.function_code(),
            raw_bytes = %hex::encode(&reply),
            "bus_frame_rejected"
        );
    })
}

/// MODBUS RTU master on a serial port
pub struct RtuBusClient {
    device: String,
    baud: u32,
    slave_id: u8,
    timeout: Duration,
    port: tokio::sync::Mutex<Option<SerialStream>>,
    metrics: Arc<Metrics>,
}

impl RtuBusClient {
    pub fn new(config: &Config, metrics: Arc<Metrics>) -> Self {
        Self {
            device: config.serial_device().to_string(),
            baud: config.serial_baud(),
            slave_id: config.serial_slave_id(),
            timeout: Duration::from_millis(config.serial_timeout_ms()),
            port: tokio::sync::Mutex::new(None),
            metrics,
        }
    }

    fn open_port(&self) -> Result<SerialStream, BusFault> {
        tokio_serial::new(&self.device, self.baud)
            .timeout(Duration::from_millis(100))
            .open_native_async()
            .map_err(|e| {
                error!(device = %self.device, error = %e, "bus_port_open_failed");
                BusFault::PortUnavailable(format!("{}: {}", self.device, e))
            })
    }

    async fn execute(&self, request: Request) -> Result<Response, BusFault> {
        let start = Instant::now();
        // Held for the whole exchange so lanes never interleave frames
        let mut guard = self.port.lock().await;

        if guard.is_none() {
            let port = self.open_port()?;
            info!(device = %self.device, baud = %self.baud, "bus_port_opened");
            *guard = Some(port);
        }
        let Some(port) = guard.as_mut() else {
            return Err(BusFault::PortUnavailable(self.device.clone()));
        };

        if let Err(e) = port.clear(tokio_serial::ClearBuffer::Input) {
            debug!(error = %e, "bus_clear_input_failed");
        }

        let result = transact(port, self.slave_id, &request, self.timeout).await;

        if let Err(BusFault::Io(ref e)) = result {
            // Reopen on the next transaction
            error!(device = %self.device, error = %e, "bus_port_io_error");
            *guard = None;
        }
        drop(guard);

        self.metrics.record_bus_transaction(start.elapsed().as_micros() as u64, result.is_ok());
        result
    }
}

#[async_trait]
impl BusClient for RtuBusClient {
    async fn write_coil(&self, address: u16, value: bool) -> Result<(), BusFault> {
        self.execute(Request::WriteCoil { address, value }).await.and_then(expect_unit)
    }

    async fn read_input_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, BusFault> {
        self.execute(Request::ReadInputRegisters { address, count }).await.and_then(expect_registers)
    }

    async fn write_holding_register(&self, address: u16, value: u16) -> Result<(), BusFault> {
        self.execute(Request::WriteHoldingRegister { address, value }).await.and_then(expect_unit)
    }
}

/// Fault to inject into the next simulated transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    /// Device stays silent
    Timeout,
    /// Reply arrives with a damaged CRC
    CorruptCrc,
    /// Reply claims to come from another slave
    WrongSlave,
    /// Device answers with an exception code
    Exception(u8),
}

#[derive(Debug, Default)]
struct DeviceImage {
    coils: FxHashMap<u16, bool>,
    input_registers: FxHashMap<u16, u16>,
    holding_registers: FxHashMap<u16, u16>,
}

impl DeviceImage {
    fn read(&self, request: &Request) -> Response {
        match *request {
            Request::ReadInputRegisters { address, count } => Response::InputRegisters(
                (0..count)
                    .map(|offset| {
                        self.input_registers.get(&address.wrapping_add(offset)).copied().unwrap_or(0)
                    })
                    .collect(),
            ),
            Request::WriteCoil { address, value } => Response::CoilWritten { address, value },
            Request::WriteHoldingRegister { address, value } => {
                Response::RegisterWritten { address, value }
            }
        }
    }

    fn commit(&mut self, request: &Request) {
        match *request {
            Request::WriteCoil { address, value } => {
                self.coils.insert(address, value);
            }
            Request::WriteHoldingRegister { address, value } => {
                self.holding_registers.insert(address, value);
            }
            Request::ReadInputRegisters { .. } => {}
        }
    }
}

/// In-memory bus device speaking the same frames as the hardware.
///
/// Each call is encoded, served by the device image and decoded through the
/// RTU codec, so framing faults surface exactly as on a real line. Writes are
/// committed to the image only when the reply decodes cleanly.
pub struct SimulatedBus {
    slave_id: u8,
    latency: Duration,
    timeout: Duration,
    device: Mutex<DeviceImage>,
    faults: Mutex<VecDeque<SimFault>>,
    requests: Mutex<Vec<Request>>,
    metrics: Option<Arc<Metrics>>,
}

impl SimulatedBus {
    pub fn new(slave_id: u8, latency: Duration) -> Self {
        Self {
            slave_id,
            latency,
            timeout: Duration::from_secs(3),
            device: Mutex::new(DeviceImage::default()),
            faults: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Timeout reported when a silent device is simulated
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Queue a fault for an upcoming transaction (FIFO)
    pub fn inject_fault(&self, fault: SimFault) {
        self.faults.lock().push_back(fault);
    }

    pub fn coil(&self, address: u16) -> bool {
        self.device.lock().coils.get(&address).copied().unwrap_or(false)
    }

    pub fn holding_register(&self, address: u16) -> Option<u16> {
        self.device.lock().holding_registers.get(&address).copied()
    }

    pub fn input_register(&self, address: u16) -> u16 {
        self.device.lock().input_registers.get(&address).copied().unwrap_or(0)
    }

    /// Drive a sensor value (what the physical world would do)
    pub fn set_input_register(&self, address: u16, value: u16) {
        self.device.lock().input_registers.insert(address, value);
    }

    /// Every request attempted so far, including ones that faulted
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    /// Number of coil writes attempted at `address`
    pub fn coil_writes(&self, address: u16) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| matches!(r, Request::WriteCoil { address: a, .. } if *a == address))
            .count()
    }

    async fn execute(&self, request: Request) -> Result<Response, BusFault> {
        let start = Instant::now();
        let result = self.serve(request).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_bus_transaction(start.elapsed().as_micros() as u64, result.is_ok());
        }
        result
    }

    async fn serve(&self, request: Request) -> Result<Response, BusFault> {
        request.validate()?;
        self.requests.lock().push(request);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let fault = self.faults.lock().pop_front();
        if fault == Some(SimFault::Timeout) {
            return Err(BusFault::Timeout(self.timeout));
        }

        // Device side: parse the request frame as it would arrive on the wire
        let (addressed_to, parsed) = modbus::decode_request(&request.encode(self.slave_id))?;
        let served = self.device.lock().read(&parsed);
        let mut reply = match fault {
            Some(SimFault::Exception(code)) => {
                modbus::encode_exception(addressed_to, parsed.function_code(), code)
            }
            Some(SimFault::WrongSlave) => {
                modbus::encode_response(addressed_to.wrapping_add(1), &parsed, &served)
            }
            _ => modbus::encode_response(addressed_to, &parsed, &served),
        };
        if fault == Some(SimFault::CorruptCrc) {
            let last = reply.len() - 1;
            reply[last] ^= 0xA5;
        }

        match modbus::decode_response(self.slave_id, &request, &reply) {
            Ok(response) => {
                self.device.lock().commit(&parsed);
                Ok(response)
            }
            Err(fault) => {
                warn!(fault = %fault, raw_bytes = %hex::encode(&reply), "bus_frame_rejected");
                Err(fault)
            }
        }
    }
}

#[async_trait]
impl BusClient for SimulatedBus {
    async fn write_coil(&self, address: u16, value: bool) -> Result<(), BusFault> {
        self.execute(Request::WriteCoil { address, value }).await.and_then(expect_unit)
    }

    async fn read_input_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, BusFault> {
        self.execute(Request::ReadInputRegisters { address, count }).await.and_then(expect_registers)
    }

    async fn write_holding_register(&self, address: u16, value: u16) -> Result<(), BusFault> {
        self.execute(Request::WriteHoldingRegister { address, value }).await.and_then(expect_unit)
    }
}
