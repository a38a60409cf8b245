//! IO modules - everything that touches bytes
//!
//! - `modbus` - MODBUS RTU framing and CRC
//! - `bus` - Bus clients: serial hardware and in-memory simulation
//! - `sim_traffic` - Simulated vehicles driving the simulated bus
//! - `lpr` - Plate capture adapters
//! - `protocol` - Floor/coordinator newline-JSON messages
//! - `transport` - Floor-side coordinator client
//! - `server` - Coordinator TCP listener
//! - `store` - Event and session ledger (memory or JSONL journal)
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod bus;
pub mod lpr;
pub mod modbus;
pub mod prometheus;
pub mod protocol;
pub mod server;
pub mod sim_traffic;
pub mod store;
pub mod transport;

pub use bus::{create_bus_client, BusClient, SimFault, SimulatedBus};
pub use lpr::{PlateCapture, PlatePool, SimulatedLpr};
pub use modbus::BusFault;
pub use store::{JournalStore, MemoryStore, Store};
pub use transport::{CentralLink, ClientSettings, CoordinatorClient, TransportFault};
