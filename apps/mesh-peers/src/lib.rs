//! Virtual mesh peers: each session connects to the rendezvous service over one
//! WebSocket, registers any number of local peers, and negotiates a data channel
//! with every neighbor the service assigns.

pub mod capability;
pub mod config;
pub mod connection;
pub mod counters;
pub mod error;
pub mod orchestrator;
pub mod session;
pub mod signaling;
pub mod telemetry;

pub use config::MeshConfig;
pub use counters::{Counter, CounterSnapshot, MeshCounters};
pub use error::{MeshError, MeshResult};
pub use session::MeshSession;
