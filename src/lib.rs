//! N-Defender Aggregator: sensor fusion backend
//!
//! Collects telemetry from independent sensing sources and keeps one
//! consistent picture of the system.
//!
//! ## Architecture
//!
//! - **Ingestors**: RF detector log, remote-ID log, VRX microcontroller serial
//!   link and system-controller HTTP API, each with its own background loop
//! - **Event Bus**: fan-out of typed envelopes with drop-oldest backpressure
//! - **State Store**: fixed named sections, snapshot on demand
//! - **Contact Fusion**: one ranked contact list across sources
//! - **Command Router**: commands routed to the serial link or the system controller

pub mod bus;
pub mod clock;
pub mod commands;
pub mod config;
pub mod contacts;
pub mod ingest;
pub mod runtime;
pub mod state;
pub mod types;

pub use config::AggregatorConfig;

pub use bus::{BusError, EventBus, Subscription};
pub use clock::{Clock, ManualClock, SystemClock};
pub use contacts::ContactFusion;
pub use state::{Section, StateError, StateStore};

pub use types::{
    event_types, CommandRequest, CommandResult, Contact, ContactKind, EventEnvelope, JsonMap, ReplayState,
    Severity, StatusSnapshot,
};

pub use commands::{CommandHandler, CommandRouter, SerialCommandHandler, SystemCommandHandler};
pub use ingest::{HealthStatus, Ingestor, IngestorHealth};
pub use runtime::{build_command_router, build_default_orchestrator, Orchestrator, Runtime};
