//! # C&DH Core
//!
//! Command and data handling core for small-satellite flight software: a network
//! of tokio tasks, one per module, exchanging command envelopes over bounded
//! queues.
//!
//! ## Features
//!
//! - **Command routing**: FIFO dispatch to per-module queues, with rejection
//!   acknowledgements instead of silent drops
//! - **Deferred scheduling**: time-tagged and periodic commands released
//!   earliest-first by a timer task
//! - **Satellite modes**: a total (state × event) transition table plus an
//!   autonomous supervisor
//! - **Housekeeping**: onboard time, per-module health records and framed
//!   environmental telemetry
//! - **Bounded memory**: fixed-capacity envelopes, diaries, queues and schedule
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use cdh_core::{CdhConfig, Destination, Envelope, FixedAnalog, FlightSoftware, MemorySink};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), cdh_core::AgentError> {
//!     let sink = Arc::new(MemorySink::new());
//!     let fsw = FlightSoftware::start(CdhConfig::default(), sink.clone(), Arc::new(FixedAnalog::default()))?;
//!
//!     // Ask the power module for its health report
//!     fsw.submit(Envelope::new(Destination::Power, 1))?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`agent`] - Wires every queue and task together
//! - [`dispatcher`] - Command router and diary fan-out
//! - [`scheduler`] - Deferred command schedule and its release timer
//! - [`modes`] - Satellite mode state machine and supervisor
//! - [`housekeeping`] - Time, health aggregation and the telemetry stream
//! - [`subsystems`] - ADCS, COMM, payload and power managers
//! - [`protocol`] - Envelopes, diaries, acknowledgements
//! - [`telemetry`] - Output sinks, analog inputs and frame building

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]

pub mod agent;
pub mod clock;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod health;
pub mod housekeeping;
pub mod modes;
pub mod protocol;
pub mod queue;
pub mod scheduler;
pub mod subsystems;
pub mod telemetry;

// Re-export main public types for convenience
pub use agent::{AgentError, FlightSoftware};
pub use config::CdhConfig;
pub use context::FlightContext;
pub use health::{HealthRecord, ModuleStatus, SubsystemMode};
pub use modes::{ModeEvent, SatelliteMode};
pub use protocol::{CommandResponse, Destination, Diary, Envelope, HealthData, ResponseStatus};
pub use telemetry::{FixedAnalog, MemorySink, TelemetrySink};
