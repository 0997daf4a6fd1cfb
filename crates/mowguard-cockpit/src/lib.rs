//! `mowguard-cockpit` – The control command surface
//!
//! A small axum HTTP server through which operators and remote clients ask
//! for drive and blade commands, emergency stops and confirmed clears, and
//! read the current safety snapshot and audit trail.
//!
//! Actuator commands are checked by the
//! [`ControlGate`][mowguard_kernel::ControlGate] against the latest
//! [`SafetySnapshot`][mowguard_types::SafetySnapshot] before they are handed
//! to an [`ActuatorSink`]. Rejections carry the machine-readable reason, the
//! blocking interlock names and a remediation hint.
//!
//! # Usage
//!
//! ```rust,no_run
//! use mowguard_cockpit::{CockpitServer, CockpitState};
//! use mowguard_kernel::{BladeAuthorization, ControlGate};
//! use mowguard_runtime::{CoreConfig, SafetyCore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let core = SafetyCore::start(CoreConfig::default())?;
//!     let state = CockpitState::new(&core, ControlGate::new(BladeAuthorization::new()));
//!     CockpitServer::new(state).with_port(8080).run().await?;
//!     Ok(())
//! }
//! ```

pub mod handlers;
pub mod server;
pub mod state;

pub use handlers::ApiError;
pub use server::{CockpitServer, DEFAULT_PORT};
pub use state::{ActuatorSink, CockpitState, LoggingActuators};

