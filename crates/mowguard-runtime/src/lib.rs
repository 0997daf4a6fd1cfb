//! `mowguard-runtime` – The running safety core
//!
//! Drives the pure state machines of `mowguard-kernel` with Tokio tasks and
//! wires them to the telemetry bus.
//!
//! # Modules
//!
//! - [`safety_loop`] – [`spawn_safety_loop`][safety_loop::spawn_safety_loop]:
//!   the fixed-rate evaluation task, sole owner of the
//!   [`EmergencyController`][mowguard_kernel::EmergencyController]. Other
//!   tasks reach it through a cloneable
//!   [`SafetyHandle`][safety_loop::SafetyHandle].
//! - [`watchdog_task`] – [`spawn_watchdog`][watchdog_task::spawn_watchdog]:
//!   feeds `system/heartbeat` pulses to the
//!   [`HeartbeatWatchdog`][mowguard_kernel::HeartbeatWatchdog] and latches a
//!   watchdog stop on every fresh timeout.
//! - [`recorder`] – [`spawn_audit_recorder`][recorder::spawn_audit_recorder]:
//!   persists every `safety/status` transition to the audit journal.
//! - [`safety_core`] – [`SafetyCore`][safety_core::SafetyCore]: starts all of the above
//!   plus the ingest hub and the bridge gateway.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter. Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable trace export.

pub mod safety_core;
pub mod recorder;
pub mod safety_loop;
pub mod telemetry;
pub mod watchdog_task;

pub use safety_core::{CoreConfig, SafetyCore};
pub use recorder::{SharedJournal, spawn_audit_recorder};
pub use safety_loop::{SafetyCommand, SafetyHandle, SafetyLoopConfig, spawn_safety_loop};
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use watchdog_task::{SupervisedComponent, WatchdogTaskConfig, spawn_watchdog};
