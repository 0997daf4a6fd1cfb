//! `mowguard-kernel` – Safety arbitration
//!
//! Owns the rules that decide whether the mower may move. Nothing in this
//! crate performs I/O or spawns tasks; `mowguard-runtime` drives it.
//!
//! # Modules
//!
//! - [`interlock`] – the [`Interlock`][interlock::Interlock] trait, the
//!   built-in interlocks and their [`SafetyThresholds`][interlock::SafetyThresholds].
//! - [`evaluator`] – [`SafetyEvaluator`][evaluator::SafetyEvaluator]:
//!   turns one tick's active interlocks into the state they demand.
//! - [`emergency`] – [`EmergencyController`][emergency::EmergencyController]:
//!   single writer of the safety state; latched stops and the confirmed
//!   clear protocol.
//! - [`watchdog`] – [`HeartbeatWatchdog`][watchdog::HeartbeatWatchdog]:
//!   liveness supervision with a derived startup grace period.
//! - [`control_gate`] – [`ControlGate`][control_gate::ControlGate]:
//!   accepts or rejects drive and blade commands against a snapshot.
//! - [`authorization`] – [`BladeAuthorization`][authorization::BladeAuthorization]:
//!   operator tokens required to run the blade.

pub mod authorization;
pub mod control_gate;
pub mod emergency;
pub mod evaluator;
pub mod interlock;
pub mod watchdog;


pub use authorization::{BladeAuthorization, BladeGrant};
pub use control_gate::{BladeCommand, ControlGate, DriveCommand, SpeedCaps};
pub use emergency::{ClearOutcome, EmergencyController, Outbox, StateChange};
pub use evaluator::{Evaluation, SafetyEvaluator};
pub use interlock::{Interlock, InterlockSet, SafetyThresholds, TickInput};
pub use watchdog::{ComponentHealth, HeartbeatRecord, HeartbeatWatchdog, WatchdogConfig, WatchdogFault};
