//! Shared state behind every control-surface handler.

use std::sync::Arc;

use mowguard_kernel::{BladeCommand, ControlGate, DriveCommand};
use mowguard_middleware::TelemetryBus;
use mowguard_middleware::topic::TopicFilter;
use mowguard_runtime::{SafetyCore, SafetyHandle, SharedJournal};
use mowguard_types::ReadingValue;
use tracing::info;

/// Where accepted actuator commands go.
///
/// Motor control lives outside the safety core; implementations hand the
/// command to whatever drives the motors.
pub trait ActuatorSink: Send + Sync {
    fn forward_drive(&self, cmd: &DriveCommand);
    fn forward_blade(&self, cmd: &BladeCommand);
}

/// [`ActuatorSink`] that only logs. Used when no motor controller is attached.
#[derive(Debug, Default)]
pub struct LoggingActuators;

impl ActuatorSink for LoggingActuators {
    fn forward_drive(&self, cmd: &DriveCommand) {
        info!(linear = cmd.linear, angular = cmd.angular, "drive command forwarded");
    }

    fn forward_blade(&self, cmd: &BladeCommand) {
        info!(enable = cmd.enable, "blade command forwarded");
    }
}

pub struct CockpitState {
    pub safety: SafetyHandle,
    pub bus: TelemetryBus,
    pub journal: SharedJournal,
    pub gate: ControlGate,
    pub actuators: Arc<dyn ActuatorSink>,
}

impl CockpitState {
    pub fn new(core: &SafetyCore, gate: ControlGate) -> Self {
        Self {
            safety: core.safety().clone(),
            bus: core.bus().clone(),
            journal: Arc::clone(core.journal()),
            gate,
            actuators: Arc::new(LoggingActuators),
        }
    }

    pub fn with_actuators(mut self, actuators: Arc<dyn ActuatorSink>) -> Self {
        self.actuators = actuators;
        self
    }

    /// `true` when the latest motion reading reports the drive motors running.
    pub fn drive_active(&self) -> bool {
        self.bus
            .latest_matching(&TopicFilter::Pattern("sensors/motion/#".to_string()))
            .iter()
            .any(|(_, reading)| matches!(reading.value(), ReadingValue::Motion { drive_active: true, .. }))
    }
}
