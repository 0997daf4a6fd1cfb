//! Safety state, interlock descriptors and the audit events emitted on every
//! state transition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::reading::Timestamp;

/// The authoritative safety state of the mower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyState {
    Normal,
    Degraded,
    LockedOut,
    EmergencyStopped,
    EmergencyClearing,
}

impl SafetyState {
    /// Rank used by the tie-break rule: the higher, the more restrictive.
    pub fn restrictiveness(&self) -> u8 {
        match self {
            SafetyState::Normal => 0,
            SafetyState::Degraded => 1,
            SafetyState::LockedOut => 2,
            SafetyState::EmergencyClearing => 3,
            SafetyState::EmergencyStopped => 4,
        }
    }

    /// Inverse of the `Display` form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NORMAL" => Some(SafetyState::Normal),
            "DEGRADED" => Some(SafetyState::Degraded),
            "LOCKED_OUT" => Some(SafetyState::LockedOut),
            "EMERGENCY_STOPPED" => Some(SafetyState::EmergencyStopped),
            "EMERGENCY_CLEARING" => Some(SafetyState::EmergencyClearing),
            _ => None,
        }
    }

    /// `true` for the two emergency states.
    pub fn is_emergency(&self) -> bool {
        matches!(
            self,
            SafetyState::EmergencyStopped | SafetyState::EmergencyClearing
        )
    }
}

impl std::fmt::Display for SafetyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SafetyState::Normal => "NORMAL",
            SafetyState::Degraded => "DEGRADED",
            SafetyState::LockedOut => "LOCKED_OUT",
            SafetyState::EmergencyStopped => "EMERGENCY_STOPPED",
            SafetyState::EmergencyClearing => "EMERGENCY_CLEARING",
        };
        f.write_str(s)
    }
}

/// Interlock severity. `Critical` beats `Warning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Warning,
    Critical,
}

/// Actuator families that can be locked out independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorClass {
    Drive,
    Blade,
}

impl std::fmt::Display for ActuatorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActuatorClass::Drive => f.write_str("drive"),
            ActuatorClass::Blade => f.write_str("blade"),
        }
    }
}

/// What an active CRITICAL interlock does: stop everything, or block one
/// actuator class while the rest of the machine keeps running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", tag = "scope", content = "actuator")]
pub enum InterlockScope {
    StopAll,
    Lockout(ActuatorClass),
}

/// One interlock as evaluated on a single tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct InterlockCondition {
    pub name: String,
    pub severity: Severity,
    pub scope: InterlockScope,
    pub current_value: bool,
    /// Measured value that tripped the interlock, for operators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl InterlockCondition {
    /// `true` when this condition is active and CRITICAL.
    pub fn is_critical(&self) -> bool {
        self.current_value && self.severity == Severity::Critical
    }

    /// `true` when this condition is active and WARNING.
    pub fn is_warning(&self) -> bool {
        self.current_value && self.severity == Severity::Warning
    }
}

/// Origin of an emergency stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StopSource {
    /// The REST / remote control surface.
    RemoteCommand,
    /// A physical stop button, lift or bump switch.
    PhysicalTrigger,
    TiltExceeded,
    WatchdogTimeout,
    /// A CRITICAL stop-all interlock other than tilt.
    Interlock,
    /// Signal delivered to the host process (Ctrl-C).
    OperatorSignal,
}

impl StopSource {
    /// Machine-readable reason used as the transition cause detail.
    pub fn as_reason(&self) -> &'static str {
        match self {
            StopSource::RemoteCommand => "remote_stop",
            StopSource::PhysicalTrigger => "physical_trigger",
            StopSource::TiltExceeded => "tilt_exceeded",
            StopSource::WatchdogTimeout => "watchdog_timeout",
            StopSource::Interlock => "interlock",
            StopSource::OperatorSignal => "operator_signal",
        }
    }
}

/// The first stop that latched EMERGENCY_STOPPED. Later stops do not
/// overwrite it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StopRecord {
    pub source: StopSource,
    pub reason: String,
    pub at: Timestamp,
}

/// Broad category of a transition cause, used to tell operator stops from
/// watchdog stops in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CauseKind {
    Command,
    Interlock,
    Watchdog,
    Clear,
    Recovery,
}

impl CauseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CauseKind::Command => "command",
            CauseKind::Interlock => "interlock",
            CauseKind::Watchdog => "watchdog",
            CauseKind::Clear => "clear",
            CauseKind::Recovery => "recovery",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "command" => Some(CauseKind::Command),
            "interlock" => Some(CauseKind::Interlock),
            "watchdog" => Some(CauseKind::Watchdog),
            "clear" => Some(CauseKind::Clear),
            "recovery" => Some(CauseKind::Recovery),
            _ => None,
        }
    }
}

/// Attribution attached to every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TransitionCause {
    pub kind: CauseKind,
    /// Interlock name or machine reason, e.g. `tilt_exceeded`.
    pub detail: String,
}

impl TransitionCause {
    pub fn new(kind: CauseKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for TransitionCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.detail)
    }
}

/// Audit record published on `safety/status` for every state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SafetyTransition {
    pub id: Uuid,
    pub from: SafetyState,
    pub to: SafetyState,
    pub cause: TransitionCause,
    /// Interlocks that blocked a clear request, empty otherwise.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
    pub at: Timestamp,
}

impl SafetyTransition {
    pub fn new(from: SafetyState, to: SafetyState, cause: TransitionCause) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to,
            cause,
            blocked_by: Vec::new(),
            at: Timestamp::now(),
        }
    }

    pub fn with_blocked_by(mut self, names: Vec<String>) -> Self {
        self.blocked_by = names;
        self
    }
}

/// Events published on `safety/emergency`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EmergencyEvent {
    StopRequested { source: StopSource, reason: String },
    Cleared,
    ClearBlocked { interlocks: Vec<String> },
}

/// Immutable copy of the safety state handed to readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SafetySnapshot {
    pub state: SafetyState,
    pub cause: Option<TransitionCause>,
    /// Interlocks whose `current_value` was true on the last tick.
    pub active_interlocks: Vec<InterlockCondition>,
    pub locked_actuators: Vec<ActuatorClass>,
    pub stop: Option<StopRecord>,
    /// Number of ticks evaluated so far.
    pub tick: u64,
}

impl Default for SafetySnapshot {
    fn default() -> Self {
        Self {
            state: SafetyState::Normal,
            cause: None,
            active_interlocks: Vec::new(),
            locked_actuators: Vec::new(),
            stop: None,
            tick: 0,
        }
    }
}

impl SafetySnapshot {
    /// `true` when commands to `actuator` are blocked by a lockout.
    pub fn is_locked(&self, actuator: ActuatorClass) -> bool {
        self.locked_actuators.contains(&actuator)
    }

    /// Names of the active critical interlocks that block `actuator`,
    /// either through a lockout of that class or a stop-all scope.
    pub fn blocking(&self, actuator: ActuatorClass) -> Vec<String> {
        self.active_interlocks
            .iter()
            .filter(|c| c.is_critical())
            .filter(|c| match c.scope {
                InterlockScope::StopAll => true,
                InterlockScope::Lockout(class) => class == actuator,
            })
            .map(|c| c.name.clone())
            .collect()
    }
}
