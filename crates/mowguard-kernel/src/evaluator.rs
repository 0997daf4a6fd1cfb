//! [`SafetyEvaluator`] – maps one tick's active interlocks to the state they
//! demand.
//!
//! The evaluator is pure: it never looks at the current state and holds no
//! memory between ticks. Stickiness and the clear protocol live in
//! [`EmergencyController`](crate::emergency::EmergencyController).
//!
//! Precedence within a tick, most restrictive first:
//!
//! | Active conditions | Demanded state |
//! |---|---|
//! | any CRITICAL with scope `StopAll` | `EMERGENCY_STOPPED` |
//! | any CRITICAL with scope `Lockout(_)` | `LOCKED_OUT` |
//! | any WARNING | `DEGRADED` |
//! | none | `NORMAL` |

use mowguard_types::{ActuatorClass, InterlockCondition, InterlockScope, SafetyState, StopSource};

use crate::interlock::{InterlockSet, SafetyThresholds, TickInput};

/// Result of evaluating one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub demanded: SafetyState,
    /// Active conditions only, in interlock order.
    pub active: Vec<InterlockCondition>,
    /// Actuator classes held by critical lockouts.
    pub locked: Vec<ActuatorClass>,
    /// The condition that decided `demanded`, if any.
    pub decisive: Option<InterlockCondition>,
}

impl Evaluation {
    /// Names of every active critical condition.
    pub fn critical_names(&self) -> Vec<String> {
        self.active
            .iter()
            .filter(|c| c.is_critical())
            .map(|c| c.name.clone())
            .collect()
    }

    /// Stop source attributed to the decisive stop-all condition.
    pub fn stop_source(&self) -> Option<StopSource> {
        let decisive = self.decisive.as_ref()?;
        if self.demanded != SafetyState::EmergencyStopped {
            return None;
        }
        Some(stop_source_for(&decisive.name))
    }
}

/// Map an interlock name to the stop source recorded in the audit trail.
pub fn stop_source_for(interlock: &str) -> StopSource {
    match interlock {
        "tilt_exceeded" => StopSource::TiltExceeded,
        "physical_trigger" => StopSource::PhysicalTrigger,
        "heartbeat_expired" => StopSource::WatchdogTimeout,
        _ => StopSource::Interlock,
    }
}

/// Evaluates an [`InterlockSet`] against each tick's input.
pub struct SafetyEvaluator {
    interlocks: InterlockSet,
}

impl SafetyEvaluator {
    pub fn new(interlocks: InterlockSet) -> Self {
        Self { interlocks }
    }

    /// Evaluator with the built-in interlocks.
    pub fn with_thresholds(thresholds: &SafetyThresholds) -> Self {
        Self::new(InterlockSet::with_defaults(thresholds))
    }

    /// Add or inspect interlocks after construction.
    pub fn interlocks_mut(&mut self) -> &mut InterlockSet {
        &mut self.interlocks
    }

    /// Evaluate every interlock and apply the precedence table.
    pub fn evaluate(&self, input: &TickInput) -> Evaluation {
        let active = self.interlocks.active(input);

        let stop_all = active
            .iter()
            .find(|c| c.is_critical() && c.scope == InterlockScope::StopAll);
        let lockouts: Vec<&InterlockCondition> = active
            .iter()
            .filter(|c| c.is_critical() && matches!(c.scope, InterlockScope::Lockout(_)))
            .collect();
        let warning = active.iter().find(|c| c.is_warning());

        let mut locked: Vec<ActuatorClass> = lockouts
            .iter()
            .filter_map(|c| match c.scope {
                InterlockScope::Lockout(class) => Some(class),
                InterlockScope::StopAll => None,
            })
            .collect();
        locked.sort();
        locked.dedup();

        let (demanded, decisive) = if let Some(c) = stop_all {
            (SafetyState::EmergencyStopped, Some(c.clone()))
        } else if let Some(c) = lockouts.first() {
            (SafetyState::LockedOut, Some((*c).clone()))
        } else if let Some(c) = warning {
            (SafetyState::Degraded, Some(c.clone()))
        } else {
            (SafetyState::Normal, None)
        };

        Evaluation {
            demanded,
            active,
            locked,
            decisive,
        }
    }
}
