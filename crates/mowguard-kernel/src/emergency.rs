//! [`EmergencyController`] – owner of the authoritative [`SafetyState`].
//!
//! The controller is the single writer of the safety state. It combines the
//! per-tick [`Evaluation`] with the latched emergency stop and the
//! confirmed-clear protocol:
//!
//! - `EMERGENCY_STOPPED` is sticky. Ticks never leave it; only
//!   [`EmergencyController::request_clear`] with `confirmation = true` does.
//! - A clear passes through `EMERGENCY_CLEARING`, re-checks every CRITICAL
//!   interlock against a fresh tick input, and either reaches `NORMAL` or
//!   falls back to `EMERGENCY_STOPPED` naming the blockers.
//! - `LOCKED_OUT` and `DEGRADED` follow the evaluation automatically.
//!
//! Every state change produces a [`SafetyTransition`]; stop and clear
//! activity also produces [`EmergencyEvent`]s. Both are queued in an outbox
//! the owning task drains with [`EmergencyController::take_outbox`].

use mowguard_types::{
    CauseKind, EmergencyEvent, InterlockCondition, MowError, SafetySnapshot, SafetyState,
    SafetyTransition, StopRecord, StopSource, Timestamp, TransitionCause,
};
use tracing::{debug, info, warn};

use crate::evaluator::{Evaluation, SafetyEvaluator};
use crate::interlock::TickInput;

/// Result of [`EmergencyController::request_stop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub from: SafetyState,
    pub to: SafetyState,
    /// The stop record now in force: the new one, or the earlier stop that
    /// already latched.
    pub stop: StopRecord,
}

impl StateChange {
    /// `false` when the stop found the machine already stopped.
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Successful outcomes of [`EmergencyController::request_clear`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearOutcome {
    EmergencyCleared,
    /// Nothing to clear; state untouched.
    NotStopped,
}

impl ClearOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClearOutcome::EmergencyCleared => "EMERGENCY_CLEARED",
            ClearOutcome::NotStopped => "NOT_STOPPED",
        }
    }
}

/// Transitions and emergency events waiting to be published.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Outbox {
    pub transitions: Vec<SafetyTransition>,
    pub events: Vec<EmergencyEvent>,
}

impl Outbox {
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty() && self.events.is_empty()
    }
}

fn cause_kind_for(source: StopSource) -> CauseKind {
    match source {
        StopSource::RemoteCommand | StopSource::OperatorSignal => CauseKind::Command,
        StopSource::WatchdogTimeout => CauseKind::Watchdog,
        StopSource::PhysicalTrigger | StopSource::TiltExceeded | StopSource::Interlock => {
            CauseKind::Interlock
        }
    }
}

/// Single-writer safety state machine.
pub struct EmergencyController {
    evaluator: SafetyEvaluator,
    state: SafetyState,
    cause: Option<TransitionCause>,
    stop: Option<StopRecord>,
    last: Option<Evaluation>,
    tick: u64,
    outbox: Outbox,
}

impl EmergencyController {
    /// A controller in `NORMAL` with no latched stop.
    pub fn new(evaluator: SafetyEvaluator) -> Self {
        Self {
            evaluator,
            state: SafetyState::Normal,
            cause: None,
            stop: None,
            last: None,
            tick: 0,
            outbox: Outbox::default(),
        }
    }

    /// Current safety state.
    pub fn state(&self) -> SafetyState {
        self.state
    }

    /// The latched stop, if any.
    pub fn stop_record(&self) -> Option<&StopRecord> {
        self.stop.as_ref()
    }

    /// Immutable copy of the current state for readers.
    pub fn snapshot(&self) -> SafetySnapshot {
        let (active_interlocks, locked_actuators) = match &self.last {
            Some(eval) => (eval.active.clone(), eval.locked.clone()),
            None => (Vec::new(), Vec::new()),
        };
        SafetySnapshot {
            state: self.state,
            cause: self.cause.clone(),
            active_interlocks,
            locked_actuators,
            stop: self.stop.clone(),
            tick: self.tick,
        }
    }

    /// Drain queued transitions and events.
    pub fn take_outbox(&mut self) -> Outbox {
        std::mem::take(&mut self.outbox)
    }

    fn transition(&mut self, to: SafetyState, cause: TransitionCause, blocked_by: Vec<String>) {
        let from = self.state;
        let transition = SafetyTransition::new(from, to, cause.clone()).with_blocked_by(blocked_by);
        info!(from = %from, to = %to, cause = %cause, "safety state transition");
        self.state = to;
        self.cause = Some(cause);
        self.outbox.transitions.push(transition);
    }

    fn latch(&mut self, source: StopSource, detail: &str, reason: String) -> StopRecord {
        let record = StopRecord {
            source,
            reason: reason.clone(),
            at: Timestamp::now(),
        };
        self.stop = Some(record.clone());
        self.transition(
            SafetyState::EmergencyStopped,
            TransitionCause::new(cause_kind_for(source), detail),
            Vec::new(),
        );
        self.outbox
            .events
            .push(EmergencyEvent::StopRequested { source, reason });
        record
    }

    /// Evaluate one tick.
    ///
    /// A demanded stop latches `EMERGENCY_STOPPED`. While stopped, the tick
    /// only refreshes the active-interlock view.
    pub fn tick(&mut self, input: &TickInput) {
        self.tick += 1;
        let eval = self.evaluator.evaluate(input);
        let demanded = eval.demanded;

        if self.state.is_emergency() {
            debug!(tick = self.tick, "tick while emergency stopped; state held");
        } else if demanded == SafetyState::EmergencyStopped {
            if let (Some(source), Some(decisive)) = (eval.stop_source(), eval.decisive.as_ref()) {
                let reason = decisive
                    .detail
                    .clone()
                    .unwrap_or_else(|| decisive.name.clone());
                warn!(interlock = %decisive.name, %reason, "critical interlock: emergency stop");
                let name = decisive.name.clone();
                self.latch(source, &name, reason);
            }
        } else if demanded != self.state {
            let cause = match &eval.decisive {
                Some(c) if demanded.restrictiveness() > self.state.restrictiveness() => {
                    TransitionCause::new(CauseKind::Interlock, c.name.clone())
                }
                Some(c) => TransitionCause::new(CauseKind::Recovery, c.name.clone()),
                None => TransitionCause::new(CauseKind::Recovery, "interlocks_clear"),
            };
            self.transition(demanded, cause, Vec::new());
        }

        self.last = Some(eval);
    }

    /// Latch an emergency stop.
    ///
    /// Always succeeds. Repeated stops are no-ops that keep the first stop's
    /// cause.
    pub fn request_stop(&mut self, source: StopSource, reason: impl Into<String>) -> StateChange {
        let reason = reason.into();
        let from = self.state;
        if let Some(existing) = self.stop.clone().filter(|_| self.state.is_emergency()) {
            debug!(source = source.as_reason(), %reason, "stop requested while already stopped");
            return StateChange {
                from,
                to: from,
                stop: existing,
            };
        }
        warn!(source = source.as_reason(), %reason, "emergency stop latched");
        let stop = self.latch(source, source.as_reason(), reason);
        StateChange {
            from,
            to: self.state,
            stop,
        }
    }

    /// Attempt to leave `EMERGENCY_STOPPED`.
    ///
    /// `input` is a fresh tick input used to re-check every CRITICAL
    /// interlock.
    ///
    /// # Errors
    ///
    /// - [`MowError::ConfirmationRequired`] when `confirmation` is false; the
    ///   state is left untouched.
    /// - [`MowError::InterlockStillActive`] naming the critical interlocks
    ///   still active; the state ends `EMERGENCY_STOPPED`.
    pub fn request_clear(&mut self, confirmation: bool, input: &TickInput) -> Result<ClearOutcome, MowError> {
        if !confirmation {
            info!(state = %self.state, "clear rejected: confirmation required");
            return Err(MowError::ConfirmationRequired);
        }
        if !self.state.is_emergency() {
            debug!(state = %self.state, "clear requested while not stopped");
            return Ok(ClearOutcome::NotStopped);
        }

        self.transition(
            SafetyState::EmergencyClearing,
            TransitionCause::new(CauseKind::Clear, "clear_requested"),
            Vec::new(),
        );

        let eval = self.evaluator.evaluate(input);
        let blocking = eval.critical_names();
        self.last = Some(eval);

        if !blocking.is_empty() {
            warn!(blocking = ?blocking, "clear blocked by active interlocks");
            self.transition(
                SafetyState::EmergencyStopped,
                TransitionCause::new(CauseKind::Clear, "clear_blocked"),
                blocking.clone(),
            );
            self.outbox.events.push(EmergencyEvent::ClearBlocked {
                interlocks: blocking.clone(),
            });
            return Err(MowError::InterlockStillActive { names: blocking });
        }

        self.stop = None;
        self.transition(
            SafetyState::Normal,
            TransitionCause::new(CauseKind::Clear, "emergency_cleared"),
            Vec::new(),
        );
        self.outbox.events.push(EmergencyEvent::Cleared);
        Ok(ClearOutcome::EmergencyCleared)
    }

    /// Active conditions from the most recent evaluation.
    pub fn active_interlocks(&self) -> &[InterlockCondition] {
        self.last.as_ref().map(|e| e.active.as_slice()).unwrap_or(&[])
    }
}
