//! [`ControlGate`] – single interception point for actuator commands.
//!
//! Drive and blade commands from the control surface pass through
//! [`ControlGate::request_drive`] / [`ControlGate::request_blade`] before
//! anything is forwarded to the motor controllers. Checks run in order and
//! the first failing group is returned as
//! [`MowError::InterlockViolation`] with the blocking names:
//!
//! | Check | Blocking name |
//! |---|---|
//! | state is `EMERGENCY_STOPPED` / `EMERGENCY_CLEARING` | `emergency_stop_active` |
//! | critical interlocks holding the actuator | the interlock names |
//! | drive speed within caps | `speed_cap_exceeded` |
//! | blade token granted | `authorization_missing` |
//! | drive idle, or token allows driving | `drive_active_unauthorized` |
//!
//! Disabling the blade is always accepted.
//!
//! # Example
//!
//! ```
//! use mowguard_kernel::control_gate::{ControlGate, DriveCommand};
//! use mowguard_kernel::authorization::BladeAuthorization;
//! use mowguard_types::{SafetySnapshot, SafetyState};
//!
//! let gate = ControlGate::new(BladeAuthorization::new());
//! let cmd = DriveCommand { linear: 0.4, angular: 0.0 };
//!
//! assert!(gate.request_drive(&SafetySnapshot::default(), &cmd).is_ok());
//!
//! let stopped = SafetySnapshot { state: SafetyState::EmergencyStopped, ..SafetySnapshot::default() };
//! assert!(gate.request_drive(&stopped, &cmd).is_err());
//! ```

use mowguard_types::{ActuatorClass, MowError, SafetySnapshot};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::authorization::BladeAuthorization;

pub const EMERGENCY_STOP_ACTIVE: &str = "emergency_stop_active";
pub const SPEED_CAP_EXCEEDED: &str = "speed_cap_exceeded";
pub const AUTHORIZATION_MISSING: &str = "authorization_missing";
pub const DRIVE_ACTIVE_UNAUTHORIZED: &str = "drive_active_unauthorized";

/// Requested drive velocities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriveCommand {
    /// m/s, positive forward.
    pub linear: f32,
    /// rad/s, positive counter-clockwise.
    pub angular: f32,
}

/// Requested blade state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BladeCommand {
    pub enable: bool,
    #[serde(default)]
    pub token: Option<String>,
}

/// Velocity caps applied to drive commands.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedCaps {
    pub max_linear: f32,
    pub max_angular: f32,
}

impl Default for SpeedCaps {
    fn default() -> Self {
        Self {
            max_linear: 1.0,
            max_angular: 1.5,
        }
    }
}

fn violation(blocking: Vec<String>) -> MowError {
    MowError::InterlockViolation { blocking }
}

/// Gate consulted for every actuator command.
pub struct ControlGate {
    authorization: BladeAuthorization,
    caps: SpeedCaps,
}

impl ControlGate {
    /// Gate with the default [`SpeedCaps`].
    pub fn new(authorization: BladeAuthorization) -> Self {
        Self::with_caps(authorization, SpeedCaps::default())
    }

    /// Gate with explicit speed caps.
    pub fn with_caps(authorization: BladeAuthorization, caps: SpeedCaps) -> Self {
        Self { authorization, caps }
    }

    /// Blade tokens this gate accepts.
    pub fn authorization(&self) -> &BladeAuthorization {
        &self.authorization
    }

    fn check_actuator(snapshot: &SafetySnapshot, actuator: ActuatorClass) -> Result<(), MowError> {
        if snapshot.state.is_emergency() {
            return Err(violation(vec![EMERGENCY_STOP_ACTIVE.to_string()]));
        }
        let blocking = snapshot.blocking(actuator);
        if !blocking.is_empty() {
            return Err(violation(blocking));
        }
        Ok(())
    }

    /// Accept or reject a drive command against the current snapshot.
    ///
    /// # Errors
    ///
    /// [`MowError::InterlockViolation`] naming what blocks the command.
    pub fn request_drive(&self, snapshot: &SafetySnapshot, cmd: &DriveCommand) -> Result<(), MowError> {
        Self::check_actuator(snapshot, ActuatorClass::Drive)?;
        let within_caps = cmd.linear.is_finite()
            && cmd.angular.is_finite()
            && cmd.linear.abs() <= self.caps.max_linear
            && cmd.angular.abs() <= self.caps.max_angular;
        if !within_caps {
            debug!(linear = cmd.linear, angular = cmd.angular, "drive command above speed caps");
            return Err(violation(vec![SPEED_CAP_EXCEEDED.to_string()]));
        }
        Ok(())
    }

    /// Accept or reject a blade command.
    ///
    /// `drive_active` is the latest motion reading of the drive motors.
    ///
    /// # Errors
    ///
    /// [`MowError::InterlockViolation`] naming what blocks the command.
    pub fn request_blade(
        &self,
        snapshot: &SafetySnapshot,
        cmd: &BladeCommand,
        drive_active: bool,
    ) -> Result<(), MowError> {
        if !cmd.enable {
            return Ok(());
        }
        Self::check_actuator(snapshot, ActuatorClass::Blade)?;

        let grant = cmd
            .token
            .as_deref()
            .and_then(|token| self.authorization.check(token))
            .ok_or_else(|| violation(vec![AUTHORIZATION_MISSING.to_string()]))?;

        if drive_active && !grant.allow_while_driving {
            return Err(violation(vec![DRIVE_ACTIVE_UNAUTHORIZED.to_string()]));
        }
        info!(operator = %grant.operator, "blade enable accepted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::BladeGrant;
    use mowguard_types::{InterlockCondition, InterlockScope, SafetyState, Severity};

    fn gate() -> ControlGate {
        let mut auth = BladeAuthorization::new();
        auth.grant(
            "parked",
            BladeGrant {
                operator: "alice".into(),
                allow_while_driving: false,
            },
        );
        auth.grant(
            "mowing",
            BladeGrant {
                operator: "bob".into(),
                allow_while_driving: true,
            },
        );
        ControlGate::new(auth)
    }

    fn enable(token: &str) -> BladeCommand {
        BladeCommand {
            enable: true,
            token: Some(token.to_string()),
        }
    }

    fn with_condition(state: SafetyState, name: &str, scope: InterlockScope) -> SafetySnapshot {
        SafetySnapshot {
            state,
            active_interlocks: vec![InterlockCondition {
                name: name.into(),
                severity: Severity::Critical,
                scope,
                current_value: true,
                detail: None,
            }],
            ..SafetySnapshot::default()
        }
    }

    fn blocking(err: MowError) -> Vec<String> {
        err.blocking().to_vec()
    }

    #[test]
    fn blade_while_stopped_is_emergency_stop_active() {
        let snap = SafetySnapshot {
            state: SafetyState::EmergencyStopped,
            ..SafetySnapshot::default()
        };
        let err = gate().request_blade(&snap, &enable("mowing"), false).unwrap_err();
        assert_eq!(blocking(err), vec![EMERGENCY_STOP_ACTIVE]);
    }

    #[test]
    fn lockout_blocks_only_its_actuator() {
        let snap = with_condition(
            SafetyState::LockedOut,
            "obstacle_too_close",
            InterlockScope::Lockout(ActuatorClass::Drive),
        );
        let drive = DriveCommand {
            linear: 0.5,
            angular: 0.0,
        };
        let err = gate().request_drive(&snap, &drive).unwrap_err();
        assert_eq!(blocking(err), vec!["obstacle_too_close"]);
        assert!(gate().request_blade(&snap, &enable("parked"), false).is_ok());
    }

    #[test]
    fn thermal_lockout_blocks_blade() {
        let snap = with_condition(
            SafetyState::LockedOut,
            "thermal_critical",
            InterlockScope::Lockout(ActuatorClass::Blade),
        );
        let err = gate().request_blade(&snap, &enable("mowing"), false).unwrap_err();
        assert_eq!(blocking(err), vec!["thermal_critical"]);
    }

    #[test]
    fn blade_requires_a_granted_token() {
        let snap = SafetySnapshot::default();
        let no_token = BladeCommand {
            enable: true,
            token: None,
        };
        assert_eq!(
            blocking(gate().request_blade(&snap, &no_token, false).unwrap_err()),
            vec![AUTHORIZATION_MISSING]
        );
        assert_eq!(
            blocking(gate().request_blade(&snap, &enable("forged"), false).unwrap_err()),
            vec![AUTHORIZATION_MISSING]
        );
        assert!(gate().request_blade(&snap, &enable("parked"), false).is_ok());
    }

    #[test]
    fn blade_while_driving_needs_permission() {
        let snap = SafetySnapshot::default();
        assert_eq!(
            blocking(gate().request_blade(&snap, &enable("parked"), true).unwrap_err()),
            vec![DRIVE_ACTIVE_UNAUTHORIZED]
        );
        assert!(gate().request_blade(&snap, &enable("mowing"), true).is_ok());
    }

    #[test]
    fn blade_disable_always_accepted() {
        let snap = SafetySnapshot {
            state: SafetyState::EmergencyStopped,
            ..SafetySnapshot::default()
        };
        let off = BladeCommand {
            enable: false,
            token: None,
        };
        assert!(gate().request_blade(&snap, &off, true).is_ok());
    }

    #[test]
    fn drive_speed_caps() {
        let snap = SafetySnapshot::default();
        let fast = DriveCommand {
            linear: 3.0,
            angular: 0.0,
        };
        let nan = DriveCommand {
            linear: f32::NAN,
            angular: 0.0,
        };
        assert_eq!(blocking(gate().request_drive(&snap, &fast).unwrap_err()), vec![SPEED_CAP_EXCEEDED]);
        assert!(gate().request_drive(&snap, &nan).is_err());
        let ok = DriveCommand {
            linear: -1.0,
            angular: 1.5,
        };
        assert!(gate().request_drive(&snap, &ok).is_ok());
    }

    #[test]
    fn degraded_state_allows_commands() {
        let snap = SafetySnapshot {
            state: SafetyState::Degraded,
            ..SafetySnapshot::default()
        };
        let drive = DriveCommand {
            linear: 0.2,
            angular: 0.1,
        };
        assert!(gate().request_drive(&snap, &drive).is_ok());
    }
}
