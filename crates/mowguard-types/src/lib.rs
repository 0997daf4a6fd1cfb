//! `mowguard-types` – shared vocabulary of the MowGuard safety core.
//!
//! - [`reading`] – [`SensorReading`], its typed [`ReadingValue`] payload and
//!   the monotonic+wall [`Timestamp`].
//! - [`safety`] – [`SafetyState`], interlock descriptors, stop sources and
//!   the [`SafetyTransition`] audit event.
//! - [`error`] – [`MowError`], the error type used across the workspace.

pub mod error;
pub mod reading;
pub mod safety;

pub use error::MowError;
pub use reading::{
    ReadingValue, SensorClass, SensorReading, TelemetryEnvelope, Timestamp, monotonic_epoch,
};
pub use safety::{
    ActuatorClass, CauseKind, EmergencyEvent, InterlockCondition, InterlockScope, SafetySnapshot,
    SafetyState, SafetyTransition, Severity, StopRecord, StopSource, TransitionCause,
};

#[cfg(test)]
mod tests {
    use super::*;

    fn attitude(pitch: f32) -> SensorReading {
        SensorReading::new(
            "sensors/attitude/imu",
            Timestamp::now(),
            ReadingValue::Attitude {
                roll_deg: 0.0,
                pitch_deg: pitch,
                yaw_deg: 90.0,
            },
            1.0,
            "imu0",
        )
    }

    #[test]
    fn reading_quality_is_clamped() {
        let r = SensorReading::new(
            "sensors/ranging/front",
            Timestamp::now(),
            ReadingValue::Range { distance_m: 1.0 },
            1.7,
            "sonar",
        );
        assert_eq!(r.quality(), 1.0);

        let r = SensorReading::new(
            "sensors/ranging/front",
            Timestamp::now(),
            ReadingValue::Range { distance_m: 1.0 },
            f32::NAN,
            "sonar",
        );
        assert_eq!(r.quality(), 0.0);
    }

    #[test]
    fn decay_compounds_and_marks_degraded() {
        let r = attitude(3.0);
        let once = r.decayed(0.5, Timestamp::now());
        let twice = once.decayed(0.5, Timestamp::now());
        assert!((twice.quality() - 0.25).abs() < f32::EPSILON);
        assert!(twice.is_degraded(0.5));
        assert!(!r.is_degraded(0.5));
        assert_eq!(twice.value(), r.value(), "decay keeps the last known value");
    }

    #[test]
    fn retopic_keeps_payload() {
        let r = attitude(3.0);
        let alias = r.retopic("imu/data");
        assert_eq!(alias.topic(), "imu/data");
        assert_eq!(alias.value(), r.value());
        assert_eq!(alias.timestamp(), r.timestamp());
    }

    #[test]
    fn timestamps_are_monotonic() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(b.monotonic_ns >= a.monotonic_ns);
    }

    #[test]
    fn envelope_serializes_wire_shape() {
        let env = TelemetryEnvelope::from_reading(&attitude(12.0), 7);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["topic"], "sensors/attitude/imu");
        assert_eq!(json["sequence"], 7);
        assert_eq!(json["value"]["kind"], "attitude");
        assert!(json.get("quality").is_some());
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn restrictiveness_orders_states() {
        assert!(SafetyState::EmergencyStopped.restrictiveness() > SafetyState::LockedOut.restrictiveness());
        assert!(SafetyState::LockedOut.restrictiveness() > SafetyState::Degraded.restrictiveness());
        assert!(SafetyState::Degraded.restrictiveness() > SafetyState::Normal.restrictiveness());
    }

    #[test]
    fn safety_state_serializes_screaming_case() {
        let json = serde_json::to_string(&SafetyState::EmergencyStopped).unwrap();
        assert_eq!(json, "\"EMERGENCY_STOPPED\"");
        assert_eq!(SafetyState::LockedOut.to_string(), "LOCKED_OUT");
    }

    #[test]
    fn error_reason_and_hint() {
        let err = MowError::InterlockStillActive {
            names: vec!["tilt_exceeded".into()],
        };
        assert_eq!(err.reason(), "interlock_still_active");
        assert!(err.to_string().contains("tilt_exceeded"));
        assert_eq!(err.blocking(), ["tilt_exceeded".to_string()]);
        assert!(!err.remediation().is_empty());
        assert_eq!(MowError::ConfirmationRequired.reason(), "confirmation_required");
    }

    #[test]
    fn sensor_class_segment_roundtrip() {
        for class in [
            SensorClass::Attitude,
            SensorClass::Ranging,
            SensorClass::Environmental,
            SensorClass::Position,
            SensorClass::Power,
            SensorClass::Trigger,
            SensorClass::Motion,
        ] {
            assert_eq!(SensorClass::from_segment(class.as_str()), Some(class));
        }
        assert_eq!(SensorClass::from_segment("lidar"), None);
    }
}
