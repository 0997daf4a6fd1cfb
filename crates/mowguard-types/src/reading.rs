//! Sensor readings and the common envelope every producer is normalised into.

use std::sync::OnceLock;
use std::time::Instant;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::safety::{EmergencyEvent, SafetyTransition};

/// Process-wide monotonic epoch. Every [`Timestamp::monotonic_ns`] is
/// measured from the first time the clock is read.
static MONOTONIC_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Return the process monotonic epoch.
pub fn monotonic_epoch() -> Instant {
    *MONOTONIC_EPOCH.get_or_init(Instant::now)
}

/// A reading timestamp carrying both monotonic and wall-clock time.
///
/// Ordering and timeouts only ever look at `monotonic_ns`; `wall` exists for
/// operators and the audit trail and may jump when the host clock is
/// adjusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Timestamp {
    /// Nanoseconds since the process monotonic epoch.
    pub monotonic_ns: u64,
    /// Wall-clock time at capture.
    pub wall: DateTime<Utc>,
}

impl Timestamp {
    /// Capture the current time.
    pub fn now() -> Self {
        Self::from_instant(Instant::now())
    }

    /// Build a timestamp for `at`, pairing it with the current wall time.
    ///
    /// Instants earlier than the process epoch saturate to zero.
    pub fn from_instant(at: Instant) -> Self {
        let monotonic_ns = at
            .saturating_duration_since(monotonic_epoch())
            .as_nanos()
            .min(u128::from(u64::MAX)) as u64;
        Self {
            monotonic_ns,
            wall: Utc::now(),
        }
    }
}

/// Sensor family a reading belongs to. The lowercase name is the second
/// segment of the canonical topic `sensors/<class>/<id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SensorClass {
    Attitude,
    Ranging,
    Environmental,
    Position,
    Power,
    /// Physical stop button, lift and bump switches.
    Trigger,
    /// Actuator activity reported by the motor controllers.
    Motion,
}

impl SensorClass {
    /// Topic segment for this class.
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorClass::Attitude => "attitude",
            SensorClass::Ranging => "ranging",
            SensorClass::Environmental => "environmental",
            SensorClass::Position => "position",
            SensorClass::Power => "power",
            SensorClass::Trigger => "trigger",
            SensorClass::Motion => "motion",
        }
    }

    /// Parse a topic segment back into a class.
    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "attitude" => Some(SensorClass::Attitude),
            "ranging" => Some(SensorClass::Ranging),
            "environmental" => Some(SensorClass::Environmental),
            "position" => Some(SensorClass::Position),
            "power" => Some(SensorClass::Power),
            "trigger" => Some(SensorClass::Trigger),
            "motion" => Some(SensorClass::Motion),
            _ => None,
        }
    }
}

impl std::fmt::Display for SensorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed payload carried by a [`SensorReading`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadingValue {
    Attitude {
        roll_deg: f32,
        pitch_deg: f32,
        yaw_deg: f32,
    },
    Range {
        distance_m: f32,
    },
    Environment {
        temperature_c: f32,
        humidity_pct: f32,
        raining: bool,
    },
    Position {
        latitude: f64,
        longitude: f64,
        accuracy_m: f32,
    },
    Power {
        voltage_v: f32,
        current_a: f32,
        battery_percent: u8,
        battery_temp_c: f32,
    },
    Trigger {
        engaged: bool,
    },
    Motion {
        drive_active: bool,
        blade_active: bool,
    },
    /// Liveness pulse as published on `system/heartbeat`.
    Heartbeat {
        component: String,
        heartbeat: bool,
    },
    SafetyStatus(SafetyTransition),
    Emergency(EmergencyEvent),
}

impl ReadingValue {
    /// The sensor class this payload is valid for, or `None` for system
    /// payloads (heartbeats and safety events).
    pub fn sensor_class(&self) -> Option<SensorClass> {
        match self {
            ReadingValue::Attitude { .. } => Some(SensorClass::Attitude),
            ReadingValue::Range { .. } => Some(SensorClass::Ranging),
            ReadingValue::Environment { .. } => Some(SensorClass::Environmental),
            ReadingValue::Position { .. } => Some(SensorClass::Position),
            ReadingValue::Power { .. } => Some(SensorClass::Power),
            ReadingValue::Trigger { .. } => Some(SensorClass::Trigger),
            ReadingValue::Motion { .. } => Some(SensorClass::Motion),
            ReadingValue::Heartbeat { .. }
            | ReadingValue::SafetyStatus(_)
            | ReadingValue::Emergency(_) => None,
        }
    }
}

/// A normalised, immutable sensor reading.
///
/// Readings are shared by cloning; there is no way to mutate one after
/// construction except through [`SensorReading::decayed`] and
/// [`SensorReading::retopic`], which both return a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SensorReading {
    topic: String,
    timestamp: Timestamp,
    value: ReadingValue,
    quality: f32,
    source_id: String,
}

impl SensorReading {
    /// Construct a reading. `quality` is clamped into `[0.0, 1.0]`; callers
    /// that need to reject out-of-range quality validate before this point.
    pub fn new(
        topic: impl Into<String>,
        timestamp: Timestamp,
        value: ReadingValue,
        quality: f32,
        source_id: impl Into<String>,
    ) -> Self {
        let quality = if quality.is_nan() {
            0.0
        } else {
            quality.clamp(0.0, 1.0)
        };
        Self {
            topic: topic.into(),
            timestamp,
            value,
            quality,
            source_id: source_id.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn value(&self) -> &ReadingValue {
        &self.value
    }

    pub fn quality(&self) -> f32 {
        self.quality
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// `true` when the reading's quality is below `threshold`. Degraded
    /// readings are still served as the last known value.
    pub fn is_degraded(&self, threshold: f32) -> bool {
        self.quality < threshold
    }

    /// A copy of this reading re-stamped at `timestamp` with its quality
    /// multiplied by `factor`.
    pub fn decayed(&self, factor: f32, timestamp: Timestamp) -> Self {
        Self::new(
            self.topic.clone(),
            timestamp,
            self.value.clone(),
            self.quality * factor,
            self.source_id.clone(),
        )
    }

    /// A copy of this reading addressed to `topic` (alias fan-out).
    pub fn retopic(&self, topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..self.clone()
        }
    }
}

/// Wire envelope for push-channel observers: `{topic, timestamp, value,
/// quality}` plus the per-topic bus sequence.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TelemetryEnvelope {
    pub topic: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub value: ReadingValue,
    pub quality: f32,
}

impl TelemetryEnvelope {
    pub fn from_reading(reading: &SensorReading, sequence: u64) -> Self {
        Self {
            topic: reading.topic().to_string(),
            sequence,
            timestamp: reading.timestamp().wall,
            value: reading.value().clone(),
            quality: reading.quality(),
        }
    }
}
