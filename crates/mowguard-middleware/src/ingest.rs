//! [`SensorIngestHub`] – normalises raw producer readings onto the bus.
//!
//! The hub owns reading normalisation and nothing else: it checks payload
//! shape and per-source timestamp monotonicity, wraps the payload in a
//! [`SensorReading`] and publishes it under `sensors/<class>/<instance>`.
//!
//! When a producer reports a transport error the hub does not leave a gap:
//! it re-publishes the previous reading of that topic with its quality
//! multiplied by the configured decay factor, so observers always see the
//! last known value and can tell from the quality that it is getting stale.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use mowguard_types::{MowError, ReadingValue, SensorClass, SensorReading, Timestamp};
use tracing::{debug, warn};

use crate::bus::TelemetryBus;
use crate::topic::{sensor_topic, validate_topic};

/// Quality multiplier applied on each transport error unless configured.
pub const DEFAULT_DECAY_FACTOR: f32 = 0.8;

/// A reading as handed over by a producer, before validation.
#[derive(Debug, Clone)]
pub struct RawReading {
    pub source_id: String,
    pub class: SensorClass,
    /// Instance segment of the topic, e.g. `front` in `sensors/ranging/front`.
    pub instance: String,
    pub value: ReadingValue,
    /// Capture time; the hub stamps `Timestamp::now()` when absent.
    pub timestamp: Option<Timestamp>,
    /// Producer confidence; defaults to 1.0.
    pub quality: Option<f32>,
}

impl RawReading {
    pub fn new(
        source_id: impl Into<String>,
        class: SensorClass,
        instance: impl Into<String>,
        value: ReadingValue,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            class,
            instance: instance.into(),
            value,
            timestamp: None,
            quality: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_quality(mut self, quality: f32) -> Self {
        self.quality = Some(quality);
        self
    }
}

/// Receives readings from independent producers and republishes them on the
/// [`TelemetryBus`]. Cheap to share behind an `Arc`.
pub struct SensorIngestHub {
    bus: TelemetryBus,
    decay_factor: f32,
    /// Last accepted monotonic timestamp per source.
    last_seen: Mutex<HashMap<String, u64>>,
}

impl SensorIngestHub {
    pub fn new(bus: TelemetryBus) -> Self {
        Self::with_decay(bus, DEFAULT_DECAY_FACTOR)
    }

    /// `decay_factor` is clamped into `[0.0, 1.0]`.
    pub fn with_decay(bus: TelemetryBus, decay_factor: f32) -> Self {
        Self {
            bus,
            decay_factor: decay_factor.clamp(0.0, 1.0),
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> &TelemetryBus {
        &self.bus
    }

    pub fn decay_factor(&self) -> f32 {
        self.decay_factor
    }

    /// Validate `raw`, publish it and return the published reading.
    ///
    /// # Errors
    ///
    /// [`MowError::InvalidReading`] when the payload shape is wrong or the
    /// timestamp regressed for this source; [`MowError::InvalidTopic`] when
    /// the instance name is not a valid topic segment.
    pub fn ingest(&self, raw: RawReading) -> Result<SensorReading, MowError> {
        let reject = |reason: String| MowError::InvalidReading {
            source_id: raw.source_id.clone(),
            reason,
        };

        validate_shape(&raw).map_err(reject)?;
        let topic = sensor_topic(raw.class, &raw.instance);
        validate_topic(&topic)?;

        let timestamp = raw.timestamp.unwrap_or_else(Timestamp::now);
        {
            let mut last_seen = self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = last_seen.get(&raw.source_id)
                && timestamp.monotonic_ns < *previous
            {
                return Err(reject(format!(
                    "timestamp_regressed: {} < {}",
                    timestamp.monotonic_ns, previous
                )));
            }
            last_seen.insert(raw.source_id.clone(), timestamp.monotonic_ns);
        }

        let reading = SensorReading::new(
            topic.as_str(),
            timestamp,
            raw.value,
            raw.quality.unwrap_or(1.0),
            raw.source_id,
        );
        self.bus.publish(&topic, reading.clone())?;
        Ok(reading)
    }

    /// Handle a transport error from the producer feeding `topic`.
    ///
    /// Re-publishes the previous reading with decayed quality and returns it.
    ///
    /// # Errors
    ///
    /// [`MowError::TransientRead`] when the topic has never been published,
    /// so there is no last known value to serve.
    pub fn report_transport_error(
        &self,
        source_id: &str,
        topic: &str,
        details: &str,
    ) -> Result<SensorReading, MowError> {
        let Some(previous) = self.bus.latest(topic) else {
            warn!(source = source_id, topic, details, "transport error before first reading");
            return Err(MowError::TransientRead {
                topic: topic.to_string(),
                details: details.to_string(),
            });
        };
        let decayed = previous.decayed(self.decay_factor, Timestamp::now());
        debug!(
            source = source_id,
            topic,
            quality = decayed.quality(),
            details,
            "serving last known value with decayed quality"
        );
        self.bus.publish(topic, decayed.clone())?;
        Ok(decayed)
    }
}

fn finite(name: &str, v: f32) -> Result<(), String> {
    if v.is_finite() {
        Ok(())
    } else {
        Err(format!("{name} is not finite"))
    }
}

/// Check that the payload belongs to the declared class and that every value
/// is physically plausible.
fn validate_shape(raw: &RawReading) -> Result<(), String> {
    match raw.value.sensor_class() {
        Some(class) if class == raw.class => {}
        Some(class) => {
            return Err(format!(
                "payload is {class} but producer declared {}",
                raw.class
            ));
        }
        None => return Err("system payloads cannot be ingested as sensor readings".into()),
    }

    if let Some(q) = raw.quality
        && !(0.0..=1.0).contains(&q)
    {
        return Err(format!("quality {q} outside [0, 1]"));
    }

    match &raw.value {
        ReadingValue::Attitude {
            roll_deg,
            pitch_deg,
            yaw_deg,
        } => {
            for (name, v) in [("roll_deg", roll_deg), ("pitch_deg", pitch_deg), ("yaw_deg", yaw_deg)] {
                finite(name, *v)?;
                if !(-360.0..=360.0).contains(v) {
                    return Err(format!("{name} {v} out of range"));
                }
            }
            if roll_deg.abs() > 180.0 || pitch_deg.abs() > 180.0 {
                return Err("roll/pitch outside [-180, 180]".into());
            }
        }
        ReadingValue::Range { distance_m } => {
            finite("distance_m", *distance_m)?;
            if *distance_m < 0.0 {
                return Err(format!("distance_m {distance_m} is negative"));
            }
        }
        ReadingValue::Environment {
            temperature_c,
            humidity_pct,
            ..
        } => {
            finite("temperature_c", *temperature_c)?;
            finite("humidity_pct", *humidity_pct)?;
            if !(0.0..=100.0).contains(humidity_pct) {
                return Err(format!("humidity_pct {humidity_pct} outside [0, 100]"));
            }
        }
        ReadingValue::Position {
            latitude,
            longitude,
            accuracy_m,
        } => {
            if !latitude.is_finite() || !(-90.0..=90.0).contains(latitude) {
                return Err(format!("latitude {latitude} invalid"));
            }
            if !longitude.is_finite() || !(-180.0..=180.0).contains(longitude) {
                return Err(format!("longitude {longitude} invalid"));
            }
            finite("accuracy_m", *accuracy_m)?;
        }
        ReadingValue::Power {
            voltage_v,
            current_a,
            battery_percent,
            battery_temp_c,
        } => {
            finite("voltage_v", *voltage_v)?;
            finite("current_a", *current_a)?;
            finite("battery_temp_c", *battery_temp_c)?;
            if *battery_percent > 100 {
                return Err(format!("battery_percent {battery_percent} above 100"));
            }
        }
        ReadingValue::Trigger { .. } | ReadingValue::Motion { .. } => {}
        ReadingValue::Heartbeat { .. }
        | ReadingValue::SafetyStatus(_)
        | ReadingValue::Emergency(_) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::TopicFilter;
    use std::time::{Duration, Instant};

    fn hub() -> SensorIngestHub {
        SensorIngestHub::with_decay(TelemetryBus::default(), 0.5)
    }

    fn tilt(pitch: f32) -> RawReading {
        RawReading::new(
            "imu0",
            SensorClass::Attitude,
            "imu",
            ReadingValue::Attitude {
                roll_deg: 0.0,
                pitch_deg: pitch,
                yaw_deg: 0.0,
            },
        )
    }

    #[test]
    fn ingest_publishes_on_canonical_topic() -> Result<(), Box<dyn std::error::Error>> {
        let hub = hub();
        let reading = hub.ingest(tilt(4.0))?;
        assert_eq!(reading.topic(), "sensors/attitude/imu");
        assert_eq!(reading.quality(), 1.0);
        assert_eq!(hub.bus().latest("sensors/attitude/imu"), Some(reading.clone()));
        // Legacy alias mirrors the same payload.
        assert_eq!(
            hub.bus().latest("imu/data").map(|r| r.value().clone()),
            Some(reading.value().clone())
        );
        Ok(())
    }

    #[test]
    fn class_mismatch_is_invalid() {
        let hub = hub();
        let raw = RawReading::new(
            "sonar",
            SensorClass::Attitude,
            "front",
            ReadingValue::Range { distance_m: 1.0 },
        );
        assert!(matches!(hub.ingest(raw), Err(MowError::InvalidReading { .. })));
    }

    #[test]
    fn implausible_values_rejected() {
        let hub = hub();
        assert!(hub.ingest(tilt(f32::NAN)).is_err());
        assert!(hub.ingest(tilt(200.0)).is_err());
        let battery = RawReading::new(
            "bms",
            SensorClass::Power,
            "bms0",
            ReadingValue::Power {
                voltage_v: 25.0,
                current_a: 1.0,
                battery_percent: 140,
                battery_temp_c: 20.0,
            },
        );
        assert!(hub.ingest(battery).is_err());
        let negative = RawReading::new(
            "sonar",
            SensorClass::Ranging,
            "front",
            ReadingValue::Range { distance_m: -0.1 },
        );
        assert!(hub.ingest(negative).is_err());
        assert!(hub.ingest(tilt(1.0).with_quality(1.5)).is_err());
    }

    #[test]
    fn timestamp_regression_rejected_per_source() -> Result<(), Box<dyn std::error::Error>> {
        let hub = hub();
        let now = Instant::now();
        let later = Timestamp::from_instant(now + Duration::from_millis(100));
        let earlier = Timestamp::from_instant(now);

        hub.ingest(tilt(1.0).with_timestamp(later))?;
        let err = hub.ingest(tilt(2.0).with_timestamp(earlier)).unwrap_err();
        assert!(matches!(err, MowError::InvalidReading { ref reason, .. } if reason.starts_with("timestamp_regressed")));

        // Another source is tracked independently.
        let other = RawReading::new(
            "imu1",
            SensorClass::Attitude,
            "imu_aux",
            ReadingValue::Attitude { roll_deg: 0.0, pitch_deg: 0.0, yaw_deg: 0.0 },
        )
        .with_timestamp(earlier);
        assert!(hub.ingest(other).is_ok());

        // Equal timestamps are accepted.
        assert!(hub.ingest(tilt(3.0).with_timestamp(later)).is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn transport_error_serves_last_known_value() -> Result<(), Box<dyn std::error::Error>> {
        let hub = hub();
        hub.ingest(tilt(7.0))?;
        let mut sub = hub.bus().subscribe(TopicFilter::parse("sensors/attitude/imu")?);
        let _replay = sub.recv().await.ok_or("closed")?;

        let first = hub.report_transport_error("imu0", "sensors/attitude/imu", "i2c nack")?;
        assert!((first.quality() - 0.5).abs() < f32::EPSILON);
        let second = hub.report_transport_error("imu0", "sensors/attitude/imu", "i2c nack")?;
        assert!((second.quality() - 0.25).abs() < f32::EPSILON);

        let d1 = sub.recv().await.ok_or("closed")?;
        let d2 = sub.recv().await.ok_or("closed")?;
        assert_eq!(d1.reading.value(), d2.reading.value());
        assert!(d2.reading.is_degraded(0.5));
        Ok(())
    }

    #[test]
    fn transport_error_before_first_reading_is_transient() {
        let hub = hub();
        assert!(matches!(
            hub.report_transport_error("imu0", "sensors/attitude/imu", "bus off"),
            Err(MowError::TransientRead { .. })
        ));
    }
}
