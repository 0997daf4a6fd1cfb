//! Interlock engine.
//!
//! An [`Interlock`] inspects the latest readings of one tick and reports
//! whether its condition is active. Each interlock declares its own
//! [`Severity`] and [`InterlockScope`]; the evaluator never infers the scope
//! from the severity.
//!
//! Built-in interlocks ([`InterlockSet::with_defaults`]):
//!
//! | Name | Severity | Scope |
//! |---|---|---|
//! | `tilt_exceeded` | Critical | StopAll |
//! | `obstacle_too_close` | Critical | Lockout(Drive) |
//! | `obstacle_near` | Warning | StopAll |
//! | `heartbeat_expired` | Critical | StopAll |
//! | `battery_critical` | Critical | StopAll |
//! | `battery_low` | Warning | StopAll |
//! | `thermal_critical` | Critical | Lockout(Blade) |
//! | `physical_trigger` | Critical | StopAll |
//! | `sensor_quality_degraded` | Warning | StopAll |

use std::collections::BTreeSet;

use mowguard_types::{
    ActuatorClass, InterlockCondition, InterlockScope, ReadingValue, SensorClass, SensorReading,
    Severity,
};
use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// Thresholds
// ────────────────────────────────────────────────────────────────────────────

/// Trip points of the built-in interlocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyThresholds {
    pub max_tilt_deg: f32,
    pub min_clearance_m: f32,
    pub warn_clearance_m: f32,
    pub battery_critical_percent: u8,
    pub battery_warning_percent: u8,
    pub battery_overtemp_c: f32,
    pub thermal_critical_c: f32,
    pub quality_threshold: f32,
}

impl Default for SafetyThresholds {
    fn default() -> Self {
        Self {
            max_tilt_deg: 30.0,
            min_clearance_m: 0.3,
            warn_clearance_m: 0.6,
            battery_critical_percent: 5,
            battery_warning_percent: 15,
            battery_overtemp_c: 60.0,
            thermal_critical_c: 70.0,
            quality_threshold: 0.5,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tick input
// ────────────────────────────────────────────────────────────────────────────

/// Everything an interlock may look at on one tick.
#[derive(Debug, Clone, Default)]
pub struct TickInput {
    /// Latest reading of every sensor topic.
    pub readings: Vec<SensorReading>,
    /// Components currently timed out according to the watchdog.
    pub watchdog_timeouts: BTreeSet<String>,
}

impl TickInput {
    pub fn new(readings: Vec<SensorReading>, watchdog_timeouts: BTreeSet<String>) -> Self {
        Self {
            readings,
            watchdog_timeouts,
        }
    }

    /// Readings whose value belongs to `class`.
    pub fn of_class(&self, class: SensorClass) -> impl Iterator<Item = &SensorReading> {
        self.readings
            .iter()
            .filter(move |r| r.value().sensor_class() == Some(class))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Interlock trait
// ────────────────────────────────────────────────────────────────────────────

/// A single safety condition evaluated every tick.
///
/// Implement this trait for site-specific conditions and add them with
/// [`InterlockSet::add`].
pub trait Interlock: Send + Sync {
    /// Stable name, reported to operators and written to the audit trail.
    fn name(&self) -> &str;

    fn severity(&self) -> Severity;

    fn scope(&self) -> InterlockScope;

    /// `Some(detail)` when the condition is active, `None` otherwise.
    fn evaluate(&self, input: &TickInput) -> Option<String>;
}

/// Ordered collection of interlocks.
#[derive(Default)]
pub struct InterlockSet {
    interlocks: Vec<Box<dyn Interlock>>,
}

impl InterlockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in interlocks configured with `thresholds`.
    pub fn with_defaults(thresholds: &SafetyThresholds) -> Self {
        let mut set = Self::new();
        set.add(Box::new(TiltInterlock {
            max_tilt_deg: thresholds.max_tilt_deg,
        }));
        set.add(Box::new(ObstacleInterlock::too_close(thresholds.min_clearance_m)));
        set.add(Box::new(ObstacleInterlock::near(thresholds.warn_clearance_m)));
        set.add(Box::new(HeartbeatInterlock));
        set.add(Box::new(BatteryCriticalInterlock {
            critical_percent: thresholds.battery_critical_percent,
            overtemp_c: thresholds.battery_overtemp_c,
        }));
        set.add(Box::new(BatteryLowInterlock {
            warning_percent: thresholds.battery_warning_percent,
        }));
        set.add(Box::new(ThermalInterlock {
            critical_c: thresholds.thermal_critical_c,
        }));
        set.add(Box::new(PhysicalTriggerInterlock));
        set.add(Box::new(QualityInterlock {
            threshold: thresholds.quality_threshold,
        }));
        set
    }

    /// Register an interlock. Evaluation follows insertion order.
    pub fn add(&mut self, interlock: Box<dyn Interlock>) {
        self.interlocks.push(interlock);
    }

    pub fn len(&self) -> usize {
        self.interlocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interlocks.is_empty()
    }

    /// One condition per interlock for `input`, active or not. Rebuilt on
    /// each call.
    pub fn evaluate(&self, input: &TickInput) -> Vec<InterlockCondition> {
        self.interlocks
            .iter()
            .map(|interlock| {
                let detail = interlock.evaluate(input);
                InterlockCondition {
                    name: interlock.name().to_string(),
                    severity: interlock.severity(),
                    scope: interlock.scope(),
                    current_value: detail.is_some(),
                    detail,
                }
            })
            .collect()
    }

    /// Only the conditions active for `input`.
    pub fn active(&self, input: &TickInput) -> Vec<InterlockCondition> {
        let mut conditions = self.evaluate(input);
        conditions.retain(|c| c.current_value);
        conditions
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in interlocks
// ────────────────────────────────────────────────────────────────────────────

/// Roll or pitch beyond `max_tilt_deg`.
pub struct TiltInterlock {
    pub max_tilt_deg: f32,
}

impl Interlock for TiltInterlock {
    fn name(&self) -> &str {
        "tilt_exceeded"
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }

    fn scope(&self) -> InterlockScope {
        InterlockScope::StopAll
    }

    fn evaluate(&self, input: &TickInput) -> Option<String> {
        input
            .of_class(SensorClass::Attitude)
            .filter_map(|r| match r.value() {
                ReadingValue::Attitude {
                    roll_deg, pitch_deg, ..
                } => Some(roll_deg.abs().max(pitch_deg.abs())),
                _ => None,
            })
            .filter(|tilt| *tilt > self.max_tilt_deg)
            .reduce(f32::max)
            .map(|tilt| format!("tilt {tilt:.1}° > max {:.1}°", self.max_tilt_deg))
    }
}

/// Nearest ranging reading below a clearance.
///
/// Used twice: critical drive lockout at the minimum clearance and a warning
/// at the wider one.
pub struct ObstacleInterlock {
    name: &'static str,
    severity: Severity,
    scope: InterlockScope,
    clearance_m: f32,
}

impl ObstacleInterlock {
    pub fn too_close(min_clearance_m: f32) -> Self {
        Self {
            name: "obstacle_too_close",
            severity: Severity::Critical,
            scope: InterlockScope::Lockout(ActuatorClass::Drive),
            clearance_m: min_clearance_m,
        }
    }

    pub fn near(warn_clearance_m: f32) -> Self {
        Self {
            name: "obstacle_near",
            severity: Severity::Warning,
            scope: InterlockScope::StopAll,
            clearance_m: warn_clearance_m,
        }
    }
}

impl Interlock for ObstacleInterlock {
    fn name(&self) -> &str {
        self.name
    }

    fn severity(&self) -> Severity {
        self.severity
    }

    fn scope(&self) -> InterlockScope {
        self.scope
    }

    fn evaluate(&self, input: &TickInput) -> Option<String> {
        input
            .of_class(SensorClass::Ranging)
            .filter_map(|r| match r.value() {
                ReadingValue::Range { distance_m } => Some((*distance_m, r.topic())),
                _ => None,
            })
            .filter(|(d, _)| *d < self.clearance_m)
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(d, topic)| format!("{topic}: {d:.2} m < {:.2} m", self.clearance_m))
    }
}

/// Any supervised component timed out.
pub struct HeartbeatInterlock;

impl Interlock for HeartbeatInterlock {
    fn name(&self) -> &str {
        "heartbeat_expired"
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }

    fn scope(&self) -> InterlockScope {
        InterlockScope::StopAll
    }

    fn evaluate(&self, input: &TickInput) -> Option<String> {
        if input.watchdog_timeouts.is_empty() {
            return None;
        }
        let names: Vec<&str> = input.watchdog_timeouts.iter().map(String::as_str).collect();
        Some(names.join(", "))
    }
}

fn power_readings(input: &TickInput) -> impl Iterator<Item = (u8, f32)> + '_ {
    input.of_class(SensorClass::Power).filter_map(|r| match r.value() {
        ReadingValue::Power {
            battery_percent,
            battery_temp_c,
            ..
        } => Some((*battery_percent, *battery_temp_c)),
        _ => None,
    })
}

/// Battery nearly empty or over temperature.
pub struct BatteryCriticalInterlock {
    pub critical_percent: u8,
    pub overtemp_c: f32,
}

impl Interlock for BatteryCriticalInterlock {
    fn name(&self) -> &str {
        "battery_critical"
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }

    fn scope(&self) -> InterlockScope {
        InterlockScope::StopAll
    }

    fn evaluate(&self, input: &TickInput) -> Option<String> {
        power_readings(input).find_map(|(percent, temp)| {
            if temp >= self.overtemp_c {
                Some(format!("battery temp {temp:.1}°C >= {:.1}°C", self.overtemp_c))
            } else if percent <= self.critical_percent {
                Some(format!("battery {percent}% <= {}%", self.critical_percent))
            } else {
                None
            }
        })
    }
}

/// Battery low, return-to-dock territory.
pub struct BatteryLowInterlock {
    pub warning_percent: u8,
}

impl Interlock for BatteryLowInterlock {
    fn name(&self) -> &str {
        "battery_low"
    }

    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn scope(&self) -> InterlockScope {
        InterlockScope::StopAll
    }

    fn evaluate(&self, input: &TickInput) -> Option<String> {
        power_readings(input)
            .map(|(percent, _)| percent)
            .find(|percent| *percent <= self.warning_percent)
            .map(|percent| format!("battery {percent}% <= {}%", self.warning_percent))
    }
}

/// Board or ambient temperature too high for the blade motor.
pub struct ThermalInterlock {
    pub critical_c: f32,
}

impl Interlock for ThermalInterlock {
    fn name(&self) -> &str {
        "thermal_critical"
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }

    fn scope(&self) -> InterlockScope {
        InterlockScope::Lockout(ActuatorClass::Blade)
    }

    fn evaluate(&self, input: &TickInput) -> Option<String> {
        input
            .of_class(SensorClass::Environmental)
            .filter_map(|r| match r.value() {
                ReadingValue::Environment { temperature_c, .. } => Some(*temperature_c),
                _ => None,
            })
            .filter(|t| *t >= self.critical_c)
            .reduce(f32::max)
            .map(|t| format!("temperature {t:.1}°C >= {:.1}°C", self.critical_c))
    }
}

/// Stop button, lift or bump sensor engaged.
pub struct PhysicalTriggerInterlock;

impl Interlock for PhysicalTriggerInterlock {
    fn name(&self) -> &str {
        "physical_trigger"
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }

    fn scope(&self) -> InterlockScope {
        InterlockScope::StopAll
    }

    fn evaluate(&self, input: &TickInput) -> Option<String> {
        let engaged: Vec<&str> = input
            .of_class(SensorClass::Trigger)
            .filter(|r| matches!(r.value(), ReadingValue::Trigger { engaged: true }))
            .map(|r| r.topic())
            .collect();
        (!engaged.is_empty()).then(|| format!("engaged: {}", engaged.join(", ")))
    }
}

/// A reading feeding another interlock fell below the quality threshold.
pub struct QualityInterlock {
    pub threshold: f32,
}

impl QualityInterlock {
    const RELEVANT: [SensorClass; 5] = [
        SensorClass::Attitude,
        SensorClass::Ranging,
        SensorClass::Power,
        SensorClass::Environmental,
        SensorClass::Trigger,
    ];
}

impl Interlock for QualityInterlock {
    fn name(&self) -> &str {
        "sensor_quality_degraded"
    }

    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn scope(&self) -> InterlockScope {
        InterlockScope::StopAll
    }

    fn evaluate(&self, input: &TickInput) -> Option<String> {
        let degraded: Vec<String> = input
            .readings
            .iter()
            .filter(|r| {
                r.value()
                    .sensor_class()
                    .is_some_and(|c| Self::RELEVANT.contains(&c))
            })
            .filter(|r| r.is_degraded(self.threshold))
            .map(|r| format!("{} q={:.2}", r.topic(), r.quality()))
            .collect();
        (!degraded.is_empty()).then(|| degraded.join(", "))
    }
}
