//! Task driving the [`HeartbeatWatchdog`].
//!
//! Listens on `system/heartbeat`, checks the watchdog on a fixed interval,
//! shares the timed-out set with the safety loop and turns every fresh
//! fault into a watchdog emergency stop. It also publishes its own pulse so
//! remote observers can see the safety core is alive.

use std::collections::BTreeSet;
use std::time::Duration;

use mowguard_kernel::{HeartbeatWatchdog, WatchdogConfig};
use mowguard_middleware::TelemetryBus;
use mowguard_middleware::topic::{SYSTEM_HEARTBEAT, TopicFilter};
use mowguard_types::{ReadingValue, SensorReading, StopSource, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::safety_loop::SafetyHandle;

/// Component id of the watchdog's own pulse.
pub const SAFETY_WATCHDOG_COMPONENT: &str = "safety_watchdog";

/// A component registered up front, before its first pulse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisedComponent {
    pub id: String,
    #[serde(with = "millis")]
    pub window: Duration,
    /// Misses are faults even during the startup grace period.
    #[serde(default)]
    pub always_critical: bool,
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone)]
pub struct WatchdogTaskConfig {
    pub watchdog: WatchdogConfig,
    pub check_interval: Duration,
    pub self_pulse_interval: Duration,
    pub supervised: Vec<SupervisedComponent>,
}

impl Default for WatchdogTaskConfig {
    fn default() -> Self {
        Self {
            watchdog: WatchdogConfig::default(),
            check_interval: Duration::from_millis(500),
            self_pulse_interval: Duration::from_secs(2),
            supervised: Vec::new(),
        }
    }
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

fn self_pulse(bus: &TelemetryBus) {
    let reading = SensorReading::new(
        SYSTEM_HEARTBEAT,
        Timestamp::now(),
        ReadingValue::Heartbeat {
            component: SAFETY_WATCHDOG_COMPONENT.to_string(),
            heartbeat: true,
        },
        1.0,
        SAFETY_WATCHDOG_COMPONENT,
    );
    if let Err(e) = bus.publish(SYSTEM_HEARTBEAT, reading) {
        warn!(error = %e, "failed to publish watchdog pulse");
    }
}

/// Spawn the watchdog task.
///
/// `timeouts` is updated after every check; the task ends when the bus
/// subscription closes or the safety loop is gone.
pub fn spawn_watchdog(
    bus: TelemetryBus,
    safety: SafetyHandle,
    timeouts: watch::Sender<BTreeSet<String>>,
    config: WatchdogTaskConfig,
) -> JoinHandle<()> {
    let mut watchdog = HeartbeatWatchdog::new(config.watchdog);
    let started = now();
    for component in &config.supervised {
        if component.always_critical {
            watchdog.register_always_critical(&component.id, component.window, started);
        } else {
            watchdog.register_at(&component.id, component.window, started);
        }
    }
    let mut heartbeats = bus.subscribe(TopicFilter::Exact(SYSTEM_HEARTBEAT.to_string()));

    tokio::spawn(async move {
        info!(
            supervised = config.supervised.len(),
            grace_s = config.watchdog.grace_period.as_secs(),
            "watchdog started"
        );
        let mut check = tokio::time::interval(config.check_interval);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pulse = tokio::time::interval(config.self_pulse_interval);
        pulse.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                delivery = heartbeats.recv() => {
                    let Some(delivery) = delivery else { break };
                    // The cached pulse replayed on subscribe is not a fresh one.
                    if delivery.replay {
                        continue;
                    }
                    match delivery.reading.value() {
                        ReadingValue::Heartbeat { component, heartbeat: true } => {
                            debug!(%component, "heartbeat");
                            watchdog.pulse(component, now());
                        }
                        ReadingValue::Heartbeat { component, heartbeat: false } => {
                            debug!(%component, "negative heartbeat ignored");
                        }
                        other => debug!(?other, "non-heartbeat payload on heartbeat topic"),
                    }
                }
                _ = check.tick() => {
                    let timed_out = watchdog.check_at(now());
                    timeouts.send_if_modified(|current| {
                        if *current == timed_out {
                            false
                        } else {
                            *current = timed_out;
                            true
                        }
                    });
                    for fault in watchdog.drain_faults() {
                        if let Err(e) = safety
                            .request_stop(StopSource::WatchdogTimeout, fault.component_id.clone())
                            .await
                        {
                            error!(error = %e, component = %fault.component_id, "watchdog could not latch stop");
                            return;
                        }
                    }
                }
                _ = pulse.tick() => self_pulse(&bus),
            }
        }
        info!("watchdog stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supervised_component_window_is_millis() -> Result<(), Box<dyn std::error::Error>> {
        let c: SupervisedComponent = serde_json::from_str(r#"{"id":"drive","window":1500}"#)?;
        assert_eq!(c.window, Duration::from_millis(1500));
        assert!(!c.always_critical);
        Ok(())
    }
}
