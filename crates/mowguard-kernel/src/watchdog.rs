//! [`HeartbeatWatchdog`] – liveness supervision of safety-relevant components.
//!
//! Every supervised component (sensor producers, the drive controller, the
//! safety subsystem itself) publishes a periodic pulse. The watchdog keeps a
//! [`HeartbeatRecord`] per component and reports the ones whose pulse is
//! overdue beyond their window.
//!
//! A freshly registered component is in its *startup grace period* for
//! [`WatchdogConfig::grace_period`]. Misses during that window are logged
//! once and never reported as faults, unless the component was registered
//! with [`HeartbeatWatchdog::register_always_critical`]. Whether a record is
//! in grace is derived from `(registered_at, now, grace_period)` on every
//! call; there is no flag to fall out of sync.
//!
//! All methods that depend on time take an explicit [`Instant`] so the
//! supervisor (and the tests) control the clock.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use mowguard_types::MowError;
use tracing::{info, warn};

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Health state reported for a single component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    /// Pulse received within the window.
    Healthy,
    /// Pulse overdue, but the component is still warming up.
    Warmup,
    /// Pulse overdue outside the grace period (or component unknown).
    TimedOut,
}

/// Watchdog tunables.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    /// Startup window during which misses are not faults.
    pub grace_period: Duration,
    /// Window used for components that pulse before being registered.
    pub default_window: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(180),
            default_window: Duration::from_secs(5),
        }
    }
}

/// Per-component liveness state.
#[derive(Debug, Clone)]
pub struct HeartbeatRecord {
    pub component_id: String,
    pub registered_at: Instant,
    pub last_seen: Instant,
    pub timeout_window: Duration,
    pub grace_period: Duration,
    pub always_critical: bool,
    fault_latched: bool,
    warmup_logged: bool,
}

impl HeartbeatRecord {
    fn new(component_id: &str, window: Duration, grace: Duration, always_critical: bool, at: Instant) -> Self {
        Self {
            component_id: component_id.to_string(),
            registered_at: at,
            last_seen: at,
            timeout_window: window,
            grace_period: grace,
            always_critical,
            fault_latched: false,
            warmup_logged: false,
        }
    }

    /// `true` while the component is still inside its startup grace window.
    /// Always-critical components never are.
    pub fn in_grace_period(&self, now: Instant) -> bool {
        !self.always_critical && now.saturating_duration_since(self.registered_at) < self.grace_period
    }

    /// Time since the last pulse beyond the window, if any.
    pub fn overdue_by(&self, now: Instant) -> Option<Duration> {
        let silent = now.saturating_duration_since(self.last_seen);
        (silent > self.timeout_window).then(|| silent - self.timeout_window)
    }
}

/// One timeout, reported exactly once until the component pulses again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogFault {
    pub component_id: String,
    pub overdue_by: Duration,
    pub always_critical: bool,
}

impl From<&WatchdogFault> for MowError {
    fn from(fault: &WatchdogFault) -> Self {
        MowError::WatchdogTimeout {
            component: fault.component_id.clone(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// HeartbeatWatchdog
// ────────────────────────────────────────────────────────────────────────────

/// Tracks heartbeats and raises one [`WatchdogFault`] per timeout.
///
/// # Example
///
/// ```
/// use std::time::{Duration, Instant};
/// use mowguard_kernel::watchdog::{ComponentHealth, HeartbeatWatchdog, WatchdogConfig};
///
/// let t0 = Instant::now();
/// let mut wd = HeartbeatWatchdog::new(WatchdogConfig {
///     grace_period: Duration::ZERO,
///     default_window: Duration::from_secs(1),
/// });
/// wd.register_at("drive", Duration::from_secs(1), t0);
///
/// let later = t0 + Duration::from_secs(2);
/// assert!(wd.check_at(later).contains("drive"));
/// assert_eq!(wd.drain_faults().len(), 1);
/// assert_eq!(wd.health("drive", later), ComponentHealth::TimedOut);
/// ```
#[derive(Debug, Default)]
pub struct HeartbeatWatchdog {
    config: WatchdogConfig,
    records: HashMap<String, HeartbeatRecord>,
    pending: Vec<WatchdogFault>,
}

impl HeartbeatWatchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            records: HashMap::new(),
            pending: Vec::new(),
        }
    }

    /// Grace period and default window in force.
    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// Register `component_id` now with the given timeout window.
    pub fn register(&mut self, component_id: &str, window: Duration) {
        self.register_at(component_id, window, Instant::now());
    }

    /// Register `component_id` at `at`. Re-registering resets the record,
    /// including its grace period.
    pub fn register_at(&mut self, component_id: &str, window: Duration, at: Instant) {
        let record = HeartbeatRecord::new(component_id, window, self.config.grace_period, false, at);
        self.records.insert(component_id.to_string(), record);
    }

    /// Register a component whose misses are faults even during warmup.
    pub fn register_always_critical(&mut self, component_id: &str, window: Duration, at: Instant) {
        let record = HeartbeatRecord::new(component_id, window, self.config.grace_period, true, at);
        self.records.insert(component_id.to_string(), record);
    }

    /// Record a pulse for `component_id` observed at `at`.
    ///
    /// Unknown components are registered with the default window, their
    /// grace period starting at `at`. A pulse older than the last one seen
    /// is ignored.
    pub fn pulse(&mut self, component_id: &str, at: Instant) {
        let default_window = self.config.default_window;
        let grace = self.config.grace_period;
        let record = self.records.entry(component_id.to_string()).or_insert_with(|| {
            info!(component = %component_id, "watchdog: auto-registered component on first pulse");
            HeartbeatRecord::new(component_id, default_window, grace, false, at)
        });
        if at < record.last_seen {
            return;
        }
        if record.fault_latched {
            info!(component = %component_id, "watchdog: component recovered");
        }
        record.last_seen = at;
        record.fault_latched = false;
        record.warmup_logged = false;
    }

    /// [`check_at`](Self::check_at) using the current instant.
    pub fn check(&mut self) -> BTreeSet<String> {
        self.check_at(Instant::now())
    }

    /// Return every component timed out at `now` (outside its grace period).
    ///
    /// A component entering the timed-out set queues one [`WatchdogFault`];
    /// it stays in the set on later checks without queueing another until it
    /// pulses again.
    pub fn check_at(&mut self, now: Instant) -> BTreeSet<String> {
        let mut timed_out = BTreeSet::new();
        for record in self.records.values_mut() {
            let Some(overdue_by) = record.overdue_by(now) else {
                continue;
            };
            if record.in_grace_period(now) {
                if !record.warmup_logged {
                    info!(
                        component = %record.component_id,
                        overdue_ms = overdue_by.as_millis() as u64,
                        "watchdog: heartbeat missed during startup grace period"
                    );
                    record.warmup_logged = true;
                }
                continue;
            }
            timed_out.insert(record.component_id.clone());
            if !record.fault_latched {
                record.fault_latched = true;
                warn!(
                    component = %record.component_id,
                    overdue_ms = overdue_by.as_millis() as u64,
                    always_critical = record.always_critical,
                    "watchdog: heartbeat timeout"
                );
                self.pending.push(WatchdogFault {
                    component_id: record.component_id.clone(),
                    overdue_by,
                    always_critical: record.always_critical,
                });
            }
        }
        timed_out
    }

    /// Take the faults raised since the last drain.
    pub fn drain_faults(&mut self) -> Vec<WatchdogFault> {
        std::mem::take(&mut self.pending)
    }

    /// Health of `component_id` at `now`. Unknown components are timed out.
    pub fn health(&self, component_id: &str, now: Instant) -> ComponentHealth {
        match self.records.get(component_id) {
            None => ComponentHealth::TimedOut,
            Some(record) => match record.overdue_by(now) {
                None => ComponentHealth::Healthy,
                Some(_) if record.in_grace_period(now) => ComponentHealth::Warmup,
                Some(_) => ComponentHealth::TimedOut,
            },
        }
    }

    pub fn record(&self, component_id: &str) -> Option<&HeartbeatRecord> {
        self.records.get(component_id)
    }

    /// Registered component IDs, sorted.
    pub fn components(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.keys().cloned().collect();
        ids.sort();
        ids
    }
}
