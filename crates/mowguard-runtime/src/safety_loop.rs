//! The fixed-rate safety loop.
//!
//! One Tokio task owns the [`EmergencyController`] and is therefore the only
//! writer of the safety state. Everything else talks to it through a
//! [`SafetyHandle`]:
//!
//! - commands (stop, clear) travel over an mpsc channel and are served
//!   before the next tick, so a stop latches immediately;
//! - readers get immutable [`SafetySnapshot`]s through a `watch` channel.
//!
//! Each tick builds a [`TickInput`] from the bus's latest sensor values and
//! the watchdog's timed-out set, evaluates it, then publishes every queued
//! transition on `safety/status` and every emergency event on
//! `safety/emergency`.
//!
//! The loop also supervises the watchdog task: when its pulse on
//! `system/heartbeat` goes quiet for longer than
//! [`SafetyLoopConfig::watchdog_window`], or its timed-out channel closes,
//! the loop latches a watchdog stop itself.

use std::collections::BTreeSet;
use std::time::Duration;

use mowguard_kernel::{
    ClearOutcome, EmergencyController, Outbox, SafetyEvaluator, SafetyThresholds, StateChange,
    TickInput,
};
use mowguard_middleware::topic::{SAFETY_EMERGENCY, SAFETY_STATUS, SYSTEM_HEARTBEAT, TopicFilter};
use mowguard_middleware::{BusDelivery, TelemetryBus};
use mowguard_types::{MowError, ReadingValue, SafetySnapshot, SensorReading, StopSource, Timestamp};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::watchdog_task::SAFETY_WATCHDOG_COMPONENT;

/// Source id stamped on readings the loop publishes.
pub const SAFETY_LOOP_SOURCE: &str = "safety_loop";

const COMMAND_QUEUE: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration bundle for [`spawn_safety_loop`].
#[derive(Debug, Clone)]
pub struct SafetyLoopConfig {
    /// Evaluation period.
    pub tick_interval: Duration,
    pub thresholds: SafetyThresholds,
    /// Longest silence tolerated from the watchdog task's own pulse.
    pub watchdog_window: Duration,
}

impl Default for SafetyLoopConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(250),
            thresholds: SafetyThresholds::default(),
            watchdog_window: Duration::from_secs(6),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands and handle
// ─────────────────────────────────────────────────────────────────────────────

/// Requests served by the safety loop.
#[derive(Debug)]
pub enum SafetyCommand {
    Stop {
        source: StopSource,
        reason: String,
        reply: Option<oneshot::Sender<StateChange>>,
    },
    Clear {
        confirmation: bool,
        reply: oneshot::Sender<Result<ClearOutcome, MowError>>,
    },
}

/// Cloneable access to the safety loop.
#[derive(Debug, Clone)]
pub struct SafetyHandle {
    commands: mpsc::Sender<SafetyCommand>,
    snapshots: watch::Receiver<SafetySnapshot>,
}

fn loop_gone() -> MowError {
    MowError::Channel("safety loop is not running".to_string())
}

impl SafetyHandle {
    /// Latch an emergency stop and wait until the loop has applied it.
    ///
    /// # Errors
    ///
    /// [`MowError::Channel`] if the loop has exited.
    pub async fn request_stop(&self, source: StopSource, reason: impl Into<String>) -> Result<StateChange, MowError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SafetyCommand::Stop {
                source,
                reason: reason.into(),
                reply: Some(reply),
            })
            .await
            .map_err(|_| loop_gone())?;
        rx.await.map_err(|_| loop_gone())
    }

    /// Queue a stop from a non-async context (signal handlers).
    ///
    /// Must not be called from within a Tokio runtime thread.
    pub fn request_stop_blocking(&self, source: StopSource, reason: impl Into<String>) -> Result<(), MowError> {
        self.commands
            .blocking_send(SafetyCommand::Stop {
                source,
                reason: reason.into(),
                reply: None,
            })
            .map_err(|_| loop_gone())
    }

    /// Ask the loop to leave `EMERGENCY_STOPPED`.
    ///
    /// # Errors
    ///
    /// The controller's clear errors ([`MowError::ConfirmationRequired`],
    /// [`MowError::InterlockStillActive`]) or [`MowError::Channel`] if the
    /// loop has exited.
    pub async fn request_clear(&self, confirmation: bool) -> Result<ClearOutcome, MowError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SafetyCommand::Clear { confirmation, reply })
            .await
            .map_err(|_| loop_gone())?;
        rx.await.map_err(|_| loop_gone())?
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> SafetySnapshot {
        self.snapshots.borrow().clone()
    }

    /// A receiver that is notified on every new snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SafetySnapshot> {
        self.snapshots.clone()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loop task
// ─────────────────────────────────────────────────────────────────────────────

struct SafetyLoop {
    controller: EmergencyController,
    bus: TelemetryBus,
    timeouts: watch::Receiver<BTreeSet<String>>,
    snapshots: watch::Sender<SafetySnapshot>,
    sensors: TopicFilter,
    watchdog_window: Duration,
    last_watchdog_pulse: Instant,
}

impl SafetyLoop {
    fn tick_input(&self) -> TickInput {
        let readings = self
            .bus
            .latest_matching(&self.sensors)
            .into_iter()
            .map(|(_, reading)| reading)
            .collect();
        TickInput::new(readings, self.timeouts.borrow().clone())
    }

    /// Serve `command`, publish what it produced, then reply.
    fn handle(&mut self, command: SafetyCommand) {
        match command {
            SafetyCommand::Stop { source, reason, reply } => {
                let change = self.controller.request_stop(source, reason);
                self.flush();
                if let Some(reply) = reply {
                    let _ = reply.send(change);
                }
            }
            SafetyCommand::Clear { confirmation, reply } => {
                let input = self.tick_input();
                let outcome = self.controller.request_clear(confirmation, &input);
                self.flush();
                let _ = reply.send(outcome);
            }
        }
    }

    fn observe_heartbeat(&mut self, delivery: BusDelivery) {
        if delivery.replay {
            return;
        }
        if let ReadingValue::Heartbeat { component, heartbeat: true } = delivery.reading.value()
            && component == SAFETY_WATCHDOG_COMPONENT
        {
            self.last_watchdog_pulse = Instant::now();
        }
    }

    /// Why the watchdog task is considered dead, if it is.
    fn watchdog_fault(&self) -> Option<&'static str> {
        if self.timeouts.has_changed().is_err() {
            return Some("watchdog task gone");
        }
        if self.last_watchdog_pulse.elapsed() > self.watchdog_window {
            return Some("watchdog pulse missing");
        }
        None
    }

    fn tick(&mut self) {
        if let Some(fault) = self.watchdog_fault()
            && !self.controller.state().is_emergency()
        {
            error!(fault, "watchdog supervision failed; latching emergency stop");
            self.controller.request_stop(StopSource::WatchdogTimeout, SAFETY_WATCHDOG_COMPONENT);
        }
        let input = self.tick_input();
        self.controller.tick(&input);
        self.flush();
    }

    /// Publish queued transitions and events, then the new snapshot.
    fn flush(&mut self) {
        let Outbox { transitions, events } = self.controller.take_outbox();
        for transition in transitions {
            let reading = SensorReading::new(
                SAFETY_STATUS,
                transition.at,
                ReadingValue::SafetyStatus(transition),
                1.0,
                SAFETY_LOOP_SOURCE,
            );
            if let Err(e) = self.bus.publish(SAFETY_STATUS, reading) {
                warn!(error = %e, "failed to publish safety transition");
            }
        }
        for event in events {
            let reading = SensorReading::new(
                SAFETY_EMERGENCY,
                Timestamp::now(),
                ReadingValue::Emergency(event),
                1.0,
                SAFETY_LOOP_SOURCE,
            );
            if let Err(e) = self.bus.publish(SAFETY_EMERGENCY, reading) {
                warn!(error = %e, "failed to publish emergency event");
            }
        }
        let snapshot = self.controller.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

/// Spawn the safety loop.
///
/// `timeouts` carries the watchdog's current timed-out set; the sender side
/// belongs to the watchdog task and dropping it latches a stop. The task
/// ends when every [`SafetyHandle`] has been dropped.
pub fn spawn_safety_loop(
    bus: TelemetryBus,
    timeouts: watch::Receiver<BTreeSet<String>>,
    config: SafetyLoopConfig,
) -> (SafetyHandle, JoinHandle<()>) {
    let controller = EmergencyController::new(SafetyEvaluator::with_thresholds(&config.thresholds));
    let (commands_tx, mut commands_rx) = mpsc::channel(COMMAND_QUEUE);
    let (snapshots_tx, snapshots_rx) = watch::channel(controller.snapshot());
    let mut heartbeats = bus.subscribe(TopicFilter::Exact(SYSTEM_HEARTBEAT.to_string()));

    let mut state = SafetyLoop {
        controller,
        bus,
        timeouts,
        snapshots: snapshots_tx,
        sensors: TopicFilter::Pattern("sensors/#".to_string()),
        watchdog_window: config.watchdog_window,
        last_watchdog_pulse: Instant::now(),
    };
    let tick_interval = config.tick_interval;

    let task = tokio::spawn(async move {
        info!(tick_ms = tick_interval.as_millis() as u64, "safety loop started");
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                command = commands_rx.recv() => {
                    let Some(command) = command else { break };
                    debug!(?command, "safety command");
                    state.handle(command);
                }
                Some(delivery) = heartbeats.recv() => state.observe_heartbeat(delivery),
                _ = ticker.tick() => state.tick(),
            }
        }
        info!("safety loop stopped: all handles dropped");
    });

    (
        SafetyHandle {
            commands: commands_tx,
            snapshots: snapshots_rx,
        },
        task,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use mowguard_types::{CauseKind, SafetyState};

    fn timeouts() -> (watch::Sender<BTreeSet<String>>, watch::Receiver<BTreeSet<String>>) {
        watch::channel(BTreeSet::new())
    }

    #[tokio::test]
    async fn stop_is_applied_before_reply() -> Result<(), Box<dyn std::error::Error>> {
        let bus = TelemetryBus::default();
        let (_tx, rx) = timeouts();
        let (handle, _task) = spawn_safety_loop(bus.clone(), rx, SafetyLoopConfig::default());

        let change = handle.request_stop(StopSource::RemoteCommand, "test").await?;
        assert!(change.changed());
        assert_eq!(handle.snapshot().state, SafetyState::EmergencyStopped);

        let status = bus.latest(SAFETY_STATUS).ok_or("no transition published")?;
        match status.value() {
            ReadingValue::SafetyStatus(t) => {
                assert_eq!(t.to, SafetyState::EmergencyStopped);
                assert_eq!(t.cause.kind, CauseKind::Command);
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert!(bus.latest(SAFETY_EMERGENCY).is_some());
        Ok(())
    }

    #[tokio::test]
    async fn clear_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let (_tx, rx) = timeouts();
        let (handle, _task) = spawn_safety_loop(TelemetryBus::default(), rx, SafetyLoopConfig::default());

        assert_eq!(handle.request_clear(true).await?, ClearOutcome::NotStopped);
        handle.request_stop(StopSource::OperatorSignal, "ctrl-c").await?;
        assert_eq!(handle.request_clear(false).await, Err(MowError::ConfirmationRequired));
        assert_eq!(handle.snapshot().state, SafetyState::EmergencyStopped);
        assert_eq!(handle.request_clear(true).await?, ClearOutcome::EmergencyCleared);
        assert_eq!(handle.snapshot().state, SafetyState::Normal);
        Ok(())
    }

    fn watchdog_pulse() -> SensorReading {
        SensorReading::new(
            SYSTEM_HEARTBEAT,
            Timestamp::now(),
            ReadingValue::Heartbeat {
                component: SAFETY_WATCHDOG_COMPONENT.to_string(),
                heartbeat: true,
            },
            1.0,
            SAFETY_WATCHDOG_COMPONENT,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn dead_watchdog_task_latches_stop() -> Result<(), Box<dyn std::error::Error>> {
        let bus = TelemetryBus::default();
        let (tx, rx) = timeouts();
        let (handle, _task) = spawn_safety_loop(bus.clone(), rx, SafetyLoopConfig::default());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.snapshot().state, SafetyState::Normal);

        drop(tx);
        let mut snapshots = handle.subscribe();
        let snapshot = tokio::time::timeout(
            Duration::from_secs(1),
            snapshots.wait_for(|s| s.state == SafetyState::EmergencyStopped),
        )
        .await??
        .clone();
        let stop = snapshot.stop.ok_or("no stop record")?;
        assert_eq!(stop.source, StopSource::WatchdogTimeout);
        assert_eq!(snapshot.cause.ok_or("no cause")?.kind, CauseKind::Watchdog);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn silent_watchdog_latches_stop_after_window() -> Result<(), Box<dyn std::error::Error>> {
        let bus = TelemetryBus::default();
        let (_tx, rx) = timeouts();
        let (handle, _task) = spawn_safety_loop(bus.clone(), rx, SafetyLoopConfig::default());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handle.snapshot().state, SafetyState::Normal);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.state, SafetyState::EmergencyStopped);
        assert_eq!(snapshot.stop.ok_or("no stop record")?.source, StopSource::WatchdogTimeout);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn pulsing_watchdog_keeps_loop_normal() -> Result<(), Box<dyn std::error::Error>> {
        let bus = TelemetryBus::default();
        let (_tx, rx) = timeouts();
        let (handle, _task) = spawn_safety_loop(bus.clone(), rx, SafetyLoopConfig::default());

        for _ in 0..10 {
            bus.publish(SYSTEM_HEARTBEAT, watchdog_pulse())?;
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        assert_eq!(handle.snapshot().state, SafetyState::Normal);
        assert!(handle.snapshot().stop.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn loop_ends_when_handles_drop() {
        let (_tx, rx) = timeouts();
        let (handle, task) = spawn_safety_loop(TelemetryBus::default(), rx, SafetyLoopConfig::default());
        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("loop did not stop")
            .expect("loop panicked");
    }
}
