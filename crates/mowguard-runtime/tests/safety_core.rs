use std::time::Duration;

use mowguard_kernel::{ClearOutcome, WatchdogConfig};
use mowguard_middleware::RawReading;
use mowguard_middleware::topic::SYSTEM_HEARTBEAT;
use mowguard_runtime::{
    CoreConfig, SafetyCore, SafetyLoopConfig, SupervisedComponent, WatchdogTaskConfig,
};
use mowguard_types::{
    CauseKind, MowError, ReadingValue, SafetySnapshot, SafetyState, SensorClass, SensorReading,
    StopSource, Timestamp,
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn attitude(pitch: f32) -> RawReading {
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

fn heartbeat(component: &str) -> SensorReading {
    SensorReading::new(
        SYSTEM_HEARTBEAT,
        Timestamp::now(),
        ReadingValue::Heartbeat {
            component: component.to_string(),
            heartbeat: true,
        },
        1.0,
        component,
    )
}

async fn wait_for_state(core: &SafetyCore, state: SafetyState) -> Result<SafetySnapshot, Box<dyn std::error::Error>> {
    let mut rx = core.safety().subscribe();
    let snapshot = tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| s.state == state)).await??;
    Ok(snapshot.clone())
}

fn watchdog_config(component: &str) -> WatchdogTaskConfig {
    WatchdogTaskConfig {
        watchdog: WatchdogConfig {
            grace_period: Duration::ZERO,
            default_window: Duration::from_secs(5),
        },
        check_interval: Duration::from_millis(100),
        supervised: vec![SupervisedComponent {
            id: component.to_string(),
            window: Duration::from_secs(1),
            always_critical: false,
        }],
        ..WatchdogTaskConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn tilt_latches_emergency_stop() -> TestResult {
    let core = SafetyCore::start(CoreConfig::default())?;
    core.hub().ingest(attitude(35.0))?;

    let snapshot = wait_for_state(&core, SafetyState::EmergencyStopped).await?;
    let cause = snapshot.cause.ok_or("stopped without a cause")?;
    assert_eq!(cause.kind, CauseKind::Interlock);
    assert_eq!(cause.detail, "tilt_exceeded");
    assert_eq!(snapshot.stop.ok_or("no stop record")?.source, StopSource::TiltExceeded);

    // Recovering the sensor does not release the latch.
    core.hub().ingest(attitude(1.0))?;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(core.snapshot().state, SafetyState::EmergencyStopped);
    core.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn remote_stop_latches_without_waiting_for_a_tick() -> TestResult {
    let config = CoreConfig {
        safety: SafetyLoopConfig {
            tick_interval: Duration::from_secs(1),
            ..SafetyLoopConfig::default()
        },
        ..CoreConfig::default()
    };
    let core = SafetyCore::start(config)?;

    let change = core.safety().request_stop(StopSource::RemoteCommand, "operator pressed stop").await?;
    assert_eq!(change.from, SafetyState::Normal);
    assert_eq!(change.to, SafetyState::EmergencyStopped);
    assert_eq!(core.snapshot().state, SafetyState::EmergencyStopped);

    // A second stop keeps the first one's cause.
    let again = core.safety().request_stop(StopSource::OperatorSignal, "ctrl-c").await?;
    assert!(!again.changed());
    assert_eq!(again.stop.source, StopSource::RemoteCommand);
    core.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn clear_requires_confirmation_and_quiet_interlocks() -> TestResult {
    let core = SafetyCore::start(CoreConfig::default())?;
    core.hub().ingest(attitude(35.0))?;
    wait_for_state(&core, SafetyState::EmergencyStopped).await?;

    assert_eq!(core.safety().request_clear(false).await, Err(MowError::ConfirmationRequired));

    let blocked = core.safety().request_clear(true).await;
    match blocked {
        Err(MowError::InterlockStillActive { names }) => assert_eq!(names, vec!["tilt_exceeded"]),
        other => panic!("expected interlock_still_active, got {other:?}"),
    }
    assert_eq!(core.snapshot().state, SafetyState::EmergencyStopped);

    core.hub().ingest(attitude(2.0))?;
    assert_eq!(core.safety().request_clear(true).await?, ClearOutcome::EmergencyCleared);
    assert_eq!(core.snapshot().state, SafetyState::Normal);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let journal = core.journal().lock().map_err(|_| "journal poisoned")?;
    let states: Vec<SafetyState> = journal.recent(10)?.into_iter().map(|t| t.to).collect();
    assert_eq!(
        states,
        vec![
            SafetyState::Normal,
            SafetyState::EmergencyClearing,
            SafetyState::EmergencyStopped,
            SafetyState::EmergencyClearing,
            SafetyState::EmergencyStopped,
        ]
    );
    let blocked = journal.recent(3)?.pop().ok_or("missing blocked transition")?;
    assert_eq!(blocked.cause.detail, "clear_blocked");
    assert_eq!(blocked.blocked_by, vec!["tilt_exceeded"]);
    drop(journal);
    core.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn missed_heartbeat_raises_exactly_one_watchdog_stop() -> TestResult {
    let config = CoreConfig {
        watchdog: watchdog_config("drive"),
        ..CoreConfig::default()
    };
    let core = SafetyCore::start(config)?;

    let snapshot = wait_for_state(&core, SafetyState::EmergencyStopped).await?;
    let stop = snapshot.stop.ok_or("no stop record")?;
    assert_eq!(stop.source, StopSource::WatchdogTimeout);

    // Stays timed out for a while; no second stop.
    tokio::time::sleep(Duration::from_secs(5)).await;
    let journal = core.journal().lock().map_err(|_| "journal poisoned")?;
    let stops: Vec<_> = journal
        .recent(50)?
        .into_iter()
        .filter(|t| t.to == SafetyState::EmergencyStopped)
        .collect();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].cause.kind, CauseKind::Watchdog);
    drop(journal);
    core.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn regular_heartbeats_keep_the_mower_running() -> TestResult {
    let config = CoreConfig {
        watchdog: watchdog_config("drive"),
        ..CoreConfig::default()
    };
    let core = SafetyCore::start(config)?;

    for _ in 0..20 {
        core.bus().publish(SYSTEM_HEARTBEAT, heartbeat("drive"))?;
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert_eq!(core.snapshot().state, SafetyState::Normal);
    assert!(core.snapshot().stop.is_none());
    core.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn journal_survives_restart() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("audit.db");
    let config = CoreConfig {
        journal_path: Some(path.clone()),
        ..CoreConfig::default()
    };

    let core = SafetyCore::start(config.clone())?;
    core.safety().request_stop(StopSource::RemoteCommand, "test").await?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    core.shutdown().await;

    let core = SafetyCore::start(config)?;
    let journal = core.journal().lock().map_err(|_| "journal poisoned")?;
    let commands = journal.by_cause_kind(CauseKind::Command)?;
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].cause.detail, "remote_stop");
    drop(journal);
    core.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn queued_stop_is_journaled_before_shutdown() -> TestResult {
    let core = SafetyCore::start(CoreConfig::default())?;
    let safety = core.safety().clone();
    // Queued without waiting for the reply, as a signal handler does.
    tokio::task::spawn_blocking(move || safety.request_stop_blocking(StopSource::OperatorSignal, "operator_signal"))
        .await??;

    let snapshot = core.await_stop_recorded(Duration::from_secs(2)).await?;
    assert_eq!(snapshot.state, SafetyState::EmergencyStopped);
    assert_eq!(snapshot.stop.ok_or("no stop record")?.source, StopSource::OperatorSignal);

    let journal = core.journal().lock().map_err(|_| "journal poisoned")?;
    let newest = journal.recent(1)?.pop().ok_or("stop not journaled")?;
    assert_eq!(newest.to, SafetyState::EmergencyStopped);
    assert_eq!(newest.cause.detail, "operator_signal");
    drop(journal);
    core.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn awaiting_a_stop_that_never_comes_times_out() -> TestResult {
    let core = SafetyCore::start(CoreConfig::default())?;
    let result = core.await_stop_recorded(Duration::from_secs(1)).await;
    assert!(matches!(result, Err(MowError::Channel(_))));
    assert_eq!(core.snapshot().state, SafetyState::Normal);
    core.shutdown().await;
    Ok(())
}
