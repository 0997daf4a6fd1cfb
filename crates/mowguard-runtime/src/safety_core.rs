//! [`SafetyCore`] – assembles the bus, ingest hub, safety loop, watchdog,
//! audit recorder and bridge gateway into one running unit.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mowguard_journal::AuditJournal;
use mowguard_middleware::{
    BridgeConfig, BridgeGateway, SensorIngestHub, SensorProducer, TelemetryBus, spawn_producer,
};
use mowguard_types::{MowError, SafetySnapshot, SafetyState};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::recorder::{SharedJournal, spawn_audit_recorder};
use crate::safety_loop::{SafetyHandle, SafetyLoopConfig, spawn_safety_loop};
use crate::watchdog_task::{WatchdogTaskConfig, spawn_watchdog};

/// Everything [`SafetyCore::start`] needs.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Per-subscriber queue capacity of the bus.
    pub bus_capacity: usize,
    /// `(canonical, alias)` topic pairs.
    pub aliases: Vec<(String, String)>,
    pub decay_factor: f32,
    pub safety: SafetyLoopConfig,
    pub watchdog: WatchdogTaskConfig,
    pub bridge: BridgeConfig,
    /// SQLite file for the audit journal; in memory when `None`.
    pub journal_path: Option<PathBuf>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            bus_capacity: 256,
            aliases: Vec::new(),
            decay_factor: mowguard_middleware::ingest::DEFAULT_DECAY_FACTOR,
            safety: SafetyLoopConfig::default(),
            watchdog: WatchdogTaskConfig::default(),
            bridge: BridgeConfig::default(),
            journal_path: None,
        }
    }
}

/// The running safety core.
///
/// Must be started from within a Tokio runtime. Dropping it does not stop
/// the tasks; call [`shutdown`](Self::shutdown).
pub struct SafetyCore {
    bus: TelemetryBus,
    hub: Arc<SensorIngestHub>,
    gateway: Arc<BridgeGateway>,
    safety: SafetyHandle,
    journal: SharedJournal,
    tasks: Vec<JoinHandle<()>>,
}

impl SafetyCore {
    /// Build and spawn every component.
    ///
    /// # Errors
    ///
    /// [`MowError::InvalidTopic`] for a bad alias pair and
    /// [`MowError::Storage`] when the journal cannot be opened.
    pub fn start(config: CoreConfig) -> Result<Self, MowError> {
        let bus = TelemetryBus::new(config.bus_capacity);
        for (canonical, alias) in &config.aliases {
            bus.register_alias(canonical, alias)?;
        }

        let journal = match &config.journal_path {
            Some(path) => {
                let path = path.to_str().ok_or_else(|| {
                    MowError::Config(format!("journal path is not UTF-8: {}", path.display()))
                })?;
                AuditJournal::open(path)?
            }
            None => AuditJournal::open_in_memory()?,
        };
        let journal = Arc::new(Mutex::new(journal));

        let mut tasks = Vec::new();
        // Subscribe before anything can publish a transition.
        tasks.push(spawn_audit_recorder(&bus, Arc::clone(&journal)));

        let (timeouts_tx, timeouts_rx) = watch::channel(BTreeSet::new());
        let (safety, safety_task) = spawn_safety_loop(bus.clone(), timeouts_rx, config.safety.clone());
        tasks.push(safety_task);
        tasks.push(spawn_watchdog(
            bus.clone(),
            safety.clone(),
            timeouts_tx,
            config.watchdog.clone(),
        ));

        let (gateway, dispatcher) = BridgeGateway::start(bus.clone(), config.bridge.clone());
        tasks.push(dispatcher);

        let hub = Arc::new(SensorIngestHub::with_decay(bus.clone(), config.decay_factor));
        info!(
            tick_ms = config.safety.tick_interval.as_millis() as u64,
            aliases = config.aliases.len(),
            persistent_journal = config.journal_path.is_some(),
            "safety core started"
        );

        Ok(Self {
            bus,
            hub,
            gateway,
            safety,
            journal,
            tasks,
        })
    }

    /// The telemetry bus every component publishes on.
    pub fn bus(&self) -> &TelemetryBus {
        &self.bus
    }

    /// Entry point for sensor producers.
    pub fn hub(&self) -> &Arc<SensorIngestHub> {
        &self.hub
    }

    /// Push-channel gateway; serve it with
    /// [`BridgeGateway::run_ws_server`].
    pub fn gateway(&self) -> &Arc<BridgeGateway> {
        &self.gateway
    }

    /// Handle for stop and clear commands.
    pub fn safety(&self) -> &SafetyHandle {
        &self.safety
    }

    /// The audit journal fed by the recorder task.
    pub fn journal(&self) -> &SharedJournal {
        &self.journal
    }

    /// Latest safety snapshot.
    pub fn snapshot(&self) -> SafetySnapshot {
        self.safety.snapshot()
    }

    /// Wait until the safety state is an emergency and the newest journal
    /// entry records it.
    ///
    /// # Errors
    ///
    /// [`MowError::Channel`] when the safety loop is gone or `timeout`
    /// elapses first, [`MowError::Storage`] when the journal cannot be read.
    pub async fn await_stop_recorded(&self, timeout: Duration) -> Result<SafetySnapshot, MowError> {
        tokio::time::timeout(timeout, self.stop_recorded())
            .await
            .map_err(|_| MowError::Channel("timed out waiting for the stop to be recorded".to_string()))?
    }

    async fn stop_recorded(&self) -> Result<SafetySnapshot, MowError> {
        let mut snapshots = self.safety.subscribe();
        let snapshot = snapshots
            .wait_for(|s| s.state.is_emergency())
            .await
            .map_err(|_| MowError::Channel("safety loop is not running".to_string()))?
            .clone();
        loop {
            if self.latest_recorded_state()?.is_some_and(|state| state.is_emergency()) {
                return Ok(snapshot);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn latest_recorded_state(&self) -> Result<Option<SafetyState>, MowError> {
        let journal = self
            .journal
            .lock()
            .map_err(|_| MowError::Storage("audit journal lock poisoned".to_string()))?;
        Ok(journal.recent(1)?.first().map(|t| t.to))
    }

    /// Run `producer` in its own task, feeding the ingest hub.
    pub fn add_producer<P>(&mut self, producer: P)
    where
        P: SensorProducer + 'static,
    {
        self.tasks.push(spawn_producer(Arc::clone(&self.hub), producer));
    }

    /// Abort every task and wait for them to finish.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        info!("safety core stopped");
    }
}
