//! Copies every transition published on `safety/status` into the
//! [`AuditJournal`].

use std::sync::{Arc, Mutex};

use mowguard_journal::AuditJournal;
use mowguard_middleware::TelemetryBus;
use mowguard_middleware::topic::{SAFETY_STATUS, TopicFilter};
use mowguard_types::ReadingValue;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Journal shared between the recorder and readers such as the cockpit.
pub type SharedJournal = Arc<Mutex<AuditJournal>>;

/// Spawn the recorder. Ends when the bus is dropped.
pub fn spawn_audit_recorder(bus: &TelemetryBus, journal: SharedJournal) -> JoinHandle<()> {
    let mut status = bus.subscribe(TopicFilter::Exact(SAFETY_STATUS.to_string()));
    tokio::spawn(async move {
        while let Some(delivery) = status.recv().await {
            if delivery.missed > 0 {
                warn!(missed = delivery.missed, "audit recorder lagged; transitions lost");
            }
            // Already recorded when it was live.
            if delivery.replay {
                continue;
            }
            let ReadingValue::SafetyStatus(transition) = delivery.reading.value() else {
                continue;
            };
            let Ok(guard) = journal.lock() else {
                error!("audit journal lock poisoned; recorder stopping");
                return;
            };
            if let Err(e) = guard.record(transition) {
                error!(error = %e, id = %transition.id, "failed to record transition");
            }
        }
        info!("audit recorder stopped");
    })
}
