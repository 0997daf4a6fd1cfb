//! Sensor producers and the task that drives each one.
//!
//! MowGuard never talks to sensor hardware directly. Drivers implement
//! [`SensorProducer`]; [`spawn_producer`] runs every producer in its own Tokio
//! task so that a slow or wedged driver can only stall itself.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mowguard_types::{MowError, SensorClass};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::ingest::{RawReading, SensorIngestHub};
use crate::topic::sensor_topic;

/// What a producer yields on each poll.
#[derive(Debug, Clone)]
pub enum ProducerEvent {
    Reading(RawReading),
    /// The driver lost its link for one sample (I/O hiccup).
    TransportError(String),
    /// The driver has no more data and its task should end.
    Finished,
}

/// Every sensor driver feeding the ingest hub implements this trait.
///
/// # Contract
///
/// * `next` may block on the driver's own I/O, never on anything else.
/// * Transport failures are reported as [`ProducerEvent::TransportError`],
///   not by ending the stream.
#[async_trait]
pub trait SensorProducer: Send {
    /// Stable source identifier, used for per-source monotonicity checks.
    fn source_id(&self) -> &str;

    /// Sensor class and instance this producer publishes.
    fn topic(&self) -> (SensorClass, String);

    /// Wait for the next event from the driver.
    async fn next(&mut self) -> ProducerEvent;
}

/// Drive `producer` in a dedicated task until it reports
/// [`ProducerEvent::Finished`].
///
/// Invalid readings are logged and dropped; transport errors are turned into
/// decayed re-publications of the last known value.
pub fn spawn_producer<P>(hub: Arc<SensorIngestHub>, mut producer: P) -> JoinHandle<()>
where
    P: SensorProducer + 'static,
{
    tokio::spawn(async move {
        let source = producer.source_id().to_string();
        let (class, instance) = producer.topic();
        let topic = sensor_topic(class, &instance);
        info!(source = %source, topic = %topic, "producer started");

        loop {
            match producer.next().await {
                ProducerEvent::Reading(raw) => {
                    if let Err(e) = hub.ingest(raw) {
                        warn!(source = %source, error = %e, "reading rejected");
                    }
                }
                ProducerEvent::TransportError(details) => {
                    match hub.report_transport_error(&source, &topic, &details) {
                        Ok(_) => {}
                        Err(MowError::TransientRead { .. }) => {}
                        Err(e) => warn!(source = %source, error = %e, "decay republish failed"),
                    }
                }
                ProducerEvent::Finished => break,
            }
        }
        info!(source = %source, "producer finished");
    })
}

// ---------------------------------------------------------------------------
// SimulatedProducer
// ---------------------------------------------------------------------------

/// Replays a scripted sequence of events at a fixed period.
///
/// Used by the demo mode of the CLI and by tests; with `repeat` set the
/// script loops forever.
pub struct SimulatedProducer {
    source_id: String,
    class: SensorClass,
    instance: String,
    script: Vec<ProducerEvent>,
    pending: VecDeque<ProducerEvent>,
    period: Duration,
    repeat: bool,
}

impl SimulatedProducer {
    pub fn new(
        source_id: impl Into<String>,
        class: SensorClass,
        instance: impl Into<String>,
        script: Vec<ProducerEvent>,
        period: Duration,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            class,
            instance: instance.into(),
            pending: script.iter().cloned().collect(),
            script,
            period,
            repeat: false,
        }
    }

    /// Loop the script instead of finishing after one pass.
    pub fn repeating(mut self) -> Self {
        self.repeat = true;
        self
    }
}

#[async_trait]
impl SensorProducer for SimulatedProducer {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn topic(&self) -> (SensorClass, String) {
        (self.class, self.instance.clone())
    }

    async fn next(&mut self) -> ProducerEvent {
        if self.pending.is_empty() && self.repeat && !self.script.is_empty() {
            self.pending.extend(self.script.iter().cloned());
        }
        match self.pending.pop_front() {
            Some(event) => {
                tokio::time::sleep(self.period).await;
                event
            }
            None => ProducerEvent::Finished,
        }
    }
}
