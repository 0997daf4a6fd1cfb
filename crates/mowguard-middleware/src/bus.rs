//! Topic-addressed publish/subscribe telemetry bus with a latest-value cache.
//!
//! Every subscriber owns a bounded [`tokio::sync::mpsc`] queue. Publishing
//! never awaits: each delivery is a `try_send`, and a subscriber whose queue
//! is full simply misses the message. The number of missed messages is
//! carried on that subscriber's next successful delivery
//! ([`BusDelivery::missed`]) and is also visible as a jump in the per-topic
//! [`BusDelivery::sequence`], so a stalled consumer learns about the gap
//! without ever slowing the publisher or any other subscriber.
//!
//! # Guarantees
//!
//! * A new subscription first receives the cached latest value of every
//!   topic its filter matches (no cold-start gap).
//! * Per topic, delivery order equals publish order. Sequence assignment and
//!   fan-out happen under one lock, so concurrent publishers cannot
//!   interleave a topic's messages.
//! * Aliases are resolved once per publish through the [`AliasTable`]; the
//!   reading is validated once and mirrored to every alias.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use mowguard_types::{MowError, SensorReading};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::topic::{AliasTable, TopicFilter, validate_topic};

/// Default per-subscriber queue capacity.
const DEFAULT_CAPACITY: usize = 256;

/// A reading delivered to one subscriber.
#[derive(Debug, Clone)]
pub struct BusDelivery {
    /// Per-topic sequence number, starting at 1.
    pub sequence: u64,
    pub reading: SensorReading,
    /// Messages this subscriber lost to a full queue since its previous
    /// delivery.
    pub missed: u64,
    /// `true` for the latest-value replay sent on subscribe.
    pub replay: bool,
}

impl BusDelivery {
    pub fn topic(&self) -> &str {
        self.reading.topic()
    }
}

/// Outcome of a single [`TelemetryBus::publish`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Canonical name followed by every alias the reading was mirrored to.
    pub topics: Vec<String>,
    /// Deliveries handed to subscriber queues.
    pub delivered: usize,
    /// Deliveries dropped because a subscriber queue was full.
    pub dropped: usize,
}

struct TopicEntry {
    sequence: u64,
    latest: SensorReading,
}

struct SubscriberSlot {
    id: u64,
    filter: TopicFilter,
    tx: mpsc::Sender<BusDelivery>,
    missed: u64,
}

impl SubscriberSlot {
    /// Offer a delivery without waiting. Returns `false` once the receiver
    /// has been dropped.
    fn offer(&mut self, sequence: u64, reading: &SensorReading, replay: bool) -> Offer {
        let delivery = BusDelivery {
            sequence,
            reading: reading.clone(),
            missed: self.missed,
            replay,
        };
        match self.tx.try_send(delivery) {
            Ok(()) => {
                self.missed = 0;
                Offer::Delivered
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.missed += 1;
                Offer::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Offer::Closed,
        }
    }
}

enum Offer {
    Delivered,
    Dropped,
    Closed,
}

#[derive(Default)]
struct BusState {
    topics: HashMap<String, TopicEntry>,
    subscribers: Vec<SubscriberSlot>,
    next_id: u64,
}

struct BusInner {
    state: Mutex<BusState>,
    aliases: RwLock<AliasTable>,
    capacity: usize,
}

impl BusInner {
    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared telemetry bus. Clone it cheaply – all clones share the same topic
/// cache and subscriber table.
#[derive(Clone)]
pub struct TelemetryBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for TelemetryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("TelemetryBus")
            .field("topics", &state.topics.len())
            .field("subscribers", &state.subscribers.len())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

impl TelemetryBus {
    /// Create a bus whose subscribers each get a queue of `capacity`
    /// deliveries, using the legacy alias defaults.
    pub fn new(capacity: usize) -> Self {
        Self::with_aliases(capacity, AliasTable::with_legacy_defaults())
    }

    /// Create a bus with an explicit alias table.
    pub fn with_aliases(capacity: usize, aliases: AliasTable) -> Self {
        Self {
            inner: Arc::new(BusInner {
                state: Mutex::new(BusState::default()),
                aliases: RwLock::new(aliases),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Register an additional legacy alias for `canonical`.
    pub fn register_alias(&self, canonical: &str, alias: &str) -> Result<(), MowError> {
        self.inner
            .aliases
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(canonical, alias)
    }

    /// Publish `reading` under `topic` and every alias of it.
    ///
    /// Never waits on subscribers. Publishing with no subscribers is a normal
    /// condition: the value is still cached for late subscribers.
    ///
    /// # Errors
    ///
    /// [`MowError::InvalidTopic`] when `topic` is malformed.
    pub fn publish(&self, topic: &str, reading: SensorReading) -> Result<PublishReport, MowError> {
        validate_topic(topic)?;
        let names = self
            .inner
            .aliases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .expand(topic);

        let mut report = PublishReport {
            topics: names.clone(),
            ..PublishReport::default()
        };

        let mut state = self.inner.lock();
        let BusState {
            topics,
            subscribers,
            ..
        } = &mut *state;
        let mut closed = false;

        for name in names {
            let message = if reading.topic() == name {
                reading.clone()
            } else {
                reading.retopic(name.as_str())
            };
            let entry = topics.entry(name.clone()).or_insert_with(|| TopicEntry {
                sequence: 0,
                latest: message.clone(),
            });
            entry.sequence += 1;
            entry.latest = message.clone();
            let sequence = entry.sequence;

            for slot in subscribers.iter_mut().filter(|s| s.filter.matches(&name)) {
                match slot.offer(sequence, &message, false) {
                    Offer::Delivered => report.delivered += 1,
                    Offer::Dropped => {
                        report.dropped += 1;
                        trace!(topic = %name, subscriber = slot.id, missed = slot.missed, "subscriber queue full");
                    }
                    Offer::Closed => closed = true,
                }
            }
        }

        if closed {
            subscribers.retain(|s| !s.tx.is_closed());
        }
        if report.dropped > 0 {
            debug!(topic = %topic, dropped = report.dropped, "deliveries dropped for slow subscribers");
        }
        Ok(report)
    }

    /// Subscribe to every topic matched by `filter`.
    ///
    /// The cached latest value of each matching topic is queued before the
    /// call returns, so the subscriber never sees a cold-start gap.
    pub fn subscribe(&self, filter: TopicFilter) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let mut state = self.inner.lock();
        let id = state.next_id;
        state.next_id += 1;

        let mut slot = SubscriberSlot {
            id,
            filter: filter.clone(),
            tx,
            missed: 0,
        };

        let mut replay: Vec<(&String, &TopicEntry)> = state
            .topics
            .iter()
            .filter(|(name, _)| filter.matches(name))
            .collect();
        replay.sort_by(|a, b| a.0.cmp(b.0));
        for (_, entry) in replay {
            if let Offer::Dropped = slot.offer(entry.sequence, &entry.latest, true) {
                warn!(subscriber = id, filter = %filter, "replay exceeded subscriber capacity");
            }
        }

        state.subscribers.push(slot);
        debug!(subscriber = id, filter = %filter, "bus subscription created");

        Subscription {
            id,
            filter,
            receiver: rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// The latest reading published under `topic` (canonical or alias).
    pub fn latest(&self, topic: &str) -> Option<SensorReading> {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map(|entry| entry.latest.clone())
    }

    /// The latest reading and its sequence number for `topic`.
    pub fn latest_with_sequence(&self, topic: &str) -> Option<(u64, SensorReading)> {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map(|entry| (entry.sequence, entry.latest.clone()))
    }

    /// Latest readings of every topic matched by `filter`, sorted by topic.
    pub fn latest_matching(&self, filter: &TopicFilter) -> Vec<(u64, SensorReading)> {
        let state = self.inner.lock();
        let mut out: Vec<(u64, SensorReading)> = state
            .topics
            .iter()
            .filter(|(name, _)| filter.matches(name))
            .map(|(_, entry)| (entry.sequence, entry.latest.clone()))
            .collect();
        out.sort_by(|a, b| a.1.topic().cmp(b.1.topic()));
        out
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

impl Default for TelemetryBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A live bus subscription. Dropping it unregisters the subscriber.
pub struct Subscription {
    id: u64,
    filter: TopicFilter,
    receiver: mpsc::Receiver<BusDelivery>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Wait for the next delivery. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BusDelivery> {
        self.receiver.recv().await
    }

    /// Take a delivery if one is already queued.
    pub fn try_recv(&mut self) -> Result<BusDelivery, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Bus-assigned id, unique for the bus's lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The filter this subscription was created with.
    pub fn filter(&self) -> &TopicFilter {
        &self.filter
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.lock().subscribers.retain(|s| s.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mowguard_types::{ReadingValue, Timestamp};
    use std::time::Duration;

    fn range(topic: &str, distance_m: f32) -> SensorReading {
        SensorReading::new(
            topic,
            Timestamp::now(),
            ReadingValue::Range { distance_m },
            1.0,
            "sonar",
        )
    }

    fn distance(d: &BusDelivery) -> f32 {
        match d.reading.value() {
            ReadingValue::Range { distance_m } => *distance_m,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_and_receive() -> Result<(), Box<dyn std::error::Error>> {
        let bus = TelemetryBus::default();
        let mut sub = bus.subscribe(TopicFilter::parse("sensors/ranging/front")?);

        let report = bus.publish("sensors/ranging/front", range("sensors/ranging/front", 1.5))?;
        assert_eq!(report.delivered, 1);

        let d = sub.recv().await.ok_or("no delivery")?;
        assert_eq!(d.topic(), "sensors/ranging/front");
        assert_eq!(d.sequence, 1);
        assert!(!d.replay);
        Ok(())
    }

    #[test]
    fn publish_without_subscribers_caches_value() -> Result<(), Box<dyn std::error::Error>> {
        let bus = TelemetryBus::default();
        let report = bus.publish("sensors/ranging/front", range("sensors/ranging/front", 2.0))?;
        assert_eq!(report.delivered, 0);
        assert!(bus.latest("sensors/ranging/front").is_some());
        Ok(())
    }

    #[test]
    fn invalid_topic_rejected() {
        let bus = TelemetryBus::default();
        assert!(matches!(
            bus.publish("Sensors//x", range("x", 1.0)),
            Err(MowError::InvalidTopic { .. })
        ));
    }

    #[tokio::test]
    async fn late_subscriber_receives_latest_value() -> Result<(), Box<dyn std::error::Error>> {
        let bus = TelemetryBus::default();
        for i in 1..=5 {
            bus.publish("sensors/ranging/front", range("sensors/ranging/front", i as f32))?;
        }

        let mut sub = bus.subscribe(TopicFilter::parse("sensors/#")?);
        let d = sub.try_recv()?;
        assert!(d.replay);
        assert_eq!(d.sequence, 5);
        assert_eq!(distance(&d), 5.0, "replay must be the Nth value");
        assert!(sub.try_recv().is_err(), "only the latest value is replayed");
        Ok(())
    }

    #[tokio::test]
    async fn per_topic_order_is_publish_order() -> Result<(), Box<dyn std::error::Error>> {
        let bus = TelemetryBus::new(64);
        let mut sub = bus.subscribe(TopicFilter::all());
        for i in 0..20 {
            bus.publish("sensors/ranging/front", range("sensors/ranging/front", i as f32))?;
        }
        let mut last = 0;
        for i in 0..20 {
            let d = sub.recv().await.ok_or("closed")?;
            assert_eq!(distance(&d), i as f32);
            assert!(d.sequence > last);
            last = d.sequence;
        }
        Ok(())
    }

    #[tokio::test]
    async fn alias_receives_mirror_without_revalidation() -> Result<(), Box<dyn std::error::Error>> {
        let bus = TelemetryBus::default();
        bus.register_alias("sensors/ranging/front", "sonar/front")?;
        let mut legacy = bus.subscribe(TopicFilter::parse("sonar/front")?);
        let mut canonical = bus.subscribe(TopicFilter::parse("sensors/ranging/front")?);

        let report = bus.publish("sensors/ranging/front", range("sensors/ranging/front", 0.9))?;
        assert_eq!(report.topics, vec!["sensors/ranging/front", "sonar/front"]);

        let a = legacy.recv().await.ok_or("closed")?;
        let c = canonical.recv().await.ok_or("closed")?;
        assert_eq!(a.topic(), "sonar/front");
        assert_eq!(c.topic(), "sensors/ranging/front");
        assert_eq!(a.reading.value(), c.reading.value());
        assert_eq!(bus.latest("sonar/front").map(|r| r.quality()), Some(1.0));
        Ok(())
    }

    #[tokio::test]
    async fn publishing_under_alias_reaches_canonical() -> Result<(), Box<dyn std::error::Error>> {
        let bus = TelemetryBus::default();
        let mut sub = bus.subscribe(TopicFilter::parse("sensors/attitude/imu")?);
        bus.publish(
            "imu/data",
            SensorReading::new(
                "imu/data",
                Timestamp::now(),
                ReadingValue::Attitude { roll_deg: 1.0, pitch_deg: 2.0, yaw_deg: 3.0 },
                1.0,
                "imu0",
            ),
        )?;
        let d = sub.recv().await.ok_or("closed")?;
        assert_eq!(d.topic(), "sensors/attitude/imu");
        Ok(())
    }

    #[tokio::test]
    async fn slow_subscriber_gets_gap_signal_and_does_not_block_others() -> Result<(), Box<dyn std::error::Error>> {
        const CAPACITY: usize = 4;
        let bus = TelemetryBus::new(CAPACITY);
        let mut slow = bus.subscribe(TopicFilter::all());
        let mut fast = bus.subscribe(TopicFilter::all());

        for i in 0..10 {
            bus.publish("sensors/ranging/front", range("sensors/ranging/front", i as f32))?;
            // The fast consumer keeps up and sees every message.
            let d = tokio::time::timeout(Duration::from_millis(50), fast.recv())
                .await?
                .ok_or("closed")?;
            assert_eq!(distance(&d), i as f32);
            assert_eq!(d.missed, 0);
        }

        // Slow consumer: first CAPACITY messages, then a gap.
        for expected in 1..=CAPACITY as u64 {
            assert_eq!(slow.try_recv()?.sequence, expected);
        }
        assert!(slow.try_recv().is_err());

        bus.publish("sensors/ranging/front", range("sensors/ranging/front", 99.0))?;
        let d = slow.try_recv()?;
        assert_eq!(d.missed, 10 - CAPACITY as u64);
        assert_eq!(d.sequence, 11);
        Ok(())
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let bus = TelemetryBus::default();
        let sub = bus.subscribe(TopicFilter::all());
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn latest_matching_is_sorted() -> Result<(), Box<dyn std::error::Error>> {
        let bus = TelemetryBus::with_aliases(8, AliasTable::new());
        bus.publish("sensors/ranging/rear", range("sensors/ranging/rear", 1.0))?;
        bus.publish("sensors/ranging/front", range("sensors/ranging/front", 2.0))?;
        bus.publish("sensors/ranging/front", range("sensors/ranging/front", 3.0))?;
        let all = bus.latest_matching(&TopicFilter::parse("sensors/ranging/+")?);
        let topics: Vec<&str> = all.iter().map(|(_, r)| r.topic()).collect();
        assert_eq!(topics, vec!["sensors/ranging/front", "sensors/ranging/rear"]);
        assert_eq!(all[0].0, 2);
        Ok(())
    }
}
