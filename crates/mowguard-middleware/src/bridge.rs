//! [`BridgeGateway`] – fans the telemetry bus out to remote observers.
//!
//! The gateway holds **one** upstream [`Subscription`] on the
//! [`TelemetryBus`] and multiplexes it into any number of push-channel
//! sessions:
//!
//! 1. A dispatcher task reads the upstream subscription and `try_send`s each
//!    reading into the bounded queue of every session whose filters match.
//!    A full queue only affects that session.
//! 2. Every session runs its own send loop ([`BridgeGateway::serve_session`])
//!    that writes to its transport, tracks `last_delivered_sequence` per
//!    topic and emits a `gap` message when sequences jump after a stall.
//! 3. Sessions end on transport failure, client close, or idle timeout.
//!    The session entry is removed immediately and nothing is retried.
//!
//! # Push-channel protocol
//!
//! Client → server (JSON text frames):
//!
//! | Action | Effect |
//! |---|---|
//! | `{"action":"subscribe","topic":"telemetry"}` | Add a filter (group, pattern or exact topic) and replay its latest values |
//! | `{"action":"unsubscribe","topic":"telemetry"}` | Remove a filter |
//! | `{"action":"ping"}` | Keep-alive, answered with `pong` |
//!
//! Server → client: `reading`, `gap`, `subscribed`, `unsubscribed`, `pong`
//! and `error` messages, see [`OutboundMessage`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use mowguard_types::{MowError, SensorReading, TelemetryEnvelope};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{Subscription, TelemetryBus};
use crate::topic::TopicFilter;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables for the gateway.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Per-session outbound queue capacity.
    pub session_queue_capacity: usize,
    /// A session with no inbound frame for this long is closed. A write
    /// that blocks for this long is treated as a transport failure.
    pub idle_timeout: Duration,
    /// Inbound client actions allowed per second per session.
    pub max_actions_per_second: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            session_queue_capacity: 128,
            idle_timeout: Duration::from_secs(60),
            max_actions_per_second: 20,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

/// Actions a push-channel client may send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientAction {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Ping,
}

/// Messages written to a push-channel client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Reading(TelemetryEnvelope),
    Gap { topic: String, missed: u64 },
    Subscribed { topic: String },
    Unsubscribed { topic: String },
    Pong,
    Error { reason: String, hint: String },
}

impl OutboundMessage {
    fn from_error(err: &MowError) -> Self {
        OutboundMessage::Error {
            reason: err.reason().to_string(),
            hint: err.remediation().to_string(),
        }
    }
}

/// Inbound frame from a session transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    /// Transport-level keep-alive (e.g. a WebSocket ping).
    KeepAlive,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    IdleTimeout,
    TransportFailure(String),
    GatewayShutdown,
}

/// Counters reported when a session ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub delivered: u64,
    pub gaps_reported: u64,
    pub reason: CloseReason,
}

// ---------------------------------------------------------------------------
// Transport seams
// ---------------------------------------------------------------------------

/// Write half of a session transport.
#[async_trait]
pub trait SessionSink: Send {
    async fn send(&mut self, message: &OutboundMessage) -> Result<(), MowError>;
}

/// Read half of a session transport.
#[async_trait]
pub trait SessionSource: Send {
    /// `None` when the peer closed the connection.
    async fn recv(&mut self) -> Option<Result<InboundFrame, MowError>>;
}

// ---------------------------------------------------------------------------
// Session table
// ---------------------------------------------------------------------------

enum QueueItem {
    Reading { sequence: u64, reading: SensorReading },
}

struct SessionEntry {
    filters: Vec<TopicFilter>,
    tx: mpsc::Sender<QueueItem>,
}

impl SessionEntry {
    fn wants(&self, topic: &str) -> bool {
        self.filters.iter().any(|f| f.matches(topic))
    }
}

type SessionTable = HashMap<Uuid, SessionEntry>;

/// Removes the session entry when the session loop exits, whatever the
/// exit path.
struct SessionGuard<'a> {
    gateway: &'a BridgeGateway,
    id: Uuid,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.gateway.sessions().remove(&self.id);
        debug!(session = %self.id, "bridge session torn down");
    }
}

// ---------------------------------------------------------------------------
// BridgeGateway
// ---------------------------------------------------------------------------

/// Multiplexes one bus subscription into many observer sessions.
pub struct BridgeGateway {
    bus: TelemetryBus,
    config: BridgeConfig,
    sessions: Mutex<SessionTable>,
}

impl BridgeGateway {
    /// Create the gateway and start its dispatcher task.
    pub fn start(bus: TelemetryBus, config: BridgeConfig) -> (Arc<Self>, JoinHandle<()>) {
        let upstream = bus.subscribe(TopicFilter::all());
        let gateway = Arc::new(Self {
            bus,
            config,
            sessions: Mutex::new(HashMap::new()),
        });
        let dispatcher = tokio::spawn(Arc::clone(&gateway).dispatch(upstream));
        (gateway, dispatcher)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Number of connected sessions.
    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }

    fn sessions(&self) -> MutexGuard<'_, SessionTable> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn dispatch(self: Arc<Self>, mut upstream: Subscription) {
        while let Some(delivery) = upstream.recv().await {
            // Sessions replay the cache themselves when they subscribe.
            if delivery.replay {
                continue;
            }
            if delivery.missed > 0 {
                warn!(missed = delivery.missed, "bridge dispatcher lagged behind the bus");
            }
            let topic = delivery.topic().to_string();
            let mut sessions = self.sessions();
            sessions.retain(|id, entry| {
                if !entry.wants(&topic) {
                    return true;
                }
                let item = QueueItem::Reading {
                    sequence: delivery.sequence,
                    reading: delivery.reading.clone(),
                };
                match entry.tx.try_send(item) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(session = %id, topic = %topic, "session queue full");
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            });
        }
        info!("bridge dispatcher stopped: bus closed");
    }

    /// Add `filter` to a session and return the latest value of every topic
    /// it matches, ordered by topic.
    fn add_filter(&self, id: Uuid, filter: TopicFilter) -> Result<Vec<(u64, SensorReading)>, MowError> {
        let mut sessions = self.sessions();
        let entry = sessions.get_mut(&id).ok_or_else(|| MowError::BridgeSessionFault {
            session: id.to_string(),
            details: "session not registered".to_string(),
        })?;
        // Snapshot the cache while holding the session lock: anything
        // published afterwards reaches the queue through the dispatcher.
        let replay = self.bus.latest_matching(&filter);
        if !entry.filters.contains(&filter) {
            entry.filters.push(filter);
        }
        Ok(replay)
    }

    fn remove_filter(&self, id: Uuid, filter: &TopicFilter) {
        if let Some(entry) = self.sessions().get_mut(&id) {
            entry.filters.retain(|f| f != filter);
        }
    }

    /// Run one observer session to completion.
    ///
    /// Returns when the client closes, the transport fails, or the session
    /// stays idle past [`BridgeConfig::idle_timeout`].
    pub async fn serve_session<S, R>(&self, mut sink: S, mut source: R) -> SessionSummary
    where
        S: SessionSink,
        R: SessionSource,
    {
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(self.config.session_queue_capacity.max(1));
        self.sessions().insert(
            id,
            SessionEntry {
                filters: Vec::new(),
                tx,
            },
        );
        let _guard = SessionGuard { gateway: self, id };
        info!(session = %id, "bridge session opened");

        let limiter = action_limiter(self.config.max_actions_per_second);
        let mut tracker = SequenceTracker::default();
        let mut delivered = 0u64;
        let idle = self.config.idle_timeout;
        let mut idle_deadline = Instant::now() + idle;

        let reason = loop {
            tokio::select! {
                item = rx.recv() => {
                    let Some(QueueItem::Reading { sequence, reading }) = item else {
                        break CloseReason::GatewayShutdown;
                    };
                    let topic = reading.topic().to_string();
                    match tracker.observe(&topic, sequence) {
                        Observed::Duplicate => continue,
                        Observed::Gap(missed) => {
                            let gap = OutboundMessage::Gap { topic: topic.clone(), missed };
                            if let Err(e) = self.write(&mut sink, &gap).await {
                                break CloseReason::TransportFailure(e.to_string());
                            }
                        }
                        Observed::InOrder => {}
                    }
                    let message = OutboundMessage::Reading(TelemetryEnvelope::from_reading(&reading, sequence));
                    if let Err(e) = self.write(&mut sink, &message).await {
                        break CloseReason::TransportFailure(e.to_string());
                    }
                    delivered += 1;
                }
                frame = source.recv() => {
                    match frame {
                        None => break CloseReason::ClientClosed,
                        Some(Err(e)) => break CloseReason::TransportFailure(e.to_string()),
                        Some(Ok(InboundFrame::KeepAlive)) => {
                            idle_deadline = Instant::now() + idle;
                        }
                        Some(Ok(InboundFrame::Text(text))) => {
                            idle_deadline = Instant::now() + idle;
                            if limiter.check().is_err() {
                                warn!(session = %id, "client action rate limit exceeded; dropping action");
                                continue;
                            }
                            let replies = self.handle_action(id, &text, &mut tracker);
                            let mut failed = None;
                            for reply in &replies {
                                if let Err(e) = self.write(&mut sink, reply).await {
                                    failed = Some(e);
                                    break;
                                }
                                if matches!(reply, OutboundMessage::Reading(_)) {
                                    delivered += 1;
                                }
                            }
                            if let Some(e) = failed {
                                break CloseReason::TransportFailure(e.to_string());
                            }
                        }
                    }
                }
                _ = sleep_until(idle_deadline) => break CloseReason::IdleTimeout,
            }
        };

        let summary = SessionSummary {
            session_id: id,
            delivered,
            gaps_reported: tracker.gaps_reported,
            reason,
        };
        match &summary.reason {
            CloseReason::TransportFailure(details) => {
                let fault = MowError::BridgeSessionFault {
                    session: id.to_string(),
                    details: details.clone(),
                };
                warn!(session = %id, error = %fault, "bridge session fault");
            }
            other => info!(session = %id, reason = ?other, delivered, "bridge session closed"),
        }
        summary
    }

    /// Write with the idle timeout as an upper bound, so a peer that stops
    /// reading is detected as dead rather than stalling the loop forever.
    async fn write<S: SessionSink>(&self, sink: &mut S, message: &OutboundMessage) -> Result<(), MowError> {
        match tokio::time::timeout(self.config.idle_timeout, sink.send(message)).await {
            Ok(result) => result,
            Err(_) => Err(MowError::Channel("write stalled past idle timeout".to_string())),
        }
    }

    /// Answer one client action. A subscribe replays the cached values of
    /// the new filter before its `subscribed` ack.
    fn handle_action(&self, id: Uuid, text: &str, tracker: &mut SequenceTracker) -> Vec<OutboundMessage> {
        let action = match serde_json::from_str::<ClientAction>(text) {
            Ok(action) => action,
            Err(e) => return vec![OutboundMessage::from_error(&MowError::Serialization(e.to_string()))],
        };
        match action {
            ClientAction::Ping => vec![OutboundMessage::Pong],
            ClientAction::Subscribe { topic } => {
                match TopicFilter::parse(&topic).and_then(|filter| self.add_filter(id, filter)) {
                    Ok(replay) => {
                        let mut out = Vec::with_capacity(replay.len() + 1);
                        for (sequence, reading) in replay {
                            match tracker.observe(reading.topic(), sequence) {
                                Observed::Duplicate => continue,
                                Observed::Gap(missed) => out.push(OutboundMessage::Gap {
                                    topic: reading.topic().to_string(),
                                    missed,
                                }),
                                Observed::InOrder => {}
                            }
                            out.push(OutboundMessage::Reading(TelemetryEnvelope::from_reading(&reading, sequence)));
                        }
                        out.push(OutboundMessage::Subscribed { topic });
                        out
                    }
                    Err(e) => vec![OutboundMessage::from_error(&e)],
                }
            }
            ClientAction::Unsubscribe { topic } => match TopicFilter::parse(&topic) {
                Ok(filter) => {
                    self.remove_filter(id, &filter);
                    tracker.forget(&filter);
                    vec![OutboundMessage::Unsubscribed { topic }]
                }
                Err(e) => vec![OutboundMessage::from_error(&e)],
            },
        }
    }

    // -----------------------------------------------------------------------
    // WebSocket server
    // -----------------------------------------------------------------------

    /// Accept push-channel clients over WebSocket on `addr` until the
    /// listener fails to bind.
    ///
    /// # Errors
    ///
    /// [`MowError::Channel`] if the TCP listener cannot be bound.
    pub async fn run_ws_server(self: Arc<Self>, addr: SocketAddr) -> Result<(), MowError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| MowError::Channel(format!("ws bind error on {addr}: {e}")))?;
        info!(%addr, "push-channel gateway listening");

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let gateway = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = gateway.handle_ws_client(stream, peer).await {
                            error!(peer = %peer, error = %e, "ws client error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "ws accept error");
                }
            }
        }
    }

    async fn handle_ws_client(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), MowError> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| MowError::Channel(format!("ws handshake from {peer}: {e}")))?;
        let (ws_tx, ws_rx) = ws_stream.split();
        let summary = self
            .serve_session(WsSink { inner: ws_tx }, WsSource { inner: ws_rx })
            .await;
        debug!(peer = %peer, session = %summary.session_id, "ws client finished");
        Ok(())
    }
}

fn action_limiter(per_second: u32) -> DefaultDirectRateLimiter {
    let rate = NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN);
    RateLimiter::direct(Quota::per_second(rate))
}

// ---------------------------------------------------------------------------
// Sequence tracking
// ---------------------------------------------------------------------------

enum Observed {
    InOrder,
    Duplicate,
    Gap(u64),
}

/// `last_delivered_sequence` per topic for one session.
#[derive(Default)]
struct SequenceTracker {
    last_delivered: HashMap<String, u64>,
    gaps_reported: u64,
}

impl SequenceTracker {
    fn observe(&mut self, topic: &str, sequence: u64) -> Observed {
        let outcome = match self.last_delivered.get(topic) {
            Some(&last) if sequence <= last => return Observed::Duplicate,
            Some(&last) if sequence > last + 1 => {
                self.gaps_reported += 1;
                Observed::Gap(sequence - last - 1)
            }
            _ => Observed::InOrder,
        };
        self.last_delivered.insert(topic.to_string(), sequence);
        outcome
    }

    fn forget(&mut self, filter: &TopicFilter) {
        self.last_delivered.retain(|topic, _| !filter.matches(topic));
    }
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

struct WsSink {
    inner: SplitSink<WebSocketStream<TcpStream>, Message>,
}

#[async_trait]
impl SessionSink for WsSink {
    async fn send(&mut self, message: &OutboundMessage) -> Result<(), MowError> {
        let json = serde_json::to_string(message).map_err(|e| MowError::Serialization(e.to_string()))?;
        self.inner
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| MowError::Channel(e.to_string()))
    }
}

struct WsSource {
    inner: SplitStream<WebSocketStream<TcpStream>>,
}

#[async_trait]
impl SessionSource for WsSource {
    async fn recv(&mut self) -> Option<Result<InboundFrame, MowError>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(InboundFrame::Text(text.as_str().to_owned()))),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => return Some(Ok(InboundFrame::KeepAlive)),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(MowError::Channel(e.to_string()))),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use mowguard_types::{ReadingValue, Timestamp};

    /// Sink that forwards every message to a test channel, optionally
    /// blocking forever to emulate a stalled network write.
    struct ChannelSink {
        tx: mpsc::UnboundedSender<serde_json::Value>,
        stall: bool,
    }

    #[async_trait]
    impl SessionSink for ChannelSink {
        async fn send(&mut self, message: &OutboundMessage) -> Result<(), MowError> {
            if self.stall {
                std::future::pending::<()>().await;
            }
            let value = serde_json::to_value(message).map_err(|e| MowError::Serialization(e.to_string()))?;
            self.tx.send(value).map_err(|e| MowError::Channel(e.to_string()))
        }
    }

    struct ChannelSource {
        rx: mpsc::UnboundedReceiver<InboundFrame>,
    }

    #[async_trait]
    impl SessionSource for ChannelSource {
        async fn recv(&mut self) -> Option<Result<InboundFrame, MowError>> {
            self.rx.recv().await.map(Ok)
        }
    }

    struct TestClient {
        to_session: mpsc::UnboundedSender<InboundFrame>,
        from_session: mpsc::UnboundedReceiver<serde_json::Value>,
        task: JoinHandle<SessionSummary>,
    }

    impl TestClient {
        fn send(&self, json: &str) {
            let _ = self.to_session.send(InboundFrame::Text(json.to_string()));
        }

        async fn next(&mut self) -> serde_json::Value {
            tokio::time::timeout(Duration::from_secs(1), self.from_session.recv())
                .await
                .expect("timed out waiting for session output")
                .expect("session output closed")
        }
    }

    fn connect(gateway: &Arc<BridgeGateway>, stall: bool) -> TestClient {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let gw = Arc::clone(gateway);
        let task = tokio::spawn(async move {
            gw.serve_session(ChannelSink { tx: out_tx, stall }, ChannelSource { rx: in_rx })
                .await
        });
        TestClient {
            to_session: in_tx,
            from_session: out_rx,
            task,
        }
    }

    fn range(d: f32) -> SensorReading {
        SensorReading::new(
            "sensors/ranging/front",
            Timestamp::now(),
            ReadingValue::Range { distance_m: d },
            0.9,
            "sonar0",
        )
    }

    async fn wait_for_sessions(gateway: &BridgeGateway, n: usize) {
        for _ in 0..100 {
            if gateway.session_count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {n} sessions, have {}", gateway.session_count());
    }

    #[tokio::test]
    async fn subscribe_replays_latest_then_streams_live() -> Result<(), Box<dyn std::error::Error>> {
        let bus = TelemetryBus::default();
        bus.publish("sensors/ranging/front", range(3.0))?;
        bus.publish("sensors/ranging/front", range(2.0))?;
        let (gateway, _dispatcher) = BridgeGateway::start(bus.clone(), BridgeConfig::default());

        let mut client = connect(&gateway, false);
        client.send(r#"{"action":"subscribe","topic":"telemetry"}"#);

        let replay = client.next().await;
        assert_eq!(replay["type"], "reading");
        assert_eq!(replay["sequence"], 2);
        assert_eq!(replay["value"]["distance_m"], 2.0);
        let ack = client.next().await;
        assert_eq!(ack["type"], "subscribed");

        bus.publish("sensors/ranging/front", range(1.0))?;
        let live = client.next().await;
        assert_eq!(live["type"], "reading");
        assert_eq!(live["sequence"], 3);
        assert_eq!(live["topic"], "sensors/ranging/front");
        assert!(live.get("quality").is_some());
        Ok(())
    }

    #[tokio::test]
    async fn repeated_subscribe_does_not_replay_twice() -> Result<(), Box<dyn std::error::Error>> {
        let bus = TelemetryBus::default();
        bus.publish("sensors/ranging/front", range(2.0))?;
        let (gateway, _dispatcher) = BridgeGateway::start(bus.clone(), BridgeConfig::default());

        let mut client = connect(&gateway, false);
        client.send(r#"{"action":"subscribe","topic":"sensors/ranging/front"}"#);
        assert_eq!(client.next().await["sequence"], 1);
        assert_eq!(client.next().await["type"], "subscribed");

        client.send(r#"{"action":"subscribe","topic":"sensors/#"}"#);
        assert_eq!(client.next().await["type"], "subscribed");

        bus.publish("sensors/ranging/front", range(1.0))?;
        let live = client.next().await;
        assert_eq!(live["type"], "reading");
        assert_eq!(live["sequence"], 2);
        Ok(())
    }

    #[tokio::test]
    async fn ping_and_bad_actions() {
        let (gateway, _dispatcher) = BridgeGateway::start(TelemetryBus::default(), BridgeConfig::default());
        let mut client = connect(&gateway, false);

        client.send(r#"{"action":"ping"}"#);
        assert_eq!(client.next().await["type"], "pong");

        client.send("not json");
        let err = client.next().await;
        assert_eq!(err["type"], "error");
        assert_eq!(err["reason"], "serialization_error");

        client.send(r#"{"action":"subscribe","topic":"Bad//Topic"}"#);
        assert_eq!(client.next().await["reason"], "invalid_topic");
    }

    #[tokio::test]
    async fn stalled_session_does_not_delay_others() -> Result<(), Box<dyn std::error::Error>> {
        let bus = TelemetryBus::default();
        let config = BridgeConfig {
            session_queue_capacity: 4,
            ..BridgeConfig::default()
        };
        let (gateway, _dispatcher) = BridgeGateway::start(bus.clone(), config);

        let stalled = connect(&gateway, true);
        let mut healthy = connect(&gateway, false);
        wait_for_sessions(&gateway, 2).await;
        stalled.send(r#"{"action":"subscribe","topic":"sensors/#"}"#);
        healthy.send(r#"{"action":"subscribe","topic":"sensors/#"}"#);
        assert_eq!(healthy.next().await["type"], "subscribed");

        for i in 0..50 {
            bus.publish("sensors/ranging/front", range(i as f32))?;
            let msg = healthy.next().await;
            assert_eq!(msg["type"], "reading");
            assert_eq!(msg["value"]["distance_m"], i as f64);
        }
        Ok(())
    }

    #[tokio::test]
    async fn gap_reported_after_queue_overflow() -> Result<(), Box<dyn std::error::Error>> {
        let bus = TelemetryBus::default();
        let config = BridgeConfig {
            session_queue_capacity: 2,
            ..BridgeConfig::default()
        };
        let (gateway, _dispatcher) = BridgeGateway::start(bus.clone(), config);
        let mut client = connect(&gateway, false);
        client.send(r#"{"action":"subscribe","topic":"sensors/ranging/front"}"#);
        assert_eq!(client.next().await["type"], "subscribed");

        // No await between publishes: the dispatcher sees the whole burst
        // before the session loop drains anything, so only two fit.
        for i in 0..10 {
            bus.publish("sensors/ranging/front", range(i as f32))?;
        }
        assert_eq!(client.next().await["sequence"], 1);
        assert_eq!(client.next().await["sequence"], 2);

        bus.publish("sensors/ranging/front", range(0.5))?;
        let gap = client.next().await;
        assert_eq!(gap["type"], "gap");
        assert_eq!(gap["topic"], "sensors/ranging/front");
        assert_eq!(gap["missed"], 8);
        let next = client.next().await;
        assert_eq!(next["type"], "reading");
        assert_eq!(next["sequence"], 11);
        Ok(())
    }

    #[tokio::test]
    async fn client_close_tears_down_session() {
        let (gateway, _dispatcher) = BridgeGateway::start(TelemetryBus::default(), BridgeConfig::default());
        let client = connect(&gateway, false);
        wait_for_sessions(&gateway, 1).await;

        drop(client.to_session);
        let summary = client.task.await.expect("session task panicked");
        assert_eq!(summary.reason, CloseReason::ClientClosed);
        assert_eq!(gateway.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_times_out() {
        let config = BridgeConfig {
            idle_timeout: Duration::from_secs(5),
            ..BridgeConfig::default()
        };
        let (gateway, _dispatcher) = BridgeGateway::start(TelemetryBus::default(), config);
        let client = connect(&gateway, false);
        let summary = client.task.await.expect("session task panicked");
        assert_eq!(summary.reason, CloseReason::IdleTimeout);
        assert_eq!(gateway.session_count(), 0);
    }

    #[test]
    fn sequence_tracker_detects_gaps_and_duplicates() {
        let mut t = SequenceTracker::default();
        assert!(matches!(t.observe("a", 3), Observed::InOrder));
        assert!(matches!(t.observe("a", 4), Observed::InOrder));
        assert!(matches!(t.observe("a", 4), Observed::Duplicate));
        assert!(matches!(t.observe("a", 2), Observed::Duplicate));
        assert!(matches!(t.observe("a", 9), Observed::Gap(4)));
        assert!(matches!(t.observe("b", 1), Observed::InOrder));
        assert_eq!(t.gaps_reported, 1);

        t.forget(&TopicFilter::Exact("a".into()));
        assert!(matches!(t.observe("a", 20), Observed::InOrder));
    }
}
