//! `mowguard-middleware` – telemetry plumbing of the safety core.
//!
//! Routes readings between sensor producers, the safety kernel and remote
//! observers without interpreting them.
//!
//! # Modules
//!
//! - [`topic`] – Topic names, subscription filters and the legacy alias table.
//! - [`bus`] – [`TelemetryBus`]: per-topic sequenced pub/sub with a
//!   latest-value cache and bounded per-subscriber queues.
//! - [`ingest`] – [`SensorIngestHub`]: validation, monotonicity and quality
//!   decay in front of the bus.
//! - [`producer`] – The [`SensorProducer`] trait and the task driving each
//!   producer.
//! - [`bridge`] – [`BridgeGateway`]: WebSocket push channel for observers.

pub mod bridge;
pub mod bus;
pub mod ingest;
pub mod producer;
pub mod topic;

pub use bridge::{BridgeConfig, BridgeGateway, CloseReason, OutboundMessage, SessionSummary};
pub use bus::{BusDelivery, PublishReport, Subscription, TelemetryBus};
pub use ingest::{RawReading, SensorIngestHub};
pub use producer::{ProducerEvent, SensorProducer, SimulatedProducer, spawn_producer};
pub use topic::{AliasTable, TopicFilter, TopicGroup};
