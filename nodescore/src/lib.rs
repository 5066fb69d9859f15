//! Node metrics collection and scoring for a VPN node marketplace.
//!
//! A [`Collector`] runs one periodic sampling task per tracked node, keeps a bounded
//! [`HistoryStore`] per node, derives uptime/reliability from it, and publishes
//! aggregates and composite scores to subscribers and the HTTP API.

pub mod api;
pub mod collector;
pub mod config;
pub mod history;
pub mod registry;
pub mod sampler;
pub mod score;
pub mod state;
pub mod store;
pub mod types;
pub mod ws;

pub use collector::Collector;
pub use history::{HistoryStore, NodeHistory};
pub use registry::{Registry, RegistryEvent, StaticRegistry};
pub use sampler::{HttpSampler, Reading, Sampler, ScriptedSampler};
pub use store::{JsonlStore, MemoryStore, MetricsStore, StoreError};
pub use types::{AggregateMetrics, CollectorEvent, Measurement, MetricSample, NodeId, PingRecord};
