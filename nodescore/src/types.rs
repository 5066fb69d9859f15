//! Sample, history and event types shared by the collector, the store and the API.
//! Field names are part of the JSON contract of the API and event feed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Latency recorded for a probe that timed out or failed. A sample whose
/// latency reaches this value counts as a failed ping.
pub const LATENCY_PENALTY_MS: f64 = 1000.0;

/// Upper bound for a bandwidth reading; anything above is local-network skew.
pub const BANDWIDTH_CAP_MBPS: f64 = 1000.0;

/// Stable node identifier: the node's `host:port` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Raw sampler output: what the network told us, before history is consulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub node_id: NodeId,
    pub timestamp: DateTime<Utc>,
    pub latency_ms: f64,
    pub bandwidth_mbps: f64,
}

/// One complete snapshot for a node; uptime and reliability are derived from history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub node_id: NodeId,
    pub timestamp: DateTime<Utc>,
    pub latency_ms: f64,
    pub bandwidth_mbps: f64,
    pub uptime_pct: f64,
    pub reliability_pct: f64,
}

impl MetricSample {
    pub fn from_measurement(m: Measurement, uptime_pct: f64, reliability_pct: f64) -> Self {
        Self {
            node_id: m.node_id,
            timestamp: m.timestamp,
            latency_ms: m.latency_ms,
            bandwidth_mbps: m.bandwidth_mbps,
            uptime_pct,
            reliability_pct,
        }
    }

    /// All-zero sample; the average of nothing.
    pub fn zeroed(node_id: NodeId, timestamp: DateTime<Utc>) -> Self {
        Self {
            node_id,
            timestamp,
            latency_ms: 0.0,
            bandwidth_mbps: 0.0,
            uptime_pct: 0.0,
            reliability_pct: 0.0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.latency_ms < LATENCY_PENALTY_MS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PingRecord {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    pub daily_average: MetricSample,
    pub weekly_average: MetricSample,
    pub monthly_average: MetricSample,
    pub total_samples: usize,
    pub last_updated: DateTime<Utc>,
}

/// Published by the collector to its subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum CollectorEvent {
    #[serde(rename = "metrics:collected")]
    MetricsCollected {
        node_id: NodeId,
        timestamp: DateTime<Utc>,
        aggregate: AggregateMetrics,
    },
    #[serde(rename = "error")]
    Error { node_id: NodeId, detail: String },
}

impl CollectorEvent {
    pub fn node_id(&self) -> &NodeId {
        match self {
            CollectorEvent::MetricsCollected { node_id, .. } => node_id,
            CollectorEvent::Error { node_id, .. } => node_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn penalty_latency_is_a_failure() {
        let ts = Utc::now();
        let mut s = MetricSample::zeroed(NodeId::from("10.0.0.1:8080"), ts);
        assert!(s.is_success());
        s.latency_ms = LATENCY_PENALTY_MS;
        assert!(!s.is_success());
        s.latency_ms = 999.9;
        assert!(s.is_success());
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let ev = CollectorEvent::Error {
            node_id: "a:1".into(),
            detail: "boom".into(),
        };
        let js = serde_json::to_value(&ev).unwrap();
        assert_eq!(js["type"], "error");
        assert_eq!(js["node_id"], "a:1");
        assert_eq!(js["detail"], "boom");
    }
}
