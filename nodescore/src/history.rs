//! Bounded per-node history: the last samples by count, the last day of pings by age.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::score::{aggregate, std_dev};
use crate::types::{AggregateMetrics, MetricSample, NodeId, PingRecord};

pub const SAMPLE_CAPACITY: usize = 24;

pub fn ping_window() -> Duration {
    Duration::hours(24)
}

pub fn push_capped<T>(dq: &mut VecDeque<T>, v: T, cap: usize) {
    if dq.len() == cap {
        dq.pop_front();
    }
    dq.push_back(v);
}

// Plain data; HistoryStore puts the lock around it.
#[derive(Debug, Clone, Default)]
pub struct NodeHistory {
    samples: VecDeque<MetricSample>,
    pings: VecDeque<PingRecord>,
}

impl NodeHistory {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(SAMPLE_CAPACITY),
            pings: VecDeque::new(),
        }
    }

    pub fn append_sample(&mut self, sample: MetricSample) {
        let ping = PingRecord {
            timestamp: sample.timestamp,
            success: sample.is_success(),
            latency_ms: sample.latency_ms,
        };
        let now = sample.timestamp;
        push_capped(&mut self.samples, sample, SAMPLE_CAPACITY);
        self.pings.push_back(ping);
        self.evict_pings(now);
    }

    // Pings arrive in time order, so stale ones are always at the front.
    fn evict_pings(&mut self, now: DateTime<Utc>) {
        let horizon = now - ping_window();
        while self.pings.front().is_some_and(|p| p.timestamp < horizon) {
            self.pings.pop_front();
        }
    }

    /// Share of successful pings, 100 while nothing is known yet.
    pub fn uptime_pct(&self) -> f64 {
        if self.pings.is_empty() {
            return 100.0;
        }
        let ok = self.pings.iter().filter(|p| p.success).count();
        ok as f64 / self.pings.len() as f64 * 100.0
    }

    /// 40% ping success, 30% latency stability, 30% bandwidth stability.
    pub fn reliability_pct(&self) -> f64 {
        if self.pings.is_empty() || self.samples.is_empty() {
            return 100.0;
        }
        let latencies: Vec<f64> = self.samples.iter().map(|s| s.latency_ms).collect();
        let bandwidths: Vec<f64> = self.samples.iter().map(|s| s.bandwidth_mbps).collect();

        let latency_stability = (100.0 - std_dev(&latencies)).max(0.0);
        let bandwidth_stability = (100.0 - std_dev(&bandwidths)).max(0.0);

        self.uptime_pct() * 0.4 + latency_stability * 0.3 + bandwidth_stability * 0.3
    }

    pub fn latest_sample(&self) -> Option<&MetricSample> {
        self.samples.back()
    }

    pub fn samples(&self) -> impl Iterator<Item = &MetricSample> {
        self.samples.iter()
    }

    pub fn ping_records(&self) -> impl Iterator<Item = &PingRecord> {
        self.pings.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

struct Inner {
    history: NodeHistory,
    aggregate: Option<AggregateMetrics>,
}

/// One node's history behind its own lock. The lock is never held across an await.
pub struct HistoryStore {
    node_id: NodeId,
    inner: Mutex<Inner>,
}

impl HistoryStore {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            inner: Mutex::new(Inner {
                history: NodeHistory::new(),
                aggregate: None,
            }),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Appends and recomputes the aggregate in one critical section. Windows and
    /// `last_updated` are relative to the moment of recomputation.
    pub fn append_sample(&self, sample: MetricSample) -> AggregateMetrics {
        let mut g = self.inner.lock();
        g.history.append_sample(sample);
        let samples: Vec<MetricSample> = g.history.samples().cloned().collect();
        let agg = aggregate(&samples, &self.node_id, Utc::now());
        g.aggregate = Some(agg.clone());
        agg
    }

    pub fn uptime_pct(&self) -> f64 {
        self.inner.lock().history.uptime_pct()
    }

    pub fn reliability_pct(&self) -> f64 {
        self.inner.lock().history.reliability_pct()
    }

    /// Uptime and reliability read under a single lock acquisition.
    pub fn derived(&self) -> (f64, f64) {
        let g = self.inner.lock();
        (g.history.uptime_pct(), g.history.reliability_pct())
    }

    pub fn latest_sample(&self) -> Option<MetricSample> {
        self.inner.lock().history.latest_sample().cloned()
    }

    pub fn all_samples(&self) -> Vec<MetricSample> {
        self.inner.lock().history.samples().cloned().collect()
    }

    pub fn all_ping_records(&self) -> Vec<PingRecord> {
        self.inner.lock().history.ping_records().copied().collect()
    }

    pub fn aggregate(&self) -> Option<AggregateMetrics> {
        self.inner.lock().aggregate.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LATENCY_PENALTY_MS;

    fn sample_at(ts: DateTime<Utc>, latency_ms: f64, bandwidth_mbps: f64) -> MetricSample {
        MetricSample {
            node_id: NodeId::from("n:1"),
            timestamp: ts,
            latency_ms,
            bandwidth_mbps,
            uptime_pct: 100.0,
            reliability_pct: 100.0,
        }
    }

    #[test]
    fn push_capped_evicts_oldest() {
        let mut dq = VecDeque::new();
        for i in 0..5 {
            push_capped(&mut dq, i, 3);
        }
        assert_eq!(dq, [2, 3, 4]);
    }

    #[test]
    fn fresh_history_is_optimistic() {
        let h = NodeHistory::new();
        assert_eq!(h.uptime_pct(), 100.0);
        assert_eq!(h.reliability_pct(), 100.0);
        let store = HistoryStore::new(NodeId::from("n:1"));
        assert_eq!(store.uptime_pct(), 100.0);
        assert_eq!(store.reliability_pct(), 100.0);
        assert!(store.latest_sample().is_none());
        assert!(store.aggregate().is_none());
    }

    #[test]
    fn sample_ring_is_bounded_by_count() {
        let start = Utc::now();
        let mut h = NodeHistory::new();
        for i in 0..40 {
            h.append_sample(sample_at(start + Duration::minutes(i), 20.0, 100.0));
        }
        assert_eq!(h.len(), SAMPLE_CAPACITY);
        let first = h.samples().next().unwrap();
        assert_eq!(first.timestamp, start + Duration::minutes(16));
    }

    #[test]
    fn ping_ring_is_bounded_by_age() {
        let start = Utc::now();
        let mut h = NodeHistory::new();
        // two days of hourly samples
        for i in 0..48 {
            h.append_sample(sample_at(start + Duration::hours(i), 20.0, 100.0));
        }
        let now = start + Duration::hours(47);
        assert!(h.ping_records().all(|p| p.timestamp >= now - ping_window()));
        // hours 23..=47; the record exactly 24h old is kept
        assert_eq!(h.ping_records().count(), 25);
    }

    #[test]
    fn uptime_counts_failed_pings() {
        let start = Utc::now();
        let mut h = NodeHistory::new();
        h.append_sample(sample_at(start, 20.0, 100.0));
        h.append_sample(sample_at(start + Duration::hours(1), LATENCY_PENALTY_MS, 0.0));
        h.append_sample(sample_at(start + Duration::hours(2), 30.0, 100.0));
        h.append_sample(sample_at(start + Duration::hours(3), LATENCY_PENALTY_MS, 0.0));
        assert_eq!(h.uptime_pct(), 50.0);
    }

    // Holds only while nothing ages out of the 24h window: an append that also
    // evicts older successes can lower uptime even when the new ping succeeded.
    #[test]
    fn uptime_moves_in_the_direction_of_the_new_ping() {
        let start = Utc::now();
        let mut h = NodeHistory::new();
        let pattern = [true, false, false, true, true, false, true, false, true, true];
        for (i, ok) in pattern.iter().enumerate() {
            let before = h.uptime_pct();
            let lat = if *ok { 25.0 } else { LATENCY_PENALTY_MS };
            h.append_sample(sample_at(start + Duration::hours(i as i64), lat, 50.0));
            let after = h.uptime_pct();
            if *ok {
                assert!(after >= before, "success lowered uptime {before} -> {after}");
            } else {
                assert!(after <= before, "failure raised uptime {before} -> {after}");
            }
        }
    }

    #[test]
    fn reliability_blends_success_and_stability() {
        let start = Utc::now();
        let mut h = NodeHistory::new();
        // identical readings: zero spread, all pings ok
        for i in 0..4 {
            h.append_sample(sample_at(start + Duration::hours(i), 20.0, 100.0));
        }
        assert!((h.reliability_pct() - 100.0).abs() < 1e-9);

        // latency 10/30 -> σ 10; bandwidth 0/200 -> σ 100
        let mut h = NodeHistory::new();
        h.append_sample(sample_at(start, 10.0, 0.0));
        h.append_sample(sample_at(start + Duration::hours(1), 30.0, 200.0));
        let expected = 100.0 * 0.4 + 90.0 * 0.3 + 0.0 * 0.3;
        assert!((h.reliability_pct() - expected).abs() < 1e-9);
    }

    #[test]
    fn store_append_refreshes_aggregate() {
        let now = Utc::now();
        let store = HistoryStore::new(NodeId::from("n:1"));
        store.append_sample(sample_at(now - Duration::hours(2), 10.0, 100.0));
        let agg = store.append_sample(sample_at(now, 30.0, 300.0));
        assert_eq!(agg.total_samples, 2);
        assert_eq!(agg.daily_average.latency_ms, 20.0);
        assert_eq!(store.aggregate(), Some(agg));
        assert_eq!(store.latest_sample().map(|s| s.latency_ms), Some(30.0));
        assert_eq!(store.all_ping_records().len(), 2);
    }

    #[test]
    fn aggregate_is_stamped_at_recompute_time() {
        let measured = Utc::now() - Duration::days(3);
        let store = HistoryStore::new(NodeId::from("n:1"));
        let before = Utc::now();
        let agg = store.append_sample(sample_at(measured, 10.0, 100.0));

        assert!(agg.last_updated >= before);
        // three days old at recompute time: outside the day, inside the week
        assert_eq!(agg.daily_average.latency_ms, 0.0);
        assert_eq!(agg.weekly_average.latency_ms, 10.0);
        assert_eq!(agg.total_samples, 1);
    }

    #[test]
    fn eviction_can_lower_uptime_on_a_successful_append() {
        let start = Utc::now();
        let mut h = NodeHistory::new();
        h.append_sample(sample_at(start, 20.0, 100.0));
        h.append_sample(sample_at(start + Duration::hours(1), 20.0, 100.0));
        h.append_sample(sample_at(start + Duration::hours(2), LATENCY_PENALTY_MS, 0.0));
        let before = h.uptime_pct();

        // pushes the two oldest successes past the window
        h.append_sample(sample_at(start + Duration::hours(25) + Duration::minutes(30), 20.0, 100.0));
        assert_eq!(h.ping_records().count(), 2);
        assert_eq!(h.uptime_pct(), 50.0);
        assert!(h.uptime_pct() < before);
    }
}
