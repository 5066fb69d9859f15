//! Pure scoring: composite score, window averages and ranking. No I/O, no shared state.

use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;

use crate::types::{AggregateMetrics, MetricSample, NodeId, BANDWIDTH_CAP_MBPS};

const LATENCY_WEIGHT: f64 = 0.30;
const BANDWIDTH_WEIGHT: f64 = 0.25;
const UPTIME_WEIGHT: f64 = 0.25;
const RELIABILITY_WEIGHT: f64 = 0.20;

/// Weighted desirability of a node in [0, 100]. Latency above 100ms contributes
/// nothing rather than a negative amount.
pub fn composite_score(s: &MetricSample) -> f64 {
    let latency = (100.0 - s.latency_ms).clamp(0.0, 100.0);
    let bandwidth = s.bandwidth_mbps.clamp(0.0, BANDWIDTH_CAP_MBPS) / 10.0;
    let uptime = s.uptime_pct.clamp(0.0, 100.0);
    let reliability = s.reliability_pct.clamp(0.0, 100.0);

    let score = latency * LATENCY_WEIGHT
        + bandwidth * BANDWIDTH_WEIGHT
        + uptime * UPTIME_WEIGHT
        + reliability * RELIABILITY_WEIGHT;
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 100.0)
    }
}

/// Elementwise mean. Empty input gives an all-zero sample stamped `now`.
pub fn average<'a, I>(samples: I, node_id: &NodeId, now: DateTime<Utc>) -> MetricSample
where
    I: IntoIterator<Item = &'a MetricSample>,
{
    let mut acc = MetricSample::zeroed(node_id.clone(), now);
    let mut n = 0usize;
    for s in samples {
        acc.latency_ms += s.latency_ms;
        acc.bandwidth_mbps += s.bandwidth_mbps;
        acc.uptime_pct += s.uptime_pct;
        acc.reliability_pct += s.reliability_pct;
        n += 1;
    }
    if n == 0 {
        return acc;
    }
    let n = n as f64;
    acc.latency_ms /= n;
    acc.bandwidth_mbps /= n;
    acc.uptime_pct /= n;
    acc.reliability_pct /= n;
    acc
}

/// Daily/weekly/monthly averages over `samples`. A sample belongs to a window
/// when its age at `now` is at most the window length.
pub fn aggregate(samples: &[MetricSample], node_id: &NodeId, now: DateTime<Utc>) -> AggregateMetrics {
    let within = |window: Duration| {
        samples
            .iter()
            .filter(move |s| now.signed_duration_since(s.timestamp) <= window)
    };

    AggregateMetrics {
        daily_average: average(within(Duration::hours(24)), node_id, now),
        weekly_average: average(within(Duration::days(7)), node_id, now),
        monthly_average: average(within(Duration::days(30)), node_id, now),
        total_samples: samples.len(),
        last_updated: now,
    }
}

/// Highest score first; equal scores fall back to node id order so listings are stable.
pub fn rank(mut scores: Vec<(NodeId, f64)>) -> Vec<(NodeId, f64)> {
    scores.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scores
}

/// Population standard deviation; zero for an empty slice.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: DateTime<Utc>, lat: f64, bw: f64, up: f64, rel: f64) -> MetricSample {
        MetricSample {
            node_id: NodeId::from("n:1"),
            timestamp: ts,
            latency_ms: lat,
            bandwidth_mbps: bw,
            uptime_pct: up,
            reliability_pct: rel,
        }
    }

    #[test]
    fn score_of_a_perfect_node_is_100() {
        let s = sample(Utc::now(), 0.0, 1000.0, 100.0, 100.0);
        assert!((composite_score(&s) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn slow_node_latency_term_does_not_go_negative() {
        let s = sample(Utc::now(), 1000.0, 0.0, 0.0, 0.0);
        assert_eq!(composite_score(&s), 0.0);
        let s = sample(Utc::now(), 500.0, 100.0, 50.0, 50.0);
        // 0 + 10*0.25 + 50*0.25 + 50*0.2
        assert!((composite_score(&s) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn score_stays_in_range_across_valid_inputs() {
        let now = Utc::now();
        for lat in [0.0, 1.0, 50.0, 99.9, 100.0, 250.0, 1000.0, 5000.0] {
            for bw in [0.0, 1.0, 500.0, 1000.0] {
                for up in [0.0, 37.5, 100.0] {
                    for rel in [0.0, 62.5, 100.0] {
                        let v = composite_score(&sample(now, lat, bw, up, rel));
                        assert!((0.0..=100.0).contains(&v), "score {v} out of range");
                    }
                }
            }
        }
    }

    #[test]
    fn mid_range_score_matches_weights() {
        let s = sample(Utc::now(), 20.0, 400.0, 90.0, 80.0);
        let expected = 80.0 * 0.30 + 40.0 * 0.25 + 90.0 * 0.25 + 80.0 * 0.20;
        assert!((composite_score(&s) - expected).abs() < 1e-9);
    }

    #[test]
    fn average_of_nothing_is_zero() {
        let now = Utc::now();
        let id = NodeId::from("n:1");
        let avg = average(std::iter::empty(), &id, now);
        assert_eq!(avg, MetricSample::zeroed(id, now));
    }

    #[test]
    fn average_is_elementwise() {
        let now = Utc::now();
        let v = [
            sample(now, 10.0, 100.0, 100.0, 90.0),
            sample(now, 30.0, 300.0, 50.0, 70.0),
        ];
        let avg = average(v.iter(), &NodeId::from("n:1"), now);
        assert_eq!(avg.latency_ms, 20.0);
        assert_eq!(avg.bandwidth_mbps, 200.0);
        assert_eq!(avg.uptime_pct, 75.0);
        assert_eq!(avg.reliability_pct, 80.0);
    }

    #[test]
    fn aggregate_windows_filter_by_age() {
        let now = Utc::now();
        let samples = vec![
            sample(now - Duration::hours(1), 10.0, 100.0, 100.0, 100.0),
            sample(now - Duration::hours(25), 20.0, 200.0, 90.0, 90.0),
            sample(now - Duration::days(8), 30.0, 300.0, 80.0, 80.0),
            sample(now - Duration::days(40), 40.0, 400.0, 70.0, 70.0),
        ];
        let agg = aggregate(&samples, &NodeId::from("n:1"), now);

        assert_eq!(agg.total_samples, 4);
        assert_eq!(agg.last_updated, now);
        assert_eq!(agg.daily_average.latency_ms, 10.0);
        assert_eq!(agg.weekly_average.latency_ms, 15.0);
        assert_eq!(agg.weekly_average.bandwidth_mbps, 150.0);
        assert_eq!(agg.monthly_average.latency_ms, 20.0);
        assert_eq!(agg.monthly_average.uptime_pct, 90.0);
    }

    #[test]
    fn aggregate_of_empty_history_is_all_zero() {
        let now = Utc::now();
        let agg = aggregate(&[], &NodeId::from("n:1"), now);
        assert_eq!(agg.total_samples, 0);
        assert_eq!(agg.daily_average.latency_ms, 0.0);
        assert_eq!(agg.monthly_average.reliability_pct, 0.0);
    }

    #[test]
    fn rank_orders_by_score_then_id() {
        let ranked = rank(vec![
            (NodeId::from("b"), 50.0),
            (NodeId::from("c"), 80.0),
            (NodeId::from("a"), 50.0),
        ]);
        let ids: Vec<_> = ranked.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, ["c", "a", "b"]);
    }

    #[test]
    fn std_dev_is_population() {
        assert_eq!(std_dev(&[]), 0.0);
        assert_eq!(std_dev(&[5.0, 5.0, 5.0]), 0.0);
        assert!((std_dev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]) - 2.0).abs() < 1e-12);
    }
}
