//! Network sampling: latency via repeated pings with a trimmed mean, bandwidth via a timed
//! download. A sampler never fails; bad nodes come back as penalties and zeros.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};
use url::Url;

use crate::config::SamplerConfig;
use crate::types::{Measurement, NodeId, BANDWIDTH_CAP_MBPS, LATENCY_PENALTY_MS};

#[async_trait]
pub trait Sampler: Send + Sync {
    async fn measure(&self, node: &NodeId) -> Measurement;
}

/// Mean after dropping the single lowest and highest value. With fewer than five
/// values trimming would leave less than three, so the plain mean is used.
pub fn trimmed_mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return LATENCY_PENALTY_MS;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let kept = match sorted.len() {
        n if n >= 5 => &sorted[1..n - 1],
        _ => &sorted[..],
    };
    kept.iter().sum::<f64>() / kept.len() as f64
}

/// Megabits per second for `bytes` received in `elapsed`, clamped to the cap.
pub fn throughput_mbps(bytes: usize, elapsed: Duration) -> f64 {
    if bytes == 0 {
        return 0.0;
    }
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return BANDWIDTH_CAP_MBPS;
    }
    let mbps = (bytes as f64 * 8.0) / (1024.0 * 1024.0) / secs;
    mbps.clamp(0.0, BANDWIDTH_CAP_MBPS)
}

pub struct HttpSampler {
    client: reqwest::Client,
    cfg: SamplerConfig,
}

impl HttpSampler {
    pub fn new(cfg: SamplerConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(cfg.ping_timeout())
            .build()?;
        Ok(Self { client, cfg })
    }

    fn endpoint(&self, node: &NodeId, path: &str) -> Option<Url> {
        let base = Url::parse(&format!("{}://{}", self.cfg.scheme, node)).ok()?;
        base.join(path).ok()
    }

    async fn probe_once(&self, url: &Url) -> f64 {
        let start = Instant::now();
        match timeout(self.cfg.ping_timeout(), self.client.get(url.clone()).send()).await {
            Ok(Ok(resp)) if resp.status().is_success() => start.elapsed().as_secs_f64() * 1000.0,
            Ok(Ok(resp)) => {
                debug!(%url, status = %resp.status(), "ping rejected");
                LATENCY_PENALTY_MS
            }
            Ok(Err(e)) => {
                debug!(%url, "ping failed: {e}");
                LATENCY_PENALTY_MS
            }
            Err(_) => {
                debug!(%url, "ping timed out");
                LATENCY_PENALTY_MS
            }
        }
    }

    pub async fn measure_latency(&self, node: &NodeId) -> f64 {
        let Some(url) = self.endpoint(node, &self.cfg.ping_path) else {
            warn!(%node, "cannot build ping url");
            return LATENCY_PENALTY_MS;
        };
        let n = self.cfg.ping_samples;
        let mut results = Vec::with_capacity(n);
        for i in 0..n {
            results.push(self.probe_once(&url).await);
            if i + 1 < n {
                sleep(self.cfg.ping_spacing()).await;
            }
        }
        trimmed_mean(&results)
    }

    pub async fn measure_bandwidth(&self, node: &NodeId) -> f64 {
        let Some(url) = self.endpoint(node, &self.cfg.speedtest_path) else {
            warn!(%node, "cannot build speedtest url");
            return 0.0;
        };
        let start = Instant::now();
        let fetch = async {
            let resp = self.client.get(url.clone()).send().await?.error_for_status()?;
            resp.bytes().await
        };
        match timeout(self.cfg.speedtest_timeout(), fetch).await {
            Ok(Ok(body)) => throughput_mbps(body.len(), start.elapsed()),
            Ok(Err(e)) => {
                debug!(%url, "speedtest failed: {e}");
                0.0
            }
            Err(_) => {
                debug!(%url, "speedtest timed out");
                0.0
            }
        }
    }
}

#[async_trait]
impl Sampler for HttpSampler {
    async fn measure(&self, node: &NodeId) -> Measurement {
        let timestamp = Utc::now();
        let (latency_ms, bandwidth_mbps) =
            tokio::join!(self.measure_latency(node), self.measure_bandwidth(node));
        Measurement {
            node_id: node.clone(),
            timestamp,
            latency_ms,
            bandwidth_mbps,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub latency_ms: f64,
    pub bandwidth_mbps: f64,
}

impl Reading {
    pub const fn new(latency_ms: f64, bandwidth_mbps: f64) -> Self {
        Self {
            latency_ms,
            bandwidth_mbps,
        }
    }

    pub const fn unreachable() -> Self {
        Self::new(LATENCY_PENALTY_MS, 0.0)
    }
}

/// Deterministic sampler: per-node queues of readings, then a default once a
/// queue runs dry. Used by tests and by the daemon's demo mode.
pub struct ScriptedSampler {
    default: Reading,
    scripts: Mutex<HashMap<NodeId, VecDeque<Reading>>>,
    calls: Mutex<HashMap<NodeId, usize>>,
    delay: Duration,
}

impl ScriptedSampler {
    pub fn new(default: Reading) -> Self {
        Self {
            default,
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            delay: Duration::ZERO,
        }
    }

    /// Each measurement sleeps this long first, standing in for network time.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script<I>(&self, node: &NodeId, readings: I)
    where
        I: IntoIterator<Item = Reading>,
    {
        self.scripts
            .lock()
            .entry(node.clone())
            .or_default()
            .extend(readings);
    }

    pub fn calls(&self, node: &NodeId) -> usize {
        self.calls.lock().get(node).copied().unwrap_or(0)
    }

    fn next_reading(&self, node: &NodeId) -> Reading {
        *self.calls.lock().entry(node.clone()).or_insert(0) += 1;
        self.scripts
            .lock()
            .get_mut(node)
            .and_then(|q| q.pop_front())
            .unwrap_or(self.default)
    }
}

#[async_trait]
impl Sampler for ScriptedSampler {
    async fn measure(&self, node: &NodeId) -> Measurement {
        let timestamp = Utc::now();
        let reading = self.next_reading(node);
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        Measurement {
            node_id: node.clone(),
            timestamp,
            latency_ms: reading.latency_ms,
            bandwidth_mbps: reading.bandwidth_mbps,
        }
    }
}
