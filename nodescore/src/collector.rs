//! Collection orchestrator: one cancellable periodic task per tracked node.
//!
//! The tracked-node map is locked only for insert/remove/lookup. Each node's history has
//! its own lock, and a node's cycles run strictly one after another inside its task, so
//! history appends are ordered without any collector-wide lock around cycle bodies.
//! Stopping cancels the schedule but lets an in-flight cycle run to completion.

use chrono::Utc;
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::history::HistoryStore;
use crate::registry::{Registry, RegistryEvent};
use crate::sampler::Sampler;
use crate::score::{composite_score, rank};
use crate::store::MetricsStore;
use crate::types::{AggregateMetrics, CollectorEvent, MetricSample, NodeId, PingRecord};

// Registry lookups and store writes get their own bound, separate from the sampler's.
const EXTERNAL_CALL_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CAPACITY: usize = 256;
// Startup sweeps spread first ticks over this share of the interval.
const SWEEP_SPREAD_DIVISOR: u32 = 10;

struct TrackedNode {
    history: Arc<HistoryStore>,
    // held for the duration of a cycle; a restarted worker waits for a stopped one to finish
    cycle_gate: Arc<tokio::sync::Mutex<()>>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl TrackedNode {
    fn is_active(&self) -> bool {
        self.cancel.is_some()
    }

    // Returns the worker handle if the node was active. Dropping it detaches the
    // worker, which exits on its own after the current cycle.
    fn stop(&mut self) -> Option<JoinHandle<()>> {
        self.cancel.take()?.cancel();
        self.task.take()
    }
}

pub struct Collector {
    sampler: Arc<dyn Sampler>,
    registry: Arc<dyn Registry>,
    store: Arc<dyn MetricsStore>,
    interval: Duration,
    nodes: Mutex<HashMap<NodeId, TrackedNode>>,
    events: broadcast::Sender<CollectorEvent>,
}

impl Collector {
    pub fn new(
        sampler: Arc<dyn Sampler>,
        registry: Arc<dyn Registry>,
        store: Arc<dyn MetricsStore>,
        interval: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sampler,
            registry,
            store,
            interval,
            nodes: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CollectorEvent> {
        self.events.subscribe()
    }

    /// Starts collection and waits for the first cycle. Returns false without doing
    /// anything if the node is already being collected.
    pub async fn start_collecting(&self, node: NodeId) -> bool {
        self.start_with_offset(node, Duration::ZERO).await
    }

    async fn start_with_offset(&self, node: NodeId, offset: Duration) -> bool {
        match self.launch(node, offset) {
            Some(first_cycle) => {
                let _ = first_cycle.await;
                true
            }
            None => false,
        }
    }

    // Registers the node and spawns its worker under one map lock, so concurrent
    // starts for the same node can never spawn two schedules.
    // `offset` delays the first scheduled tick, not the immediate cycle.
    fn launch(&self, node: NodeId, offset: Duration) -> Option<oneshot::Receiver<()>> {
        let mut nodes = self.nodes.lock();
        let entry = nodes.entry(node.clone()).or_insert_with(|| TrackedNode {
            history: Arc::new(HistoryStore::new(node.clone())),
            cycle_gate: Arc::new(tokio::sync::Mutex::new(())),
            cancel: None,
            task: None,
        });
        if entry.is_active() {
            debug!(%node, "already collecting");
            return None;
        }

        let cancel = CancellationToken::new();
        let (first_tx, first_rx) = oneshot::channel();
        let worker = NodeWorker {
            node: node.clone(),
            history: entry.history.clone(),
            cycle_gate: entry.cycle_gate.clone(),
            sampler: self.sampler.clone(),
            registry: self.registry.clone(),
            store: self.store.clone(),
            events: self.events.clone(),
            interval: self.interval,
            offset,
            cancel: cancel.clone(),
            persist: true,
        };
        entry.cancel = Some(cancel);
        entry.task = Some(tokio::spawn(worker.run(first_tx)));
        info!(%node, interval_secs = self.interval.as_secs(), "started collecting");
        Some(first_rx)
    }

    /// Cancels the node's schedule; its history stays queryable. Unknown or already
    /// stopped nodes are a no-op.
    pub fn stop_collecting(&self, node: &NodeId) -> bool {
        let stopped = self
            .nodes
            .lock()
            .get_mut(node)
            .and_then(TrackedNode::stop)
            .is_some();
        if stopped {
            info!(%node, "stopped collecting");
        }
        stopped
    }

    pub fn stop_all(&self) {
        let n = self.stop_workers().len();
        info!(stopped = n, "stopped all collection");
    }

    /// Stops everything and waits for in-flight cycles to finish.
    pub async fn shutdown(&self) {
        let handles = self.stop_workers();
        info!(stopped = handles.len(), "shutting down collection");
        for h in handles {
            let _ = h.await;
        }
    }

    fn stop_workers(&self) -> Vec<JoinHandle<()>> {
        self.nodes
            .lock()
            .values_mut()
            .filter_map(TrackedNode::stop)
            .collect()
    }

    /// Starts every node the registry currently approves. Returns how many were newly started.
    ///
    /// Immediate cycles all run now; first ticks are staggered evenly across a
    /// tenth of the interval.
    pub async fn track_approved(&self) -> usize {
        let approved = self.registry.approved_nodes().await;
        let n = approved.len().max(1) as u32;
        let spread = self.interval / SWEEP_SPREAD_DIVISOR;
        let starts = approved
            .into_iter()
            .zip(0u32..)
            .map(|(node, i)| self.start_with_offset(node, spread * i / n));
        futures_util::future::join_all(starts)
            .await
            .into_iter()
            .filter(|started| *started)
            .count()
    }

    /// Follows approval/deactivation events until the registry channel closes.
    pub fn follow_registry(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<RegistryEvent>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(RegistryEvent::NodeApproved(node)) => {
                        // don't wait for the first cycle; later events must apply in order
                        let _ = this.launch(node, Duration::ZERO);
                    }
                    Ok(RegistryEvent::NodeDeactivated(node)) => {
                        this.stop_collecting(&node);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "registry events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn history(&self, node: &NodeId) -> Option<Arc<HistoryStore>> {
        self.nodes.lock().get(node).map(|t| t.history.clone())
    }

    pub fn is_collecting(&self, node: &NodeId) -> bool {
        self.nodes.lock().get(node).is_some_and(TrackedNode::is_active)
    }

    pub fn tracked_node_ids(&self) -> BTreeSet<NodeId> {
        self.nodes
            .lock()
            .iter()
            .filter(|(_, t)| t.is_active())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn latest_sample(&self, node: &NodeId) -> Option<MetricSample> {
        self.history(node)?.latest_sample()
    }

    pub fn aggregate(&self, node: &NodeId) -> Option<AggregateMetrics> {
        self.history(node)?.aggregate()
    }

    pub fn samples(&self, node: &NodeId) -> Option<Vec<MetricSample>> {
        self.history(node).map(|h| h.all_samples())
    }

    pub fn ping_records(&self, node: &NodeId) -> Option<Vec<PingRecord>> {
        self.history(node).map(|h| h.all_ping_records())
    }

    /// Score of the latest sample; 0 for stopped, untracked or sample-less nodes.
    pub fn composite_score(&self, node: &NodeId) -> f64 {
        if !self.is_collecting(node) {
            return 0.0;
        }
        self.latest_sample(node)
            .map(|s| composite_score(&s))
            .unwrap_or(0.0)
    }

    /// Tracked nodes, best first.
    pub fn rankings(&self) -> Vec<(NodeId, f64)> {
        let scores = self
            .tracked_node_ids()
            .into_iter()
            .map(|id| {
                let s = self.composite_score(&id);
                (id, s)
            })
            .collect();
        rank(scores)
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        for t in self.nodes.get_mut().values_mut() {
            let _ = t.stop();
        }
    }
}

struct NodeWorker {
    node: NodeId,
    history: Arc<HistoryStore>,
    cycle_gate: Arc<tokio::sync::Mutex<()>>,
    sampler: Arc<dyn Sampler>,
    registry: Arc<dyn Registry>,
    store: Arc<dyn MetricsStore>,
    events: broadcast::Sender<CollectorEvent>,
    interval: Duration,
    offset: Duration,
    cancel: CancellationToken,
    // cleared once the registry reports the node gone
    persist: bool,
}

impl NodeWorker {
    async fn run(mut self, first_cycle: oneshot::Sender<()>) {
        self.guarded_cycle().await;
        let _ = first_cycle.send(());

        let mut ticker = interval_at(Instant::now() + self.interval + self.offset, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            // not raced against cancellation: a started cycle always finishes
            self.guarded_cycle().await;
        }
        debug!(node = %self.node, "collection loop exited");
    }

    async fn guarded_cycle(&mut self) {
        let gate = self.cycle_gate.clone();
        let _cycle = gate.lock().await;
        let res = AssertUnwindSafe(self.cycle()).catch_unwind().await;
        if let Err(panic) = res {
            let detail = panic_detail(panic.as_ref());
            error!(node = %self.node, "collection cycle panicked: {detail}");
            self.emit(CollectorEvent::Error {
                node_id: self.node.clone(),
                detail: format!("collection cycle panicked: {detail}"),
            });
        }
    }

    async fn cycle(&mut self) {
        let m = self.sampler.measure(&self.node).await;
        // derive from history before this sample's own ping record lands
        let (uptime, reliability) = self.history.derived();
        let sample = MetricSample::from_measurement(m, uptime, reliability);
        debug!(
            node = %self.node,
            latency_ms = sample.latency_ms,
            bandwidth_mbps = sample.bandwidth_mbps,
            uptime_pct = sample.uptime_pct,
            reliability_pct = sample.reliability_pct,
            "sample collected"
        );
        let aggregate = self.history.append_sample(sample.clone());

        self.persist(&sample).await;

        self.emit(CollectorEvent::MetricsCollected {
            node_id: self.node.clone(),
            timestamp: Utc::now(),
            aggregate,
        });
    }

    async fn persist(&mut self, sample: &MetricSample) {
        if !self.persist {
            return;
        }
        match timeout(EXTERNAL_CALL_TIMEOUT, self.registry.node_exists(&self.node)).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(node = %self.node, "node not in registry; persistence disabled");
                self.persist = false;
                self.emit_error(format!(
                    "node {} not found in registry; metrics not saved",
                    self.node
                ));
                return;
            }
            Err(_) => {
                warn!(node = %self.node, "registry lookup timed out");
                self.emit_error("registry lookup timed out; metrics not saved".into());
                return;
            }
        }
        match timeout(
            EXTERNAL_CALL_TIMEOUT,
            self.store.save_metric_sample(&self.node, sample),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(node = %self.node, "failed to save metrics: {e}");
                self.emit_error(format!("failed to save metrics: {e}"));
            }
            Err(_) => {
                warn!(node = %self.node, "metrics store write timed out");
                self.emit_error("metrics store write timed out".into());
            }
        }
    }

    fn emit_error(&self, detail: String) {
        self.emit(CollectorEvent::Error {
            node_id: self.node.clone(),
            detail,
        });
    }

    fn emit(&self, ev: CollectorEvent) {
        // no subscribers is fine
        let _ = self.events.send(ev);
    }
}

fn panic_detail(p: &(dyn Any + Send)) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = p.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
