//! Node registry seam. The authoritative registry lives on-chain; the collector only
//! asks whether a node still exists and which nodes are approved.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use tokio::sync::broadcast;

use crate::types::NodeId;

#[async_trait]
pub trait Registry: Send + Sync {
    async fn node_exists(&self, node: &NodeId) -> bool;
    async fn approved_nodes(&self) -> Vec<NodeId>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    NodeApproved(NodeId),
    NodeDeactivated(NodeId),
}

/// In-process registry seeded from config. Admin calls change the approved set and
/// broadcast the change so the collector can follow it.
pub struct StaticRegistry {
    nodes: RwLock<BTreeSet<NodeId>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl StaticRegistry {
    pub fn new<I: IntoIterator<Item = NodeId>>(nodes: I) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            nodes: RwLock::new(nodes.into_iter().collect()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Returns false if the node was already approved.
    pub fn approve(&self, node: NodeId) -> bool {
        let added = self.nodes.write().insert(node.clone());
        if added {
            let _ = self.events.send(RegistryEvent::NodeApproved(node));
        }
        added
    }

    /// Returns false if the node was not approved.
    pub fn deactivate(&self, node: &NodeId) -> bool {
        let removed = self.nodes.write().remove(node);
        if removed {
            let _ = self.events.send(RegistryEvent::NodeDeactivated(node.clone()));
        }
        removed
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn node_exists(&self, node: &NodeId) -> bool {
        self.nodes.read().contains(node)
    }

    async fn approved_nodes(&self) -> Vec<NodeId> {
        self.nodes.read().iter().cloned().collect()
    }
}
