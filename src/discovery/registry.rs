//! # Node Registry Module
//!
//! Tracks which backend nodes are alive and which services each one offers, and
//! announces node life-cycle changes to anyone listening (the call distributor in
//! particular). It is also the place the invoker goes to open a channel to a node.
//!
//! ## Rust Concepts Used
//!
//! - `Arc<dyn NodeBackend>` for pluggable ways of reaching a node (in-process or WebSocket)
//! - `parking_lot::RwLock` guarding the ordered node list
//! - `tokio::sync::broadcast` for the life-cycle event notification system
//! - `async_trait` for async methods in traits

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::NodeId;
use crate::protocols::channel::NodeChannel;

/// Default capacity of the life-cycle event channel
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Node life-cycle notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeEvent {
    /// A node registered (or re-registered) with the registry
    NodeRegistered(NodeId),
    /// A node left the registry
    NodeRemoved(NodeId),
}

/// Type alias for node event receiver
pub type NodeEventReceiver = broadcast::Receiver<NodeEvent>;

/// Type alias for node event sender
pub type NodeEventSender = broadcast::Sender<NodeEvent>;

/// What the registry knows about a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub services: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub registered_at: DateTime<Utc>,
}

impl NodeInfo {
    pub fn new<I, S>(id: I, services: S) -> Self
    where
        I: Into<NodeId>,
        S: IntoIterator,
        S::Item: Into<String>,
    {
        Self {
            id: id.into(),
            services: services.into_iter().map(Into::into).collect(),
            metadata: HashMap::new(),
            registered_at: Utc::now(),
        }
    }

    pub fn with_metadata<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn offers(&self, service: &str) -> bool {
        self.services.iter().any(|s| s == service)
    }
}

/// A way of reaching one node
#[async_trait]
pub trait NodeBackend: Send + Sync {
    /// Open a fresh multiplexed channel to the node
    async fn open_channel(&self, node_id: &str) -> GatewayResult<NodeChannel>;
}

/// Registry operations the gateway depends on
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    /// Nodes currently offering `service`, in registration order
    fn nodes_offering(&self, service: &str) -> Vec<NodeInfo>;

    /// Ids of every registered node
    fn registered_nodes(&self) -> Vec<NodeId>;

    /// Subscribe to node life-cycle events
    fn watch_changes(&self) -> NodeEventReceiver;

    /// Open a multiplexed channel to a registered node
    async fn open_channel(&self, node_id: &str) -> GatewayResult<NodeChannel>;
}

struct RegisteredNode {
    info: NodeInfo,
    registration: u64,
    backend: Arc<dyn NodeBackend>,
}

/// In-memory node registry
///
/// Nodes keep the position of their first registration; re-registering a node id
/// replaces its services and backend in place. The node list is updated before the
/// matching event is broadcast, so a listener never sees an event that is ahead of
/// [`nodes_offering`](NodeRegistry::nodes_offering).
pub struct InMemoryRegistry {
    nodes: RwLock<Vec<RegisteredNode>>,
    next_registration: AtomicU64,
    change_sender: NodeEventSender,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::with_event_buffer(DEFAULT_EVENT_BUFFER)
    }

    pub fn with_event_buffer(capacity: usize) -> Self {
        let (change_sender, _) = broadcast::channel(capacity.max(1));
        Self {
            nodes: RwLock::new(Vec::new()),
            next_registration: AtomicU64::new(1),
            change_sender,
        }
    }

    /// Register a node, returning a token that identifies this registration
    pub fn register(&self, info: NodeInfo, backend: Arc<dyn NodeBackend>) -> u64 {
        let registration = self.next_registration.fetch_add(1, Ordering::Relaxed);
        let node_id = info.id.clone();

        {
            let mut nodes = self.nodes.write();
            let entry = RegisteredNode { info, registration, backend };
            match nodes.iter_mut().find(|n| n.info.id == node_id) {
                Some(existing) => *existing = entry,
                None => nodes.push(entry),
            }
        }

        info!(node_id = %node_id, "Node registered");
        let _ = self.change_sender.send(NodeEvent::NodeRegistered(node_id));
        registration
    }

    /// Remove a node regardless of which registration put it there
    pub fn deregister(&self, node_id: &str) -> bool {
        self.remove_where(node_id, |_| true)
    }

    /// Remove a node only if `registration` is still the current one
    ///
    /// Used by connections that end after the same node id reconnected elsewhere.
    pub fn deregister_registration(&self, node_id: &str, registration: u64) -> bool {
        self.remove_where(node_id, |n| n.registration == registration)
    }

    fn remove_where<F>(&self, node_id: &str, matches: F) -> bool
    where
        F: Fn(&RegisteredNode) -> bool,
    {
        let removed = {
            let mut nodes = self.nodes.write();
            let before = nodes.len();
            nodes.retain(|n| !(n.info.id == node_id && matches(n)));
            nodes.len() != before
        };

        if removed {
            info!(node_id = %node_id, "Node removed");
            let _ = self.change_sender.send(NodeEvent::NodeRemoved(node_id.to_string()));
        } else {
            debug!(node_id = %node_id, "Ignoring removal of unknown node registration");
        }
        removed
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeRegistry for InMemoryRegistry {
    fn nodes_offering(&self, service: &str) -> Vec<NodeInfo> {
        self.nodes
            .read()
            .iter()
            .filter(|n| n.info.offers(service))
            .map(|n| n.info.clone())
            .collect()
    }

    fn registered_nodes(&self) -> Vec<NodeId> {
        self.nodes.read().iter().map(|n| n.info.id.clone()).collect()
    }

    fn watch_changes(&self) -> NodeEventReceiver {
        self.change_sender.subscribe()
    }

    async fn open_channel(&self, node_id: &str) -> GatewayResult<NodeChannel> {
        // Clone the backend out so the lock is not held across the await
        let backend = self
            .nodes
            .read()
            .iter()
            .find(|n| n.info.id == node_id)
            .map(|n| n.backend.clone())
            .ok_or_else(|| GatewayError::transport(node_id, "node is not registered"))?;

        backend.open_channel(node_id).await
    }
}
