//! # Call Distributor
//!
//! Least-loaded assignment of calls to nodes.
//!
//! The distributor owns one counter per registered node. For each call it scans the
//! nodes offering the call's service in registry order and picks the one with the
//! smallest counter; on a tie the first node wins. The winner's counter is bumped
//! straight away, so the next call in the same request already sees the new value.
//!
//! Counters are cumulative: they count calls ever assigned to a node since it
//! registered and are never decremented when a call completes.
//!
//! ## Concurrency
//!
//! A whole request is distributed while holding the counter lock, and life-cycle
//! events take the same lock. Two requests therefore never interleave their
//! selections, and a node removal is either fully before or fully after a request.

use metrics::{counter, gauge};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::types::{
    AssignedCall, DistributionPlan, NoServiceFallback, NodeId, ServiceCallRequest,
};
use crate::discovery::{NodeEvent, NodeInfo, NodeRegistry};
use crate::observability::metrics::{
    DISTRIBUTOR_ASSIGNMENTS, DISTRIBUTOR_NO_NODE_CALLS, DISTRIBUTOR_TRACKED_NODES,
};

/// Assigns calls to nodes and tracks per-node load
pub struct CallDistributor {
    registry: Arc<dyn NodeRegistry>,
    counters: Mutex<HashMap<NodeId, u64>>,
}

impl CallDistributor {
    pub fn new(registry: Arc<dyn NodeRegistry>) -> Self {
        Self {
            registry,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Split a validated request into per-node work and the no-node fallback
    pub fn distribute(&self, request: &ServiceCallRequest) -> (DistributionPlan, NoServiceFallback) {
        let mut plan = DistributionPlan::default();
        let mut fallback = NoServiceFallback::default();
        let mut ordinal = 0usize;

        let mut counters = self.counters.lock();

        for (service, calls) in request.services() {
            let nodes = self.registry.nodes_offering(service);

            if nodes.is_empty() {
                warn!(service = %service, calls = calls.len(), "No node offers service");
                counter!(DISTRIBUTOR_NO_NODE_CALLS).increment(calls.len() as u64);
                for call in calls {
                    fallback.push(AssignedCall {
                        service: service.clone(),
                        method: call.method.clone(),
                        params: call.params.clone(),
                        ordinal,
                    });
                    ordinal += 1;
                }
                continue;
            }

            for node in &nodes {
                counters.entry(node.id.clone()).or_insert(0);
            }

            for call in calls {
                let Some(selected) = select_least_loaded(&nodes, &counters) else {
                    continue;
                };

                let load = counters.entry(selected.id.clone()).or_insert(0);
                *load += 1;

                debug!(
                    service = %service,
                    method = %call.method,
                    node_id = %selected.id,
                    load = *load,
                    algorithm = "least_loaded",
                    "Assigned call to node"
                );
                counter!(DISTRIBUTOR_ASSIGNMENTS).increment(1);

                plan.assign(
                    &selected.id,
                    AssignedCall {
                        service: service.clone(),
                        method: call.method.clone(),
                        params: call.params.clone(),
                        ordinal,
                    },
                );
                ordinal += 1;
            }
        }

        gauge!(DISTRIBUTOR_TRACKED_NODES).set(counters.len() as f64);
        (plan, fallback)
    }

    /// Copy of the current per-node counters
    pub fn load_snapshot(&self) -> HashMap<NodeId, u64> {
        self.counters.lock().clone()
    }

    /// Apply one registry life-cycle event to the counter map
    pub fn handle_event(&self, event: &NodeEvent) {
        let mut counters = self.counters.lock();
        match event {
            NodeEvent::NodeRegistered(node_id) => {
                counters.entry(node_id.clone()).or_insert(0);
                debug!(node_id = %node_id, "Tracking node load");
            }
            NodeEvent::NodeRemoved(node_id) => {
                counters.remove(node_id);
                debug!(node_id = %node_id, "Stopped tracking node load");
            }
        }
        gauge!(DISTRIBUTOR_TRACKED_NODES).set(counters.len() as f64);
    }

    /// Drop counters for nodes the registry no longer knows about
    ///
    /// Used after the event stream lagged and some removals may have been missed.
    pub fn resync(&self) {
        let registered = self.registry.registered_nodes();
        let mut counters = self.counters.lock();
        counters.retain(|node_id, _| registered.contains(node_id));
        for node_id in registered {
            counters.entry(node_id).or_insert(0);
        }
        gauge!(DISTRIBUTOR_TRACKED_NODES).set(counters.len() as f64);
    }

    /// Follow registry life-cycle events for the lifetime of the process
    pub fn spawn_event_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let distributor = Arc::clone(self);
        let mut events = distributor.registry.watch_changes();

        // Nodes registered before we subscribed never produce an event for us
        distributor.resync();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => distributor.handle_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Node event listener lagged, resynchronising");
                        distributor.resync();
                    }
                    Err(RecvError::Closed) => {
                        info!("Node event stream closed, stopping listener");
                        break;
                    }
                }
            }
        })
    }
}

/// Strict less-than scan: the first node with the smallest counter wins
fn select_least_loaded<'a>(nodes: &'a [NodeInfo], counters: &HashMap<NodeId, u64>) -> Option<&'a NodeInfo> {
    let mut min_load = u64::MAX;
    let mut selected = None;

    for node in nodes {
        let load = counters.get(&node.id).copied().unwrap_or(0);
        if load < min_load {
            min_load = load;
            selected = Some(node);
        }
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::GatewayResult;
    use crate::core::types::{CallResult, CallSpec};
    use crate::discovery::{InMemoryRegistry, NodeBackend};
    use crate::protocols::channel::NodeChannel;
    use async_trait::async_trait;
    use serde_json::Map;

    struct IdleBackend;

    #[async_trait]
    impl NodeBackend for IdleBackend {
        async fn open_channel(&self, node_id: &str) -> GatewayResult<NodeChannel> {
            Ok(NodeChannel::pair(node_id).0)
        }
    }

    fn registry_with(nodes: &[(&str, &[&str])]) -> Arc<InMemoryRegistry> {
        let registry = Arc::new(InMemoryRegistry::new());
        for (id, services) in nodes {
            registry.register(NodeInfo::new(*id, services.iter().copied()), Arc::new(IdleBackend));
        }
        registry
    }

    fn request(service: &str, methods: &[&str]) -> ServiceCallRequest {
        let mut request = ServiceCallRequest::new();
        for method in methods {
            request.push(service, CallSpec::new(*method, Map::new()));
        }
        request
    }

    #[test]
    fn test_least_loaded_selection_with_ties() {
        let registry = registry_with(&[("A", &["svc"]), ("B", &["svc"]), ("C", &["svc"])]);
        let distributor = CallDistributor::new(registry);
        distributor.counters.lock().insert("B".to_string(), 2);

        let (plan, fallback) = distributor.distribute(&request("svc", &["first"]));
        assert!(fallback.is_empty());
        assert_eq!(plan.calls_for("A").unwrap()[0].method, "first");
        assert_eq!(distributor.load_snapshot()["A"], 1);

        let (plan, _) = distributor.distribute(&request("svc", &["second"]));
        assert_eq!(plan.calls_for("C").unwrap()[0].method, "second");

        let snapshot = distributor.load_snapshot();
        assert_eq!(snapshot["A"], 1);
        assert_eq!(snapshot["B"], 2);
        assert_eq!(snapshot["C"], 1);
    }

    #[test]
    fn test_calls_within_one_request_spread_across_nodes() {
        let registry = registry_with(&[("A", &["svc"]), ("B", &["svc"])]);
        let distributor = CallDistributor::new(registry);

        let (plan, _) = distributor.distribute(&request("svc", &["m1", "m2", "m3"]));

        let on_a: Vec<_> = plan.calls_for("A").unwrap().iter().map(|c| c.method.as_str()).collect();
        let on_b: Vec<_> = plan.calls_for("B").unwrap().iter().map(|c| c.method.as_str()).collect();
        assert_eq!(on_a, vec!["m1", "m3"]);
        assert_eq!(on_b, vec!["m2"]);
    }

    #[test]
    fn test_every_call_lands_in_exactly_one_place() {
        let registry = registry_with(&[("A", &["users"]), ("B", &["users", "billing"])]);
        let distributor = CallDistributor::new(registry);

        let mut req = request("users", &["get", "list", "count"]);
        req.push("billing", CallSpec::new("charge", Map::new()));
        req.push("search", CallSpec::new("query", Map::new()));
        req.push("search", CallSpec::new("suggest", Map::new()));

        let (plan, fallback) = distributor.distribute(&req);
        assert_eq!(plan.call_count() + fallback.call_count(), req.call_count());

        let mut ordinals: Vec<usize> = plan
            .iter()
            .flat_map(|(_, calls)| calls.iter().map(|c| c.ordinal))
            .chain(fallback.entries().iter().map(|(c, _)| c.ordinal))
            .collect();
        ordinals.sort_unstable();
        assert_eq!(ordinals, (0..req.call_count()).collect::<Vec<_>>());
    }

    #[test]
    fn test_service_without_nodes_goes_to_fallback() {
        let registry = registry_with(&[("A", &["users"])]);
        let distributor = CallDistributor::new(registry);

        let (plan, fallback) = distributor.distribute(&request("search", &["query"]));
        assert!(plan.is_empty());
        assert_eq!(
            fallback.results()["search"]["query"],
            CallResult::no_node_available()
        );
        assert!(distributor.load_snapshot().values().all(|load| *load == 0));
    }

    #[test]
    fn test_removed_node_is_never_selected() {
        let registry = registry_with(&[("X", &["svc"]), ("Y", &["svc"])]);
        let distributor = CallDistributor::new(registry.clone());

        distributor.distribute(&request("svc", &["warmup"]));
        registry.deregister("X");
        distributor.handle_event(&NodeEvent::NodeRemoved("X".to_string()));

        for _ in 0..3 {
            let (plan, _) = distributor.distribute(&request("svc", &["m"]));
            assert!(plan.calls_for("X").is_none());
        }
        assert!(!distributor.load_snapshot().contains_key("X"));
    }

    #[test]
    fn test_registration_event_starts_counter_at_zero() {
        let registry = registry_with(&[]);
        let distributor = CallDistributor::new(registry);

        distributor.handle_event(&NodeEvent::NodeRegistered("N".to_string()));
        assert_eq!(distributor.load_snapshot()["N"], 0);

        distributor.counters.lock().insert("N".to_string(), 5);
        distributor.handle_event(&NodeEvent::NodeRegistered("N".to_string()));
        assert_eq!(distributor.load_snapshot()["N"], 5);
    }

    #[tokio::test]
    async fn test_listener_follows_registry_events() {
        let registry = registry_with(&[("A", &["svc"])]);
        let distributor = Arc::new(CallDistributor::new(registry.clone()));
        let _listener = distributor.spawn_event_listener();
        assert_eq!(distributor.load_snapshot()["A"], 0);

        registry.register(NodeInfo::new("B", ["svc"]), Arc::new(IdleBackend));
        registry.deregister("A");

        for _ in 0..50 {
            let snapshot = distributor.load_snapshot();
            if snapshot.contains_key("B") && !snapshot.contains_key("A") {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("listener did not apply registry events");
    }
}
