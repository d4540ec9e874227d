//! # Node Invoker
//!
//! Dispatches the calls a request assigned to one node over a single channel and
//! hands back one [`OutcomeHandle`] per call.
//!
//! Each invocation spawns a driver task that owns the channel. The driver writes one
//! [`ExecutionRequest`] per call and then routes channel events to the matching
//! call by id. A call is settled by the first of data, error or close; anything the
//! node sends for it afterwards is ignored. When the channel goes away every call
//! still pending is settled as closed, so no handle is left hanging.

use bytes::Bytes;
use metrics::counter;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{AssignedCall, CallResult, NodeId};
use crate::discovery::NodeRegistry;
use crate::observability::metrics::CALL_OUTCOMES;
use crate::protocols::channel::{CallId, ChannelEvent, ExecutionRequest};

/// A call whose outcome is known
#[derive(Debug, Clone, PartialEq)]
pub struct SettledCall {
    pub service: String,
    pub method: String,
    pub ordinal: usize,
    pub result: CallResult,
}

/// Pending outcome of one dispatched call
#[derive(Debug)]
pub struct OutcomeHandle {
    pub service: String,
    pub method: String,
    pub ordinal: usize,
    node_id: NodeId,
    receiver: oneshot::Receiver<CallResult>,
}

impl OutcomeHandle {
    /// Wait for the call to settle
    ///
    /// Fails only if the driver went away without settling the call.
    pub async fn settled(self) -> GatewayResult<SettledCall> {
        let result = self.receiver.await.map_err(|_| {
            GatewayError::aggregation(format!(
                "outcome of {}.{} on node '{}' was lost",
                self.service, self.method, self.node_id
            ))
        })?;

        Ok(SettledCall {
            service: self.service,
            method: self.method,
            ordinal: self.ordinal,
            result,
        })
    }
}

/// Opens node channels and turns their events into call outcomes
#[derive(Clone)]
pub struct NodeInvoker {
    registry: Arc<dyn NodeRegistry>,
}

impl NodeInvoker {
    pub fn new(registry: Arc<dyn NodeRegistry>) -> Self {
        Self { registry }
    }

    /// Dispatch `calls` to `node_id`; the handles come back in the same order
    pub fn invoke(&self, node_id: &str, calls: Vec<AssignedCall>) -> Vec<OutcomeHandle> {
        let mut handles = Vec::with_capacity(calls.len());
        let mut work = Vec::with_capacity(calls.len());

        for call in calls {
            let (sender, receiver) = oneshot::channel();
            handles.push(OutcomeHandle {
                service: call.service.clone(),
                method: call.method.clone(),
                ordinal: call.ordinal,
                node_id: node_id.to_string(),
                receiver,
            });
            work.push((call, sender));
        }

        if !work.is_empty() {
            tokio::spawn(drive_channel(self.registry.clone(), node_id.to_string(), work));
        }
        handles
    }
}

async fn drive_channel(
    registry: Arc<dyn NodeRegistry>,
    node_id: NodeId,
    work: Vec<(AssignedCall, oneshot::Sender<CallResult>)>,
) {
    let mut channel = match registry.open_channel(&node_id).await {
        Ok(channel) => channel,
        Err(e) => {
            warn!(node_id = %node_id, error = %e, "Failed to open node channel");
            for (_, sender) in work {
                settle(sender, CallResult::channel_closed());
            }
            return;
        }
    };

    let mut pending: HashMap<CallId, oneshot::Sender<CallResult>> = HashMap::with_capacity(work.len());

    for (index, (call, sender)) in work.into_iter().enumerate() {
        let call_id = index as CallId;
        let request = ExecutionRequest {
            call_id,
            service: call.service,
            method: call.method,
            params: call.params,
        };

        match channel.send(request) {
            Ok(()) => {
                pending.insert(call_id, sender);
            }
            Err(e) => {
                debug!(node_id = %node_id, call_id, error = %e, "Could not dispatch call");
                settle(sender, CallResult::channel_closed());
            }
        }
    }

    while !pending.is_empty() {
        match channel.next_event().await {
            Some(ChannelEvent::Data { call_id, payload }) => {
                if let Some(sender) = pending.remove(&call_id) {
                    settle(sender, CallResult::success(decode_payload(&payload)));
                }
            }
            Some(ChannelEvent::Error { call_id, code, message }) => {
                if let Some(sender) = pending.remove(&call_id) {
                    settle(sender, CallResult::node_error(code, message));
                }
            }
            Some(ChannelEvent::Closed { call_id: Some(call_id) }) => {
                if let Some(sender) = pending.remove(&call_id) {
                    settle(sender, CallResult::channel_closed());
                }
            }
            Some(ChannelEvent::Closed { call_id: None }) | None => break,
        }
    }

    if !pending.is_empty() {
        debug!(node_id = %node_id, pending = pending.len(), "Node channel closed with calls outstanding");
    }
    for (_, sender) in pending.drain() {
        settle(sender, CallResult::channel_closed());
    }
}

fn settle(sender: oneshot::Sender<CallResult>, result: CallResult) {
    counter!(CALL_OUTCOMES, "outcome" => result.outcome_label()).increment(1);
    // The receiver is gone when the HTTP client stopped waiting; the result is dropped
    let _ = sender.send(result);
}

/// Empty payloads mean null; payloads that are not JSON are kept as text
fn decode_payload(payload: &Bytes) -> Value {
    if payload.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{InMemoryRegistry, NodeBackend, NodeInfo};
    use crate::protocols::channel::{ChannelPeer, NodeChannel};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Map};

    /// Hands each opened peer to a script running in its own task
    struct ScriptedBackend<F> {
        script: F,
        opened: Mutex<usize>,
    }

    #[async_trait]
    impl<F, Fut> NodeBackend for ScriptedBackend<F>
    where
        F: Fn(ChannelPeer) -> Fut + Send + Sync,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        async fn open_channel(&self, node_id: &str) -> GatewayResult<NodeChannel> {
            *self.opened.lock() += 1;
            let (channel, peer) = NodeChannel::pair(node_id);
            tokio::spawn((self.script)(peer));
            Ok(channel)
        }
    }

    fn calls(methods: &[&str]) -> Vec<AssignedCall> {
        methods
            .iter()
            .enumerate()
            .map(|(ordinal, method)| AssignedCall {
                service: "svc".to_string(),
                method: method.to_string(),
                params: Map::new(),
                ordinal,
            })
            .collect()
    }

    async fn results(handles: Vec<OutcomeHandle>) -> Vec<CallResult> {
        let mut out = Vec::new();
        for handle in handles {
            out.push(handle.settled().await.unwrap().result);
        }
        out
    }

    fn invoker_with<F, Fut>(script: F) -> (NodeInvoker, Arc<ScriptedBackend<F>>)
    where
        F: Fn(ChannelPeer) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let registry = Arc::new(InMemoryRegistry::new());
        let backend = Arc::new(ScriptedBackend { script, opened: Mutex::new(0) });
        registry.register(NodeInfo::new("N", ["svc"]), backend.clone());
        (NodeInvoker::new(registry), backend)
    }

    #[tokio::test]
    async fn test_data_error_and_close_settle_each_call() {
        let (invoker, backend) = invoker_with(|mut peer: ChannelPeer| async move {
            let mut ids = Vec::new();
            for _ in 0..4 {
                ids.push(peer.next_request().await.unwrap().call_id);
            }
            peer.data(ids[0], Bytes::from_static(br#"{"greeting":"hi"}"#));
            peer.error(ids[1], json!(7), "boom");
            peer.close(Some(ids[2]));
            peer.data(ids[3], Bytes::new());
            // Late events for settled calls are ignored
            peer.error(ids[0], json!(1), "late");
            let _ = peer.next_request().await;
        });

        let handles = invoker.invoke("N", calls(&["a", "b", "c", "d"]));
        assert_eq!(handles.iter().map(|h| h.method.as_str()).collect::<Vec<_>>(), vec!["a", "b", "c", "d"]);

        let outcomes = results(handles).await;
        assert_eq!(outcomes[0], CallResult::success(json!({"greeting": "hi"})));
        assert_eq!(outcomes[1], CallResult::node_error(json!(7), "boom"));
        assert_eq!(outcomes[2], CallResult::channel_closed());
        assert_eq!(outcomes[3], CallResult::success(Value::Null));
        assert_eq!(*backend.opened.lock(), 1);
    }

    #[tokio::test]
    async fn test_channel_close_settles_all_pending_calls() {
        let (invoker, _) = invoker_with(|mut peer: ChannelPeer| async move {
            let first = peer.next_request().await.unwrap();
            peer.data(first.call_id, Bytes::from_static(b"1"));
            peer.close(None);
        });

        let outcomes = results(invoker.invoke("N", calls(&["a", "b", "c"]))).await;
        assert_eq!(outcomes[0], CallResult::success(json!(1)));
        assert_eq!(outcomes[1], CallResult::channel_closed());
        assert_eq!(outcomes[2], CallResult::channel_closed());
    }

    #[tokio::test]
    async fn test_dropped_peer_counts_as_close() {
        let (invoker, _) = invoker_with(|peer: ChannelPeer| async move {
            drop(peer);
        });

        let outcomes = results(invoker.invoke("N", calls(&["a"]))).await;
        assert_eq!(outcomes, vec![CallResult::channel_closed()]);
    }

    #[tokio::test]
    async fn test_unknown_node_settles_calls_as_closed() {
        let invoker = NodeInvoker::new(Arc::new(InMemoryRegistry::new()));
        let outcomes = results(invoker.invoke("ghost", calls(&["a", "b"]))).await;
        assert_eq!(outcomes, vec![CallResult::channel_closed(), CallResult::channel_closed()]);
    }

    /// Crashes the driver task before any call settles
    struct CrashingBackend;

    #[async_trait]
    impl NodeBackend for CrashingBackend {
        async fn open_channel(&self, _node_id: &str) -> GatewayResult<NodeChannel> {
            panic!("backend crashed while opening a channel");
        }
    }

    #[tokio::test]
    async fn test_lost_driver_fails_the_handle() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.register(NodeInfo::new("N", ["svc"]), Arc::new(CrashingBackend));
        let invoker = NodeInvoker::new(registry);

        let handle = invoker.invoke("N", calls(&["a"])).remove(0);
        let err = handle.settled().await.unwrap_err();
        assert!(matches!(err, GatewayError::Aggregation { .. }));
        assert_eq!(err.to_string(), "outcome of svc.a on node 'N' was lost");
    }

    #[test]
    fn test_payload_decoding() {
        assert_eq!(decode_payload(&Bytes::new()), Value::Null);
        assert_eq!(decode_payload(&Bytes::from_static(b"[1,2]")), json!([1, 2]));
        assert_eq!(decode_payload(&Bytes::from_static(b"plain text")), json!("plain text"));
    }
}
