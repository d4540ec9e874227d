//! # Node Channels
//!
//! A [`NodeChannel`] is the gateway's end of one multiplexed conversation with a
//! backend node. The gateway writes one [`ExecutionRequest`] per call and reads
//! [`ChannelEvent`]s back; events carry the call id they answer, so any number of
//! calls can be in flight on the same channel. The other end, [`ChannelPeer`], is
//! held by whatever actually reaches the node: an in-process service table or the
//! WebSocket connection actor.
//!
//! Dropping the peer closes the channel: the gateway side then sees the end of the
//! event stream, which the invoker treats exactly like a `Closed` event.

use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::NodeId;

/// Identifies a call within one channel
pub type CallId = u64;

/// The serialized form of one call, handed to the node
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub call_id: CallId,
    pub service: String,
    pub method: String,
    pub params: Map<String, Value>,
}

/// Something a node said on a channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Result payload for a call; empty bytes mean "no value"
    Data { call_id: CallId, payload: Bytes },
    /// The node failed the call
    Error { call_id: CallId, code: Value, message: String },
    /// The node closed one call (`Some`) or the whole channel (`None`)
    Closed { call_id: Option<CallId> },
}

/// Gateway side of a node channel
#[derive(Debug)]
pub struct NodeChannel {
    node_id: NodeId,
    requests: mpsc::UnboundedSender<ExecutionRequest>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl NodeChannel {
    /// Create a connected channel/peer pair for `node_id`
    pub fn pair<N: Into<NodeId>>(node_id: N) -> (NodeChannel, ChannelPeer) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let channel = NodeChannel {
            node_id: node_id.into(),
            requests: request_tx,
            events: event_rx,
        };
        let peer = ChannelPeer {
            requests: request_rx,
            events: event_tx,
        };
        (channel, peer)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Hand one execution request to the node
    pub fn send(&self, request: ExecutionRequest) -> GatewayResult<()> {
        self.requests
            .send(request)
            .map_err(|_| GatewayError::transport(self.node_id.clone(), "channel peer is gone"))
    }

    /// Next event from the node, `None` once the peer has gone away
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }
}

/// Node side of a node channel
#[derive(Debug)]
pub struct ChannelPeer {
    requests: mpsc::UnboundedReceiver<ExecutionRequest>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelPeer {
    /// Next request written by the gateway, `None` once the gateway dropped its side
    pub async fn next_request(&mut self) -> Option<ExecutionRequest> {
        self.requests.recv().await
    }

    /// A cloneable handle for answering from spawned tasks
    pub fn responder(&self) -> ChannelResponder {
        ChannelResponder {
            events: self.events.clone(),
        }
    }

    pub fn data<P: Into<Bytes>>(&self, call_id: CallId, payload: P) -> bool {
        self.responder().data(call_id, payload)
    }

    pub fn error<S: Into<String>>(&self, call_id: CallId, code: Value, message: S) -> bool {
        self.responder().error(call_id, code, message)
    }

    pub fn close(&self, call_id: Option<CallId>) -> bool {
        self.responder().close(call_id)
    }

    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedReceiver<ExecutionRequest>,
        ChannelResponder,
    ) {
        (self.requests, ChannelResponder { events: self.events })
    }
}

/// Sends events back to the gateway side of a channel
///
/// Every method returns `false` once the gateway side has been dropped.
#[derive(Debug, Clone)]
pub struct ChannelResponder {
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelResponder {
    pub fn emit(&self, event: ChannelEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn data<P: Into<Bytes>>(&self, call_id: CallId, payload: P) -> bool {
        self.emit(ChannelEvent::Data {
            call_id,
            payload: payload.into(),
        })
    }

    pub fn error<S: Into<String>>(&self, call_id: CallId, code: Value, message: S) -> bool {
        self.emit(ChannelEvent::Error {
            call_id,
            code,
            message: message.into(),
        })
    }

    pub fn close(&self, call_id: Option<CallId>) -> bool {
        self.emit(ChannelEvent::Closed { call_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_pair_carries_requests_and_events() {
        let (mut channel, mut peer) = NodeChannel::pair("node-a");

        channel
            .send(ExecutionRequest {
                call_id: 3,
                service: "greeter".to_string(),
                method: "hello".to_string(),
                params: Map::new(),
            })
            .unwrap();

        let request = peer.next_request().await.unwrap();
        assert_eq!(request.call_id, 3);
        assert_eq!(request.method, "hello");

        assert!(peer.data(3, Bytes::from_static(b"{}")));
        assert!(peer.error(4, json!(7), "boom"));

        assert_eq!(
            channel.next_event().await,
            Some(ChannelEvent::Data { call_id: 3, payload: Bytes::from_static(b"{}") })
        );
        assert_eq!(
            channel.next_event().await,
            Some(ChannelEvent::Error { call_id: 4, code: json!(7), message: "boom".to_string() })
        );
    }

    #[tokio::test]
    async fn test_dropping_peer_ends_event_stream() {
        let (mut channel, peer) = NodeChannel::pair("node-a");
        drop(peer);

        assert_eq!(channel.next_event().await, None);
        assert!(channel
            .send(ExecutionRequest {
                call_id: 0,
                service: "s".to_string(),
                method: "m".to_string(),
                params: Map::new(),
            })
            .is_err());
    }
}
