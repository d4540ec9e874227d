//! # WebSocket Node Transport
//!
//! Lets backend nodes attach to the gateway over a WebSocket and serve calls.
//!
//! ## Wire format
//!
//! Every frame is a JSON text message tagged with `type`, carrying its fields in
//! `data`:
//!
//! ```text
//! node -> gateway   {"type":"register","data":{"node_id":"n1","services":["users"]}}
//! gateway -> node   {"type":"execute","data":{"channel":1,"call":0,"service":"users","method":"get","params":{}}}
//! node -> gateway   {"type":"data","data":{"channel":1,"call":0,"payload":{"id":1}}}
//! node -> gateway   {"type":"error","data":{"channel":1,"call":0,"code":7,"message":"boom"}}
//! node -> gateway   {"type":"close","data":{"channel":1,"call":0}}
//! gateway -> node   {"type":"release","data":{"channel":1}}
//! ```
//!
//! One socket carries any number of logical channels. A `close` without `call`
//! closes the whole logical channel. When the socket ends, every open logical
//! channel is closed and the node is removed from the registry.
//!
//! ## Rust Concepts Used
//!
//! - `DashMap` for concurrent channel lookup from the socket reader
//! - `futures::StreamExt::split` to read and write the socket from different tasks
//! - `#[serde(tag, content)]` for adjacently tagged frame enums

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use metrics::gauge;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::discovery::{InMemoryRegistry, NodeBackend, NodeInfo};
use crate::observability::metrics::CONNECTED_NODES;
use crate::protocols::channel::{CallId, ChannelResponder, NodeChannel};

/// Identifies a logical channel within one node connection
pub type ChannelId = u64;

/// Frames the gateway sends to a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GatewayFrame {
    Execute {
        channel: ChannelId,
        call: CallId,
        service: String,
        method: String,
        params: Map<String, Value>,
    },
    Release {
        channel: ChannelId,
    },
}

/// Frames a node sends to the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum NodeFrame {
    Register {
        node_id: String,
        services: Vec<String>,
    },
    Data {
        channel: ChannelId,
        call: CallId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Error {
        channel: ChannelId,
        call: CallId,
        code: Value,
        message: String,
    },
    Close {
        channel: ChannelId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call: Option<CallId>,
    },
}

/// Backend for a node attached over a WebSocket
///
/// Logical channels are multiplexed over the socket's outbound frame queue.
/// Once [`RemoteNode::close_all`] has run no new channel can be opened.
pub struct RemoteNode {
    outbound: mpsc::UnboundedSender<GatewayFrame>,
    channels: Arc<DashMap<ChannelId, ChannelResponder>>,
    next_channel: AtomicU64,
    closed: Mutex<bool>,
}

impl RemoteNode {
    pub fn new(outbound: mpsc::UnboundedSender<GatewayFrame>) -> Self {
        Self {
            outbound,
            channels: Arc::new(DashMap::new()),
            next_channel: AtomicU64::new(1),
            closed: Mutex::new(false),
        }
    }

    /// Deliver a frame from the node to the logical channel it names
    pub fn route(&self, frame: NodeFrame) {
        match frame {
            NodeFrame::Register { node_id, .. } => {
                warn!(node_id = %node_id, "Ignoring repeated register frame");
            }
            NodeFrame::Data { channel, call, payload } => {
                let payload = match payload {
                    Some(value) => match serde_json::to_vec(&value) {
                        Ok(bytes) => Bytes::from(bytes),
                        Err(e) => {
                            warn!(channel, call, error = %e, "Dropping unencodable payload");
                            return;
                        }
                    },
                    None => Bytes::new(),
                };
                self.with_channel(channel, |responder| responder.data(call, payload));
            }
            NodeFrame::Error { channel, call, code, message } => {
                self.with_channel(channel, |responder| responder.error(call, code, message));
            }
            NodeFrame::Close { channel, call: Some(call) } => {
                self.with_channel(channel, |responder| responder.close(Some(call)));
            }
            NodeFrame::Close { channel, call: None } => {
                if let Some((_, responder)) = self.channels.remove(&channel) {
                    responder.close(None);
                }
            }
        }
    }

    fn with_channel<F>(&self, channel: ChannelId, deliver: F)
    where
        F: FnOnce(&ChannelResponder) -> bool,
    {
        match self.channels.get(&channel) {
            Some(responder) => {
                deliver(responder.value());
            }
            None => debug!(channel, "Frame for unknown or released channel"),
        }
    }

    /// Close every open logical channel and refuse new ones; used when the socket goes away
    pub fn close_all(&self) {
        *self.closed.lock() = true;
        let ids: Vec<ChannelId> = self.channels.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, responder)) = self.channels.remove(&id) {
                responder.close(None);
            }
        }
    }

    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }
}

#[async_trait]
impl NodeBackend for RemoteNode {
    async fn open_channel(&self, node_id: &str) -> GatewayResult<NodeChannel> {
        let channel_id = self.next_channel.fetch_add(1, Ordering::Relaxed);
        let (channel, peer) = NodeChannel::pair(node_id);
        let (mut requests, responder) = peer.into_parts();

        {
            // Held across the insert so `close_all` either sees the entry or runs first
            let closed = self.closed.lock();
            if *closed || self.outbound.is_closed() {
                return Err(GatewayError::transport(node_id, "node connection is closed"));
            }
            self.channels.insert(channel_id, responder);
        }

        let outbound = self.outbound.clone();
        let channels = self.channels.clone();
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let frame = GatewayFrame::Execute {
                    channel: channel_id,
                    call: request.call_id,
                    service: request.service,
                    method: request.method,
                    params: request.params,
                };
                if outbound.send(frame).is_err() {
                    break;
                }
            }

            // The gateway dropped its side: the node may forget this channel
            channels.remove(&channel_id);
            let _ = outbound.send(GatewayFrame::Release { channel: channel_id });
        });

        debug!(node_id = %node_id, channel = channel_id, "Opened logical channel");
        Ok(channel)
    }
}

fn parse_frame(message: &Message) -> Option<Result<NodeFrame, serde_json::Error>> {
    match message {
        Message::Text(text) => Some(serde_json::from_str(text)),
        Message::Binary(bytes) => Some(serde_json::from_slice(bytes)),
        _ => None,
    }
}

/// Serve one node connection until the socket ends
#[instrument(skip(socket, registry))]
pub async fn serve_node_socket(socket: WebSocket, registry: Arc<InMemoryRegistry>) {
    let (mut sink, mut stream) = socket.split();

    // The first meaningful frame must be the registration
    let (node_id, services) = loop {
        let message = match stream.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                warn!(error = %e, "Node socket failed before registering");
                return;
            }
            None => {
                debug!("Node socket closed before registering");
                return;
            }
        };

        if let Message::Close(_) = message {
            return;
        }

        match parse_frame(&message) {
            Some(Ok(NodeFrame::Register { node_id, services })) => break (node_id, services),
            Some(Ok(other)) => warn!(frame = ?other, "Expected register frame"),
            Some(Err(e)) => warn!(error = %e, "Malformed frame from node"),
            None => {}
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<GatewayFrame>();
    let backend = Arc::new(RemoteNode::new(outbound_tx));
    let info = NodeInfo::new(node_id.clone(), services).with_metadata("transport", "websocket");
    let registration = registry.register(info, backend.clone());
    gauge!(CONNECTED_NODES).increment(1.0);
    info!(node_id = %node_id, "Node attached");

    let writer_node = node_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!(node_id = %writer_node, error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                warn!(node_id = %writer_node, error = %e, "Failed to write to node socket");
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(Message::Close(_)) => break,
            Ok(message) => message,
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "Node socket error");
                break;
            }
        };

        match parse_frame(&message) {
            Some(Ok(frame)) => backend.route(frame),
            Some(Err(e)) => warn!(node_id = %node_id, error = %e, "Malformed frame from node"),
            None => {}
        }
    }

    backend.close_all();
    registry.deregister_registration(&node_id, registration);
    writer.abort();
    gauge!(CONNECTED_NODES).decrement(1.0);
    info!(node_id = %node_id, "Node detached");
}
