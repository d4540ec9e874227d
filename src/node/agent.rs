//! # Node Agent
//!
//! Attaches a [`ServiceTable`] to a remote gateway over a WebSocket.
//!
//! The agent dials the gateway's node endpoint, registers the table's services
//! under its node id and then serves `execute` frames until the socket closes.
//! Every call runs in its own task, so a slow method never holds up the others.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::core::error::{GatewayError, GatewayResult};
use crate::node::service_table::ServiceTable;
use crate::protocols::websocket::{GatewayFrame, NodeFrame};

/// A backend node attached to a gateway over WebSocket
pub struct NodeAgent {
    node_id: String,
    gateway_url: String,
    table: Arc<ServiceTable>,
}

impl NodeAgent {
    /// `gateway_url` is the full node endpoint, e.g. `ws://127.0.0.1:8011/nodes/connect`
    pub fn new<N: Into<String>, U: Into<String>>(node_id: N, gateway_url: U, table: ServiceTable) -> Self {
        Self {
            node_id: node_id.into(),
            gateway_url: gateway_url.into(),
            table: Arc::new(table),
        }
    }

    /// Node endpoint URL for a gateway at `host` (`host:port`)
    pub fn endpoint(host: &str, connect_path: &str) -> String {
        format!("ws://{}{}", host, connect_path)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Run the agent on a background task
    pub fn spawn(self) -> JoinHandle<GatewayResult<()>> {
        tokio::spawn(self.run())
    }

    /// Connect, register and serve until the gateway closes the socket
    pub async fn run(self) -> GatewayResult<()> {
        let url = parse_endpoint(&self.gateway_url)?;
        let (socket, _) = connect_async(url.as_str()).await?;
        info!(node_id = %self.node_id, url = %self.gateway_url, "Connected to gateway");

        let (mut sink, mut stream) = socket.split();
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<NodeFrame>();

        // Queued first so it is the first frame on the wire
        let _ = frames_tx.send(NodeFrame::Register {
            node_id: self.node_id.clone(),
            services: self.table.services(),
        });

        let writer_node = self.node_id.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = frames_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(node_id = %writer_node, error = %e, "Failed to encode frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!(node_id = %writer_node, error = %e, "Failed to write to gateway");
                    break;
                }
            }
        });

        while let Some(message) = stream.next().await {
            let text = match message? {
                Message::Text(text) => text,
                Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Message::Close(_) => break,
                _ => continue,
            };

            match serde_json::from_str::<GatewayFrame>(&text) {
                Ok(GatewayFrame::Execute { channel, call, service, method, params }) => {
                    let table = self.table.clone();
                    let frames = frames_tx.clone();
                    tokio::spawn(async move {
                        let frame = match table.execute(&service, &method, params).await {
                            Ok(payload) => NodeFrame::Data { channel, call, payload: Some(payload) },
                            Err(e) => NodeFrame::Error { channel, call, code: e.code, message: e.message },
                        };
                        let _ = frames.send(frame);
                    });
                }
                Ok(GatewayFrame::Release { channel }) => {
                    debug!(node_id = %self.node_id, channel, "Gateway released channel");
                }
                Err(e) => warn!(node_id = %self.node_id, error = %e, "Malformed frame from gateway"),
            }
        }

        writer.abort();
        info!(node_id = %self.node_id, "Disconnected from gateway");
        Ok(())
    }
}

fn parse_endpoint(raw: &str) -> GatewayResult<Url> {
    let url = Url::parse(raw).map_err(|e| GatewayError::config(format!("Invalid gateway url '{}': {}", raw, e)))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(GatewayError::config(format!(
            "Gateway url must use ws or wss, got '{}'",
            other
        ))),
    }
}
