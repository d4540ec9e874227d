//! In-process node backend: calls run directly against a [`ServiceTable`].

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

use crate::core::error::GatewayResult;
use crate::discovery::NodeBackend;
use crate::node::service_table::ServiceTable;
use crate::protocols::channel::{ChannelPeer, NodeChannel};

/// A node living in the gateway process
#[derive(Debug, Clone)]
pub struct LocalNode {
    table: Arc<ServiceTable>,
}

impl LocalNode {
    pub fn new(table: ServiceTable) -> Self {
        Self {
            table: Arc::new(table),
        }
    }

    pub fn services(&self) -> Vec<String> {
        self.table.services()
    }
}

#[async_trait]
impl NodeBackend for LocalNode {
    async fn open_channel(&self, node_id: &str) -> GatewayResult<NodeChannel> {
        let (channel, peer) = NodeChannel::pair(node_id);
        tokio::spawn(serve_channel(self.table.clone(), peer));
        Ok(channel)
    }
}

/// Execute every request written to `peer`, each in its own task
pub async fn serve_channel(table: Arc<ServiceTable>, peer: ChannelPeer) {
    let (mut requests, responder) = peer.into_parts();

    while let Some(request) = requests.recv().await {
        let table = table.clone();
        let responder = responder.clone();

        tokio::spawn(async move {
            let call_id = request.call_id;
            match table.execute(&request.service, &request.method, request.params).await {
                Ok(value) => match serde_json::to_vec(&value) {
                    Ok(payload) => {
                        responder.data(call_id, Bytes::from(payload));
                    }
                    Err(e) => {
                        responder.error(call_id, 500.into(), e.to_string());
                    }
                },
                Err(e) => {
                    debug!(service = %request.service, method = %request.method, error = %e, "Method failed");
                    responder.error(call_id, e.code, e.message);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::service_table::{NodeError, Params};
    use crate::protocols::channel::{ChannelEvent, ExecutionRequest};
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_local_node_answers_requests() {
        let table = ServiceTable::new()
            .with_method("math", "double", |params: Params| async move {
                let n = params.get("n").and_then(Value::as_i64).ok_or_else(|| NodeError::new(400, "n required"))?;
                Ok(json!(n * 2))
            });
        let node = LocalNode::new(table);
        let mut channel = node.open_channel("local").await.unwrap();

        channel
            .send(ExecutionRequest {
                call_id: 0,
                service: "math".to_string(),
                method: "double".to_string(),
                params: json!({"n": 21}).as_object().cloned().unwrap(),
            })
            .unwrap();
        assert_eq!(
            channel.next_event().await,
            Some(ChannelEvent::Data { call_id: 0, payload: Bytes::from_static(b"42") })
        );

        channel
            .send(ExecutionRequest {
                call_id: 1,
                service: "math".to_string(),
                method: "triple".to_string(),
                params: Params::new(),
            })
            .unwrap();
        assert_eq!(
            channel.next_event().await,
            Some(ChannelEvent::Error {
                call_id: 1,
                code: json!(404),
                message: "method 'triple' not found on service 'math'".to_string()
            })
        );
    }
}
