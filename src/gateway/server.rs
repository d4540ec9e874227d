//! # Gateway Server
//!
//! The request/response cycle for `POST /server_calls` and the HTTP server around it.
//!
//! ## Request flow
//!
//! 1. Query parameters and JSON body are merged (body wins) and validated
//! 2. The distributor assigns every call to a node or to the no-node fallback
//! 3. The invoker opens one channel per node in the plan and dispatches its calls
//! 4. The aggregator merges outcomes as they settle and the result set is returned
//!
//! Besides `/server_calls` the server exposes `/health`, `/nodes/load`, the node
//! attachment WebSocket and, when enabled, the Prometheus scrape endpoint.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::{Future, IntoFuture};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument, warn};

use crate::core::config::GatewayConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::ResultSet;
use crate::discovery::{InMemoryRegistry, NodeRegistry};
use crate::gateway::aggregator::ResultAggregator;
use crate::gateway::lifecycle::{CallPhase, RequestLifecycle};
use crate::gateway::validator::{merge_query_and_body, validate};
use crate::load_balancing::CallDistributor;
use crate::observability::metrics::{REQUESTS_TOTAL, REQUEST_DURATION};
use crate::observability::RequestId;
use crate::protocols::invoker::NodeInvoker;
use crate::protocols::websocket::serve_node_socket;

/// Validates, distributes, invokes and aggregates one batched request
pub struct ServiceCallGateway {
    distributor: Arc<CallDistributor>,
    invoker: NodeInvoker,
}

impl ServiceCallGateway {
    pub fn new(registry: Arc<dyn NodeRegistry>) -> Self {
        Self {
            distributor: Arc::new(CallDistributor::new(registry.clone())),
            invoker: NodeInvoker::new(registry),
        }
    }

    pub fn distributor(&self) -> &Arc<CallDistributor> {
        &self.distributor
    }

    /// Run one request to completion
    pub async fn execute(&self, raw: &Value) -> GatewayResult<ResultSet> {
        let mut lifecycle = RequestLifecycle::new(RequestId::new());
        self.execute_tracked(raw, &mut lifecycle).await
    }

    /// Run one request, recording its phases in `lifecycle`
    ///
    /// Leaves the lifecycle in `Aggregated`, `Rejected` or `Failed`.
    pub async fn execute_tracked(&self, raw: &Value, lifecycle: &mut RequestLifecycle) -> GatewayResult<ResultSet> {
        let request = match validate(raw) {
            Ok(request) => request,
            Err(e) => {
                info!(request_id = %lifecycle.request_id(), path = %e.path, error = %e, "Rejected server_calls request");
                lifecycle.advance(CallPhase::Rejected);
                return Err(e.into());
            }
        };
        lifecycle.advance(CallPhase::Validated);

        let (plan, fallback) = self.distributor.distribute(&request);
        lifecycle.advance(CallPhase::Distributed);

        info!(
            request_id = %lifecycle.request_id(),
            calls = request.call_count(),
            nodes = plan.nodes().count(),
            without_node = fallback.call_count(),
            "Distributed server_calls request"
        );

        let mut handles = Vec::with_capacity(plan.call_count());
        for (node_id, calls) in plan {
            handles.extend(self.invoker.invoke(&node_id, calls));
        }
        lifecycle.advance(CallPhase::AwaitingResults);

        match ResultAggregator::build(&fallback, handles).await {
            Ok(results) => {
                lifecycle.advance(CallPhase::Aggregated);
                Ok(results)
            }
            Err(e) => {
                lifecycle.advance(CallPhase::Failed);
                Err(e)
            }
        }
    }
}

/// Shared server state
#[derive(Clone)]
pub struct GatewayState {
    pub gateway: Arc<ServiceCallGateway>,
    pub registry: Arc<InMemoryRegistry>,
    pub config: Arc<GatewayConfig>,
    pub metrics: Option<PrometheusHandle>,
}

impl GatewayState {
    /// Wire the gateway to `registry` and start following its node events
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: GatewayConfig, registry: Arc<InMemoryRegistry>, metrics: Option<PrometheusHandle>) -> Self {
        let gateway = Arc::new(ServiceCallGateway::new(registry.clone()));
        gateway.distributor().spawn_event_listener();

        Self {
            gateway,
            registry,
            config: Arc::new(config),
            metrics,
        }
    }
}

/// Build the HTTP router
pub fn build_router(state: GatewayState) -> Router {
    let config = state.config.clone();

    let mut router = Router::new()
        .route(
            "/server_calls",
            post(server_calls_handler).layer(DefaultBodyLimit::max(config.server.max_request_size)),
        )
        .route("/health", get(health_handler))
        .route("/nodes/load", get(load_handler))
        .route(&config.nodes.connect_path, get(node_connect_handler));

    if state.metrics.is_some() {
        router = router.route(&config.observability.metrics.endpoint_path, get(metrics_handler));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Main gateway server
pub struct GatewayServer {
    state: GatewayState,
    app: Router,
}

impl GatewayServer {
    pub fn new(state: GatewayState) -> Self {
        let app = build_router(state.clone());
        Self { state, app }
    }

    pub fn state(&self) -> &GatewayState {
        &self.state
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn start<F>(self, shutdown: F) -> GatewayResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.state.config.server.socket_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::internal(format!("Failed to bind gateway server to {}: {}", addr, e)))?;

        info!("Gateway HTTP server listening on {}", addr);
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    ///
    /// After `shutdown` resolves, in-flight requests get `shutdown_grace` to finish.
    /// Node sockets never finish on their own, so the grace period is a hard stop.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> GatewayResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let grace = self.state.config.server.shutdown_grace;
        let (stop_tx, stop_rx) = watch::channel(false);

        tokio::spawn(async move {
            shutdown.await;
            let _ = stop_tx.send(true);
        });

        let mut graceful_rx = stop_rx.clone();
        let server = axum::serve(listener, self.app).with_graceful_shutdown(async move {
            let _ = graceful_rx.changed().await;
            info!("Shutdown signal received, draining connections");
        })
        .into_future();

        let mut deadline_rx = stop_rx;
        let deadline = async move {
            if deadline_rx.changed().await.is_err() {
                // Shutdown can no longer be signalled
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(grace).await;
        };

        tokio::select! {
            result = server => {
                result.map_err(|e| GatewayError::internal(format!("Gateway server error: {}", e)))?;
            }
            _ = deadline => {
                warn!(grace = ?grace, "Grace period elapsed, closing remaining connections");
            }
        }

        info!("Gateway server stopped");
        Ok(())
    }
}

const BODY_NOT_OBJECT: &str = "request body must be a JSON object";

/// Empty bodies are allowed (query-only requests); anything else must be an object
fn parse_body(body: &Bytes) -> GatewayResult<Option<Map<String, Value>>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(Some(map)),
        _ => Err(GatewayError::validation(BODY_NOT_OBJECT)),
    }
}

#[instrument(skip(state, query, body), fields(request_id = tracing::field::Empty))]
async fn server_calls_handler(
    State(state): State<GatewayState>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let request_id = RequestId::new();
    tracing::Span::current().record("request_id", tracing::field::display(&request_id));
    let mut lifecycle = RequestLifecycle::new(request_id);

    let outcome = match parse_body(&body) {
        Ok(body) => {
            let raw = merge_query_and_body(&query, body);
            state.gateway.execute_tracked(&raw, &mut lifecycle).await
        }
        Err(e) => {
            lifecycle.advance(CallPhase::Rejected);
            Err(e)
        }
    };

    let response = match outcome {
        Ok(results) => {
            lifecycle.advance(CallPhase::Responded);
            (StatusCode::OK, Json(results)).into_response()
        }
        Err(e) => {
            if lifecycle.phase() == CallPhase::Failed {
                warn!(
                    request_id = %lifecycle.request_id(),
                    error_type = e.error_type(),
                    error = %e,
                    "server_calls request failed"
                );
            } else {
                debug!(request_id = %lifecycle.request_id(), error_type = e.error_type(), "server_calls request rejected");
            }
            e.into_response()
        }
    };

    counter!(REQUESTS_TOTAL, "outcome" => lifecycle.phase().as_str()).increment(1);
    histogram!(REQUEST_DURATION).record(lifecycle.elapsed_secs());
    response
}

async fn health_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "nodes": state.registry.node_count(),
    }))
}

async fn load_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    let snapshot: BTreeMap<String, u64> = state.gateway.distributor().load_snapshot().into_iter().collect();
    Json(snapshot)
}

async fn node_connect_handler(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> Response {
    let registry = state.registry.clone();
    ws.on_upgrade(move |socket| serve_node_socket(socket, registry))
}

async fn metrics_handler(State(state): State<GatewayState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_body() {
        assert_eq!(parse_body(&Bytes::new()).unwrap(), None);
        assert_eq!(parse_body(&Bytes::from_static(b"  \n")).unwrap(), None);
        assert!(parse_body(&Bytes::from_static(br#"{"a":1}"#)).unwrap().is_some());

        for bad in [&b"[1]"[..], b"42", b"not json"] {
            let err = parse_body(&Bytes::copy_from_slice(bad)).unwrap_err();
            assert_eq!(err.to_string(), BODY_NOT_OBJECT);
            assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn test_execute_without_nodes_uses_fallback() {
        let gateway = ServiceCallGateway::new(Arc::new(InMemoryRegistry::new()));
        let results = gateway
            .execute(&json!({"server_calls": {"users": [{"method": "get", "params": {}}]}}))
            .await
            .unwrap();

        assert_eq!(
            results.to_json().unwrap(),
            json!({"users": {"get": {"code": 1, "msg": "no master nodes available for this service", "data": null}}})
        );
    }

    #[tokio::test]
    async fn test_execute_tracks_aggregation_failure() {
        use crate::discovery::{NodeBackend, NodeInfo};
        use crate::protocols::channel::NodeChannel;
        use async_trait::async_trait;

        struct CrashingBackend;

        #[async_trait]
        impl NodeBackend for CrashingBackend {
            async fn open_channel(&self, _node_id: &str) -> GatewayResult<NodeChannel> {
                panic!("backend crashed while opening a channel");
            }
        }

        let registry = Arc::new(InMemoryRegistry::new());
        registry.register(NodeInfo::new("crashy", ["users"]), Arc::new(CrashingBackend));
        let gateway = ServiceCallGateway::new(registry);
        let mut lifecycle = RequestLifecycle::new(RequestId::new());

        let err = gateway
            .execute_tracked(&json!({"server_calls": {"users": [{"method": "get", "params": {}}]}}), &mut lifecycle)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(lifecycle.phase(), CallPhase::Failed);
    }

    #[tokio::test]
    async fn test_execute_tracks_rejection() {
        let gateway = ServiceCallGateway::new(Arc::new(InMemoryRegistry::new()));
        let mut lifecycle = RequestLifecycle::new(RequestId::new());

        let err = gateway.execute_tracked(&json!({}), &mut lifecycle).await.unwrap_err();
        assert_eq!(err.to_string(), "server_calls is empty");
        assert_eq!(lifecycle.phase(), CallPhase::Rejected);
    }
}
