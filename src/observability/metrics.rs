//! # Metrics
//!
//! Metric names recorded through the `metrics` facade, and the optional Prometheus
//! exporter. Without an installed recorder every macro call is a no-op, so library
//! users and tests pay nothing for them.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::core::error::{GatewayError, GatewayResult};

/// Batched requests received, labelled by the final request phase as `outcome`
pub const REQUESTS_TOTAL: &str = "gateway_server_calls_requests_total";
/// End-to-end handling time of one batched request
pub const REQUEST_DURATION: &str = "gateway_server_calls_request_duration_seconds";
/// Calls assigned to a node
pub const DISTRIBUTOR_ASSIGNMENTS: &str = "gateway_distributor_assignments_total";
/// Calls answered by the no-node fallback
pub const DISTRIBUTOR_NO_NODE_CALLS: &str = "gateway_distributor_no_node_calls_total";
/// Nodes with a load counter
pub const DISTRIBUTOR_TRACKED_NODES: &str = "gateway_distributor_tracked_nodes";
/// Settled call outcomes, labelled by `outcome`
pub const CALL_OUTCOMES: &str = "gateway_call_outcomes_total";
/// Nodes attached over the WebSocket transport
pub const CONNECTED_NODES: &str = "gateway_connected_nodes";

const DURATION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Install the global Prometheus recorder and return a handle for rendering it
pub fn install_prometheus() -> GatewayResult<PrometheusHandle> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(REQUEST_DURATION.to_string()), DURATION_BUCKETS)
        .map_err(|e| GatewayError::internal(format!("Failed to set histogram buckets: {}", e)))?
        .install_recorder()
        .map_err(|e| GatewayError::internal(format!("Failed to install metrics recorder: {}", e)))
}
