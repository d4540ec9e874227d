//! # Service Gateway Library
//!
//! A gateway that accepts one HTTP request bundling many named service calls, fans
//! them out across the backend nodes registered for each service, and answers with
//! one aggregated result.
//!
//! ## Module Overview
//!
//! - `core`: error type, configuration and the shared data model
//! - `gateway`: request validation, aggregation, the request state machine and the HTTP server
//! - `load_balancing`: least-loaded assignment of calls to nodes
//! - `discovery`: the node registry and its life-cycle events
//! - `protocols`: node channels, the call invoker and the WebSocket node transport
//! - `node`: the node-side service table, in-process nodes and the WebSocket agent
//! - `observability`: logging and metrics
//! - `client`: helpers for calling a gateway over HTTP
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde_json::{json, Value};
//! use service_gateway::{GatewayConfig, GatewayServer, GatewayState, InMemoryRegistry, LocalNode, NodeInfo, ServiceTable};
//! use std::sync::Arc;
//!
//! # async fn run() -> service_gateway::GatewayResult<()> {
//! let table = ServiceTable::new()
//!     .with_method("greeter", "hello", |_params| async { Ok(json!({"greeting": "hi"})) });
//!
//! let registry = Arc::new(InMemoryRegistry::new());
//! let node = LocalNode::new(table);
//! registry.register(NodeInfo::new("local-1", node.services()), Arc::new(node));
//!
//! let state = GatewayState::new(GatewayConfig::default(), registry, None);
//! GatewayServer::new(state).start(std::future::pending()).await
//! # }
//! ```

/// Error types, configuration and the data model shared by every other module
pub mod core;

/// Request validation, result aggregation and the HTTP server
pub mod gateway;

/// Least-loaded call distribution across nodes
pub mod load_balancing;

/// Node registry with registration/removal notifications
pub mod discovery;

/// Node channels, the invoker and the WebSocket node transport
pub mod protocols;

/// Node-side execution environment
pub mod node;

/// Structured logging and metrics
pub mod observability;

/// HTTP client helpers for `/server_calls`
pub mod client;

// Re-export commonly used types for easier access

/// Main error type used throughout the gateway
pub use core::error::{GatewayError, GatewayResult, ValidationError};

/// Main configuration structure for the gateway
pub use core::config::GatewayConfig;

pub use core::types::{CallResult, CallSpec, DistributionPlan, NoServiceFallback, ResultSet, ServiceCallRequest};

pub use discovery::{InMemoryRegistry, NodeBackend, NodeEvent, NodeInfo, NodeRegistry};

pub use gateway::{GatewayServer, GatewayState, ServiceCallGateway};

pub use load_balancing::CallDistributor;

pub use node::{LocalNode, NodeAgent, NodeError, ServiceTable};

pub use protocols::NodeInvoker;
