//! # Service Table
//!
//! The node-side execution environment: named services, each with named async
//! methods taking a JSON params object.

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Parameters handed to a method
pub type Params = Map<String, Value>;

/// Failure reported by a method
///
/// `code` travels to the client unchanged as `errorCode`.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct NodeError {
    pub code: Value,
    pub message: String,
}

impl NodeError {
    pub fn new<C: Into<Value>, M: Into<String>>(code: C, message: M) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(service: &str, method: &str) -> Self {
        Self::new(404, format!("method '{}' not found on service '{}'", method, service))
    }
}

type Handler = Arc<dyn Fn(Params) -> BoxFuture<'static, Result<Value, NodeError>> + Send + Sync>;

/// Services and methods a node can execute
#[derive(Clone, Default)]
pub struct ServiceTable {
    services: HashMap<String, HashMap<String, Handler>>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` as `service.method`, replacing any previous handler
    pub fn register<F, Fut>(&mut self, service: &str, method: &str, handler: F) -> &mut Self
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, NodeError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |params: Params| -> BoxFuture<'static, Result<Value, NodeError>> {
            Box::pin(handler(params))
        });
        self.services
            .entry(service.to_string())
            .or_default()
            .insert(method.to_string(), handler);
        self
    }

    /// Builder-style variant of [`register`](Self::register)
    pub fn with_method<F, Fut>(mut self, service: &str, method: &str, handler: F) -> Self
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, NodeError>> + Send + 'static,
    {
        self.register(service, method, handler);
        self
    }

    /// Names of the services this table offers, sorted
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_method(&self, service: &str, method: &str) -> bool {
        self.services
            .get(service)
            .map_or(false, |methods| methods.contains_key(method))
    }

    /// Run `service.method` with `params`
    pub async fn execute(&self, service: &str, method: &str, params: Params) -> Result<Value, NodeError> {
        let handler = self
            .services
            .get(service)
            .and_then(|methods| methods.get(method))
            .cloned()
            .ok_or_else(|| NodeError::not_found(service, method))?;

        handler(params).await
    }
}

impl std::fmt::Debug for ServiceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceTable")
            .field("services", &self.services())
            .finish()
    }
}
