//! # Result Aggregation
//!
//! Merges fallback entries and per-node outcomes into one [`ResultSet`] as the
//! outcomes settle, in whatever order that happens.
//!
//! The result set has one slot per (service, method). When a request calls the
//! same method twice within a service, the call with the higher ordinal (the one
//! written later in the request) owns the slot, no matter which settles first.

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use tracing::{debug, error};

use crate::core::error::GatewayResult;
use crate::core::types::{CallResult, NoServiceFallback, ResultSet};
use crate::protocols::invoker::OutcomeHandle;

/// Builds the response payload for one request
#[derive(Debug, Default)]
pub struct ResultAggregator {
    results: ResultSet,
    owners: HashMap<(String, String), usize>,
}

impl ResultAggregator {
    /// Start from the calls answered at distribution time
    pub fn new(fallback: &NoServiceFallback) -> Self {
        let mut aggregator = Self::default();
        for (call, result) in fallback.entries() {
            aggregator.merge(&call.service, &call.method, call.ordinal, result.clone());
        }
        aggregator
    }

    /// Record one outcome unless a later call already owns its slot
    pub fn merge(&mut self, service: &str, method: &str, ordinal: usize, result: CallResult) {
        let key = (service.to_string(), method.to_string());
        match self.owners.get(&key) {
            Some(owner) if *owner > ordinal => {
                debug!(service, method, ordinal, "Discarding outcome shadowed by a later call");
            }
            _ => {
                self.owners.insert(key, ordinal);
                self.results.insert(service, method, result);
            }
        }
    }

    /// Wait for every handle and merge each outcome as it arrives
    ///
    /// A lost handle fails the whole aggregation.
    pub async fn collect(mut self, handles: Vec<OutcomeHandle>) -> GatewayResult<ResultSet> {
        let mut pending: FuturesUnordered<_> = handles.into_iter().map(OutcomeHandle::settled).collect();

        while let Some(outcome) = pending.next().await {
            match outcome {
                Ok(settled) => self.merge(&settled.service, &settled.method, settled.ordinal, settled.result),
                Err(e) => {
                    error!(error = %e, "Aggregation failed");
                    return Err(e);
                }
            }
        }

        Ok(self.results)
    }

    /// Convenience for `new(fallback).collect(handles)`
    pub async fn build(fallback: &NoServiceFallback, handles: Vec<OutcomeHandle>) -> GatewayResult<ResultSet> {
        Self::new(fallback).collect(handles).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_later_call_wins_regardless_of_merge_order() {
        let mut aggregator = ResultAggregator::default();
        aggregator.merge("svc", "m", 3, CallResult::success(json!("late")));
        aggregator.merge("svc", "m", 1, CallResult::success(json!("early")));
        assert_eq!(aggregator.results.get("svc", "m"), Some(&CallResult::success(json!("late"))));

        let mut aggregator = ResultAggregator::default();
        aggregator.merge("svc", "m", 1, CallResult::success(json!("early")));
        aggregator.merge("svc", "m", 3, CallResult::success(json!("late")));
        assert_eq!(aggregator.results.get("svc", "m"), Some(&CallResult::success(json!("late"))));
    }

    #[tokio::test]
    async fn test_lost_outcome_fails_collection() {
        use crate::core::types::AssignedCall;
        use crate::discovery::{InMemoryRegistry, NodeBackend, NodeInfo};
        use crate::protocols::channel::NodeChannel;
        use crate::protocols::invoker::NodeInvoker;
        use async_trait::async_trait;
        use std::sync::Arc;

        struct CrashingBackend;

        #[async_trait]
        impl NodeBackend for CrashingBackend {
            async fn open_channel(&self, _node_id: &str) -> GatewayResult<NodeChannel> {
                panic!("backend crashed while opening a channel");
            }
        }

        let registry = Arc::new(InMemoryRegistry::new());
        registry.register(NodeInfo::new("N", ["svc"]), Arc::new(CrashingBackend));
        let handles = NodeInvoker::new(registry).invoke(
            "N",
            vec![AssignedCall {
                service: "svc".to_string(),
                method: "m".to_string(),
                params: Default::default(),
                ordinal: 0,
            }],
        );

        let err = ResultAggregator::build(&NoServiceFallback::default(), handles).await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_fallback_only_request() {
        let mut fallback = NoServiceFallback::default();
        fallback.push(crate::core::types::AssignedCall {
            service: "search".to_string(),
            method: "query".to_string(),
            params: Default::default(),
            ordinal: 0,
        });

        let results = ResultAggregator::build(&fallback, Vec::new()).await.unwrap();
        assert_eq!(
            results.to_json().unwrap(),
            json!({"search": {"query": {"code": 1, "msg": "no master nodes available for this service", "data": null}}})
        );
    }
}
