//! # Core Types Module
//!
//! The data model shared by the validator, distributor, invoker and aggregator:
//! the decoded batched-call request, the per-request distribution plan and fallback,
//! and the per-call results that make up the response.
//!
//! ## Rust Concepts in This Module
//!
//! - `BTreeMap` gives deterministic iteration order for maps that end up in JSON
//! - A hand-written `Serialize` impl controls the exact wire shape of `CallResult`
//! - Newtype wrappers (`ResultSet`, `DistributionPlan`) keep invariants behind methods

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Opaque name of a registered backend node
pub type NodeId = String;

/// Message used for every call whose service has no node
pub const NO_NODE_AVAILABLE_MSG: &str = "no master nodes available for this service";

/// Message used when a node channel closes before answering a call
pub const CHANNEL_CLOSED_MSG: &str = "stream closed by master";

/// One requested invocation of a method on a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSpec {
    pub method: String,
    pub params: Map<String, Value>,
}

impl CallSpec {
    pub fn new<M: Into<String>>(method: M, params: Map<String, Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// A validated batched-call request: service name -> ordered calls
///
/// Call order inside a service is preserved and drives distribution order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceCallRequest {
    services: BTreeMap<String, Vec<CallSpec>>,
}

impl ServiceCallRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a call to a service, keeping insertion order within that service
    pub fn push<S: Into<String>>(&mut self, service: S, call: CallSpec) {
        self.services.entry(service.into()).or_default().push(call);
    }

    /// Builder-style variant of [`push`](Self::push)
    pub fn with_call<S: Into<String>>(mut self, service: S, call: CallSpec) -> Self {
        self.push(service, call);
        self
    }

    pub fn insert_service<S: Into<String>>(&mut self, service: S, calls: Vec<CallSpec>) {
        self.services.insert(service.into(), calls);
    }

    pub fn services(&self) -> impl Iterator<Item = (&String, &Vec<CallSpec>)> {
        self.services.iter()
    }

    pub fn calls_for(&self, service: &str) -> Option<&[CallSpec]> {
        self.services.get(service).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Total number of calls across all services
    pub fn call_count(&self) -> usize {
        self.services.values().map(Vec::len).sum()
    }
}

/// A call bound to a service, ready to be dispatched or answered by the fallback
///
/// `ordinal` is the call's position in the flattened request; it decides which
/// outcome wins when two calls in the same service share a method name.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignedCall {
    pub service: String,
    pub method: String,
    pub params: Map<String, Value>,
    pub ordinal: usize,
}

/// Node -> ordered calls, built once per request
#[derive(Debug, Clone, Default)]
pub struct DistributionPlan {
    assignments: BTreeMap<NodeId, Vec<AssignedCall>>,
}

impl DistributionPlan {
    pub(crate) fn assign(&mut self, node: &str, call: AssignedCall) {
        self.assignments.entry(node.to_string()).or_default().push(call);
    }

    pub fn calls_for(&self, node: &str) -> Option<&[AssignedCall]> {
        self.assignments.get(node).map(Vec::as_slice)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.assignments.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Vec<AssignedCall>)> {
        self.assignments.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn call_count(&self) -> usize {
        self.assignments.values().map(Vec::len).sum()
    }
}

impl IntoIterator for DistributionPlan {
    type Item = (NodeId, Vec<AssignedCall>);
    type IntoIter = std::collections::btree_map::IntoIter<NodeId, Vec<AssignedCall>>;

    fn into_iter(self) -> Self::IntoIter {
        self.assignments.into_iter()
    }
}

/// Calls answered at distribution time because their service had no node
#[derive(Debug, Clone, Default)]
pub struct NoServiceFallback {
    entries: Vec<(AssignedCall, CallResult)>,
}

impl NoServiceFallback {
    pub(crate) fn push(&mut self, call: AssignedCall) {
        self.entries.push((call, CallResult::no_node_available()));
    }

    pub fn entries(&self) -> &[(AssignedCall, CallResult)] {
        &self.entries
    }

    /// The fallback as service -> method -> result
    pub fn results(&self) -> BTreeMap<String, BTreeMap<String, CallResult>> {
        let mut results: BTreeMap<String, BTreeMap<String, CallResult>> = BTreeMap::new();
        for (call, result) in &self.entries {
            results
                .entry(call.service.clone())
                .or_default()
                .insert(call.method.clone(), result.clone());
        }
        results
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn call_count(&self) -> usize {
        self.entries.len()
    }
}

/// Why a call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No registered node offers the service
    NoNodeAvailable,
    /// The node answered with an error
    NodeExecution,
    /// The node channel closed before an answer arrived
    ChannelClosed,
}

/// A failed call as it appears in the result set
#[derive(Debug, Clone, PartialEq)]
pub struct CallFailure {
    pub kind: FailureKind,
    pub code: i64,
    pub error_code: Option<Value>,
    pub msg: String,
}

/// Outcome of one call
#[derive(Debug, Clone, PartialEq)]
pub enum CallResult {
    Success(Value),
    Failure(CallFailure),
}

impl CallResult {
    pub fn success(payload: Value) -> Self {
        Self::Success(payload)
    }

    pub fn no_node_available() -> Self {
        Self::Failure(CallFailure {
            kind: FailureKind::NoNodeAvailable,
            code: 1,
            error_code: None,
            msg: NO_NODE_AVAILABLE_MSG.to_string(),
        })
    }

    pub fn node_error<S: Into<String>>(error_code: Value, msg: S) -> Self {
        Self::Failure(CallFailure {
            kind: FailureKind::NodeExecution,
            code: 1,
            error_code: Some(error_code),
            msg: msg.into(),
        })
    }

    pub fn channel_closed() -> Self {
        Self::Failure(CallFailure {
            kind: FailureKind::ChannelClosed,
            code: 1,
            error_code: None,
            msg: CHANNEL_CLOSED_MSG.to_string(),
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Label used for metrics
    pub fn outcome_label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Failure(failure) => match failure.kind {
                FailureKind::NoNodeAvailable => "no_node",
                FailureKind::NodeExecution => "node_error",
                FailureKind::ChannelClosed => "channel_closed",
            },
        }
    }
}

// Wire shapes:
//   success         -> the payload itself (or null)
//   no node         -> {"code":1,"msg":"...","data":null}
//   node error      -> {"code":1,"errorCode":<any>,"msg":"..."}
//   channel closed  -> {"code":1,"msg":"stream closed by master"}
impl Serialize for CallResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Success(payload) => payload.serialize(serializer),
            Self::Failure(failure) => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("code", &failure.code)?;
                if let Some(error_code) = &failure.error_code {
                    map.serialize_entry("errorCode", error_code)?;
                }
                map.serialize_entry("msg", &failure.msg)?;
                if failure.kind == FailureKind::NoNodeAvailable {
                    map.serialize_entry("data", &Value::Null)?;
                }
                map.end()
            }
        }
    }
}

/// The response payload: service -> method -> result
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ResultSet {
    results: BTreeMap<String, BTreeMap<String, CallResult>>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<S: Into<String>, M: Into<String>>(&mut self, service: S, method: M, result: CallResult) {
        self.results
            .entry(service.into())
            .or_default()
            .insert(method.into(), result);
    }

    pub fn get(&self, service: &str, method: &str) -> Option<&CallResult> {
        self.results.get(service).and_then(|methods| methods.get(method))
    }

    pub fn services(&self) -> impl Iterator<Item = &String> {
        self.results.keys()
    }

    /// Number of (service, method) entries
    pub fn len(&self) -> usize {
        self.results.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

impl From<BTreeMap<String, BTreeMap<String, CallResult>>> for ResultSet {
    fn from(results: BTreeMap<String, BTreeMap<String, CallResult>>) -> Self {
        Self { results }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_no_node_result_wire_shape() {
        let value = serde_json::to_value(CallResult::no_node_available()).unwrap();
        assert_eq!(
            value,
            json!({"code": 1, "msg": "no master nodes available for this service", "data": null})
        );
    }

    #[test]
    fn test_node_error_wire_shape() {
        let value = serde_json::to_value(CallResult::node_error(json!(7), "boom")).unwrap();
        assert_eq!(value, json!({"code": 1, "errorCode": 7, "msg": "boom"}));
    }

    #[test]
    fn test_channel_closed_wire_shape() {
        let value = serde_json::to_value(CallResult::channel_closed()).unwrap();
        assert_eq!(value, json!({"code": 1, "msg": "stream closed by master"}));
    }

    #[test]
    fn test_success_serializes_payload_unchanged() {
        let value = serde_json::to_value(CallResult::success(json!({"greeting": "hi"}))).unwrap();
        assert_eq!(value, json!({"greeting": "hi"}));
        assert_eq!(serde_json::to_value(CallResult::success(Value::Null)).unwrap(), Value::Null);
    }

    #[test]
    fn test_result_set_nests_by_service_and_method() {
        let mut results = ResultSet::new();
        results.insert("users", "get", CallResult::success(json!({"id": 1})));
        results.insert("users", "list", CallResult::success(json!([])));
        results.insert("billing", "charge", CallResult::channel_closed());

        assert_eq!(results.len(), 3);
        assert_eq!(
            results.to_json().unwrap(),
            json!({
                "billing": {"charge": {"code": 1, "msg": "stream closed by master"}},
                "users": {"get": {"id": 1}, "list": []}
            })
        );
    }

    #[test]
    fn test_request_counts_calls_across_services() {
        let request = ServiceCallRequest::new()
            .with_call("a", CallSpec::new("x", Map::new()))
            .with_call("a", CallSpec::new("y", Map::new()))
            .with_call("b", CallSpec::new("z", Map::new()));

        assert_eq!(request.call_count(), 3);
        assert_eq!(request.calls_for("a").unwrap()[1].method, "y");
    }
}
