//! # Request Validation
//!
//! Turns the decoded `/server_calls` payload into a [`ServiceCallRequest`] in one
//! pass. Services are checked in the order they appear in the payload and the first
//! violation is reported; nothing is partially decoded.
//!
//! An empty JSON array stands for an empty mapping, both for `server_calls` and for
//! a call's `params`, since many clients cannot tell the two apart when encoding.

use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::core::error::ValidationError;
use crate::core::types::{CallSpec, ServiceCallRequest};

/// Top-level field holding the batched calls
pub const SERVER_CALLS_FIELD: &str = "server_calls";

/// Validate a merged request payload
///
/// `raw` is the JSON object built from query parameters and body. A missing or
/// null `server_calls` is treated as empty.
pub fn validate(raw: &Value) -> Result<ServiceCallRequest, ValidationError> {
    let server_calls = raw.get(SERVER_CALLS_FIELD).unwrap_or(&Value::Null);

    let services = match server_calls {
        Value::Object(services) => services,
        Value::Null => return Err(empty()),
        Value::Array(items) if items.is_empty() => return Err(empty()),
        // A list has positional keys, which can never be service names
        Value::Array(_) => {
            return Err(ValidationError::new(SERVER_CALLS_FIELD, "Service name must be a string"))
        }
        _ => {
            return Err(ValidationError::new(
                SERVER_CALLS_FIELD,
                "server_calls must be an object",
            ))
        }
    };

    if services.is_empty() {
        return Err(empty());
    }

    let mut request = ServiceCallRequest::new();

    for (service, calls) in services {
        let calls = calls.as_array().ok_or_else(|| {
            ValidationError::new(
                format!("{}.{}", SERVER_CALLS_FIELD, service),
                format!("Calls for service '{}' must be an array", service),
            )
        })?;

        let mut specs = Vec::with_capacity(calls.len());
        for (index, call) in calls.iter().enumerate() {
            specs.push(validate_call(service, index, call)?);
        }
        request.insert_service(service.clone(), specs);
    }

    Ok(request)
}

fn validate_call(service: &str, index: usize, call: &Value) -> Result<CallSpec, ValidationError> {
    let path = format!("{}.{}[{}]", SERVER_CALLS_FIELD, service, index);

    let call = call.as_object().ok_or_else(|| {
        ValidationError::new(
            path.clone(),
            format!("Call at index {} for service '{}' must be an object", index, service),
        )
    })?;

    let method = call.get("method").and_then(Value::as_str).ok_or_else(|| {
        ValidationError::new(
            format!("{}.method", path),
            format!(
                "Method is required and must be a string for call {} of service '{}'",
                index, service
            ),
        )
    })?;

    let params = match call.get("params") {
        Some(Value::Object(params)) => params.clone(),
        Some(Value::Array(items)) if items.is_empty() => Map::new(),
        _ => {
            return Err(ValidationError::new(
                format!("{}.params", path),
                format!(
                    "Params is required and must be an object for call {} of service '{}'",
                    index, service
                ),
            ))
        }
    };

    Ok(CallSpec::new(method, params))
}

fn empty() -> ValidationError {
    ValidationError::new(SERVER_CALLS_FIELD, "server_calls is empty")
}

/// Merge query parameters under a JSON body; body fields win on conflict
///
/// Query values that parse as JSON are used as JSON, anything else as a string.
pub fn merge_query_and_body(query: &HashMap<String, String>, body: Option<Map<String, Value>>) -> Value {
    let mut merged: Map<String, Value> = query
        .iter()
        .map(|(key, raw)| {
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
            (key.clone(), value)
        })
        .collect();

    if let Some(body) = body {
        merged.extend(body);
    }

    Value::Object(merged)
}
