//! HTTP helpers for calling a gateway's `/server_calls` endpoint.

use serde_json::{json, Map, Value};

use crate::core::error::GatewayResult;
use crate::core::types::ServiceCallRequest;

/// Status and decoded JSON body of a `/server_calls` answer
#[derive(Debug, Clone, PartialEq)]
pub struct CallResponse {
    pub status: u16,
    pub body: Value,
}

impl CallResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Result of `service.method` in a successful answer
    pub fn result(&self, service: &str, method: &str) -> Option<&Value> {
        self.body.get(service).and_then(|methods| methods.get(method))
    }
}

/// Build the request body for a batch of calls
pub fn request_body(calls: &ServiceCallRequest) -> Value {
    let server_calls: Map<String, Value> = calls
        .services()
        .map(|(service, service_calls)| {
            let calls = service_calls
                .iter()
                .map(|call| json!({"method": call.method, "params": call.params}))
                .collect();
            (service.clone(), Value::Array(calls))
        })
        .collect();

    json!({ "server_calls": server_calls })
}

/// Call one method on a gateway at `host` (`host:port`)
pub async fn call(host: &str, service: &str, method: &str, params: Map<String, Value>) -> GatewayResult<CallResponse> {
    let body = json!({
        "server_calls": {
            service: [{"method": method, "params": params}]
        }
    });
    post(host, &body).await
}

/// Call a batch of methods in one round trip
pub async fn call_multi(host: &str, calls: &ServiceCallRequest) -> GatewayResult<CallResponse> {
    post(host, &request_body(calls)).await
}

async fn post(host: &str, body: &Value) -> GatewayResult<CallResponse> {
    let response = reqwest::Client::new()
        .post(format!("http://{}/server_calls", host))
        .json(body)
        .send()
        .await?;

    let status = response.status().as_u16();
    let body = response.json::<Value>().await?;
    Ok(CallResponse { status, body })
}
