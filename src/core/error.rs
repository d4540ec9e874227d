//! # Error Handling Module
//!
//! This module provides the error type shared by every part of the gateway, built on
//! the `thiserror` crate, together with the mapping from error kinds to HTTP status
//! codes used when a request fails as a whole.
//!
//! ## Request-level vs. call-level failures
//!
//! Only two things can fail an entire `/server_calls` request: a malformed payload
//! (`RequestValidation`, answered with 400) and a broken aggregation step
//! (`Aggregation`, answered with 500). Everything that goes wrong for a *single* call
//! (no node offers the service, the node reported an error, the node hung up) is
//! plain data in the result set and never becomes a `GatewayError`.
//!
//! ## Rust Concepts Used
//!
//! - `Result<T, E>` and the `?` operator for explicit error propagation
//! - `thiserror` derives `Display` and `std::error::Error` from the `#[error]` attributes
//! - `From` implementations let `?` convert library errors automatically
//! - `IntoResponse` lets axum handlers return `GatewayError` directly

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error types for the service-call gateway
///
/// Each variant represents a different category of failure. Constructor helpers
/// below keep call sites short: `GatewayError::config("bad port")`.
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Configuration-related errors (invalid config, unreadable files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The batched-call payload is structurally invalid.
    ///
    /// The message is shown to clients verbatim, so it carries no prefix.
    #[error("{message}")]
    RequestValidation { path: String, message: String },

    /// The per-call outcomes could not be merged into one result set
    #[error("{message}")]
    Aggregation { message: String },

    /// Node transport failures (channel could not be opened, socket errors, etc.)
    #[error("Transport error ({node}): {message}")]
    Transport { node: String, message: String },

    /// Internal server errors for unexpected failures
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },

    /// HTTP client errors raised by the call helpers
    #[error("HTTP client error: {message}")]
    HttpClient { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an aggregation error with a custom message
    pub fn aggregation<S: Into<String>>(message: S) -> Self {
        Self::Aggregation {
            message: message.into(),
        }
    }

    /// Create a transport error for a node
    pub fn transport<N: Into<String>, S: Into<String>>(node: N, message: S) -> Self {
        Self::Transport {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a validation error that is not tied to a specific field
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::RequestValidation {
            path: String::new(),
            message: message.into(),
        }
    }

    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RequestValidation { .. } => StatusCode::BAD_REQUEST,
            Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::Aggregation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Transport { .. } => StatusCode::BAD_GATEWAY,
            Self::HttpClient { .. } => StatusCode::BAD_GATEWAY,
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get a string representation of the error type for logs and metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::RequestValidation { .. } => "request_validation_error",
            Self::Aggregation { .. } => "aggregation_error",
            Self::Transport { .. } => "transport_error",
            Self::Internal { .. } => "internal_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
            Self::HttpClient { .. } => "http_client_error",
        }
    }
}

/// A structural problem found while decoding a `server_calls` payload.
///
/// `path` points at the offending field (`server_calls.users[2].method`), `message`
/// is the human-readable text returned to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new<P: Into<String>, M: Into<String>>(path: P, message: M) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ValidationError {}

impl From<ValidationError> for GatewayError {
    fn from(err: ValidationError) -> Self {
        Self::RequestValidation {
            path: err.path,
            message: err.message,
        }
    }
}

/// Implement conversion from serde_json::Error
impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

/// Implement conversion from serde_yaml::Error
impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

/// Implement conversion from reqwest::Error
impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        Self::HttpClient {
            message: err.to_string(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport {
            node: "websocket".to_string(),
            message: err.to_string(),
        }
    }
}

/// Render request-level failures as `{"error": "<message>"}`
///
/// Clients of `/server_calls` only ever see this shape for 4xx/5xx answers.
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            GatewayError::validation("server_calls is empty").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::aggregation("outcome lost").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayError::transport("node-1", "refused").status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_validation_message_is_rendered_verbatim() {
        let err: GatewayError = ValidationError::new("server_calls", "server_calls is empty").into();
        assert_eq!(err.to_string(), "server_calls is empty");
        assert_eq!(err.error_type(), "request_validation_error");
    }

    #[tokio::test]
    async fn test_into_response_body_shape() {
        let response = GatewayError::aggregation("outcome lost").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value, json!({ "error": "outcome lost" }));
    }
}
