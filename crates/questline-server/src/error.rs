//! Server error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Connection string and token minting failures.
#[derive(Debug, thiserror::Error)]
pub enum NegotiateError {
    /// No connection string configured.
    #[error("no Web PubSub connection string configured")]
    NotConfigured,
    /// A required `Key=value` pair is absent.
    #[error("connection string has no {0}")]
    MissingField(&'static str),
    /// `Endpoint` is not an http(s) URL.
    #[error("invalid endpoint {0:?}: expected http:// or https://")]
    InvalidEndpoint(String),
    /// `Port` is not a port number.
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    /// JWT encoding failed.
    #[error("token signing failed: {0}")]
    Sign(#[from] jsonwebtoken::errors::Error),
}

/// Content store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The identifier escapes the store root (absolute or `..`).
    #[error("invalid content path {0:?}")]
    InvalidPath(String),
    /// Filesystem error.
    #[error("content store I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced over HTTP.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// URL minting failed.
    #[error(transparent)]
    Negotiate(#[from] NegotiateError),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "negotiate failed");
        let body = Json(json!({ "error": self.to_string() }));
        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}
