//! Error types for the tunnel server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Custom error types for tunnel-related operations.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("no free port in the allocator range")]
    PortExhausted,

    #[error("project '{project_name}' is already tunneled for user '{user_id}'")]
    DuplicateProject {
        user_id: String,
        project_name: String,
    },

    #[error("user '{0}' has reached the tunnel limit")]
    LimitExceeded(String),

    #[error("forwarding rejected: {0}")]
    ForwardingRejected(String),

    #[error("upstream request timed out")]
    ProxyTimeout,

    #[error("upstream request failed: {0}")]
    ProxyTransport(String),

    #[error("tunnel '{0}' not found")]
    TunnelNotFound(String),

    #[error("webhook delivery failed: {0}")]
    WebhookFailure(String),

    #[error("health probe failed: {0}")]
    HealthProbeFail(String),

    #[error("could not load or generate the SSH host key: {0}")]
    HostKeyIO(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    SshError(#[from] russh::Error),
}

impl IntoResponse for TunnelError {
    fn into_response(self) -> Response {
        let status = match &self {
            TunnelError::TunnelNotFound(_) => StatusCode::NOT_FOUND,
            TunnelError::ProxyTimeout => StatusCode::GATEWAY_TIMEOUT,
            TunnelError::ProxyTransport(_) => StatusCode::BAD_GATEWAY,
            TunnelError::DuplicateProject { .. }
            | TunnelError::LimitExceeded(_)
            | TunnelError::PortExhausted => StatusCode::CONFLICT,
            TunnelError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "detail": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
