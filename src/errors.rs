use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::models::llm::LlmErrorType;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("resource gone: {0}")]
    ResourceGone(String),

    #[error("prefix '{prefix}' matches {matches} tokens")]
    AmbiguousPrefix { prefix: String, matches: usize },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("duplicate name: {0}")]
    DuplicateName(String),

    #[error("tool '{tool}' failed: {cause}")]
    ToolExecution { tool: String, cause: String },

    #[error("{provider} returned {class}: {message}")]
    UpstreamProvider {
        provider: String,
        class: LlmErrorType,
        message: String,
    },

    #[error("conversation exceeded {0} model turns")]
    ConversationLoopLimit(usize),

    #[error("insecure permissions on {path}: mode {mode:o}")]
    InsecurePermissions { path: String, mode: u32 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn upstream(
        provider: impl Into<String>,
        class: LlmErrorType,
        message: impl Into<String>,
    ) -> Self {
        AppError::UpstreamProvider {
            provider: provider.into(),
            class,
            message: message.into(),
        }
    }

    /// Stable, machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Unauthorized(_) => "unauthorized",
            AppError::ResourceGone(_) => "resource_gone",
            AppError::AmbiguousPrefix { .. } => "ambiguous_prefix",
            AppError::NotFound(_) => "not_found",
            AppError::MethodNotFound(_) => "method_not_found",
            AppError::InvalidArguments(_) => "invalid_arguments",
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::DuplicateName(_) => "duplicate_name",
            AppError::ToolExecution { .. } => "tool_execution_error",
            AppError::UpstreamProvider { .. } => "upstream_provider_error",
            AppError::ConversationLoopLimit(_) => "conversation_loop_limit",
            AppError::InsecurePermissions { .. } => "insecure_permissions",
            AppError::Database(_) | AppError::Internal(_) => "internal_error",
        }
    }

    /// True for upstream failures worth retrying (rate limits, 5xx, timeouts).
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::UpstreamProvider { class, .. } if class.is_transient())
    }

    /// JSON-RPC 2.0 error code. Application errors use the -32000 server range.
    pub fn rpc_code(&self) -> i64 {
        match self {
            AppError::InvalidRequest(_) => -32600,
            AppError::MethodNotFound(_) => -32601,
            AppError::InvalidArguments(_) | AppError::NotFound(_) => -32602,
            AppError::Unauthorized(_) => -32001,
            AppError::ResourceGone(_) => -32002,
            AppError::UpstreamProvider { .. } => -32003,
            AppError::ConversationLoopLimit(_) => -32004,
            AppError::ToolExecution { .. } => -32005,
            AppError::AmbiguousPrefix { .. } | AppError::DuplicateName(_) => -32006,
            AppError::InsecurePermissions { .. }
            | AppError::Database(_)
            | AppError::Internal(_) => -32603,
        }
    }

    /// Message safe to show to a caller. Internal causes are logged instead.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                "internal server error".to_string()
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:#}", e);
                "internal server error".to_string()
            }
            AppError::InsecurePermissions { .. } => {
                tracing::error!("{}", self);
                "internal server error".to_string()
            }
            AppError::Unauthorized(_) => "invalid or missing token".to_string(),
            other => other.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::ResourceGone(_) => StatusCode::GONE,
            AppError::AmbiguousPrefix { .. } | AppError::DuplicateName(_) => StatusCode::CONFLICT,
            AppError::NotFound(_) | AppError::MethodNotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidArguments(_) | AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::ToolExecution { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::UpstreamProvider { class, .. } => match class {
                LlmErrorType::RateLimit | LlmErrorType::QuotaExceeded => {
                    StatusCode::TOO_MANY_REQUESTS
                }
                LlmErrorType::Timeout => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            },
            AppError::ConversationLoopLimit(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::InsecurePermissions { .. } | AppError::Database(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": {
                "message": self.public_message(),
                "type": self.kind(),
                "code": status.as_u16(),
            }
        }));

        let mut response = (status, body).into_response();

        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                "www-authenticate",
                axum::http::HeaderValue::from_static("Bearer"),
            );
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_stable() {
        assert_eq!(AppError::Unauthorized("x".into()).kind(), "unauthorized");
        assert_eq!(
            AppError::ConversationLoopLimit(10).kind(),
            "conversation_loop_limit"
        );
        assert_eq!(
            AppError::AmbiguousPrefix {
                prefix: "deadbeef".into(),
                matches: 2
            }
            .kind(),
            "ambiguous_prefix"
        );
    }

    #[test]
    fn test_rpc_codes() {
        assert_eq!(AppError::MethodNotFound("x".into()).rpc_code(), -32601);
        assert_eq!(AppError::InvalidArguments("x".into()).rpc_code(), -32602);
        assert_eq!(
            AppError::Internal(anyhow::anyhow!("boom")).rpc_code(),
            -32603
        );
    }

    #[test]
    fn test_internal_details_not_exposed() {
        let err = AppError::Internal(anyhow::anyhow!("password=hunter2"));
        assert_eq!(err.public_message(), "internal server error");
    }

    #[test]
    fn test_transient_classification() {
        assert!(AppError::upstream("openai", LlmErrorType::RateLimit, "slow down").is_transient());
        assert!(AppError::upstream("openai", LlmErrorType::ServerError, "oops").is_transient());
        assert!(!AppError::upstream("openai", LlmErrorType::InvalidAuth, "bad key").is_transient());
        assert!(!AppError::NotFound("x".into()).is_transient());
    }

    #[test]
    fn test_upstream_status_mapping() {
        let resp = AppError::upstream("anthropic", LlmErrorType::RateLimit, "busy").into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

        let resp = AppError::Unauthorized("expired".into()).into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(resp.headers().contains_key("www-authenticate"));
    }
}
