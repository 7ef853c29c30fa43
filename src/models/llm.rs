//! Provider-neutral conversation model.
//!
//! Every LLM backend translates to and from these types, so the conversation
//! loop and the proxy endpoints never see a vendor wire format. Also holds the
//! upstream error classification shared by all providers.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Messages ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default = "empty_object")]
    pub arguments: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// Set on assistant turns that request tools.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set on tool-result turns; names the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            is_error: false,
        }
    }

    /// Assistant turn that carries the model's tool calls.
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::assistant(content)
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            is_error,
            ..Self::text(Role::Tool, content)
        }
    }
}

/// Tool definition offered to a model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(alias = "inputSchema")]
    pub input_schema: Value,
}

// ── Responses ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Other,
}

impl StopReason {
    /// Map a vendor stop/finish reason onto the normalized set.
    pub fn from_provider(reason: &str) -> Self {
        match reason {
            "end_turn" | "stop" | "stop_sequence" => StopReason::EndTurn,
            "tool_use" | "tool_calls" | "function_call" => StopReason::ToolUse,
            "max_tokens" | "length" => StopReason::MaxTokens,
            _ => StopReason::Other,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: StopReason,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl LlmResponse {
    pub fn wants_tools(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

// ── Error Classification ────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LlmErrorType {
    RateLimit,
    ContextTooLong,
    InvalidAuth,
    ContentFilter,
    ServerError,
    Timeout,
    Network,
    ModelNotFound,
    QuotaExceeded,
    InvalidRequest,
    InvalidResponse,
    NotConfigured,
    Other,
}

impl LlmErrorType {
    /// Transient failures are retried; everything else surfaces immediately.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::ServerError | Self::Timeout | Self::Network
        )
    }
}

impl fmt::Display for LlmErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimit => write!(f, "rate_limit"),
            Self::ContextTooLong => write!(f, "context_too_long"),
            Self::InvalidAuth => write!(f, "invalid_auth"),
            Self::ContentFilter => write!(f, "content_filter"),
            Self::ServerError => write!(f, "server_error"),
            Self::Timeout => write!(f, "timeout"),
            Self::Network => write!(f, "network"),
            Self::ModelNotFound => write!(f, "model_not_found"),
            Self::QuotaExceeded => write!(f, "quota_exceeded"),
            Self::InvalidRequest => write!(f, "invalid_request"),
            Self::InvalidResponse => write!(f, "invalid_response"),
            Self::NotConfigured => write!(f, "not_configured"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Classify an upstream error from status code and response body.
pub fn classify_error(status: u16, body: &str) -> LlmErrorType {
    let json: Option<Value> = serde_json::from_str(body).ok();
    let error = json.as_ref().and_then(|j| j.get("error"));

    let error_message = error
        .and_then(|e| e.get("message").or(e.get("type")).or(Some(e)))
        .and_then(|m| m.as_str())
        .unwrap_or("");
    let error_type_field = error
        .and_then(|e| e.get("type"))
        .and_then(|t| t.as_str())
        .unwrap_or("");
    let error_code = error
        .and_then(|e| e.get("code"))
        .and_then(|c| c.as_str())
        .unwrap_or("");

    match status {
        401 | 403 => LlmErrorType::InvalidAuth,
        404 => {
            if error_code.contains("model_not_found")
                || error_message.contains("does not exist")
                || error_message.contains("model")
                || error_type_field == "not_found_error"
            {
                LlmErrorType::ModelNotFound
            } else {
                LlmErrorType::Other
            }
        }
        408 => LlmErrorType::Timeout,
        429 => {
            if error_message.contains("quota")
                || error_code.contains("insufficient_quota")
                || error_type_field == "insufficient_quota"
            {
                LlmErrorType::QuotaExceeded
            } else {
                LlmErrorType::RateLimit
            }
        }
        400 | 413 | 422 => {
            let lower = format!("{} {} {} {}", error_message, error_type_field, error_code, body)
                .to_lowercase();

            if lower.contains("context_length")
                || lower.contains("maximum context")
                || lower.contains("too many tokens")
                || lower.contains("prompt is too long")
                || lower.contains("token limit")
            {
                LlmErrorType::ContextTooLong
            } else if lower.contains("content_filter")
                || lower.contains("content_policy")
                || lower.contains("safety")
                || lower.contains("flagged")
            {
                LlmErrorType::ContentFilter
            } else {
                LlmErrorType::InvalidRequest
            }
        }
        // Anthropic signals overload with 529.
        500..=599 => LlmErrorType::ServerError,
        _ => LlmErrorType::Other,
    }
}

/// Pull a human-readable message out of a provider error body.
pub fn error_message(body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let message = parsed.as_ref().and_then(|j| {
        let err = j.get("error")?;
        err.get("message")
            .and_then(|m| m.as_str())
            .or_else(|| err.as_str())
            .map(str::to_string)
    });
    let msg = message.unwrap_or_else(|| body.trim().to_string());
    if msg.chars().count() > 200 {
        let truncated: String = msg.chars().take(200).collect();
        format!("{}…", truncated)
    } else {
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit_vs_quota() {
        assert_eq!(
            classify_error(429, r#"{"error":{"message":"Rate limit reached"}}"#),
            LlmErrorType::RateLimit
        );
        assert_eq!(
            classify_error(
                429,
                r#"{"error":{"message":"You exceeded your current quota","code":"insufficient_quota"}}"#
            ),
            LlmErrorType::QuotaExceeded
        );
    }

    #[test]
    fn test_classify_auth_and_server() {
        assert_eq!(classify_error(401, ""), LlmErrorType::InvalidAuth);
        assert_eq!(classify_error(403, "{}"), LlmErrorType::InvalidAuth);
        assert_eq!(classify_error(500, ""), LlmErrorType::ServerError);
        assert_eq!(classify_error(529, r#"{"type":"error","error":{"type":"overloaded_error"}}"#), LlmErrorType::ServerError);
    }

    #[test]
    fn test_classify_bad_request_variants() {
        assert_eq!(
            classify_error(
                400,
                r#"{"error":{"message":"This model's maximum context length is 8192 tokens","code":"context_length_exceeded"}}"#
            ),
            LlmErrorType::ContextTooLong
        );
        assert_eq!(
            classify_error(400, r#"{"error":{"message":"flagged by content_filter"}}"#),
            LlmErrorType::ContentFilter
        );
        assert_eq!(
            classify_error(400, r#"{"error":{"message":"messages: field required"}}"#),
            LlmErrorType::InvalidRequest
        );
    }

    #[test]
    fn test_classify_model_not_found() {
        assert_eq!(
            classify_error(404, r#"{"error":{"message":"The model `gpt-9` does not exist"}}"#),
            LlmErrorType::ModelNotFound
        );
        // Ollama-style plain string error
        assert_eq!(
            classify_error(404, r#"{"error":"model 'llama9' not found"}"#),
            LlmErrorType::ModelNotFound
        );
    }

    #[test]
    fn test_transient_set() {
        assert!(LlmErrorType::RateLimit.is_transient());
        assert!(LlmErrorType::Network.is_transient());
        assert!(!LlmErrorType::QuotaExceeded.is_transient());
        assert!(!LlmErrorType::InvalidRequest.is_transient());
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(error_message(r#"{"error":{"message":"bad key"}}"#), "bad key");
        assert_eq!(error_message(r#"{"error":"no such model"}"#), "no such model");
        assert_eq!(error_message("plain failure"), "plain failure");
        assert!(error_message(&"x".repeat(500)).ends_with('…'));
    }

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(StopReason::from_provider("stop"), StopReason::EndTurn);
        assert_eq!(StopReason::from_provider("tool_calls"), StopReason::ToolUse);
        assert_eq!(StopReason::from_provider("tool_use"), StopReason::ToolUse);
        assert_eq!(StopReason::from_provider("length"), StopReason::MaxTokens);
        assert_eq!(StopReason::from_provider("weird"), StopReason::Other);
    }

    #[test]
    fn test_message_serialization_skips_empty_fields() {
        let json = serde_json::to_value(Message::user("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "user", "content": "hi"}));

        let json = serde_json::to_value(Message::tool_result("call_1", "boom", true)).unwrap();
        assert_eq!(json["tool_call_id"], "call_1");
        assert_eq!(json["is_error"], true);
    }

    #[test]
    fn test_tool_spec_accepts_mcp_casing() {
        let spec: ToolSpec = serde_json::from_value(serde_json::json!({
            "name": "query_database",
            "description": "Run SQL",
            "inputSchema": {"type": "object"}
        }))
        .unwrap();
        assert_eq!(spec.input_schema["type"], "object");
    }
}
