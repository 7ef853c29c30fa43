//! Ollama `/api/chat` client.
//!
//! Ollama does not assign tool call ids, so they are generated here. Models
//! without native tool support sometimes answer with a bare
//! `{"tool": ..., "arguments": ...}` object instead; that is accepted too.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use uuid::Uuid;

use super::retry::{send_json, RetryPolicy};
use super::{endpoint, ChatProvider, ProviderKind, Sampling};
use crate::errors::AppError;
use crate::models::llm::{LlmErrorType, LlmResponse, Message, Role, StopReason, ToolCall, ToolSpec, Usage};

pub struct OllamaClient {
    http: Client,
    base_url: String,
    model: String,
    sampling: Sampling,
    retry: RetryPolicy,
}

impl OllamaClient {
    pub fn new(http: Client, base_url: &str, model: String, sampling: Sampling, retry: RetryPolicy) -> Self {
        Self {
            http,
            base_url: base_url.to_string(),
            model,
            sampling,
            retry,
        }
    }
}

#[async_trait]
impl ChatProvider for OllamaClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        model: Option<&str>,
    ) -> Result<LlmResponse, AppError> {
        let model = model.unwrap_or(&self.model);
        let body = build_request(model, messages, tools, self.sampling);
        let url = endpoint(&self.base_url, "/api/chat");

        let response = send_json("ollama", &self.retry, || self.http.post(&url).json(&body)).await?;
        parse_response(&response, model, tools)
    }

    async fn list_models(&self) -> Result<Vec<String>, AppError> {
        let url = endpoint(&self.base_url, "/api/tags");
        let response = send_json("ollama", &self.retry, || self.http.get(&url)).await?;

        Ok(response
            .get("models")
            .and_then(|m| m.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }
}

fn build_request(model: &str, messages: &[Message], tools: &[ToolSpec], sampling: Sampling) -> Value {
    let messages: Vec<Value> = messages
        .iter()
        .map(|msg| match msg.role {
            Role::Assistant if !msg.tool_calls.is_empty() => {
                let calls: Vec<Value> = msg
                    .tool_calls
                    .iter()
                    .map(|call| json!({ "function": { "name": call.name, "arguments": call.arguments } }))
                    .collect();
                json!({ "role": "assistant", "content": msg.content, "tool_calls": calls })
            }
            role => json!({ "role": role, "content": msg.content }),
        })
        .collect();

    let mut body = json!({
        "model": model,
        "messages": messages,
        "stream": false,
        "options": {
            "temperature": sampling.temperature,
            "num_predict": sampling.max_tokens,
        },
    });
    if !tools.is_empty() {
        let tools: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    }
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }
    body
}

fn synthesize_id() -> String {
    format!("call_{}", &Uuid::new_v4().simple().to_string()[..12])
}

fn parse_response(body: &Value, requested_model: &str, tools: &[ToolSpec]) -> Result<LlmResponse, AppError> {
    let message = body.get("message").ok_or_else(|| {
        AppError::upstream("ollama", LlmErrorType::InvalidResponse, "response has no message")
    })?;
    let mut content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string();

    let mut tool_calls: Vec<ToolCall> = message
        .get("tool_calls")
        .and_then(|t| t.as_array())
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let function = call.get("function")?;
                    Some(ToolCall {
                        id: synthesize_id(),
                        name: function.get("name")?.as_str()?.to_string(),
                        arguments: match function.get("arguments") {
                            // Some models send arguments as an encoded string.
                            Some(Value::String(raw)) => {
                                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
                            }
                            Some(args) => args.clone(),
                            None => json!({}),
                        },
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    if tool_calls.is_empty() && !tools.is_empty() {
        if let Some(call) = inline_tool_call(&content, tools) {
            tool_calls.push(call);
            content.clear();
        }
    }

    let stop_reason = if !tool_calls.is_empty() {
        StopReason::ToolUse
    } else {
        body.get("done_reason")
            .and_then(|r| r.as_str())
            .map(StopReason::from_provider)
            .unwrap_or(StopReason::EndTurn)
    };

    let usage = match (body.get("prompt_eval_count"), body.get("eval_count")) {
        (None, None) => None,
        (input, output) => Some(Usage {
            input_tokens: input.and_then(|t| t.as_u64()).unwrap_or(0),
            output_tokens: output.and_then(|t| t.as_u64()).unwrap_or(0),
        }),
    };

    Ok(LlmResponse {
        content,
        tool_calls,
        stop_reason,
        model: body
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(requested_model)
            .to_string(),
        usage,
    })
}

/// A whole-message `{"tool": name, "arguments": {...}}` naming an offered tool.
fn inline_tool_call(content: &str, tools: &[ToolSpec]) -> Option<ToolCall> {
    let parsed: Value = serde_json::from_str(content.trim()).ok()?;
    let name = parsed.get("tool")?.as_str()?;
    if !tools.iter().any(|t| t.name == name) {
        return None;
    }
    Some(ToolCall {
        id: synthesize_id(),
        name: name.to_string(),
        arguments: parsed.get("arguments").cloned().unwrap_or_else(|| json!({})),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tools() -> Vec<ToolSpec> {
        vec![ToolSpec {
            name: "query_database".into(),
            description: "Run a read-only query".into(),
            input_schema: json!({"type": "object"}),
        }]
    }

    #[test]
    fn test_native_tool_calls_get_distinct_ids() {
        let body = json!({
            "model": "llama3.1",
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [
                    {"function": {"name": "query_database", "arguments": {"query": "select 1"}}},
                    {"function": {"name": "query_database", "arguments": "{\"query\":\"select 2\"}"}}
                ]
            },
            "done": true,
            "done_reason": "stop"
        });
        let resp = parse_response(&body, "llama3.1", &tools()).unwrap();
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
        assert_eq!(resp.tool_calls.len(), 2);
        assert_ne!(resp.tool_calls[0].id, resp.tool_calls[1].id);
        assert!(resp.tool_calls[0].id.starts_with("call_"));
        assert_eq!(resp.tool_calls[1].arguments["query"], "select 2");
    }

    #[test]
    fn test_inline_json_tool_call() {
        let body = json!({
            "message": {
                "role": "assistant",
                "content": "  {\"tool\": \"query_database\", \"arguments\": {\"query\": \"select now()\"}}\n"
            },
            "done": true
        });
        let resp = parse_response(&body, "llama3.1", &tools()).unwrap();
        assert!(resp.wants_tools());
        assert_eq!(resp.tool_calls[0].name, "query_database");
        assert!(resp.content.is_empty());

        // Unknown tool names stay plain text.
        let body = json!({"message": {"content": "{\"tool\": \"rm_rf\"}"}});
        let resp = parse_response(&body, "llama3.1", &tools()).unwrap();
        assert!(!resp.wants_tools());
    }

    #[test]
    fn test_request_shape() {
        let body = build_request(
            "llama3.1",
            &[Message::system("sys"), Message::tool_result("call_1", "ok", false)],
            &tools(),
            Sampling {
                max_tokens: 100,
                temperature: 0.2,
            },
        );
        assert_eq!(body["stream"], false);
        assert_eq!(body["options"]["num_predict"], 100);
        assert_eq!(body["messages"][1]["role"], "tool");
        assert_eq!(body["tools"][0]["function"]["name"], "query_database");
    }

    #[tokio::test]
    async fn test_chat_and_tags() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({"model": "qwen2.5", "stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "qwen2.5",
                "message": {"role": "assistant", "content": "hi there"},
                "done": true,
                "prompt_eval_count": 4,
                "eval_count": 2
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [{"name": "llama3.1:latest"}, {"name": "qwen2.5:latest"}]
            })))
            .mount(&server)
            .await;

        let client = OllamaClient::new(
            Client::new(),
            &server.uri(),
            "llama3.1".into(),
            Sampling {
                max_tokens: 64,
                temperature: 0.0,
            },
            RetryPolicy::with_max_retries(0),
        );
        let resp = client.chat(&[Message::user("hello")], &[], Some("qwen2.5")).await.unwrap();
        assert_eq!(resp.content, "hi there");
        assert_eq!(resp.usage.unwrap().input_tokens, 4);

        let models = client.list_models().await.unwrap();
        assert_eq!(models, vec!["llama3.1:latest", "qwen2.5:latest"]);
    }

    #[tokio::test]
    async fn test_missing_model_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "model 'nope' not found"})))
            .mount(&server)
            .await;

        let client = OllamaClient::new(
            Client::new(),
            &server.uri(),
            "nope".into(),
            Sampling {
                max_tokens: 64,
                temperature: 0.0,
            },
            RetryPolicy::with_max_retries(2),
        );
        let err = client.chat(&[Message::user("hello")], &[], None).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::UpstreamProvider { class: LlmErrorType::ModelNotFound, .. }
        ));
    }
}
