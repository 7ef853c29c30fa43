//! Anthropic Messages API client.
//!
//! System turns move to the top-level `system` field, tool results become
//! `tool_result` blocks inside a user turn, and `tool_use` blocks map back to
//! tool calls.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::retry::{send_json, RetryPolicy};
use super::{endpoint, ChatProvider, ProviderKind, Sampling};
use crate::errors::AppError;
use crate::models::llm::{LlmErrorType, LlmResponse, Message, Role, StopReason, ToolCall, ToolSpec, Usage};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    sampling: Sampling,
    retry: RetryPolicy,
}

impl AnthropicClient {
    pub fn new(
        http: Client,
        base_url: &str,
        api_key: &str,
        model: String,
        sampling: Sampling,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            model,
            sampling,
            retry,
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
    }
}

#[async_trait]
impl ChatProvider for AnthropicClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
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
        let url = endpoint(&self.base_url, "/v1/messages");

        let response = send_json("anthropic", &self.retry, || {
            self.request(self.http.post(&url)).json(&body)
        })
        .await?;

        parse_response(&response, model)
    }

    async fn list_models(&self) -> Result<Vec<String>, AppError> {
        let url = endpoint(&self.base_url, "/v1/models");
        let response = send_json("anthropic", &self.retry, || self.request(self.http.get(&url))).await?;

        Ok(response
            .get("data")
            .and_then(|d| d.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("id").and_then(|id| id.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }
}

fn build_request(model: &str, messages: &[Message], tools: &[ToolSpec], sampling: Sampling) -> Value {
    let mut system_parts = Vec::new();
    let mut turns: Vec<Value> = Vec::new();
    // Consecutive tool results share one user turn.
    let mut open_results = false;

    for msg in messages {
        match msg.role {
            Role::System => {
                system_parts.push(msg.content.clone());
                continue;
            }
            Role::Tool => {
                let mut block = json!({
                    "type": "tool_result",
                    "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                    "content": msg.content,
                });
                if msg.is_error {
                    block["is_error"] = json!(true);
                }
                let appended = open_results
                    && turns
                        .last_mut()
                        .and_then(|t| t.get_mut("content"))
                        .and_then(|c| c.as_array_mut())
                        .map(|blocks| blocks.push(block.clone()))
                        .is_some();
                if !appended {
                    turns.push(json!({ "role": "user", "content": [block] }));
                }
                open_results = true;
                continue;
            }
            Role::Assistant if !msg.tool_calls.is_empty() => {
                let mut blocks = Vec::new();
                if !msg.content.is_empty() {
                    blocks.push(json!({ "type": "text", "text": msg.content }));
                }
                for call in &msg.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments,
                    }));
                }
                turns.push(json!({ "role": "assistant", "content": blocks }));
            }
            Role::Assistant => {
                turns.push(json!({ "role": "assistant", "content": msg.content }));
            }
            Role::User => {
                turns.push(json!({ "role": "user", "content": msg.content }));
            }
        }
        open_results = false;
    }

    let mut body = json!({
        "model": model,
        "max_tokens": sampling.max_tokens,
        "temperature": sampling.temperature,
        "messages": turns,
    });
    if !system_parts.is_empty() {
        body["system"] = json!(system_parts.join("\n"));
    }
    if !tools.is_empty() {
        let tools: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.input_schema,
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }
    body
}

fn parse_response(body: &Value, requested_model: &str) -> Result<LlmResponse, AppError> {
    let blocks = body
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| {
            AppError::upstream("anthropic", LlmErrorType::InvalidResponse, "response has no content")
        })?;

    let mut text = Vec::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                    text.push(t);
                }
            }
            Some("tool_use") => tool_calls.push(ToolCall {
                id: block.get("id").and_then(|i| i.as_str()).unwrap_or_default().to_string(),
                name: block.get("name").and_then(|n| n.as_str()).unwrap_or_default().to_string(),
                arguments: block.get("input").cloned().unwrap_or_else(|| json!({})),
            }),
            _ => {}
        }
    }

    let stop_reason = body
        .get("stop_reason")
        .and_then(|s| s.as_str())
        .map(StopReason::from_provider)
        .unwrap_or(StopReason::EndTurn);

    let usage = body.get("usage").map(|u| Usage {
        input_tokens: u.get("input_tokens").and_then(|t| t.as_u64()).unwrap_or(0),
        output_tokens: u.get("output_tokens").and_then(|t| t.as_u64()).unwrap_or(0),
    });

    Ok(LlmResponse {
        content: text.join("\n"),
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
