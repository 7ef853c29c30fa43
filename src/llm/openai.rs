//! OpenAI Chat Completions client.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::retry::{send_json, RetryPolicy};
use super::{endpoint, ChatProvider, ProviderKind, Sampling};
use crate::errors::AppError;
use crate::models::llm::{LlmErrorType, LlmResponse, Message, Role, StopReason, ToolCall, ToolSpec, Usage};

pub struct OpenAiClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    sampling: Sampling,
    retry: RetryPolicy,
}

impl OpenAiClient {
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
}

#[async_trait]
impl ChatProvider for OpenAiClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
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
        let url = endpoint(&self.base_url, "/v1/chat/completions");

        let response = send_json("openai", &self.retry, || {
            self.http.post(&url).bearer_auth(&self.api_key).json(&body)
        })
        .await?;

        parse_response(&response, model)
    }

    async fn list_models(&self) -> Result<Vec<String>, AppError> {
        let url = endpoint(&self.base_url, "/v1/models");
        let response = send_json("openai", &self.retry, || {
            self.http.get(&url).bearer_auth(&self.api_key)
        })
        .await?;

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
    let messages: Vec<Value> = messages.iter().map(to_openai_message).collect();

    let mut body = json!({
        "model": model,
        "messages": messages,
        "max_tokens": sampling.max_tokens,
        "temperature": sampling.temperature,
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

fn to_openai_message(msg: &Message) -> Value {
    match msg.role {
        Role::Assistant if !msg.tool_calls.is_empty() => {
            let calls: Vec<Value> = msg
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": call.arguments.to_string(),
                        }
                    })
                })
                .collect();
            let content = if msg.content.is_empty() {
                Value::Null
            } else {
                json!(msg.content)
            };
            json!({ "role": "assistant", "content": content, "tool_calls": calls })
        }
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
            "content": msg.content,
        }),
        role => json!({ "role": role, "content": msg.content }),
    }
}

fn parse_response(body: &Value, requested_model: &str) -> Result<LlmResponse, AppError> {
    let choice = body
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| {
            AppError::upstream("openai", LlmErrorType::InvalidResponse, "response has no choices")
        })?;
    let message = choice.get("message").cloned().unwrap_or(Value::Null);

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string();

    let tool_calls: Vec<ToolCall> = message
        .get("tool_calls")
        .and_then(|t| t.as_array())
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let function = call.get("function")?;
                    let raw_args = function.get("arguments").and_then(|a| a.as_str()).unwrap_or("{}");
                    Some(ToolCall {
                        id: call.get("id").and_then(|i| i.as_str()).unwrap_or_default().to_string(),
                        name: function.get("name").and_then(|n| n.as_str())?.to_string(),
                        // Malformed arguments stay a string and fail schema validation.
                        arguments: serde_json::from_str(raw_args)
                            .unwrap_or_else(|_| Value::String(raw_args.to_string())),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let stop_reason = match choice.get("finish_reason").and_then(|r| r.as_str()) {
        _ if !tool_calls.is_empty() => StopReason::ToolUse,
        Some(reason) => StopReason::from_provider(reason),
        None => StopReason::EndTurn,
    };

    let usage = body.get("usage").map(|u| Usage {
        input_tokens: u.get("prompt_tokens").and_then(|t| t.as_u64()).unwrap_or(0),
        output_tokens: u.get("completion_tokens").and_then(|t| t.as_u64()).unwrap_or(0),
    });

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

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sampling() -> Sampling {
        Sampling {
            max_tokens: 256,
            temperature: 0.0,
        }
    }

    fn client(base: &str) -> OpenAiClient {
        OpenAiClient::new(
            Client::new(),
            base,
            "sk-test",
            "gpt-4o".into(),
            sampling(),
            RetryPolicy {
                max_retries: 1,
                base_backoff_ms: 1,
                max_backoff_ms: 5,
                jitter_ms: 0,
                max_retry_after: std::time::Duration::from_millis(10),
            },
        )
    }

    #[test]
    fn test_request_translation() {
        let messages = vec![
            Message::system("You are a database assistant"),
            Message::user("how many users?"),
            Message::assistant_tool_calls(
                "",
                vec![ToolCall {
                    id: "call_1".into(),
                    name: "count_rows".into(),
                    arguments: json!({"table": "users"}),
                }],
            ),
            Message::tool_result("call_1", "42", false),
        ];
        let tools = vec![ToolSpec {
            name: "count_rows".into(),
            description: "Count rows".into(),
            input_schema: json!({"type": "object"}),
        }];
        let body = build_request("gpt-4o", &messages, &tools, sampling());

        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs[0]["role"], "system");
        assert_eq!(msgs[2]["content"], Value::Null);
        assert_eq!(msgs[2]["tool_calls"][0]["function"]["arguments"], r#"{"table":"users"}"#);
        assert_eq!(msgs[3]["role"], "tool");
        assert_eq!(msgs[3]["tool_call_id"], "call_1");
        assert_eq!(body["tools"][0]["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn test_response_with_malformed_arguments() {
        let body = json!({
            "model": "gpt-4o-2024",
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [
                        {"id": "a", "function": {"name": "query_database", "arguments": "{\"query\":\"select 1\"}"}},
                        {"id": "b", "function": {"name": "query_database", "arguments": "{not json"}}
                    ]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let resp = parse_response(&body, "gpt-4o").unwrap();
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
        assert_eq!(resp.tool_calls[0].arguments["query"], "select 1");
        assert!(resp.tool_calls[1].arguments.is_string());
        assert_eq!(resp.model, "gpt-4o-2024");
    }

    #[test]
    fn test_response_without_choices_is_invalid() {
        let err = parse_response(&json!({"choices": []}), "gpt-4o").unwrap_err();
        assert!(matches!(
            err,
            AppError::UpstreamProvider { class: LlmErrorType::InvalidResponse, .. }
        ));
    }

    #[tokio::test]
    async fn test_chat_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"model": "gpt-4o-mini"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "gpt-4o-mini",
                "choices": [{"message": {"role": "assistant", "content": "There are 42 users."}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 6}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let resp = client(&server.uri())
            .chat(&[Message::user("count users")], &[], Some("gpt-4o-mini"))
            .await
            .unwrap();
        assert_eq!(resp.content, "There are 42 users.");
        assert_eq!(resp.stop_reason, StopReason::EndTurn);
        assert_eq!(resp.usage.unwrap().output_tokens, 6);
    }

    #[tokio::test]
    async fn test_list_models() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "gpt-4o"}, {"id": "gpt-4o-mini"}]
            })))
            .mount(&server)
            .await;

        let models = client(&server.uri()).list_models().await.unwrap();
        assert_eq!(models, vec!["gpt-4o", "gpt-4o-mini"]);
    }

    #[tokio::test]
    async fn test_auth_failure_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"message": "Incorrect API key provided", "type": "invalid_request_error"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .chat(&[Message::user("hi")], &[], None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::UpstreamProvider { class: LlmErrorType::InvalidAuth, .. }
        ));
    }
}
