//! Tool-calling conversation loop.
//!
//! The model is called with the registry's tools; every tool call in a turn
//! runs concurrently and its result goes back keyed by the call id. The loop
//! ends on the first turn without tool calls, or fails once `max_turns`
//! model calls have all asked for tools.

use futures::future::join_all;
use serde::Serialize;

use super::ChatProvider;
use crate::errors::AppError;
use crate::mcp::registry::{ToolContext, ToolRegistry};
use crate::models::llm::{LlmResponse, Message, ToolCall};

#[derive(Debug, Clone, Serialize)]
pub struct ConversationOutcome {
    /// The final model turn.
    pub response: LlmResponse,
    /// Full transcript, including the assistant and tool turns added here.
    pub messages: Vec<Message>,
    /// Model calls made.
    pub turns: usize,
}

pub async fn run_conversation(
    provider: &dyn ChatProvider,
    registry: &ToolRegistry,
    ctx: &ToolContext,
    mut messages: Vec<Message>,
    model: Option<&str>,
    max_turns: usize,
) -> Result<ConversationOutcome, AppError> {
    let tools = registry.specs();

    for turn in 1..=max_turns {
        let response = provider.chat(&messages, &tools, model).await?;

        if !response.wants_tools() {
            messages.push(Message::assistant(response.content.clone()));
            tracing::debug!(identity = %ctx.identity, turns = turn, "conversation complete");
            return Ok(ConversationOutcome {
                response,
                messages,
                turns: turn,
            });
        }

        tracing::info!(
            identity = %ctx.identity,
            turn,
            calls = response.tool_calls.len(),
            "executing tool calls"
        );
        messages.push(Message::assistant_tool_calls(
            response.content.clone(),
            response.tool_calls.clone(),
        ));

        let results = join_all(
            response
                .tool_calls
                .iter()
                .map(|call| execute(registry, ctx, call)),
        )
        .await;
        for result in results {
            messages.push(result?);
        }
    }

    tracing::warn!(identity = %ctx.identity, max_turns, "conversation hit the turn limit");
    Err(AppError::ConversationLoopLimit(max_turns))
}

/// Run one call and turn its outcome into a tool-result turn. Only a retired
/// connection aborts the conversation; other failures go back to the model.
async fn execute(registry: &ToolRegistry, ctx: &ToolContext, call: &ToolCall) -> Result<Message, AppError> {
    match registry
        .call(ctx.clone(), &call.name, Some(call.arguments.clone()))
        .await
    {
        Ok(result) => Ok(Message::tool_result(&call.id, result.to_text(), result.is_error)),
        Err(AppError::ResourceGone(reason)) => Err(AppError::ResourceGone(reason)),
        Err(err) => {
            tracing::warn!(tool = %call.name, call_id = %call.id, error = %err, "tool call failed");
            let text = match &err {
                AppError::ToolExecution { cause, .. } => format!("Error executing tool: {}", cause),
                other => format!("Error: {}", other),
            };
            Ok(Message::tool_result(&call.id, text, true))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ProviderKind;
    use crate::mcp::registry::handler;
    use crate::mcp::types::CallToolResult;
    use crate::models::llm::{Role, StopReason, ToolSpec};
    use crate::store::{ConnectionManager, ConnectionMode, ConnectionTarget, PoolPolicy};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Replays canned responses and records every transcript it was sent.
    struct Scripted {
        replies: Mutex<VecDeque<LlmResponse>>,
        repeat_last: bool,
        seen: Mutex<Vec<Vec<Message>>>,
    }

    impl Scripted {
        fn new(replies: Vec<LlmResponse>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                repeat_last: false,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn forever(reply: LlmResponse) -> Self {
            Self {
                repeat_last: true,
                ..Self::new(vec![reply])
            }
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChatProvider for Scripted {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Ollama
        }

        fn default_model(&self) -> &str {
            "scripted"
        }

        async fn chat(
            &self,
            messages: &[Message],
            _tools: &[ToolSpec],
            _model: Option<&str>,
        ) -> Result<LlmResponse, AppError> {
            self.seen.lock().unwrap().push(messages.to_vec());
            let mut replies = self.replies.lock().unwrap();
            let reply = if self.repeat_last && replies.len() == 1 {
                replies.front().cloned()
            } else {
                replies.pop_front()
            };
            Ok(reply.expect("script exhausted"))
        }

        async fn list_models(&self) -> Result<Vec<String>, AppError> {
            Ok(vec![])
        }
    }

    fn text(content: &str) -> LlmResponse {
        LlmResponse {
            content: content.into(),
            tool_calls: vec![],
            stop_reason: StopReason::EndTurn,
            model: "scripted".into(),
            usage: None,
        }
    }

    fn tool_turn(calls: &[(&str, &str, serde_json::Value)]) -> LlmResponse {
        LlmResponse {
            content: String::new(),
            tool_calls: calls
                .iter()
                .map(|(id, name, args)| ToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments: args.clone(),
                })
                .collect(),
            stop_reason: StopReason::ToolUse,
            model: "scripted".into(),
            usage: None,
        }
    }

    async fn ctx() -> ToolContext {
        let mgr = ConnectionManager::new(
            ConnectionMode::Global,
            PoolPolicy::default(),
            "postgres://localhost/test",
        )
        .unwrap();
        let handle = mgr
            .acquire("tok_conv", || async { Ok(ConnectionTarget::ServerDefault) })
            .await
            .unwrap();
        ToolContext::new("tok_conv", handle)
    }

    fn registry(calls: Arc<AtomicUsize>) -> ToolRegistry {
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let mut registry = ToolRegistry::new(Duration::from_secs(5));
        registry
            .register(
                "lookup",
                "Look up a key",
                json!({
                    "type": "object",
                    "properties": {"key": {"type": "string"}},
                    "required": ["key"]
                }),
                handler(move |_ctx, args| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let key = args["key"].as_str().unwrap_or_default().to_string();
                        if key == "slow" {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                        Ok(CallToolResult::text(format!("value-of-{}", key)))
                    }
                }),
            )
            .unwrap();
        registry
            .register(
                "rendezvous",
                "Blocks until a second call arrives",
                json!({"type": "object"}),
                handler(move |_ctx, _args| {
                    let barrier = barrier.clone();
                    async move {
                        barrier.wait().await;
                        Ok(CallToolResult::text("met"))
                    }
                }),
            )
            .unwrap();
        registry
            .register(
                "broken",
                "Always fails",
                json!({"type": "object"}),
                handler(|_ctx, _args| async {
                    Err(AppError::ToolExecution {
                        tool: "broken".into(),
                        cause: "relation \"nope\" does not exist".into(),
                    })
                }),
            )
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_plain_answer_takes_one_turn() {
        let provider = Scripted::new(vec![text("hello")]);
        let registry = registry(Arc::new(AtomicUsize::new(0)));
        let outcome = run_conversation(&provider, &registry, &ctx().await, vec![Message::user("hi")], None, 10)
            .await
            .unwrap();
        assert_eq!(outcome.turns, 1);
        assert_eq!(outcome.response.content, "hello");
        assert_eq!(outcome.messages.len(), 2);
        assert_eq!(outcome.messages[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_parallel_results_keyed_by_call_id() {
        let provider = Scripted::new(vec![
            tool_turn(&[
                ("call_a", "lookup", json!({"key": "slow"})),
                ("call_b", "lookup", json!({"key": "fast"})),
            ]),
            text("done"),
        ]);
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry(calls.clone());
        let outcome = run_conversation(&provider, &registry, &ctx().await, vec![Message::user("go")], None, 10)
            .await
            .unwrap();

        assert_eq!(outcome.turns, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let second_request = &provider.seen.lock().unwrap()[1];
        let results: Vec<(&str, &str)> = second_request
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| (m.tool_call_id.as_deref().unwrap(), m.content.as_str()))
            .collect();
        assert_eq!(
            results,
            vec![("call_a", "value-of-slow"), ("call_b", "value-of-fast")]
        );
    }

    #[tokio::test]
    async fn test_tool_calls_run_concurrently() {
        // Each call waits for the other; a sequential loop would never finish.
        let provider = Scripted::new(vec![
            tool_turn(&[
                ("r1", "rendezvous", json!({})),
                ("r2", "rendezvous", json!({})),
            ]),
            text("both met"),
        ]);
        let registry = registry(Arc::new(AtomicUsize::new(0)));
        let ctx = ctx().await;
        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            run_conversation(&provider, &registry, &ctx, vec![Message::user("go")], None, 10),
        )
        .await
        .expect("tool calls did not run concurrently")
        .unwrap();
        assert_eq!(outcome.response.content, "both met");
    }

    #[tokio::test]
    async fn test_loop_limit() {
        let provider = Scripted::forever(tool_turn(&[("c", "lookup", json!({"key": "again"}))]));
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry(calls.clone());
        let err = run_conversation(&provider, &registry, &ctx().await, vec![Message::user("loop")], None, 3)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::ConversationLoopLimit(3)));
        assert_eq!(provider.calls(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_tool_failures_go_back_to_model() {
        let provider = Scripted::new(vec![
            tool_turn(&[
                ("x1", "broken", json!({})),
                ("x2", "lookup", json!({"wrong": 1})),
                ("x3", "missing_tool", json!({})),
            ]),
            text("sorry"),
        ]);
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry(calls.clone());
        let outcome = run_conversation(&provider, &registry, &ctx().await, vec![Message::user("go")], None, 10)
            .await
            .unwrap();

        let tool_turns: Vec<&Message> = outcome.messages.iter().filter(|m| m.role == Role::Tool).collect();
        assert_eq!(tool_turns.len(), 3);
        assert!(tool_turns.iter().all(|m| m.is_error));
        assert!(tool_turns[0].content.contains("does not exist"));
        assert!(tool_turns[1].content.contains("invalid arguments"));
        // Schema-invalid arguments never reach the handler.
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
