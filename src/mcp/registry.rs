//! Tool registry: the tools this server exposes over MCP and to the
//! conversation loop.
//!
//! Each tool is a tagged record (name, description, JSON schema, handler).
//! Tools are registered once at startup; the registry is then shared
//! read-only behind an `Arc`.
//!
//! Calls are validated against the tool's schema before the handler runs, and
//! handler faults (errors, panics, timeouts) come back as `ToolExecution`.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use jsonschema::JSONSchema;
use serde_json::Value;

use super::types::{CallToolResult, McpToolDef};
use crate::errors::AppError;
use crate::models::llm::ToolSpec;
use crate::store::ResourceHandle;

/// Per-call context handed to a tool handler.
#[derive(Clone)]
pub struct ToolContext {
    pub identity: String,
    pub db: ResourceHandle,
}

impl ToolContext {
    pub fn new(identity: impl Into<String>, db: ResourceHandle) -> Self {
        Self {
            identity: identity.into(),
            db,
        }
    }
}

pub type ToolFuture = BoxFuture<'static, Result<CallToolResult, AppError>>;
pub type ToolHandler = Arc<dyn Fn(ToolContext, Value) -> ToolFuture + Send + Sync>;

/// Wrap an async fn or closure as a `ToolHandler`.
pub fn handler<F, Fut>(f: F) -> ToolHandler
where
    F: Fn(ToolContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CallToolResult, AppError>> + Send + 'static,
{
    Arc::new(move |ctx, args| Box::pin(f(ctx, args)))
}

pub struct Tool {
    name: String,
    description: String,
    input_schema: Value,
    validator: JSONSchema,
    handler: ToolHandler,
}

impl Tool {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn definition(&self) -> McpToolDef {
        McpToolDef {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }

    fn validate(&self, args: &Value) -> Result<(), AppError> {
        if let Err(errors) = self.validator.validate(args) {
            let details: Vec<String> = errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{}: {}", path, e)
                    }
                })
                .collect();
            return Err(AppError::InvalidArguments(format!(
                "{}: {}",
                self.name,
                details.join("; ")
            )));
        }
        Ok(())
    }
}

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

pub struct ToolRegistry {
    tools: HashMap<String, Arc<Tool>>,
    order: Vec<String>,
    call_timeout: Duration,
}

impl ToolRegistry {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            tools: HashMap::new(),
            order: Vec::new(),
            call_timeout,
        }
    }

    pub fn register(
        &mut self,
        name: &str,
        description: &str,
        input_schema: Value,
        handler: ToolHandler,
    ) -> Result<(), AppError> {
        if self.tools.contains_key(name) {
            return Err(AppError::DuplicateName(format!("tool '{}'", name)));
        }
        let validator = JSONSchema::compile(&input_schema).map_err(|e| {
            AppError::InvalidArguments(format!("schema for tool '{}' is invalid: {}", name, e))
        })?;

        self.tools.insert(
            name.to_string(),
            Arc::new(Tool {
                name: name.to_string(),
                description: description.to_string(),
                input_schema,
                validator,
                handler,
            }),
        );
        self.order.push(name.to_string());
        tracing::debug!(tool = %name, "tool registered");
        Ok(())
    }

    /// Tool definitions in registration order.
    pub fn list(&self) -> Vec<McpToolDef> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.definition())
            .collect()
    }

    /// Definitions in the provider-neutral shape offered to models.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.list()
            .into_iter()
            .map(|def| ToolSpec {
                name: def.name,
                description: def.description,
                input_schema: def.input_schema,
            })
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate `args` and run the named tool.
    pub async fn call(
        &self,
        ctx: ToolContext,
        name: &str,
        args: Option<Value>,
    ) -> Result<CallToolResult, AppError> {
        let tool = self
            .tools
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("tool '{}'", name)))?;

        let args = match args {
            Some(Value::Null) | None => Value::Object(Default::default()),
            Some(v) => v,
        };
        tool.validate(&args)?;

        let identity = ctx.identity.clone();
        let handler = tool.handler.clone();
        let started = Instant::now();

        let invocation = AssertUnwindSafe(async move { handler(ctx, args).await }).catch_unwind();
        let outcome = match tokio::time::timeout(self.call_timeout, invocation).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(err))) => Err(fault(name, err)),
            Ok(Err(panic)) => {
                let cause = panic_message(panic.as_ref());
                tracing::error!(tool = %name, identity = %identity, cause = %cause, "tool handler panicked");
                Err(AppError::ToolExecution {
                    tool: name.to_string(),
                    cause: format!("handler panicked: {}", cause),
                })
            }
            Err(_) => Err(AppError::ToolExecution {
                tool: name.to_string(),
                cause: format!("timed out after {}s", self.call_timeout.as_secs()),
            }),
        };

        tracing::info!(
            tool = %name,
            identity = %identity,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "tool executed"
        );
        outcome
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL_TIMEOUT)
    }
}

/// Classify a handler's own error. Argument problems the schema could not
/// express stay `InvalidArguments`; anything else is a tool fault.
fn fault(tool: &str, err: AppError) -> AppError {
    match err {
        AppError::InvalidArguments(_) | AppError::ToolExecution { .. } | AppError::ResourceGone(_) => err,
        AppError::Internal(_) => AppError::ToolExecution {
            tool: tool.to_string(),
            cause: err.public_message(),
        },
        other => AppError::ToolExecution {
            tool: tool.to_string(),
            cause: other.to_string(),
        },
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ── Tests ──────────────────────────────────────────────────────
