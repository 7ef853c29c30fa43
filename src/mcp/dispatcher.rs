//! Per-request pipeline: authenticate, bind the caller's pool, route.
//!
//! One `RequestDispatcher` is built at startup and shared by every request.
//! It owns no request state; everything a handler needs travels in the
//! `RequestContext` produced by `begin()`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::registry::{ToolContext, ToolRegistry};
use super::resources::ResourceCatalog;
use super::types::{
    CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult,
    JsonRpcRequest, JsonRpcResponse, ListResourcesResult, ListToolsResult, ReadResourceParams,
    ReadResourceResult, ResourcesCapability, ServerCapabilities, ToolsCapability,
    PROTOCOL_VERSION,
};
use crate::auth::session::{Session, SESSION_PREFIX};
use crate::auth::{SessionManager, TokenStore};
use crate::errors::AppError;
use crate::llm::{run_conversation, LlmGateway, ProviderInfo, ProviderKind};
use crate::models::llm::{LlmResponse, Message, ToolSpec};
use crate::store::connections::{ConnectionMode, TargetInfo};
use crate::store::{ConnectionManager, ConnectionTarget, ResourceHandle};

pub const SERVER_NAME: &str = "pgmcp";
const DEFAULT_STATEMENT_TIMEOUT_MS: u64 = 30_000;

/// Identity of an authenticated caller.
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub identity: String,
    /// Session token this request runs under.
    pub session: String,
    /// Set when the caller presented an API token; the session to use from
    /// now on, minted on first contact and reused afterwards.
    pub minted: Option<Session>,
}

/// Everything a routed request may touch.
#[derive(Clone)]
pub struct RequestContext {
    pub identity: String,
    pub session: String,
    pub minted: Option<Session>,
    pub db: ResourceHandle,
}

impl RequestContext {
    fn tool_context(&self) -> ToolContext {
        ToolContext::new(self.identity.clone(), self.db.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Initialize,
    Initialized,
    Ping,
    ToolsList,
    ToolsCall,
    DatabasesList,
    ResourcesList,
    ResourcesRead,
    Chat,
    Models,
    Logout,
}

const ROUTES: &[(&str, Method)] = &[
    ("initialize", Method::Initialize),
    ("notifications/initialized", Method::Initialized),
    ("ping", Method::Ping),
    ("tools/list", Method::ToolsList),
    ("tools/call", Method::ToolsCall),
    ("databases/list", Method::DatabasesList),
    ("resources/list", Method::ResourcesList),
    ("resources/read", Method::ResourcesRead),
    ("chat", Method::Chat),
    ("models", Method::Models),
    ("logout", Method::Logout),
];

fn route(method: &str) -> Option<Method> {
    ROUTES
        .iter()
        .find(|(name, _)| *name == method)
        .map(|(_, m)| *m)
}

/// Params for JSON-RPC `chat` and `POST /api/llm/chat`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatParams {
    pub messages: Vec<Message>,
    /// When present the server only proxies one model turn.
    #[serde(default)]
    pub tools: Option<Vec<ToolSpec>>,
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub provider: ProviderKind,
    pub response: LlmResponse,
    /// Messages appended after the caller's own.
    pub messages: Vec<Message>,
    pub turns: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelsParams {
    #[serde(default)]
    pub provider: Option<ProviderKind>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelsReply {
    pub provider: ProviderKind,
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseEntry {
    pub alias: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub sslmode: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogoutReply {
    pub revoked: bool,
    /// Whether the caller's pool was drained.
    pub released: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabasesReply {
    pub mode: ConnectionMode,
    pub current: TargetInfo,
    pub databases: Vec<DatabaseEntry>,
}

pub struct RequestDispatcher {
    tokens: Arc<TokenStore>,
    sessions: SessionManager,
    connections: Arc<ConnectionManager>,
    tools: Arc<ToolRegistry>,
    resources: ResourceCatalog,
    llm: LlmGateway,
    max_tool_turns: usize,
    statement_timeout_ms: u64,
}

impl RequestDispatcher {
    pub fn new(
        tokens: Arc<TokenStore>,
        sessions: SessionManager,
        connections: Arc<ConnectionManager>,
        tools: Arc<ToolRegistry>,
        llm: LlmGateway,
        max_tool_turns: usize,
    ) -> Self {
        Self {
            tokens,
            sessions,
            connections,
            tools,
            resources: ResourceCatalog::builtin(),
            llm,
            max_tool_turns: max_tool_turns.max(1),
            statement_timeout_ms: DEFAULT_STATEMENT_TIMEOUT_MS,
        }
    }

    /// Timeout applied to resource reads.
    pub fn with_statement_timeout(mut self, statement_timeout_ms: u64) -> Self {
        self.statement_timeout_ms = statement_timeout_ms;
        self
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn resources(&self) -> &ResourceCatalog {
        &self.resources
    }

    pub fn llm(&self) -> &LlmGateway {
        &self.llm
    }

    // ── Pipeline ──────────────────────────────────────────────

    /// Session first, then API token. A valid API token mints a session.
    pub async fn authenticate(&self, credential: Option<&str>) -> Result<Authenticated, AppError> {
        let credential = credential
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AppError::Unauthorized("missing bearer token".into()))?;

        if let Some(identity) = self.sessions.resolve(credential) {
            return Ok(Authenticated {
                identity,
                session: credential.to_string(),
                minted: None,
            });
        }
        if credential.starts_with(SESSION_PREFIX) {
            return Err(AppError::Unauthorized("session expired or unknown".into()));
        }

        let identity = self.tokens.validate(credential).await?;
        // A token with a previously retired id may have been re-issued.
        self.connections.reinstate(&identity);
        let session = self.sessions.issue(&identity);
        Ok(Authenticated {
            identity,
            session: session.token.clone(),
            minted: Some(session),
        })
    }

    /// Acquire the pool that backs `identity`.
    pub async fn bind(&self, identity: &str) -> Result<ResourceHandle, AppError> {
        let tokens = self.tokens.clone();
        let owner = identity.to_string();
        self.connections
            .acquire(identity, move || async move {
                Ok(match tokens.connection_for(&owner).await? {
                    Some((alias, profile)) => ConnectionTarget::Saved { alias, profile },
                    None => ConnectionTarget::ServerDefault,
                })
            })
            .await
    }

    /// Authenticate and bind in one step. No pool is touched on auth failure.
    pub async fn begin(&self, credential: Option<&str>) -> Result<RequestContext, AppError> {
        let auth = self.authenticate(credential).await?;
        let db = self.bind(&auth.identity).await?;
        Ok(RequestContext {
            identity: auth.identity,
            session: auth.session,
            minted: auth.minted,
            db,
        })
    }

    /// Revoke the caller's session. The pool goes too once the identity has
    /// no live session left.
    pub async fn logout(&self, ctx: &RequestContext) -> LogoutReply {
        let revoked = self.sessions.revoke(&ctx.session).is_some();
        let released = !self.sessions.has_live_session(&ctx.identity)
            && self.connections.release(&ctx.identity).await;
        tracing::info!(identity = %ctx.identity, revoked, released, "logout");
        LogoutReply { revoked, released }
    }

    /// Route one JSON-RPC message. Notifications yield `None`.
    pub async fn handle_rpc(&self, ctx: &RequestContext, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let outcome = self.dispatch(ctx, &request).await;
        match request.id {
            None => {
                if let Err(e) = outcome {
                    tracing::debug!(method = %request.method, error = %e, "notification failed");
                }
                None
            }
            Some(id) => Some(match outcome {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err(e) => {
                    tracing::warn!(
                        method = %request.method,
                        identity = %ctx.identity,
                        kind = e.kind(),
                        "request failed: {}",
                        e
                    );
                    JsonRpcResponse::failure(id, (&e).into())
                }
            }),
        }
    }

    async fn dispatch(&self, ctx: &RequestContext, request: &JsonRpcRequest) -> Result<Value, AppError> {
        if !request.jsonrpc.is_empty() && request.jsonrpc != "2.0" {
            return Err(AppError::InvalidRequest(format!(
                "unsupported jsonrpc version '{}'",
                request.jsonrpc
            )));
        }
        let method = route(&request.method)
            .ok_or_else(|| AppError::MethodNotFound(request.method.clone()))?;

        match method {
            Method::Initialize => to_value(self.initialize(request.params()?)),
            Method::Initialized | Method::Ping => Ok(json!({})),
            Method::ToolsList => to_value(ListToolsResult {
                tools: self.tools.list(),
            }),
            Method::ToolsCall => to_value(self.call_tool(ctx, request.params()?).await?),
            Method::DatabasesList => to_value(self.databases(ctx).await?),
            Method::ResourcesList => to_value(ListResourcesResult {
                resources: self.resources.list(),
            }),
            Method::ResourcesRead => to_value(self.read_resource(ctx, request.params()?).await?),
            Method::Chat => to_value(self.chat(ctx, request.params()?).await?),
            Method::Models => to_value(self.models(request.params()?).await?),
            Method::Logout => to_value(self.logout(ctx).await),
        }
    }

    // ── Methods ───────────────────────────────────────────────

    pub fn initialize(&self, params: InitializeParams) -> InitializeResult {
        if let Some(client) = &params.client_info {
            tracing::info!(client = %client.name, version = %client.version, "client initialized");
        }
        InitializeResult {
            protocol_version: params
                .protocol_version
                .unwrap_or_else(|| PROTOCOL_VERSION.to_string()),
            capabilities: ServerCapabilities {
                tools: ToolsCapability { list_changed: false },
                resources: ResourcesCapability {
                    subscribe: false,
                    list_changed: false,
                },
            },
            server_info: Implementation {
                name: SERVER_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }

    /// A failing handler is reported as an `isError` result, not a protocol error.
    pub async fn call_tool(&self, ctx: &RequestContext, params: CallToolParams) -> Result<CallToolResult, AppError> {
        match self
            .tools
            .call(ctx.tool_context(), &params.name, params.arguments)
            .await
        {
            Ok(result) => Ok(result),
            Err(AppError::ToolExecution { tool, cause }) => Ok(CallToolResult::error(format!(
                "Error executing tool '{}': {}",
                tool, cause
            ))),
            Err(e) => Err(e),
        }
    }

    pub async fn read_resource(
        &self,
        ctx: &RequestContext,
        params: ReadResourceParams,
    ) -> Result<ReadResourceResult, AppError> {
        self.resources
            .read(ctx.db.pool(), &params.uri, self.statement_timeout_ms)
            .await
    }

    pub async fn databases(&self, ctx: &RequestContext) -> Result<DatabasesReply, AppError> {
        let mode = self.connections.mode();
        let databases = match mode {
            ConnectionMode::Global => Vec::new(),
            ConnectionMode::PerToken => {
                let (active, profiles) = self.tokens.connections(&ctx.identity).await?;
                profiles
                    .into_iter()
                    .map(|(alias, p)| DatabaseEntry {
                        active: active.as_deref() == Some(alias.as_str()),
                        database: p.database().to_string(),
                        sslmode: p.sslmode.as_str().to_string(),
                        alias,
                        host: p.host,
                        port: p.port,
                        user: p.user,
                        description: p.description,
                    })
                    .collect()
            }
        };
        Ok(DatabasesReply {
            mode,
            current: ctx.db.target().clone(),
            databases,
        })
    }

    pub async fn chat(&self, ctx: &RequestContext, params: ChatParams) -> Result<ChatReply, AppError> {
        if params.messages.is_empty() {
            return Err(AppError::InvalidArguments("messages must not be empty".into()));
        }
        let provider = self.llm.provider(params.provider)?;
        let model = params.model.as_deref();

        if let Some(tools) = params.tools {
            let response = provider.chat(&params.messages, &tools, model).await?;
            let mut appended = Vec::new();
            if response.tool_calls.is_empty() {
                appended.push(Message::assistant(response.content.clone()));
            } else {
                appended.push(Message::assistant_tool_calls(
                    response.content.clone(),
                    response.tool_calls.clone(),
                ));
            }
            return Ok(ChatReply {
                provider: provider.kind(),
                response,
                messages: appended,
                turns: 1,
            });
        }

        let supplied = params.messages.len();
        let outcome = run_conversation(
            provider.as_ref(),
            &self.tools,
            &ctx.tool_context(),
            params.messages,
            model,
            self.max_tool_turns,
        )
        .await?;
        Ok(ChatReply {
            provider: provider.kind(),
            response: outcome.response,
            messages: outcome.messages.into_iter().skip(supplied).collect(),
            turns: outcome.turns,
        })
    }

    pub async fn models(&self, params: ModelsParams) -> Result<ModelsReply, AppError> {
        let provider = self.llm.provider(params.provider)?;
        let models = self.llm.list_models(Some(provider.kind())).await?;
        Ok(ModelsReply {
            provider: provider.kind(),
            models,
        })
    }

    pub fn providers(&self) -> Vec<ProviderInfo> {
        self.llm.providers()
    }

    /// Discard all sessions and drain all pools.
    pub async fn shutdown(&self) {
        let sessions = self.sessions.len();
        self.sessions.clear();
        self.connections.shutdown().await;
        tracing::info!(sessions, "dispatcher shut down");
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value, AppError> {
    serde_json::to_value(value).map_err(|e| AppError::Internal(e.into()))
}
