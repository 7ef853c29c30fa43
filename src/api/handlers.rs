use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    Extension, Json,
};
use serde_json::{json, Value};

use crate::errors::AppError;
use crate::mcp::dispatcher::{ChatParams, ChatReply, LogoutReply, ModelsParams, ModelsReply};
use crate::mcp::{RequestContext, RequestDispatcher};

// ── Handlers ─────────────────────────────────────────────────

/// GET /health (no auth)
pub async fn health(State(dispatcher): State<Arc<RequestDispatcher>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "mode": dispatcher.connections().mode(),
        "tools": dispatcher.tools().len(),
    }))
}

/// GET /api/llm/providers
pub async fn list_providers(State(dispatcher): State<Arc<RequestDispatcher>>) -> Json<Value> {
    Json(json!({
        "providers": dispatcher.providers(),
        "default": dispatcher.llm().default_kind(),
    }))
}

/// GET /api/llm/models?provider=
pub async fn list_models(
    State(dispatcher): State<Arc<RequestDispatcher>>,
    Query(params): Query<ModelsParams>,
) -> Result<Json<ModelsReply>, AppError> {
    Ok(Json(dispatcher.models(params).await?))
}

/// POST /api/llm/chat
pub async fn chat(
    State(dispatcher): State<Arc<RequestDispatcher>>,
    Extension(ctx): Extension<RequestContext>,
    body: Result<Json<ChatParams>, JsonRejection>,
) -> Result<Json<ChatReply>, AppError> {
    let Json(params) = body.map_err(|e| AppError::InvalidArguments(e.body_text()))?;
    tracing::debug!(
        identity = %ctx.identity,
        messages = params.messages.len(),
        proxy_only = params.tools.is_some(),
        "chat request"
    );
    Ok(Json(dispatcher.chat(&ctx, params).await?))
}

/// POST /api/logout
pub async fn logout(
    State(dispatcher): State<Arc<RequestDispatcher>>,
    Extension(ctx): Extension<RequestContext>,
) -> Json<LogoutReply> {
    Json(dispatcher.logout(&ctx).await)
}
