use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::auth::bearer_token;
use crate::mcp::types::JsonRpcResponse;
use crate::mcp::RequestDispatcher;

pub mod handlers;
pub mod mcp;

pub const MCP_PATH: &str = "/mcp/v1";
pub const SESSION_HEADER: &str = "x-session-token";

const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Build the full HTTP surface.
pub fn router(dispatcher: Arc<RequestDispatcher>) -> Router {
    let protected = Router::new()
        .route(MCP_PATH, post(mcp::handle))
        .route("/api/llm/providers", get(handlers::list_providers))
        .route("/api/llm/models", get(handlers::list_models))
        .route("/api/llm/chat", post(handlers::chat))
        .route("/api/logout", post(handlers::logout))
        .route_layer(middleware::from_fn_with_state(
            dispatcher.clone(),
            require_auth,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(protected)
        .fallback(fallback_404)
        .with_state(dispatcher)
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(security_headers_middleware))
                .layer(middleware::from_fn(request_id_middleware))
                .layer(TraceLayer::new_for_http())
                .layer(DefaultBodyLimit::max(MAX_BODY_BYTES)),
        )
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Middleware: authenticate the bearer credential and bind the caller's pool.
/// The resulting `RequestContext` goes into request extensions; a freshly
/// minted or reused session is returned in `x-session-token`.
async fn require_auth(
    State(dispatcher): State<Arc<RequestDispatcher>>,
    mut req: Request,
    next: Next,
) -> Response {
    let credential = bearer_token(req.headers()).map(str::to_string);
    let ctx = match dispatcher.begin(credential.as_deref()).await {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::warn!(path = %req.uri().path(), kind = e.kind(), "request rejected: {}", e);
            if req.uri().path() == MCP_PATH {
                let status = e.status();
                let body = Json(JsonRpcResponse::failure(serde_json::Value::Null, (&e).into()));
                return (status, body).into_response();
            }
            return e.into_response();
        }
    };

    let minted = ctx.minted.as_ref().map(|s| s.token.clone());
    req.extensions_mut().insert(ctx);
    let mut resp = next.run(req).await;

    // Not after a logout in the same request.
    if let Some(token) = minted.filter(|t| dispatcher.sessions().resolve(t).is_some()) {
        if let Ok(val) = HeaderValue::from_str(&token) {
            resp.headers_mut().insert(SESSION_HEADER, val);
        }
    }
    resp
}

/// Middleware: injects a unique X-Request-Id into every response.
async fn request_id_middleware(req: Request, next: Next) -> Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(val) = HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

async fn security_headers_middleware(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    // Session tokens travel in response headers.
    headers.insert("cache-control", HeaderValue::from_static("no-store"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    headers.remove("server");
    resp
}
