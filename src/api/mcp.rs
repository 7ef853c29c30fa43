//! POST /mcp/v1: JSON-RPC 2.0 over HTTP, single messages or batches.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde_json::Value;

use crate::errors::AppError;
use crate::mcp::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, PARSE_ERROR};
use crate::mcp::{RequestContext, RequestDispatcher};

pub async fn handle(
    State(dispatcher): State<Arc<RequestDispatcher>>,
    Extension(ctx): Extension<RequestContext>,
    body: Bytes,
) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            let error = JsonRpcError {
                code: PARSE_ERROR,
                message: format!("parse error: {}", e),
                data: None,
            };
            return (
                StatusCode::BAD_REQUEST,
                Json(JsonRpcResponse::failure(Value::Null, error)),
            )
                .into_response();
        }
    };

    match payload {
        Value::Array(items) => {
            if items.is_empty() {
                return invalid(Value::Null, "empty batch").into_response();
            }
            let mut replies = Vec::new();
            for item in items {
                if let Some(reply) = handle_one(&dispatcher, &ctx, item).await {
                    replies.push(reply);
                }
            }
            if replies.is_empty() {
                StatusCode::ACCEPTED.into_response()
            } else {
                Json(replies).into_response()
            }
        }
        single => match handle_one(&dispatcher, &ctx, single).await {
            Some(reply) => Json(reply).into_response(),
            None => StatusCode::ACCEPTED.into_response(),
        },
    }
}

async fn handle_one(
    dispatcher: &RequestDispatcher,
    ctx: &RequestContext,
    item: Value,
) -> Option<JsonRpcResponse> {
    let id = item.get("id").cloned();
    match serde_json::from_value::<JsonRpcRequest>(item) {
        Ok(request) => dispatcher.handle_rpc(ctx, request).await,
        Err(e) => Some(invalid(id.unwrap_or(Value::Null), &e.to_string()).0),
    }
}

fn invalid(id: Value, reason: &str) -> Json<JsonRpcResponse> {
    let err = AppError::InvalidRequest(reason.to_string());
    Json(JsonRpcResponse::failure(id, (&err).into()))
}
