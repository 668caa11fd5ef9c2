//! REST surface: machine create/inspect plus a health probe.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::server::AgentState;

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "unauthorized" })),
    )
        .into_response()
}

fn failure(error: &str, details: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": error, "details": details.to_string() })),
    )
        .into_response()
}

pub async fn health(State(state): State<Arc<AgentState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": state.connections.len(),
        "processes": state.processes.count(),
    }))
}

/// `POST /api/machine` - create a workspace machine. The request body is
/// ignored; everything the orchestrator needs comes from configuration.
pub async fn create_machine(
    State(state): State<Arc<AgentState>>,
    headers: HeaderMap,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return unauthorized();
    };
    if !state.auth.verify(token).await {
        return unauthorized();
    }
    let orchestrator = match state.orchestrator().await {
        Ok(client) => client,
        Err(err) => return failure("orchestrator unavailable", err),
    };
    match orchestrator.create_machine(token).await {
        Ok(machine_id) => (StatusCode::OK, Json(json!({ "machine_id": machine_id }))).into_response(),
        Err(err) => failure("machine creation failed", err),
    }
}

/// `GET /api/machine/:id` - fetch a machine's status record.
pub async fn get_machine(
    State(state): State<Arc<AgentState>>,
    Path(machine_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return unauthorized();
    };
    if !state.auth.verify(token).await {
        return unauthorized();
    }
    let orchestrator = match state.orchestrator().await {
        Ok(client) => client,
        Err(err) => return failure("orchestrator unavailable", err),
    };
    match orchestrator.get_machine_status(&machine_id).await {
        Ok(Some(machine)) => (
            StatusCode::OK,
            Json(json!({ "success": true, "machine": machine })),
        )
            .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("machine not found: {machine_id}") })),
        )
            .into_response(),
        Err(err) => failure("machine lookup failed", err),
    }
}
