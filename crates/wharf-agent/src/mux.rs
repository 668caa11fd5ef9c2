//! Control-channel multiplexer.
//!
//! One WebSocket per client carries every operation. Each inbound frame is
//! parsed as a `{id, operation}` envelope, dispatched on its own task and
//! answered with a response envelope carrying the same id, so response
//! order is decoupled from request order and clients correlate by id.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::envelope::{Operation, RawRequest, Response};
use crate::error::{AgentError, OpResult};
use crate::registry::ConnectionHandle;
use crate::server::AgentState;
use crate::{fs_ops, ids};

pub async fn ws_handler(
    State(state): State<Arc<AgentState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

pub async fn handle_socket(state: Arc<AgentState>, socket: WebSocket) {
    let ws_id = ids::token();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    state.connections.insert(
        ws_id.clone(),
        ConnectionHandle {
            tx: tx.clone(),
            auth_token: Mutex::new(None),
        },
    );
    info!(%ws_id, "control socket connected");

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                let state = state.clone();
                let ws_id = ws_id.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Some(response) = handle_frame(&state, &ws_id, &text).await {
                        let _ = tx.send(Message::Text(response.to_json()));
                    }
                });
            }
            Message::Close(_) => break,
            // Binary frames carry no operations on the control channel.
            _ => {}
        }
    }

    info!(%ws_id, "control socket disconnected");
    state.connections.remove(&ws_id);
    state.watchers.unsubscribe(&ws_id);
    state.processes.unsubscribe(&ws_id);
    drop(tx);
    let _ = writer.await;
}

/// Parse and dispatch one frame. `None` means the outer envelope did not
/// parse: there is no id to answer, so the frame is logged and dropped.
async fn handle_frame(state: &Arc<AgentState>, ws_id: &str, text: &str) -> Option<Response> {
    let raw: RawRequest = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(ws_id, %err, "dropping unparseable frame");
            return None;
        }
    };
    let id = raw.id;
    let operation = match serde_json::from_value::<Operation>(raw.operation) {
        Ok(op) => op,
        Err(err) => {
            return Some(Response::err(
                id,
                &AgentError::InvalidOperation(err.to_string()),
            ));
        }
    };
    debug!(ws_id, %id, "dispatching operation");
    // Run the handler on its own task so a panic surfaces as an
    // INTERNAL_ERROR response instead of a silently missing reply.
    let handler = tokio::spawn({
        let state = state.clone();
        let ws_id = ws_id.to_string();
        async move { dispatch(&state, &ws_id, operation).await }
    });
    let result = match handler.await {
        Ok(result) => result,
        Err(err) => Err(AgentError::Internal(format!(
            "operation handler failed: {err}"
        ))),
    };
    match result {
        Ok(data) => Some(Response::ok(id, data)),
        Err(err) => Some(Response::err(id, &err)),
    }
}

async fn dispatch(state: &Arc<AgentState>, ws_id: &str, op: Operation) -> OpResult<Value> {
    let workspace = &state.config.workspace;
    match op {
        Operation::ReadFile { path, encoding } => {
            fs_ops::read_file(workspace, &path, encoding.as_deref()).await
        }
        Operation::WriteFile {
            path,
            content,
            encoding,
        } => fs_ops::write_file(workspace, &path, content.as_deref(), encoding.as_deref()).await,
        Operation::Rm { path, recursive } => fs_ops::rm(workspace, &path, recursive).await,
        Operation::Readdir { path } => fs_ops::readdir(workspace, &path).await,
        Operation::Mkdir { path, recursive } => fs_ops::mkdir(workspace, &path, recursive).await,
        Operation::Stat { path } => fs_ops::stat(workspace, &path).await,
        Operation::Mount { path, tree } => fs_ops::mount(workspace, &path, tree.as_ref()).await,

        Operation::Spawn { command, args } => {
            let command = command
                .ok_or_else(|| AgentError::Process("spawn requires a command".to_string()))?;
            let pid = state.processes.spawn(ws_id, &command, &args).await?;
            Ok(json!({ "pid": pid }))
        }
        Operation::Input { pid, data } => {
            let pid =
                pid.ok_or_else(|| AgentError::Process("input requires a pid".to_string()))?;
            let data =
                data.ok_or_else(|| AgentError::Process("input requires data".to_string()))?;
            state.processes.input(pid, &data)?;
            Ok(Value::Null)
        }
        Operation::Kill { pid } => {
            let pid = pid.ok_or_else(|| AgentError::Process("kill requires a pid".to_string()))?;
            state.processes.kill(pid)?;
            Ok(Value::Null)
        }
        Operation::Resize { pid, cols, rows } => {
            let pid =
                pid.ok_or_else(|| AgentError::Process("resize requires a pid".to_string()))?;
            let cols =
                cols.ok_or_else(|| AgentError::Process("resize requires cols".to_string()))?;
            let rows =
                rows.ok_or_else(|| AgentError::Process("resize requires rows".to_string()))?;
            state.processes.resize(pid, cols, rows)?;
            Ok(Value::Null)
        }

        Operation::Watch { patterns, .. } => {
            let watcher_id = state.watchers.watch(ws_id, &patterns)?;
            Ok(json!({ "watcherId": watcher_id }))
        }
        Operation::WatchPaths { include } => {
            let watcher_id = state.watchers.watch(ws_id, &include)?;
            Ok(json!({ "watcherId": watcher_id }))
        }

        Operation::Auth { token } => {
            let token =
                token.ok_or_else(|| AgentError::Auth("auth requires a token".to_string()))?;
            if !state.auth.verify(&token).await {
                return Err(AgentError::Auth("token verification failed".to_string()));
            }
            if let Some(conn) = state.connections.get(ws_id) {
                *conn.auth_token.lock() = Some(token);
            }
            Ok(Value::Null)
        }
    }
}
