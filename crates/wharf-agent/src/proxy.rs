//! Reverse-proxy gateway.
//!
//! `/{ws,http}://agent/proxy/<machineId>/[preview/]<rest>[?port=<n>]`
//! resolves the machine id to a private IPv6 address through the
//! orchestrator and then either bridges a WebSocket to the target agent or
//! fetches an HTTP preview from a user process bound inside it.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{CloseFrame, Message as ClientMessage, WebSocket};
use axum::extract::{Path, Query, Request, State, WebSocketUpgrade};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tracing::{debug, warn};

use crate::config::DEFAULT_PREVIEW_PORT;
use crate::server::AgentState;

/// Control port every agent listens on inside its machine.
const UPSTREAM_CONTROL_PORT: u16 = 3000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// HTTP preview of a user process.
    Http(String),
    /// WebSocket onto the upstream agent.
    Ws(String),
}

impl Target {
    pub fn url(&self) -> &str {
        match self {
            Target::Http(url) | Target::Ws(url) => url,
        }
    }

    /// The same target as a WebSocket URL, for upgrade requests landing on
    /// a preview path.
    fn into_ws_url(self) -> String {
        match self {
            Target::Ws(url) => url,
            Target::Http(url) => match url.strip_prefix("http") {
                Some(rest) => format!("ws{rest}"),
                None => url,
            },
        }
    }
}

/// Build the upstream target for a proxied request. `rest` is the path
/// after the machine id, `raw_query` the untouched query string.
pub fn build_target(ip: &str, rest: &str, raw_query: Option<&str>, port: Option<u16>) -> Target {
    let (is_preview, tail) = match rest.strip_prefix("preview") {
        Some(tail) => (true, tail.trim_start_matches('/')),
        None => (false, rest),
    };
    if is_preview {
        let port = port.unwrap_or(DEFAULT_PREVIEW_PORT);
        let query = strip_port_param(raw_query);
        Target::Http(format!("http://[{ip}]:{port}/{tail}{query}"))
    } else {
        let query = raw_query
            .filter(|q| !q.is_empty())
            .map(|q| format!("?{q}"))
            .unwrap_or_default();
        Target::Ws(format!("ws://[{ip}]:{UPSTREAM_CONTROL_PORT}/{tail}{query}"))
    }
}

/// Drop the routing-only `port` parameter before forwarding the query.
fn strip_port_param(raw_query: Option<&str>) -> String {
    let Some(raw) = raw_query else {
        return String::new();
    };
    let forwarded: Vec<&str> = raw
        .split('&')
        .filter(|pair| !pair.is_empty() && !pair.starts_with("port="))
        .collect();
    if forwarded.is_empty() {
        String::new()
    } else {
        format!("?{}", forwarded.join("&"))
    }
}

pub async fn handler(
    State(state): State<Arc<AgentState>>,
    Path((machine_id, rest)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    ws: Option<WebSocketUpgrade>,
    req: Request,
) -> Response {
    let orchestrator = match state.orchestrator().await {
        Ok(client) => client,
        Err(err) => {
            return failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "orchestrator unavailable",
                &err,
            )
        }
    };
    let ip = match orchestrator.get_machine_ip(&machine_id).await {
        Ok(Some(ip)) => ip,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("unknown machine: {machine_id}") })),
            )
                .into_response()
        }
        Err(err) => {
            return failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "machine lookup failed",
                &err,
            )
        }
    };

    let port = params.get("port").and_then(|p| p.parse().ok());
    let target = build_target(&ip, &rest, req.uri().query(), port);
    debug!(%machine_id, target = target.url(), "proxying request");

    if let Some(ws) = ws {
        let url = target.into_ws_url();
        return ws.on_upgrade(move |socket| bridge(socket, url)).into_response();
    }

    match target {
        Target::Http(url) => forward_http(&state, req, &url).await,
        Target::Ws(_) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "this proxy path requires a WebSocket upgrade" })),
        )
            .into_response(),
    }
}

/// Bidirectional WebSocket bridge. Closing either end closes the other;
/// text and binary framing is preserved.
async fn bridge(client: WebSocket, target_url: String) {
    let (upstream, _) = match connect_async(target_url.as_str()).await {
        Ok(conn) => conn,
        Err(err) => {
            warn!(%target_url, %err, "upstream websocket connect failed");
            let mut client = client;
            let _ = client.close().await;
            return;
        }
    };
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let to_upstream = tokio::spawn(async move {
        while let Some(Ok(msg)) = client_rx.next().await {
            let Some(msg) = client_to_upstream(msg) else {
                continue;
            };
            if upstream_tx.send(msg).await.is_err() {
                break;
            }
        }
        let _ = upstream_tx.close().await;
    });
    let to_client = tokio::spawn(async move {
        while let Some(Ok(msg)) = upstream_rx.next().await {
            let Some(msg) = upstream_to_client(msg) else {
                continue;
            };
            if client_tx.send(msg).await.is_err() {
                break;
            }
        }
        let _ = client_tx.close().await;
    });

    let _ = to_upstream.await;
    let _ = to_client.await;
    debug!(%target_url, "proxy bridge finished");
}

fn client_to_upstream(msg: ClientMessage) -> Option<UpstreamMessage> {
    match msg {
        ClientMessage::Text(text) => Some(UpstreamMessage::Text(text)),
        ClientMessage::Binary(data) => Some(UpstreamMessage::Binary(data)),
        ClientMessage::Ping(data) => Some(UpstreamMessage::Ping(data)),
        ClientMessage::Pong(data) => Some(UpstreamMessage::Pong(data)),
        ClientMessage::Close(frame) => Some(UpstreamMessage::Close(frame.map(|f| {
            UpstreamCloseFrame {
                code: CloseCode::from(f.code),
                reason: f.reason,
            }
        }))),
    }
}

fn upstream_to_client(msg: UpstreamMessage) -> Option<ClientMessage> {
    match msg {
        UpstreamMessage::Text(text) => Some(ClientMessage::Text(text)),
        UpstreamMessage::Binary(data) => Some(ClientMessage::Binary(data)),
        UpstreamMessage::Ping(data) => Some(ClientMessage::Ping(data)),
        UpstreamMessage::Pong(data) => Some(ClientMessage::Pong(data)),
        UpstreamMessage::Close(frame) => Some(ClientMessage::Close(frame.map(|f| CloseFrame {
            code: f.code.into(),
            reason: f.reason,
        }))),
        UpstreamMessage::Frame(_) => None,
    }
}

/// Stream an HTTP preview response back to the caller.
async fn forward_http(state: &Arc<AgentState>, req: Request, url: &str) -> Response {
    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "failed to read request body" })),
            )
                .into_response()
        }
    };

    let mut builder = state.http.request(parts.method, url);
    for (name, value) in parts.headers.iter() {
        if name != header::HOST {
            builder = builder.header(name, value);
        }
    }
    let upstream = match builder.body(bytes).send().await {
        Ok(resp) => resp,
        Err(err) => {
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": "upstream fetch failed", "details": err.to_string() })),
            )
                .into_response()
        }
    };

    let mut response = Response::builder().status(upstream.status());
    for (name, value) in upstream.headers() {
        // reqwest already undid the transfer framing; re-streaming below
        // sets its own.
        if name == header::TRANSFER_ENCODING || name == header::CONNECTION {
            continue;
        }
        response = response.header(name, value);
    }
    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

fn failure(status: StatusCode, error: &str, details: &dyn std::fmt::Display) -> Response {
    (
        status,
        Json(json!({ "error": error, "details": details.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_paths_become_upstream_websockets() {
        let target = build_target("fdaa::1", "rpc", None, None);
        assert_eq!(target, Target::Ws("ws://[fdaa::1]:3000/rpc".to_string()));
    }

    #[test]
    fn preview_paths_use_the_port_parameter() {
        let target = build_target("fdaa::1", "preview/", Some("port=8123"), Some(8123));
        assert_eq!(target, Target::Http("http://[fdaa::1]:8123/".to_string()));
    }

    #[test]
    fn preview_defaults_to_the_dev_server_port() {
        let target = build_target("fdaa::1", "preview/assets/app.js", None, None);
        assert_eq!(
            target,
            Target::Http(format!(
                "http://[fdaa::1]:{DEFAULT_PREVIEW_PORT}/assets/app.js"
            ))
        );
    }

    #[test]
    fn preview_forwards_non_port_query_params() {
        let target = build_target("fdaa::1", "preview/api", Some("port=9000&x=1&y=2"), Some(9000));
        assert_eq!(
            target,
            Target::Http("http://[fdaa::1]:9000/api?x=1&y=2".to_string())
        );
    }

    #[test]
    fn upgrade_on_a_preview_path_switches_scheme() {
        let target = build_target("fdaa::1", "preview/hmr", Some("port=5173"), Some(5173));
        assert_eq!(target.into_ws_url(), "ws://[fdaa::1]:5173/hmr");
    }
}
