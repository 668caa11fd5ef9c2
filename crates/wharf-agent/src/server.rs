//! Server composition and lifecycle.

use std::sync::Arc;

use anyhow::Context;
use axum::http::{header, Method};
use axum::routing::{any, get, post};
use axum::Router;
use serde_json::json;
use tokio::sync::{broadcast, OnceCell};
use tower_http::cors::{Any as AnyOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::AuthVerifier;
use crate::config::Config;
use crate::orchestrator::{OrchestratorClient, OrchestratorError};
use crate::ports::{PortChange, PortScanner};
use crate::process::ProcessSupervisor;
use crate::registry::{self, Connections};
use crate::watch::WatcherRegistry;
use crate::{mux, proxy, rest};

pub struct AgentState {
    pub config: Config,
    pub connections: Arc<Connections>,
    pub processes: Arc<ProcessSupervisor>,
    pub watchers: Arc<WatcherRegistry>,
    pub auth: AuthVerifier,
    /// Shared client for proxied preview fetches.
    pub http: reqwest::Client,
    orchestrator: OnceCell<OrchestratorClient>,
}

impl AgentState {
    pub fn new(config: Config) -> Arc<Self> {
        let connections: Arc<Connections> = Arc::new(Connections::new());
        let processes = Arc::new(ProcessSupervisor::new(
            connections.clone(),
            config.pty_helper.clone(),
            config.coep.clone(),
        ));
        let watchers = Arc::new(WatcherRegistry::new(
            connections.clone(),
            config.workspace.clone(),
            config.stability_threshold,
            config.poll_interval,
        ));
        let auth = AuthVerifier::new(config.auth_server_url.clone());
        Arc::new(AgentState {
            config,
            connections,
            processes,
            watchers,
            auth,
            http: reqwest::Client::new(),
            orchestrator: OnceCell::new(),
        })
    }

    /// The orchestrator client, created on first use so the agent can come
    /// up before the control plane is reachable.
    pub async fn orchestrator(&self) -> Result<&OrchestratorClient, OrchestratorError> {
        self.orchestrator
            .get_or_try_init(|| async { OrchestratorClient::new(&self.config.orchestrator) })
            .await
    }

    pub fn shutdown(&self) {
        self.processes.kill_all();
        self.watchers.clear();
        self.connections.clear();
    }
}

pub fn build_router(state: Arc<AgentState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AnyOrigin)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    let api = Router::new()
        .route("/api/machine", post(rest::create_machine))
        .route("/api/machine/:id", get(rest::get_machine))
        .layer(cors);

    Router::new()
        .route("/", get(mux::ws_handler))
        .route("/health", get(rest::health))
        .route("/proxy/:machine_id/*rest", any(proxy::handler))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Launch the port scanner and the task translating its deltas into
/// broadcast `port` events carrying a preview URL.
pub fn spawn_port_events(state: Arc<AgentState>) -> tokio::task::JoinHandle<()> {
    let mut excluded = state.config.excluded_ports.clone();
    excluded.push(state.config.port);
    let scanner = PortScanner::new(state.config.scan_interval, excluded);
    let mut events = scanner.subscribe();
    let _scan_task = scanner.spawn();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let kind = match event.change {
                        PortChange::Opened => "open",
                        PortChange::Closed => "close",
                    };
                    let payload = json!({
                        "type": "port",
                        "data": {
                            "port": event.port,
                            "type": kind,
                            "url": state.config.preview_url(event.port),
                        }
                    });
                    registry::broadcast(&state.connections, &payload.to_string());
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let state = AgentState::new(config);
    let _port_events = spawn_port_events(state.clone());

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, workspace = %state.config.workspace.display(), "agent listening");

    let app = build_router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    state.shutdown();
    Ok(())
}
