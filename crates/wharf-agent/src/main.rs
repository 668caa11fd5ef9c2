use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use wharf_agent::config::{
    Config, OrchestratorConfig, DEFAULT_AUTH_SERVER_URL, DEFAULT_FLY_API_HOST, DEFAULT_PORT,
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_SCAN_INTERVAL_MS, DEFAULT_STABILITY_THRESHOLD_MS,
};

#[derive(Parser)]
#[command(name = "wharf-agent")]
#[command(about = "Workspace agent: WebSocket control channel and machine proxy")]
#[command(version)]
struct Cli {
    /// Host to bind to
    #[arg(long, env = "WHARF_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "WHARF_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Directory all filesystem operations are confined to
    #[arg(short, long, env = "WHARF_WORKSPACE", default_value = "/workspace")]
    workspace: PathBuf,

    /// Port scan interval in milliseconds
    #[arg(long, env = "WHARF_SCAN_INTERVAL_MS", default_value_t = DEFAULT_SCAN_INTERVAL_MS)]
    scan_interval_ms: u64,

    /// Extra ports hidden from port events (comma separated)
    #[arg(long, env = "WHARF_EXCLUDED_PORTS", value_delimiter = ',')]
    excluded_ports: Vec<u16>,

    /// Settle window before a file change is reported, in milliseconds
    #[arg(long, env = "WHARF_STABILITY_MS", default_value_t = DEFAULT_STABILITY_THRESHOLD_MS)]
    stability_ms: u64,

    /// Watcher settle poll interval in milliseconds
    #[arg(long, env = "WHARF_POLL_MS", default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    poll_ms: u64,

    /// Override the PTY helper binary location
    #[arg(long, env = "WHARF_PTY_HELPER")]
    pty_helper: Option<PathBuf>,

    /// COEP value handed to spawned children
    #[arg(long, env = "COEP", default_value = "credentialless")]
    coep: String,

    /// Token introspection endpoint base URL
    #[arg(long, env = "AUTH_SERVER_URL", default_value = DEFAULT_AUTH_SERVER_URL)]
    auth_server_url: String,

    /// Public edge host used in preview URLs
    #[arg(long, env = "APP_HOST", default_value = "localhost")]
    app_host: String,

    /// This machine's id, as assigned by the orchestrator
    #[arg(long, env = "FLY_MACHINE_ID", default_value = "")]
    machine_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Config {
        host: cli.host,
        port: cli.port,
        workspace: cli.workspace,
        scan_interval: Duration::from_millis(cli.scan_interval_ms),
        excluded_ports: cli.excluded_ports,
        stability_threshold: Duration::from_millis(cli.stability_ms),
        poll_interval: Duration::from_millis(cli.poll_ms),
        pty_helper: cli.pty_helper,
        coep: cli.coep,
        auth_server_url: cli.auth_server_url,
        app_host: cli.app_host,
        machine_id: cli.machine_id,
        orchestrator: OrchestratorConfig {
            api_host: std::env::var("FLY_API_HOST")
                .unwrap_or_else(|_| DEFAULT_FLY_API_HOST.to_string()),
            api_token: std::env::var("FLY_API_TOKEN").ok(),
            app_name: std::env::var("FLY_APP_NAME").ok(),
            image_ref: std::env::var("FLY_IMAGE_REF").ok(),
        },
    };

    wharf_agent::run(config).await
}
