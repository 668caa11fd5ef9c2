//! Agent configuration.
//!
//! Everything is resolved once at startup, from CLI flags and environment
//! variables in `main`, or constructed directly by tests.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_SCAN_INTERVAL_MS: u64 = 2000;
pub const DEFAULT_STABILITY_THRESHOLD_MS: u64 = 300;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_PREVIEW_PORT: u16 = 5174;
pub const DEFAULT_AUTH_SERVER_URL: &str = "http://localhost:4000";
pub const DEFAULT_FLY_API_HOST: &str = "https://api.machines.dev";

/// Container-install location tried first when resolving the PTY helper.
pub const PTY_HELPER_SYSTEM_PATH: &str = "/usr/local/bin/wharf-pty";
/// Fallback relative to the agent's current working directory.
pub const PTY_HELPER_LOCAL_PATH: &str = "wharf-pty";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// All filesystem operations are confined to this directory.
    pub workspace: PathBuf,

    pub scan_interval: Duration,
    /// Ports never reported by the scanner, on top of the agent's own port.
    pub excluded_ports: Vec<u16>,

    pub stability_threshold: Duration,
    pub poll_interval: Duration,

    /// Overrides the fixed-then-relative PTY helper lookup.
    pub pty_helper: Option<PathBuf>,
    /// Value of the COEP variable injected into spawned children.
    pub coep: String,

    pub auth_server_url: String,

    /// Public edge host used when building preview URLs for port events.
    pub app_host: String,
    /// This agent's own machine id (`FLY_MACHINE_ID`).
    pub machine_id: String,

    pub orchestrator: OrchestratorConfig,
}

/// Credentials and coordinates for the machine orchestrator API.
/// `api_token`/`app_name` stay optional: the client is initialized lazily
/// and only the REST and proxy surfaces need it.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub api_host: String,
    pub api_token: Option<String>,
    pub app_name: Option<String>,
    pub image_ref: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            workspace: PathBuf::from("/workspace"),
            scan_interval: Duration::from_millis(DEFAULT_SCAN_INTERVAL_MS),
            excluded_ports: Vec::new(),
            stability_threshold: Duration::from_millis(DEFAULT_STABILITY_THRESHOLD_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            pty_helper: None,
            coep: "credentialless".to_string(),
            auth_server_url: DEFAULT_AUTH_SERVER_URL.to_string(),
            app_host: "localhost".to_string(),
            machine_id: String::new(),
            orchestrator: OrchestratorConfig {
                api_host: DEFAULT_FLY_API_HOST.to_string(),
                api_token: None,
                app_name: None,
                image_ref: None,
            },
        }
    }
}

impl Config {
    /// Preview URL advertised alongside port-open events.
    pub fn preview_url(&self, port: u16) -> String {
        format!(
            "https://{}/proxy/{}/preview/?port={}",
            self.app_host, self.machine_id, port
        )
    }
}
