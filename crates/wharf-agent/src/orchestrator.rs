//! Machine orchestrator client.
//!
//! Thin wrapper over the control-plane REST API that creates machines and
//! resolves machine ids to their private IPv6 addresses. Initialized
//! lazily behind a `OnceCell` so the agent can start serving before the
//! orchestrator is reachable.

use serde_json::{json, Value};
use thiserror::Error;

use crate::config::OrchestratorConfig;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestrator is not configured: {0}")]
    NotConfigured(String),
    #[error("orchestrator request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("orchestrator returned {status}: {body}")]
    Api { status: u16, body: String },
}

pub struct OrchestratorClient {
    client: reqwest::Client,
    api_host: String,
    api_token: String,
    app_name: String,
    image_ref: Option<String>,
}

impl OrchestratorClient {
    pub fn new(config: &OrchestratorConfig) -> Result<Self, OrchestratorError> {
        let api_token = config
            .api_token
            .clone()
            .ok_or_else(|| OrchestratorError::NotConfigured("FLY_API_TOKEN is not set".into()))?;
        let app_name = config
            .app_name
            .clone()
            .ok_or_else(|| OrchestratorError::NotConfigured("FLY_APP_NAME is not set".into()))?;
        Ok(OrchestratorClient {
            client: reqwest::Client::new(),
            api_host: config.api_host.trim_end_matches('/').to_string(),
            api_token,
            app_name,
            image_ref: config.image_ref.clone(),
        })
    }

    fn machines_url(&self) -> String {
        format!("{}/v1/apps/{}/machines", self.api_host, self.app_name)
    }

    /// Create a workspace machine. The user token rides along in the
    /// machine environment so the new agent can call back into the auth
    /// service on behalf of its owner.
    pub async fn create_machine(&self, user_token: &str) -> Result<String, OrchestratorError> {
        let image = self.image_ref.clone().ok_or_else(|| {
            OrchestratorError::NotConfigured("FLY_IMAGE_REF is not set".into())
        })?;
        let body = json!({
            "config": {
                "image": image,
                "env": { "USER_TOKEN": user_token },
            }
        });
        let resp = self
            .client
            .post(self.machines_url())
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(OrchestratorError::Api {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        let machine: Value = resp.json().await?;
        machine["id"]
            .as_str()
            .map(str::to_string)
            .ok_or(OrchestratorError::Api {
                status: status.as_u16(),
                body: "machine response is missing an id".to_string(),
            })
    }

    /// Fetch a machine's full status record. `None` means the orchestrator
    /// does not know the id.
    pub async fn get_machine_status(
        &self,
        machine_id: &str,
    ) -> Result<Option<Value>, OrchestratorError> {
        let resp = self
            .client
            .get(format!("{}/{}", self.machines_url(), machine_id))
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(OrchestratorError::Api {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(Some(resp.json().await?))
    }

    /// Resolve a machine id to its private IPv6 address.
    pub async fn get_machine_ip(
        &self,
        machine_id: &str,
    ) -> Result<Option<String>, OrchestratorError> {
        let machine = match self.get_machine_status(machine_id).await? {
            Some(m) => m,
            None => return Ok(None),
        };
        Ok(machine["private_ip"].as_str().map(str::to_string))
    }
}
