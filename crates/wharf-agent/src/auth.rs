//! Bearer-token verification against the external auth service.

use tracing::warn;

#[derive(Debug, Clone)]
pub struct AuthVerifier {
    client: reqwest::Client,
    base_url: String,
}

impl AuthVerifier {
    pub fn new(base_url: impl Into<String>) -> Self {
        AuthVerifier {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Introspect a token. Any transport failure counts as "not verified";
    /// the agent never grants access on an unreachable auth service.
    pub async fn verify(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        let url = format!("{}/verify", self.base_url.trim_end_matches('/'));
        match self.client.get(&url).bearer_auth(token).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                warn!(%err, "token verification request failed");
                false
            }
        }
    }
}
