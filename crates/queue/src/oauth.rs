//! OAuth2 refresh-token exchange over HTTP.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use engine::auth::{RefreshedToken, TokenRefresher};
use engine::EngineError;

pub struct HttpTokenRefresher {
    client: reqwest::Client,
}

impl HttpTokenRefresher {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for HttpTokenRefresher {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Token lifetime assumed when the provider doesn't say.
const DEFAULT_EXPIRES_IN: i64 = 3600;

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, fields: &HashMap<String, String>) -> Result<RefreshedToken, EngineError> {
        let field = |name: &str| {
            fields
                .get(name)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| EngineError::Credential(format!("oauth2 credential has no {name}")))
        };
        let token_uri = field("token_uri")?;
        let refresh_token = field("refresh_token")?;

        let mut form = vec![("grant_type", "refresh_token"), ("refresh_token", refresh_token.as_str())];
        for name in ["client_id", "client_secret", "scope"] {
            if let Some(value) = fields.get(name).filter(|v| !v.is_empty()) {
                form.push((name, value.as_str()));
            }
        }

        let response = self
            .client
            .post(token_uri)
            .form(&form)
            .send()
            .await
            .map_err(|e| EngineError::Credential(format!("token refresh request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Credential(format!("token endpoint answered {status}")));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Credential(format!("unreadable token response: {e}")))?;
        debug!(%token_uri, "Exchanged refresh token");

        Ok(RefreshedToken {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: Utc::now().timestamp() + token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN),
        })
    }
}
