//! Refresh-token grant against the Twitch token endpoint.

use std::time::Duration;

use {
    async_trait::async_trait,
    pollcast_config::TwitchConfig,
    pollcast_polls::provider::{ProviderError, ProviderResult, TokenPair, TokenRefresher},
    reqwest::StatusCode,
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    tracing::{info, warn},
};

use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: Vec<String>,
}

pub struct TwitchTokenRefresher {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: Secret<String>,
}

impl TwitchTokenRefresher {
    pub fn new(config: &TwitchConfig) -> Result<Self> {
        let client_id = config
            .client_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or(Error::MissingClientId)?;
        let client_secret = config
            .client_secret
            .clone()
            .ok_or(Error::MissingClientSecret)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            token_url: config.token_url.clone(),
            client_id,
            client_secret,
        })
    }
}

#[async_trait]
impl TokenRefresher for TwitchTokenRefresher {
    async fn refresh(&self, refresh_token: &Secret<String>) -> ProviderResult<TokenPair> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.expose_secret().as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret().as_str()),
        ];
        let response = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        // an invalid or revoked refresh token comes back as 400
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            warn!(status = status.as_u16(), "refresh token rejected");
            return Err(ProviderError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        info!(expires_in = ?tokens.expires_in, "access token refreshed");
        Ok(TokenPair {
            access_token: Secret::new(tokens.access_token),
            refresh_token: Secret::new(tokens.refresh_token),
            scopes: tokens.scope,
            expires_in: tokens.expires_in,
        })
    }
}
