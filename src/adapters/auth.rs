use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::errors::{OracleError, OracleResult};

/// Token refresh happens this long before the reported expiry.
const TOKEN_EXPIRY_BUFFER: Duration = Duration::from_secs(300);

/// Authentication configuration variants for data sources
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AuthConfig {
    None,
    ApiKey {
        header_name: String,
        api_key: String,
    },
    Oauth2 {
        token_url: String,
        client_id: String,
        client_secret: String,
        #[serde(default)]
        scope: String,
    },
    /// Client certificates are applied at connection level, not as headers.
    ClientCert {
        cert_path: String,
        key_path: String,
    },
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Resolves request headers for the configured authentication method,
/// caching OAuth tokens until shortly before they expire.
pub struct AuthHandler {
    config: AuthConfig,
    http_client: reqwest::Client,
    token_cache: Mutex<HashMap<String, CachedToken>>,
}

impl AuthHandler {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            http_client: reqwest::Client::new(),
            token_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Get authentication headers for the next request.
    pub async fn auth_headers(&self) -> OracleResult<Vec<(String, String)>> {
        match &self.config {
            AuthConfig::None | AuthConfig::ClientCert { .. } => Ok(Vec::new()),
            AuthConfig::ApiKey {
                header_name,
                api_key,
            } => Ok(vec![(header_name.clone(), api_key.clone())]),
            AuthConfig::Oauth2 { .. } => {
                let token = self.oauth_token().await?;
                Ok(vec![("Authorization".to_string(), format!("Bearer {}", token))])
            }
        }
    }

    async fn oauth_token(&self) -> OracleResult<String> {
        let (token_url, client_id, client_secret, scope) = match &self.config {
            AuthConfig::Oauth2 {
                token_url,
                client_id,
                client_secret,
                scope,
            } => (token_url, client_id, client_secret, scope),
            _ => {
                return Err(OracleError::Auth(
                    "OAuth token requested for non-OAuth source".to_string(),
                ))
            }
        };

        {
            let cache = self.token_cache.lock().await;
            if let Some(cached) = cache.get(client_id) {
                if cached.expires_at.saturating_duration_since(Instant::now())
                    > TOKEN_EXPIRY_BUFFER
                {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        debug!("Refreshing OAuth token for client {}", client_id);

        let response = self
            .http_client
            .post(token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("scope", scope.as_str()),
            ])
            .send()
            .await
            .map_err(|e| OracleError::Auth(format!("OAuth token request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(OracleError::Auth(format!(
                "OAuth token request failed with status {}",
                response.status()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Auth(format!("Malformed OAuth token response: {}", e)))?;

        let access_token = token.access_token.clone();
        {
            let mut cache = self.token_cache.lock().await;
            cache.insert(
                client_id.clone(),
                CachedToken {
                    access_token: token.access_token,
                    expires_at: Instant::now() + Duration::from_secs(token.expires_in),
                },
            );
        }

        Ok(access_token)
    }
}
