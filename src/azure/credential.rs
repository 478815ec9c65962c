use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;

/// Instance metadata endpoint for managed identity tokens.
const IMDS_TOKEN_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";

/// Tokens are refreshed this long before they expire.
const REFRESH_SKEW_MINUTES: i64 = 5;

/// A bearer token and its expiry.
#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

impl AccessToken {
    fn is_fresh(&self) -> bool {
        self.expires_on - Duration::minutes(REFRESH_SKEW_MINUTES) > Utc::now()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("token endpoint unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),

    #[error("token endpoint rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("malformed token response: {0}")]
    Malformed(String),
}

/// Source of bearer tokens for a given OAuth scope.
#[async_trait]
pub trait TokenCredential: Send + Sync + std::fmt::Debug {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError>;
}

/// A fixed token, used for local development (`AZURE_ACCESS_TOKEN`).
#[derive(Clone)]
pub struct StaticTokenCredential {
    token: String,
}

impl std::fmt::Debug for StaticTokenCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenCredential").finish_non_exhaustive()
    }
}

impl StaticTokenCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenCredential for StaticTokenCredential {
    async fn get_token(&self, _scope: &str) -> Result<AccessToken, CredentialError> {
        Ok(AccessToken {
            token: self.token.clone(),
            expires_on: Utc::now() + Duration::hours(1),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ImdsTokenResponse {
    access_token: String,
    /// Seconds since the epoch, sent as a string.
    expires_on: String,
}

/// Managed identity tokens from the instance metadata service.
///
/// When a client id is configured the user-assigned identity is requested
/// explicitly; otherwise the system-assigned identity is used. Tokens are
/// cached per resource.
#[derive(Clone)]
pub struct ManagedIdentityCredential {
    http: reqwest::Client,
    endpoint: String,
    client_id: Option<String>,
    cache: Arc<Mutex<HashMap<String, AccessToken>>>,
}

impl std::fmt::Debug for ManagedIdentityCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedIdentityCredential")
            .field("endpoint", &self.endpoint)
            .field("client_id", &self.client_id)
            .finish()
    }
}

impl ManagedIdentityCredential {
    #[must_use]
    pub fn new(client_id: Option<String>) -> Self {
        Self::with_endpoint(IMDS_TOKEN_ENDPOINT, client_id)
    }

    #[must_use]
    pub fn with_endpoint(endpoint: impl Into<String>, client_id: Option<String>) -> Self {
        Self {
            http: crate::http::client(),
            endpoint: endpoint.into(),
            client_id: client_id.filter(|id| !id.trim().is_empty()),
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// `https://vault.azure.net/.default` -> `https://vault.azure.net`
    fn resource_for_scope(scope: &str) -> &str {
        scope.trim_end_matches("/.default")
    }

    async fn fetch(&self, resource: &str) -> Result<AccessToken, CredentialError> {
        let mut query = vec![
            ("api-version", IMDS_API_VERSION),
            ("resource", resource),
        ];
        if let Some(client_id) = &self.client_id {
            query.push(("client_id", client_id.as_str()));
        }

        let resp = self
            .http
            .get(&self.endpoint)
            .header("Metadata", "true")
            .query(&query)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CredentialError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ImdsTokenResponse = resp.json().await?;
        let seconds: i64 = parsed
            .expires_on
            .parse()
            .map_err(|e| CredentialError::Malformed(format!("expires_on: {e}")))?;
        let expires_on = DateTime::from_timestamp(seconds, 0)
            .ok_or_else(|| CredentialError::Malformed(format!("expires_on out of range: {seconds}")))?;

        Ok(AccessToken {
            token: parsed.access_token,
            expires_on,
        })
    }
}

#[async_trait]
impl TokenCredential for ManagedIdentityCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let resource = Self::resource_for_scope(scope);

        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.get(resource)
            && token.is_fresh()
        {
            return Ok(token.clone());
        }

        tracing::debug!(resource = %resource, "Requesting managed identity token");
        let token = self.fetch(resource).await?;
        cache.insert(resource.to_string(), token.clone());
        Ok(token)
    }
}
