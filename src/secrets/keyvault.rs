use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use super::{SecretError, SecretStore};
use crate::azure::TokenCredential;

const KEYVAULT_SCOPE: &str = "https://vault.azure.net/.default";
const KEYVAULT_API_VERSION: &str = "7.4";

#[derive(Debug, Deserialize)]
struct SecretBundle {
    value: String,
}

/// Azure Key Vault secrets over the data-plane REST API.
#[derive(Debug, Clone)]
pub struct KeyVaultSecretStore {
    http: reqwest::Client,
    vault_url: String,
    credential: Arc<dyn TokenCredential>,
}

impl KeyVaultSecretStore {
    pub fn new(vault_url: impl Into<String>, credential: Arc<dyn TokenCredential>) -> Self {
        Self {
            http: crate::http::client(),
            vault_url: vault_url.into().trim_end_matches('/').to_string(),
            credential,
        }
    }

    fn secret_url(&self, name: &str) -> String {
        format!("{}/secrets/{name}", self.vault_url)
    }

    async fn bearer(&self) -> Result<String, SecretError> {
        self.credential
            .get_token(KEYVAULT_SCOPE)
            .await
            .map(|t| t.token)
            .map_err(|e| SecretError::Unreachable(e.to_string()))
    }
}

#[async_trait]
impl SecretStore for KeyVaultSecretStore {
    async fn get_secret(&self, name: &str) -> Result<String, SecretError> {
        let token = self.bearer().await?;
        let resp = self
            .http
            .get(self.secret_url(name))
            .query(&[("api-version", KEYVAULT_API_VERSION)])
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| SecretError::Unreachable(e.to_string()))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(SecretError::NotFound(name.to_string())),
            status if !status.is_success() => Err(SecretError::Rejected {
                name: name.to_string(),
                status: status.as_u16(),
            }),
            _ => {
                let bundle: SecretBundle = resp
                    .json()
                    .await
                    .map_err(|e| SecretError::Unreachable(e.to_string()))?;
                tracing::debug!(secret = %name, "Fetched secret from Key Vault");
                Ok(bundle.value)
            }
        }
    }

    async fn set_secret(&self, name: &str, value: &str) -> Result<(), SecretError> {
        let token = self.bearer().await?;
        let resp = self
            .http
            .put(self.secret_url(name))
            .query(&[("api-version", KEYVAULT_API_VERSION)])
            .bearer_auth(token)
            .json(&serde_json::json!({ "value": value }))
            .send()
            .await
            .map_err(|e| SecretError::Unreachable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SecretError::Rejected {
                name: name.to_string(),
                status: status.as_u16(),
            });
        }

        tracing::info!(secret = %name, "Stored secret in Key Vault");
        Ok(())
    }
}
