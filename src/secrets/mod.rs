//! Secret resolution.
//!
//! Configuration values (connection strings, endpoints, credentials) live in a
//! centralized secret store. They are read once at process start through
//! [`Secrets::resolve`] and trusted for the lifetime of the process; rotating
//! a secret requires a restart.
//!
//! # Stores
//!
//! - [`KeyVaultSecretStore`]: Azure Key Vault over REST
//! - [`EnvSecretStore`]: process environment, for local development and tests

mod env;
mod keyvault;

pub use env::EnvSecretStore;
pub use keyvault::KeyVaultSecretStore;

use async_trait::async_trait;

/// Secret names used by the assistant.
pub mod names {
    pub const AI_PROJECT_CONN_STRING: &str = "ai-project-conn-string";
    pub const AGENT_ID: &str = "agent-id";
    pub const MODEL_DEPLOYMENT_NAME: &str = "model-deployment-name";
    pub const SEARCH_ENDPOINT: &str = "azure-search-endpoint";
    pub const SEARCH_INDEX_NAME: &str = "azureai-search-index-name";
    pub const OPENAI_ENDPOINT: &str = "azure-openai-endpoint";
    pub const EMBEDDING_DEPLOYMENT: &str = "azure-openai-embedding-deployment";
    pub const SERP_API_KEY: &str = "serp-api-key";
    pub const PATIENT_DB_HOST: &str = "patient-db-host";
    pub const PATIENT_DB_PORT: &str = "patient-db-port";
    pub const PATIENT_DB_NAME: &str = "patient-db-name";
    pub const PATIENT_DB_USERNAME: &str = "patient-db-username";
    pub const PATIENT_DB_PASSWORD: &str = "patient-db-password";
}

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret '{0}' not found")]
    NotFound(String),

    #[error("secret store unreachable: {0}")]
    Unreachable(String),

    #[error("secret store rejected request for '{name}' ({status})")]
    Rejected { name: String, status: u16 },

    #[error("invalid value for secret '{name}': {reason}")]
    Invalid { name: String, reason: String },
}

/// Read/write access to a named secret store.
#[async_trait]
pub trait SecretStore: Send + Sync + std::fmt::Debug {
    async fn get_secret(&self, name: &str) -> Result<String, SecretError>;

    async fn set_secret(&self, name: &str, value: &str) -> Result<(), SecretError>;
}

/// Connection details for the patient records database.
#[derive(Clone)]
pub struct PatientDbSecrets {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for PatientDbSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatientDbSecrets")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Secrets the tool functions depend on.
#[derive(Clone)]
pub struct ToolSecrets {
    pub search_endpoint: String,
    pub search_index_name: String,
    pub openai_endpoint: String,
    pub embedding_deployment: String,
    /// `None` when absent or blank; web search then reports the missing key.
    pub serp_api_key: Option<String>,
    pub patient_db: PatientDbSecrets,
}

impl std::fmt::Debug for ToolSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSecrets")
            .field("search_endpoint", &self.search_endpoint)
            .field("search_index_name", &self.search_index_name)
            .field("openai_endpoint", &self.openai_endpoint)
            .field("embedding_deployment", &self.embedding_deployment)
            .field("serp_api_key", &self.serp_api_key.as_ref().map(|_| "<redacted>"))
            .field("patient_db", &self.patient_db)
            .finish()
    }
}

impl ToolSecrets {
    pub async fn resolve(store: &dyn SecretStore) -> Result<Self, SecretError> {
        let port = match optional(store, names::PATIENT_DB_PORT).await? {
            Some(raw) => raw.trim().parse().map_err(|e| SecretError::Invalid {
                name: names::PATIENT_DB_PORT.to_string(),
                reason: format!("{e}"),
            })?,
            None => 5432,
        };

        Ok(Self {
            search_endpoint: store.get_secret(names::SEARCH_ENDPOINT).await?,
            search_index_name: store.get_secret(names::SEARCH_INDEX_NAME).await?,
            openai_endpoint: store.get_secret(names::OPENAI_ENDPOINT).await?,
            embedding_deployment: store.get_secret(names::EMBEDDING_DEPLOYMENT).await?,
            serp_api_key: optional(store, names::SERP_API_KEY).await?,
            patient_db: PatientDbSecrets {
                host: store.get_secret(names::PATIENT_DB_HOST).await?,
                port,
                database: store.get_secret(names::PATIENT_DB_NAME).await?,
                username: store.get_secret(names::PATIENT_DB_USERNAME).await?,
                password: store.get_secret(names::PATIENT_DB_PASSWORD).await?,
            },
        })
    }
}

/// Every secret needed before the first user interaction.
#[derive(Clone)]
pub struct Secrets {
    pub project_connection_string: String,
    pub agent_id: String,
    pub tools: ToolSecrets,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("agent_id", &self.agent_id)
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}

impl Secrets {
    /// Resolve all startup secrets. Any missing required secret is an error.
    pub async fn resolve(store: &dyn SecretStore) -> Result<Self, SecretError> {
        let secrets = Self {
            project_connection_string: store.get_secret(names::AI_PROJECT_CONN_STRING).await?,
            agent_id: store.get_secret(names::AGENT_ID).await?,
            tools: ToolSecrets::resolve(store).await?,
        };

        tracing::info!(
            agent_id = %secrets.agent_id,
            search_index = %secrets.tools.search_index_name,
            serp_api_key_present = secrets.tools.serp_api_key.is_some(),
            "Secrets resolved"
        );

        Ok(secrets)
    }
}

/// Absent and blank secrets both read as `None`.
async fn optional(store: &dyn SecretStore, name: &str) -> Result<Option<String>, SecretError> {
    match store.get_secret(name).await {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(SecretError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}
