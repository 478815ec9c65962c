//! Construction of every external client, owned by process startup.

use std::sync::Arc;

use url::Url;

use crate::agent::{AgentService, AgentServiceError, AgentsClient, InvocationLoop, ProjectConnection};
use crate::azure::{ManagedIdentityCredential, StaticTokenCredential, TokenCredential};
use crate::config::{AppConfig, SecretsConfig, SecretsProvider, ToolsConfig};
use crate::secrets::{
    EnvSecretStore, KeyVaultSecretStore, SecretError, SecretStore, Secrets, ToolSecrets, names,
};
use crate::session::ThreadRegistry;
use crate::tools::guidelines::{AzureOpenAiEmbedder, AzureSearchIndex};
use crate::tools::patients::PgPatientStore;
use crate::tools::{
    DischargeSummaryTool, GuidelineSearchTool, PatientLookupTool, ToolRegistry, WebSearchTool,
};

#[derive(Debug, thiserror::Error)]
pub enum ServicesError {
    #[error("{0}")]
    Config(String),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error(transparent)]
    Agent(#[from] AgentServiceError),
}

/// Credential for all Azure calls.
///
/// `AZURE_ACCESS_TOKEN` wins for local development; otherwise managed
/// identity, user-assigned when a client id is configured or `AZURE_CLIENT_ID`
/// is set.
pub fn credential(config: &SecretsConfig) -> Arc<dyn TokenCredential> {
    if let Some(token) = std::env::var("AZURE_ACCESS_TOKEN")
        .ok()
        .filter(|t| !t.trim().is_empty())
    {
        tracing::info!("Using static access token from AZURE_ACCESS_TOKEN");
        return Arc::new(StaticTokenCredential::new(token));
    }

    let client_id = config
        .managed_identity_client_id
        .clone()
        .or_else(|| std::env::var("AZURE_CLIENT_ID").ok());
    tracing::info!(user_assigned = client_id.is_some(), "Using managed identity credential");
    Arc::new(ManagedIdentityCredential::new(client_id))
}

pub fn secret_store(
    config: &SecretsConfig,
    credential: Arc<dyn TokenCredential>,
) -> Result<Arc<dyn SecretStore>, ServicesError> {
    match config.provider {
        SecretsProvider::KeyVault => {
            let vault_url = config.vault_url.as_deref().ok_or_else(|| {
                ServicesError::Config(
                    "secrets.vault_url (or KEY_VAULT_NAME) is required for the keyvault provider"
                        .into(),
                )
            })?;
            let vault_url = Url::parse(vault_url).map_err(|e| {
                ServicesError::Config(format!("invalid secrets.vault_url '{vault_url}': {e}"))
            })?;
            tracing::info!(vault_url = %vault_url, "Reading secrets from Key Vault");
            Ok(Arc::new(KeyVaultSecretStore::new(vault_url.as_str(), credential)))
        }
        SecretsProvider::Env => {
            tracing::info!(prefix = %config.env_prefix, "Reading secrets from the environment");
            Ok(Arc::new(EnvSecretStore::new(config.env_prefix.clone())))
        }
    }
}

/// The four tool functions, wired to their backends.
pub fn tool_registry(
    config: &ToolsConfig,
    secrets: &ToolSecrets,
    credential: &Arc<dyn TokenCredential>,
    patients: PgPatientStore,
) -> ToolRegistry {
    let embedder = AzureOpenAiEmbedder::new(
        &secrets.openai_endpoint,
        &secrets.embedding_deployment,
        &config.embedding_api_version,
        Arc::clone(credential),
    );
    let index = AzureSearchIndex::new(
        &secrets.search_endpoint,
        &secrets.search_index_name,
        &config.search_api_version,
        Arc::clone(credential),
    );

    ToolRegistry::new()
        .with_tool(Arc::new(GuidelineSearchTool::new(
            Arc::new(embedder),
            Arc::new(index),
            config.guideline_top_k,
        )))
        .with_tool(Arc::new(WebSearchTool::with_base_url(
            &config.serpapi_base_url,
            secrets.serp_api_key.clone(),
        )))
        .with_tool(Arc::new(PatientLookupTool::new(
            Arc::new(patients),
            config.patient_row_limit,
        )))
        .with_tool(Arc::new(DischargeSummaryTool::new(&config.discharge_dir)))
}

/// Explicitly constructed client set.
#[derive(Debug, Clone)]
pub struct Services {
    pub secret_store: Arc<dyn SecretStore>,
    pub agents: Arc<dyn AgentService>,
    pub tools: ToolRegistry,
    pub patients: PgPatientStore,
}

impl Services {
    fn assemble(
        config: &AppConfig,
        secret_store: Arc<dyn SecretStore>,
        credential: &Arc<dyn TokenCredential>,
        connection_string: &str,
        tool_secrets: &ToolSecrets,
    ) -> Result<Self, ServicesError> {
        let connection = ProjectConnection::parse(connection_string)?;
        let agents: Arc<dyn AgentService> = Arc::new(AgentsClient::new(
            &connection,
            &config.agent.api_version,
            Arc::clone(credential),
        ));
        let patients = PgPatientStore::connect_lazy(&tool_secrets.patient_db);
        let tools = tool_registry(&config.tools, tool_secrets, credential, patients.clone());
        tracing::info!(tools = ?tools.names(), project = %connection.project_name, "Services ready");

        Ok(Self {
            secret_store,
            agents,
            tools,
            patients,
        })
    }

    /// Everything a chat turn needs, with all startup secrets resolved.
    pub async fn for_chat(config: &AppConfig) -> Result<(Self, InvocationLoop), ServicesError> {
        let credential = credential(&config.secrets);
        let store = secret_store(&config.secrets, Arc::clone(&credential))?;
        let secrets = Secrets::resolve(store.as_ref()).await?;

        let services = Self::assemble(
            config,
            store,
            &credential,
            &secrets.project_connection_string,
            &secrets.tools,
        )?;
        let invocation = InvocationLoop::new(
            Arc::clone(&services.agents),
            ThreadRegistry::new(Arc::clone(&services.agents))
                .with_max_users(config.agent.max_tracked_users),
            services.tools.clone(),
            secrets.agent_id,
            config.agent.invocation_settings(),
        );
        Ok((services, invocation))
    }

    /// Clients for maintenance commands, which run before `agent-id` exists.
    pub async fn for_maintenance(config: &AppConfig) -> Result<Self, ServicesError> {
        let credential = credential(&config.secrets);
        let store = secret_store(&config.secrets, Arc::clone(&credential))?;
        let connection_string = store.get_secret(names::AI_PROJECT_CONN_STRING).await?;
        let tool_secrets = ToolSecrets::resolve(store.as_ref()).await?;

        Self::assemble(config, store, &credential, &connection_string, &tool_secrets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets_config(provider: SecretsProvider, vault_url: Option<&str>) -> SecretsConfig {
        SecretsConfig {
            provider,
            vault_url: vault_url.map(str::to_string),
            managed_identity_client_id: None,
            env_prefix: "TEST_".into(),
        }
    }

    #[test]
    fn test_keyvault_requires_url() {
        let cred: Arc<dyn TokenCredential> = Arc::new(StaticTokenCredential::new("t"));
        let err = secret_store(&secrets_config(SecretsProvider::KeyVault, None), cred).unwrap_err();
        assert!(matches!(err, ServicesError::Config(_)));
    }

    #[test]
    fn test_keyvault_url_must_parse() {
        let cred: Arc<dyn TokenCredential> = Arc::new(StaticTokenCredential::new("t"));
        let config = secrets_config(SecretsProvider::KeyVault, Some("not a url"));
        assert!(matches!(secret_store(&config, cred), Err(ServicesError::Config(_))));
    }

    #[test]
    fn test_env_provider_needs_no_url() {
        let cred: Arc<dyn TokenCredential> = Arc::new(StaticTokenCredential::new("t"));
        assert!(secret_store(&secrets_config(SecretsProvider::Env, None), cred).is_ok());
    }

    #[tokio::test]
    async fn test_registry_has_all_four_tools() {
        let cred: Arc<dyn TokenCredential> = Arc::new(StaticTokenCredential::new("t"));
        let secrets = ToolSecrets {
            search_endpoint: "https://search.example".into(),
            search_index_name: "acc-guidelines-index".into(),
            openai_endpoint: "https://aoai.example".into(),
            embedding_deployment: "embedding".into(),
            serp_api_key: None,
            patient_db: crate::secrets::PatientDbSecrets {
                host: "localhost".into(),
                port: 5432,
                database: "clinic".into(),
                username: "reader".into(),
                password: "pw".into(),
            },
        };
        let config = ToolsConfig {
            guideline_top_k: 10,
            discharge_dir: "discharge_summaries".into(),
            serpapi_base_url: "https://serpapi.com".into(),
            search_api_version: "2024-07-01".into(),
            embedding_api_version: "2024-04-01-preview".into(),
            patient_row_limit: 50,
        };

        let patients = PgPatientStore::connect_lazy(&secrets.patient_db);
        let registry = tool_registry(&config, &secrets, &cred, patients);
        assert_eq!(
            registry.names(),
            vec![
                "generate_discharge_summary",
                "lookup_patient_data",
                "search_acc_guidelines",
                "search_serpapi_web"
            ]
        );
    }
}
