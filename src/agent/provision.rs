//! One-time creation of the hosted agent.

use std::path::Path;

use super::{AgentDefinition, AgentService};
use crate::secrets::{SecretStore, names};
use crate::tools::ToolRegistry;

pub const DEFAULT_AGENT_NAME: &str = "healthcare_agent";

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("failed to read instructions from {path}: {source}")]
    Instructions {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("instructions file {0} is empty")]
    EmptyInstructions(String),

    #[error(transparent)]
    Secret(#[from] crate::secrets::SecretError),

    #[error(transparent)]
    Service(#[from] super::AgentServiceError),
}

/// Read the agent instructions, rejecting empty files.
pub async fn read_instructions(path: &Path) -> Result<String, ProvisionError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ProvisionError::Instructions {
            path: path.display().to_string(),
            source,
        })?;
    if text.trim().is_empty() {
        return Err(ProvisionError::EmptyInstructions(path.display().to_string()));
    }
    Ok(text)
}

/// Create the agent with the registry's tools and store its id as `agent-id`.
#[tracing::instrument(skip(service, store, tools, instructions))]
pub async fn provision_agent(
    service: &dyn AgentService,
    store: &dyn SecretStore,
    tools: &ToolRegistry,
    name: &str,
    instructions: String,
) -> Result<String, ProvisionError> {
    let model = store.get_secret(names::MODEL_DEPLOYMENT_NAME).await?;

    let agent = service
        .create_agent(&AgentDefinition {
            model,
            name: name.to_string(),
            instructions,
            tools: tools.definitions(),
        })
        .await?;
    tracing::info!(agent_id = %agent.id, tools = ?tools.names(), "Created agent");

    store.set_secret(names::AGENT_ID, &agent.id).await?;
    Ok(agent.id)
}
