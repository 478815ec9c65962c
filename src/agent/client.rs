//! REST client for the hosted agent service.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use super::{
    Agent, AgentDefinition, AgentService, AgentServiceError, MessageRole, Run, ThreadMessage,
    ToolOutput,
};
use crate::azure::TokenCredential;

pub const DEFAULT_API_VERSION: &str = "2024-12-01-preview";
const AGENTS_SCOPE: &str = "https://ml.azure.com/.default";
/// Largest page the service returns when listing.
const PAGE_LIMIT: &str = "100";

/// A parsed project connection string: `<host>;<subscription>;<resource-group>;<project>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectConnection {
    pub host: String,
    pub subscription_id: String,
    pub resource_group: String,
    pub project_name: String,
}

impl ProjectConnection {
    pub fn parse(raw: &str) -> Result<Self, AgentServiceError> {
        let parts: Vec<&str> = raw.trim().split(';').map(str::trim).collect();
        match parts.as_slice() {
            [host, sub, rg, project]
                if [host, sub, rg, project].iter().all(|p| !p.is_empty()) =>
            {
                Ok(Self {
                    host: (*host).to_string(),
                    subscription_id: (*sub).to_string(),
                    resource_group: (*rg).to_string(),
                    project_name: (*project).to_string(),
                })
            }
            _ => Err(AgentServiceError::InvalidConnectionString(format!(
                "expected 4 ';'-separated non-empty parts, got {}",
                parts.len()
            ))),
        }
    }

    /// Base URL of the project's agents endpoint.
    pub fn endpoint(&self) -> String {
        format!(
            "https://{}/agents/v1.0/subscriptions/{}/resourceGroups/{}/providers/Microsoft.MachineLearningServices/workspaces/{}",
            self.host, self.subscription_id, self.resource_group, self.project_name
        )
    }
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    data: Vec<T>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    last_id: Option<String>,
}

/// [`AgentService`] over HTTPS.
#[derive(Debug, Clone)]
pub struct AgentsClient {
    http: reqwest::Client,
    endpoint: String,
    api_version: String,
    credential: Arc<dyn TokenCredential>,
}

impl AgentsClient {
    pub fn new(
        connection: &ProjectConnection,
        api_version: impl Into<String>,
        credential: Arc<dyn TokenCredential>,
    ) -> Self {
        Self::with_endpoint(connection.endpoint(), api_version, credential)
    }

    pub fn with_endpoint(
        endpoint: impl Into<String>,
        api_version: impl Into<String>,
        credential: Arc<dyn TokenCredential>,
    ) -> Self {
        Self {
            http: crate::http::client(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_version: api_version.into(),
            credential,
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<serde_json::Value>,
    ) -> Result<T, AgentServiceError> {
        let token = self.credential.get_token(AGENTS_SCOPE).await?;
        let url = format!("{}{path}", self.endpoint);

        let mut req = self
            .http
            .request(method.clone(), &url)
            .query(&[("api-version", self.api_version.as_str())])
            .query(query)
            .bearer_auth(token.token);
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(%method, path, status = status.as_u16(), "Agent service request failed");
            return Err(AgentServiceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| AgentServiceError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl AgentService for AgentsClient {
    async fn create_thread(&self) -> Result<String, AgentServiceError> {
        let thread: IdOnly = self
            .call(Method::POST, "/threads", &[], Some(json!({})))
            .await?;
        Ok(thread.id)
    }

    async fn create_message(
        &self,
        thread_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<ThreadMessage, AgentServiceError> {
        self.call(
            Method::POST,
            &format!("/threads/{thread_id}/messages"),
            &[],
            Some(json!({ "role": role, "content": content })),
        )
        .await
    }

    async fn create_run(
        &self,
        thread_id: &str,
        agent_id: &str,
        tools: &[serde_json::Value],
    ) -> Result<Run, AgentServiceError> {
        self.call(
            Method::POST,
            &format!("/threads/{thread_id}/runs"),
            &[],
            Some(json!({ "assistant_id": agent_id, "tools": tools })),
        )
        .await
    }

    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<Run, AgentServiceError> {
        self.call(
            Method::GET,
            &format!("/threads/{thread_id}/runs/{run_id}"),
            &[],
            None,
        )
        .await
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<Run, AgentServiceError> {
        self.call(
            Method::POST,
            &format!("/threads/{thread_id}/runs/{run_id}/submit_tool_outputs"),
            &[],
            Some(json!({ "tool_outputs": outputs })),
        )
        .await
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<Run, AgentServiceError> {
        self.call(
            Method::POST,
            &format!("/threads/{thread_id}/runs/{run_id}/cancel"),
            &[],
            None,
        )
        .await
    }

    async fn list_messages(
        &self,
        thread_id: &str,
        run_id: Option<&str>,
    ) -> Result<Vec<ThreadMessage>, AgentServiceError> {
        let path = format!("/threads/{thread_id}/messages");
        let mut messages = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let mut query = vec![("order", "desc"), ("limit", PAGE_LIMIT)];
            if let Some(run_id) = run_id {
                query.push(("run_id", run_id));
            }
            if let Some(cursor) = after.as_deref() {
                query.push(("after", cursor));
            }
            let page: ListResponse<ThreadMessage> =
                self.call(Method::GET, &path, &query, None).await?;

            let cursor = page
                .last_id
                .or_else(|| page.data.last().map(|m| m.id.clone()));
            let empty = page.data.is_empty();
            messages.extend(page.data);
            match cursor {
                Some(cursor) if page.has_more && !empty && after.as_ref() != Some(&cursor) => {
                    after = Some(cursor);
                }
                _ => break,
            }
        }
        Ok(messages)
    }

    async fn create_agent(&self, definition: &AgentDefinition) -> Result<Agent, AgentServiceError> {
        let body =
            serde_json::to_value(definition).map_err(|e| AgentServiceError::Malformed(e.to_string()))?;
        self.call(Method::POST, "/assistants", &[], Some(body)).await
    }
}
