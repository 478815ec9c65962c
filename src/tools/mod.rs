//! Functions exposed to the hosted agent.
//!
//! Each tool wraps exactly one external dependency and never fails towards
//! its caller: every failure path is turned into a [`ToolOutcome::Failure`]
//! whose rendered text the hosted agent reads like any other result.
//!
//! # Tools
//!
//! - [`GuidelineSearchTool`]: hybrid search over the clinical guideline index
//! - [`WebSearchTool`]: web search through `SerpAPI`
//! - [`PatientLookupTool`]: templated queries over patient records
//! - [`DischargeSummaryTool`]: discharge summary PDF generation
//!
//! The hosted agent chooses tools by reading their parameter schema, so every
//! parameter has to be meaningful on its own.

pub mod discharge;
pub mod guidelines;
pub mod patients;
pub mod web_search;

pub use discharge::DischargeSummaryTool;
pub use guidelines::GuidelineSearchTool;
pub use patients::PatientLookupTool;
pub use web_search::WebSearchTool;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::azure::CredentialError;

/// Why a tool call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// A required credential is not configured; nothing was called.
    MissingCredential,
    /// The arguments did not match the tool's schema.
    InvalidArguments,
    /// The external service failed or answered with an error.
    Upstream,
    /// Local output could not be written.
    Storage,
    /// No tool is registered under the requested name.
    UnknownTool,
}

/// A failed tool call, carrying the text handed back to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ToolFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidArguments, message)
    }
}

/// Result of a tool call before it is rendered for the hosted agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Success(String),
    Failure(ToolFailure),
}

impl ToolOutcome {
    pub fn success(text: impl Into<String>) -> Self {
        Self::Success(text.into())
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure(ToolFailure::new(kind, message))
    }

    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Failure kind, if any.
    #[must_use]
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Success(_) => None,
            Self::Failure(f) => Some(f.kind),
        }
    }

    /// The text submitted to the hosted agent as the tool output.
    #[must_use]
    pub fn render(&self) -> &str {
        match self {
            Self::Success(text) => text,
            Self::Failure(f) => &f.message,
        }
    }
}

impl From<ToolFailure> for ToolOutcome {
    fn from(failure: ToolFailure) -> Self {
        Self::Failure(failure)
    }
}

/// Errors from the HTTP services behind the tools.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("{0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Malformed(String),
}

impl UpstreamError {
    /// Turn a non-success response into [`UpstreamError::Status`].
    pub async fn check(resp: reqwest::Response) -> Result<reqwest::Response, Self> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(Self::Status {
            status: status.as_u16(),
            body,
        })
    }
}

/// A callable function offered to the hosted agent.
#[async_trait]
pub trait AgentTool: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema of the arguments object.
    fn parameters(&self) -> serde_json::Value;
    async fn invoke(&self, args: serde_json::Value) -> ToolOutcome;
}

/// Read a required string argument.
pub fn required_str<'a>(args: &'a serde_json::Value, key: &str) -> Result<&'a str, ToolFailure> {
    args.get(key)
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ToolFailure::invalid_arguments(format!("Missing required argument '{key}'")))
}

/// Read an optional string argument; JSON null reads as absent.
pub fn optional_str<'a>(args: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(serde_json::Value::as_str)
}

/// The capability set handed to the hosted agent.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<BTreeMap<String, Arc<dyn AgentTool>>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool of the same name.
    #[must_use]
    pub fn with_tool(self, tool: Arc<dyn AgentTool>) -> Self {
        let mut tools = (*self.tools).clone();
        tools.insert(tool.name().to_string(), tool);
        Self {
            tools: Arc::new(tools),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Function tool definitions in the hosted agent's schema format.
    pub fn definitions(&self) -> Vec<serde_json::Value> {
        self.tools
            .values()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name(),
                        "description": t.description(),
                        "parameters": t.parameters()
                    }
                })
            })
            .collect()
    }

    /// Run a tool call requested by the hosted agent.
    ///
    /// `arguments` is the raw JSON text the agent produced. Unknown tools and
    /// unparseable arguments come back as failures, never as errors.
    pub async fn dispatch(&self, name: &str, arguments: &str) -> ToolOutcome {
        let Some(tool) = self.tools.get(name) else {
            tracing::warn!(tool = %name, "Agent requested an unknown tool");
            return ToolOutcome::failure(FailureKind::UnknownTool, format!("Unknown tool: {name}"));
        };

        let args = if arguments.trim().is_empty() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            match serde_json::from_str(arguments) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(tool = %name, error = %e, "Unparseable tool arguments");
                    return ToolOutcome::failure(
                        FailureKind::InvalidArguments,
                        format!("Invalid arguments for {name}: {e}"),
                    );
                }
            }
        };

        let outcome = tool.invoke(args).await;
        match &outcome {
            ToolOutcome::Success(text) => {
                tracing::info!(tool = %name, result_length = text.len(), "Tool call succeeded");
            }
            ToolOutcome::Failure(f) => {
                tracing::warn!(tool = %name, kind = ?f.kind, message = %f.message, "Tool call failed");
            }
        }
        outcome
    }
}
