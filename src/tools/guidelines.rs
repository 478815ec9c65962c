//! Hybrid (lexical + vector) search over the clinical guideline index.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{AgentTool, FailureKind, ToolOutcome, UpstreamError, required_str};
use crate::azure::TokenCredential;

const COGNITIVE_SERVICES_SCOPE: &str = "https://cognitiveservices.azure.com/.default";
const SEARCH_SCOPE: &str = "https://search.azure.com/.default";

/// Field holding the passage text.
const CONTENT_FIELD: &str = "content";
/// Field holding the passage embedding.
const VECTOR_FIELD: &str = "content_vector";

pub const NO_GUIDELINES: &str = "No relevant guidelines found.";

/// Text embedding for search queries.
#[async_trait]
pub trait Embedder: Send + Sync + std::fmt::Debug {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, UpstreamError>;
}

/// A managed document index answering hybrid queries.
#[async_trait]
pub trait SearchIndex: Send + Sync + std::fmt::Debug {
    /// Ranked passage contents for the query.
    async fn hybrid_search(
        &self,
        text: &str,
        vector: Vec<f32>,
        top_k: usize,
    ) -> Result<Vec<String>, UpstreamError>;
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

/// Azure `OpenAI` embeddings deployment.
#[derive(Debug, Clone)]
pub struct AzureOpenAiEmbedder {
    http: reqwest::Client,
    endpoint: String,
    deployment: String,
    api_version: String,
    credential: Arc<dyn TokenCredential>,
}

impl AzureOpenAiEmbedder {
    pub fn new(
        endpoint: impl Into<String>,
        deployment: impl Into<String>,
        api_version: impl Into<String>,
        credential: Arc<dyn TokenCredential>,
    ) -> Self {
        Self {
            http: crate::http::client(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            deployment: deployment.into(),
            api_version: api_version.into(),
            credential,
        }
    }
}

#[async_trait]
impl Embedder for AzureOpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, UpstreamError> {
        let token = self.credential.get_token(COGNITIVE_SERVICES_SCOPE).await?;
        let url = format!(
            "{}/openai/deployments/{}/embeddings",
            self.endpoint, self.deployment
        );

        let resp = self
            .http
            .post(&url)
            .query(&[("api-version", self.api_version.as_str())])
            .bearer_auth(token.token)
            .json(&json!({ "input": text }))
            .send()
            .await?;
        let parsed: EmbeddingResponse = UpstreamError::check(resp).await?.json().await?;

        parsed
            .data
            .into_iter()
            .next()
            .map(|item| item.embedding)
            .ok_or_else(|| UpstreamError::Malformed("embedding response had no data".into()))
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    value: Vec<serde_json::Value>,
}

/// Azure AI Search index.
#[derive(Debug, Clone)]
pub struct AzureSearchIndex {
    http: reqwest::Client,
    endpoint: String,
    index_name: String,
    api_version: String,
    credential: Arc<dyn TokenCredential>,
}

impl AzureSearchIndex {
    pub fn new(
        endpoint: impl Into<String>,
        index_name: impl Into<String>,
        api_version: impl Into<String>,
        credential: Arc<dyn TokenCredential>,
    ) -> Self {
        Self {
            http: crate::http::client(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            index_name: index_name.into(),
            api_version: api_version.into(),
            credential,
        }
    }
}

#[async_trait]
impl SearchIndex for AzureSearchIndex {
    async fn hybrid_search(
        &self,
        text: &str,
        vector: Vec<f32>,
        top_k: usize,
    ) -> Result<Vec<String>, UpstreamError> {
        let token = self.credential.get_token(SEARCH_SCOPE).await?;
        let url = format!("{}/indexes/{}/docs/search", self.endpoint, self.index_name);

        let body = json!({
            "search": text,
            "vectorQueries": [{
                "kind": "vector",
                "vector": vector,
                "k": top_k,
                "fields": VECTOR_FIELD
            }],
            "searchFields": CONTENT_FIELD,
            "top": top_k,
            "count": true
        });

        let resp = self
            .http
            .post(&url)
            .query(&[("api-version", self.api_version.as_str())])
            .bearer_auth(token.token)
            .json(&body)
            .send()
            .await?;
        let parsed: SearchResponse = UpstreamError::check(resp).await?.json().await?;

        Ok(parsed
            .value
            .iter()
            .map(|doc| {
                doc.get(CONTENT_FIELD)
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            })
            .collect())
    }
}

/// `search_acc_guidelines`: American College of Cardiology guideline lookup.
#[derive(Debug, Clone)]
pub struct GuidelineSearchTool {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn SearchIndex>,
    top_k: usize,
}

impl GuidelineSearchTool {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn SearchIndex>, top_k: usize) -> Self {
        Self {
            embedder,
            index,
            top_k,
        }
    }

    async fn search(&self, query: &str) -> Result<Vec<String>, UpstreamError> {
        let vector = self.embedder.embed(query).await?;
        self.index.hybrid_search(query, vector, self.top_k).await
    }
}

#[async_trait]
impl AgentTool for GuidelineSearchTool {
    fn name(&self) -> &str {
        "search_acc_guidelines"
    }

    fn description(&self) -> &str {
        "Searches the clinical guideline index for relevant American College of Cardiology (ACC) guidelines."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Free-text clinical question, e.g. 'first-line therapy for hypertension in elderly patients'."
                }
            },
            "required": ["query"]
        })
    }

    #[tracing::instrument(name = "search_acc_guidelines", skip(self, args), fields(search_index_query = tracing::field::Empty))]
    async fn invoke(&self, args: serde_json::Value) -> ToolOutcome {
        let query = match required_str(&args, "query") {
            Ok(q) => q,
            Err(f) => return f.into(),
        };
        tracing::Span::current().record("search_index_query", query);

        match self.search(query).await {
            Ok(passages) if passages.is_empty() => ToolOutcome::success(NO_GUIDELINES),
            Ok(passages) => {
                tracing::debug!(passages = passages.len(), "Guideline passages retrieved");
                ToolOutcome::success(passages.join("\n"))
            }
            Err(e) => ToolOutcome::failure(FailureKind::Upstream, format!("Error {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::azure::StaticTokenCredential;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct FixedEmbedder;

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, UpstreamError> {
            Ok(vec![0.1, 0.2, 0.3])
        }
    }

    #[derive(Debug, Default)]
    struct RecordingIndex {
        passages: Vec<String>,
        seen_top_k: Mutex<Option<usize>>,
    }

    #[async_trait]
    impl SearchIndex for RecordingIndex {
        async fn hybrid_search(
            &self,
            _text: &str,
            vector: Vec<f32>,
            top_k: usize,
        ) -> Result<Vec<String>, UpstreamError> {
            assert_eq!(vector.len(), 3);
            *self.seen_top_k.lock().unwrap() = Some(top_k);
            Ok(self.passages.clone())
        }
    }

    #[tokio::test]
    async fn test_passages_are_newline_joined() {
        let index = Arc::new(RecordingIndex {
            passages: vec!["ACE inhibitors first.".into(), "Thiazides also.".into()],
            ..Default::default()
        });
        let tool = GuidelineSearchTool::new(
            Arc::new(FixedEmbedder),
            Arc::clone(&index) as Arc<dyn SearchIndex>,
            10,
        );

        let outcome = tool.invoke(json!({ "query": "hypertension" })).await;
        assert_eq!(
            outcome,
            ToolOutcome::success("ACE inhibitors first.\nThiazides also.")
        );
        assert_eq!(*index.seen_top_k.lock().unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_no_results_marker() {
        let tool = GuidelineSearchTool::new(
            Arc::new(FixedEmbedder),
            Arc::new(RecordingIndex::default()),
            10,
        );
        let outcome = tool.invoke(json!({ "query": "anything" })).await;
        assert_eq!(outcome.render(), NO_GUIDELINES);
        assert!(!outcome.is_failure());
    }

    #[tokio::test]
    async fn test_unreachable_services_become_error_string() {
        let cred: Arc<dyn TokenCredential> = Arc::new(StaticTokenCredential::new("t"));
        let tool = GuidelineSearchTool::new(
            Arc::new(AzureOpenAiEmbedder::new(
                "http://127.0.0.1:1",
                "embedding",
                "2024-04-01-preview",
                Arc::clone(&cred),
            )),
            Arc::new(AzureSearchIndex::new(
                "http://127.0.0.1:1",
                "acc-guidelines-index",
                "2024-07-01",
                cred,
            )),
            10,
        );

        let outcome = tool.invoke(json!({ "query": "statins" })).await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::Upstream));
        assert!(outcome.render().starts_with("Error "));
    }
}
