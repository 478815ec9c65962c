//! Web search through `SerpAPI`'s Google engine.

use async_trait::async_trait;
use serde_json::json;

use super::{AgentTool, FailureKind, ToolOutcome, required_str};

pub const SERPAPI_BASE_URL: &str = "https://serpapi.com";
pub const MISSING_KEY: &str = "❌ SerpAPI key is not set. Please check your .env file.";
pub const NO_RESULTS: &str = "No results found.";
const DEFAULT_NUM_RESULTS: u64 = 5;

/// `search_serpapi_web`: numbered title/snippet/link list of organic results.
#[derive(Clone)]
pub struct WebSearchTool {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl std::fmt::Debug for WebSearchTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSearchTool")
            .field("base_url", &self.base_url)
            .field("api_key_present", &self.api_key.is_some())
            .finish()
    }
}

impl WebSearchTool {
    pub fn new(api_key: Option<String>) -> Self {
        Self::with_base_url(SERPAPI_BASE_URL, api_key)
    }

    pub fn with_base_url(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: crate::http::client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    async fn fetch(
        &self,
        api_key: &str,
        query: &str,
        num_results: u64,
    ) -> Result<serde_json::Value, reqwest::Error> {
        let num = num_results.to_string();
        self.http
            .get(format!("{}/search.json", self.base_url))
            .query(&[
                ("engine", "google"),
                ("q", query),
                ("api_key", api_key),
                ("num", num.as_str()),
                ("hl", "en"),
            ])
            .send()
            .await?
            .json()
            .await
    }
}

/// Render a `SerpAPI` response body.
///
/// API-level errors are reported in the body (often alongside a 4xx status),
/// so the body is inspected rather than the status code.
pub fn render_results(results: &serde_json::Value) -> ToolOutcome {
    if let Some(error) = results.get("error") {
        let detail = error
            .as_str()
            .map_or_else(|| error.to_string(), ToString::to_string);
        return ToolOutcome::failure(FailureKind::Upstream, format!("❌ SerpAPI error: {detail}"));
    }

    let field = |entry: &serde_json::Value, key: &str, default: &str| {
        entry
            .get(key)
            .and_then(serde_json::Value::as_str)
            .unwrap_or(default)
            .to_string()
    };

    let snippets: Vec<String> = results
        .get("organic_results")
        .and_then(serde_json::Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .enumerate()
                .map(|(idx, entry)| {
                    format!(
                        "{}. **{}**\n{}\n🔗 {}",
                        idx + 1,
                        field(entry, "title", "No title"),
                        field(entry, "snippet", "No snippet available."),
                        field(entry, "link", "No link"),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    if snippets.is_empty() {
        ToolOutcome::success(NO_RESULTS)
    } else {
        ToolOutcome::success(snippets.join("\n\n"))
    }
}

#[async_trait]
impl AgentTool for WebSearchTool {
    fn name(&self) -> &str {
        "search_serpapi_web"
    }

    fn description(&self) -> &str {
        "Perform a Google search and return summarized top results. Use for recent news, drug approvals and anything newer than the guideline index."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query string."
                },
                "num_results": {
                    "type": "integer",
                    "description": "Number of top results to retrieve (default 5).",
                    "minimum": 1,
                    "maximum": 20
                }
            },
            "required": ["query"]
        })
    }

    #[tracing::instrument(name = "search_serpapi_web", skip(self, args), fields(requested_web_search = tracing::field::Empty))]
    async fn invoke(&self, args: serde_json::Value) -> ToolOutcome {
        let Some(api_key) = self.api_key.as_deref() else {
            return ToolOutcome::failure(FailureKind::MissingCredential, MISSING_KEY);
        };
        let query = match required_str(&args, "query") {
            Ok(q) => q,
            Err(f) => return f.into(),
        };
        let num_results = args
            .get("num_results")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(DEFAULT_NUM_RESULTS);
        tracing::Span::current().record("requested_web_search", query);

        match self.fetch(api_key, query, num_results).await {
            Ok(body) => render_results(&body),
            Err(e) => ToolOutcome::failure(
                FailureKind::Upstream,
                format!("❌ SerpAPI request failed: {e}"),
            ),
        }
    }
}
