use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::{Capability, CapabilityMetadata};
use crate::errors::{AgentError, AgentResult};
use crate::models::content::Content;
use crate::models::tool::Tool;

pub const ID: &str = "knowledge_search";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    text: String,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    source: Option<String>,
}

/// Retrieves passages from the vector-search backend. Opts out of
/// registration when no backend is configured.
pub struct KnowledgeSearchCapability {
    metadata: CapabilityMetadata,
    tool: Tool,
    client: Client,
    host: Option<String>,
    top_k: usize,
}

impl KnowledgeSearchCapability {
    pub fn new(host: Option<&str>, top_k: usize, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            metadata: CapabilityMetadata::new(ID, "Knowledge Search")
                .with_description("Searches the user's indexed documents")
                .with_category("knowledge")
                .with_icon("book-open"),
            tool: Tool::new(
                "search_knowledge",
                "Search the user's document collection for passages relevant to a query. \
                Use it for questions about the user's own files and notes.",
                json!({
                    "type": "object",
                    "required": ["query"],
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "What to look for, phrased as a search query"
                        }
                    }
                }),
            ),
            client,
            host: host.map(|h| h.trim_end_matches('/').to_string()),
            top_k,
        })
    }
}

#[async_trait]
impl Capability for KnowledgeSearchCapability {
    fn metadata(&self) -> &CapabilityMetadata {
        &self.metadata
    }

    fn descriptor(&self) -> &Tool {
        &self.tool
    }

    fn is_available(&self) -> bool {
        self.host.is_some()
    }

    async fn execute(&self, arguments: Value) -> AgentResult<Vec<Content>> {
        let host = self
            .host
            .as_deref()
            .ok_or_else(|| AgentError::Internal("no knowledge backend configured".into()))?;
        let query = arguments
            .get("query")
            .and_then(Value::as_str)
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| AgentError::InvalidParameters("query parameter required".into()))?;

        let response = self
            .client
            .post(format!("{}/search", host))
            .json(&json!({"query": query, "top_k": self.top_k}))
            .send()
            .await
            .map_err(|e| AgentError::ExecutionError(format!("search backend unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(AgentError::ExecutionError(format!(
                "search backend returned {}",
                response.status()
            )));
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| AgentError::ExecutionError(format!("unexpected search response: {}", e)))?;

        if body.results.is_empty() {
            return Ok(vec![Content::text("No matching documents found.")]);
        }

        Ok(body
            .results
            .into_iter()
            .take(self.top_k)
            .enumerate()
            .map(|(i, hit)| {
                let mut header = format!("[{}]", i + 1);
                if let Some(source) = hit.source {
                    header.push_str(&format!(" {}", source));
                }
                if let Some(score) = hit.score {
                    header.push_str(&format!(" (score {:.2})", score));
                }
                Content::text(format!("{}\n{}", header, hit.text))
            })
            .collect())
    }
}
