use async_trait::async_trait;
use serde_json::json;
use tern_common::{Result, truncate_chars};
use tracing::warn;

use super::{Tool, ToolContext, ToolOutput};
use crate::search::SearchClient;

const SNIPPET_CHARS: usize = 300;

/// Search the web through the configured search API.
pub struct WebSearch {
    search: SearchClient,
    api_key: Option<String>,
}

impl WebSearch {
    pub fn new(search: SearchClient, api_key: Option<String>) -> Self {
        Self { search, api_key }
    }
}

#[async_trait]
impl Tool for WebSearch {
    fn name(&self) -> &'static str {
        "web_search"
    }

    fn description(&self) -> &'static str {
        "Search the web for current information. Returns a synthesized answer \
         when available plus a numbered list of sources."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query."
                },
                "max_results": {
                    "type": "integer",
                    "description": "How many sources to return (1-10, default 5)."
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, _context: &ToolContext, args: serde_json::Value) -> Result<ToolOutput> {
        let query = args["query"].as_str().unwrap_or("").trim();
        if query.is_empty() {
            return Ok(ToolOutput::text("No search query was provided."));
        }

        let Some(api_key) = self.api_key.as_deref() else {
            return Ok(ToolOutput::text(
                "Web search is not configured. Add a search API key in settings to enable it.",
            ));
        };

        let max_results = args["max_results"].as_u64().unwrap_or(5).clamp(1, 10) as usize;

        let response = match self
            .search
            .search(api_key, query, max_results, true, "basic")
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("web search failed: {e}");
                return Ok(ToolOutput::text(format!("Web search failed: {e}")));
            }
        };

        let mut sections = Vec::new();
        if let Some(answer) = response.answer.as_deref().filter(|a| !a.trim().is_empty()) {
            sections.push(format!("Answer: {answer}"));
        }

        if !response.results.is_empty() {
            let sources = response
                .results
                .iter()
                .take(max_results)
                .enumerate()
                .map(|(i, hit)| {
                    format!(
                        "{}. {} — {}\n   {}",
                        i + 1,
                        hit.title,
                        hit.url,
                        truncate_chars(&hit.content, SNIPPET_CHARS)
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!("Sources:\n{sources}"));
        }

        if sections.is_empty() {
            return Ok(ToolOutput::text(format!("No results found for: {query}")));
        }

        Ok(ToolOutput::text(sections.join("\n\n")))
    }
}
