use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tern_common::{Error, Result};

/// Client for the external search API.
#[derive(Clone)]
pub struct SearchClient {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SearchResponse {
    pub answer: Option<String>,
    #[serde(default)]
    pub results: Vec<SearchHit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchHit {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub content: String,
}

impl SearchClient {
    pub fn new(client: reqwest::Client, url: String, timeout_secs: u64) -> Self {
        Self {
            client,
            url,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub async fn search(
        &self,
        api_key: &str,
        query: &str,
        max_results: usize,
        include_answer: bool,
        search_depth: &str,
    ) -> Result<SearchResponse> {
        let body = json!({
            "api_key": api_key,
            "query": query,
            "max_results": max_results,
            "include_answer": include_answer,
            "search_depth": search_depth,
        });

        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Search(format!("search request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::Search(format!("search API returned {status}")));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Search(format!("failed to parse search response: {e}")))
    }
}
