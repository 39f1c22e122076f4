use futures::future::join_all;
use serde_json::Value;
use tern_common::{CancellationToken, Error, Result, truncate_chars};
use tokio::sync::mpsc;
use tracing::debug;

use crate::events::ChatEvent;
use crate::providers::{LlmProvider, LlmRequest};
use crate::search::SearchClient;

const MAX_INITIAL_QUERIES: usize = 4;
const MAX_FOLLOWUP_QUERIES: usize = 2;
const SOURCES_PER_QUERY: usize = 4;
const SNIPPET_CHARS: usize = 250;

/// Two-round, gap-driven search pipeline for deep-research mode: plan
/// queries, run them concurrently, ask the provider whether follow-ups are
/// warranted, optionally run those, and return the combined digest.
pub struct ResearchPipeline<'a> {
    provider: &'a dyn LlmProvider,
    search: &'a SearchClient,
    search_api_key: &'a str,
    model: &'a str,
}

impl<'a> ResearchPipeline<'a> {
    pub fn new(
        provider: &'a dyn LlmProvider,
        search: &'a SearchClient,
        search_api_key: &'a str,
        model: &'a str,
    ) -> Self {
        Self {
            provider,
            search,
            search_api_key,
            model,
        }
    }

    pub async fn run(
        &self,
        question: &str,
        events: &mpsc::Sender<ChatEvent>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let _ = events.send(ChatEvent::ResearchStart).await;

        let plan_prompt = format!(
            "You are planning web research for the question below. Produce 3 to 4 \
             targeted search queries that together cover it.\n\
             Respond with JSON only, in the form {{\"queries\": [\"...\"]}}.\n\n\
             Question: {question}"
        );
        let planned = self.complete(plan_prompt, cancel).await?;
        let mut queries = parse_query_list(&planned, MAX_INITIAL_QUERIES);
        if queries.is_empty() {
            // Unusable plan: fall back to searching the question verbatim.
            queries.push(question.to_string());
        }

        let mut digest = self.run_batch(&queries, 1, events, cancel).await?;
        let mut total_queries = queries.len();

        let gap_prompt = format!(
            "You are reviewing research coverage for the question below. Given the \
             digest so far, decide whether up to {MAX_FOLLOWUP_QUERIES} follow-up \
             searches would close important gaps. If coverage is sufficient, respond \
             {{\"queries\": []}}. Respond with JSON only.\n\n\
             Question: {question}\n\nDigest:\n{digest}"
        );
        let gap = self.complete(gap_prompt, cancel).await?;
        let followups = parse_query_list(&gap, MAX_FOLLOWUP_QUERIES);

        if !followups.is_empty() {
            debug!(count = followups.len(), "running follow-up research round");
            let second = self
                .run_batch(&followups, total_queries + 1, events, cancel)
                .await?;
            digest.push_str("\n\n");
            digest.push_str(&second);
            total_queries += followups.len();
        }

        let _ = events
            .send(ChatEvent::ResearchDone {
                query_count: total_queries,
            })
            .await;

        Ok(digest)
    }

    async fn complete(&self, prompt: String, cancel: &CancellationToken) -> Result<String> {
        let request = LlmRequest::single_turn(self.model, prompt);
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Search("research cancelled".to_string())),
            completed = self.provider.complete(&request) => completed,
        }
    }

    /// Run one batch of queries concurrently. Failures are isolated per
    /// query and rendered as placeholder sections.
    async fn run_batch(
        &self,
        queries: &[String],
        first_index: usize,
        events: &mpsc::Sender<ChatEvent>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        for query in queries {
            let _ = events
                .send(ChatEvent::ResearchQuery {
                    query: query.clone(),
                })
                .await;
        }

        let searches = join_all(queries.iter().map(|query| {
            self.search.search(
                self.search_api_key,
                query,
                SOURCES_PER_QUERY,
                true,
                "advanced",
            )
        }));

        let results = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Search("research cancelled".to_string())),
            results = searches => results,
        };

        let sections: Vec<String> = results
            .into_iter()
            .zip(queries)
            .enumerate()
            .map(|(offset, (result, query))| {
                let n = first_index + offset;
                match result {
                    Ok(response) => {
                        let mut section = format!("### Search {n}: {query}");
                        if let Some(answer) =
                            response.answer.as_deref().filter(|a| !a.trim().is_empty())
                        {
                            section.push_str(&format!("\n{answer}"));
                        }
                        for (i, hit) in
                            response.results.iter().take(SOURCES_PER_QUERY).enumerate()
                        {
                            section.push_str(&format!(
                                "\n{}. {} — {}\n   {}",
                                i + 1,
                                hit.title,
                                hit.url,
                                truncate_chars(&hit.content, SNIPPET_CHARS)
                            ));
                        }
                        section
                    }
                    Err(e) => {
                        debug!("research query '{query}' failed: {e}");
                        format!("### Search {n}: {query}\n[Search {n}: failed]")
                    }
                }
            })
            .collect();

        Ok(sections.join("\n\n"))
    }
}

/// Parse a `{"queries": [...]}` response, tolerating surrounding prose.
fn parse_query_list(raw: &str, max: usize) -> Vec<String> {
    let value: Option<Value> = serde_json::from_str(raw).ok().or_else(|| {
        let start = raw.find('{')?;
        let end = raw.rfind('}')?;
        serde_json::from_str(&raw[start..=end]).ok()
    });

    value
        .as_ref()
        .and_then(|v| v.get("queries"))
        .and_then(Value::as_array)
        .map(|queries| {
            queries
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(str::to_string)
                .take(max)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json() {
        let queries = parse_query_list(r#"{"queries": ["a", "b", "c"]}"#, 4);
        assert_eq!(queries, vec!["a", "b", "c"]);
    }

    #[test]
    fn parses_json_embedded_in_prose() {
        let raw = "Here is my plan:\n{\"queries\": [\"rust async\", \"tokio select\"]}\nDone.";
        let queries = parse_query_list(raw, 4);
        assert_eq!(queries, vec!["rust async", "tokio select"]);
    }

    #[test]
    fn caps_and_drops_empty_entries() {
        let raw = r#"{"queries": ["a", " ", "b", "c", "d", "e"]}"#;
        assert_eq!(parse_query_list(raw, 2), vec!["a", "b"]);
    }

    #[test]
    fn unusable_responses_yield_nothing() {
        assert!(parse_query_list("no json here", 4).is_empty());
        assert!(parse_query_list(r#"{"other": 1}"#, 4).is_empty());
    }
}
