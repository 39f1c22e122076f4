use serde_json::Value;
use tracing::debug;

use crate::providers::{LlmProvider, LlmRequest};

/// Best-effort extraction of new memory-worthy facts from recent turns.
/// Returns an empty list on any provider or parse failure; never errors.
pub async fn extract_memory_facts(
    provider: &dyn LlmProvider,
    model: &str,
    turns: &[(String, String)],
    existing: &[String],
    max_facts: usize,
    max_words: usize,
) -> Vec<String> {
    let transcript = turns
        .iter()
        .map(|(role, content)| format!("{role}: {content}"))
        .collect::<Vec<_>>()
        .join("\n");

    let known = if existing.is_empty() {
        "(none)".to_string()
    } else {
        existing
            .iter()
            .map(|fact| format!("- {fact}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let prompt = format!(
        "Extract lasting facts about the user from this conversation: stable \
         preferences, background, or standing instructions. Emit at most \
         {max_facts} facts of at most {max_words} words each. Exclude anything \
         already known, anything about the assistant, and anything not \
         specific to the user. Respond with JSON only, in the form \
         {{\"facts\": [\"...\"]}}; use an empty list when there is nothing new.\n\n\
         Already known:\n{known}\n\nConversation:\n{transcript}"
    );

    let request = LlmRequest::single_turn(model, prompt);
    let raw = match provider.complete(&request).await {
        Ok(raw) => raw,
        Err(e) => {
            debug!("memory extraction failed: {e}");
            return Vec::new();
        }
    };

    parse_fact_list(&raw, max_facts, max_words)
}

/// Parse the extractor response, tolerating a couple of plausible top-level
/// field names and surrounding prose.
fn parse_fact_list(raw: &str, max_facts: usize, max_words: usize) -> Vec<String> {
    let value: Option<Value> = serde_json::from_str(raw).ok().or_else(|| {
        let start = raw.find('{')?;
        let end = raw.rfind('}')?;
        serde_json::from_str(&raw[start..=end]).ok()
    });

    let Some(value) = value else {
        return Vec::new();
    };

    let facts = ["facts", "memories", "new_facts"]
        .iter()
        .find_map(|field| value.get(field).and_then(Value::as_array));

    facts
        .map(|entries| {
            entries
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|fact| !fact.is_empty())
                .filter(|fact| fact.split_whitespace().count() <= max_words)
                .map(str::to_string)
                .take(max_facts)
                .collect()
        })
        .unwrap_or_default()
}

/// Best-effort title from the conversation's first user message. `None` on
/// any failure; the conversation keeps its placeholder title.
pub async fn generate_title(
    provider: &dyn LlmProvider,
    model: &str,
    first_message: &str,
) -> Option<String> {
    let prompt = format!(
        "Write a title of at most six words for a conversation that starts \
         with the message below. Respond with the title only, no quotes.\n\n\
         {first_message}"
    );

    let request = LlmRequest::single_turn(model, prompt);
    let raw = provider.complete(&request).await.ok()?;
    let title = raw.trim().trim_matches('"').trim();
    if title.is_empty() {
        return None;
    }

    let words: Vec<&str> = title.split_whitespace().take(8).collect();
    Some(words.join(" "))
}
