use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tern_common::Result;
use tern_db::{MemoryStore, SaveOutcome};
use tokio::sync::Mutex;

use super::{Tool, ToolContext, ToolOutput};

/// Persist a fact about the user, deduplicated against existing memory.
pub struct MemorySave {
    store: Arc<Mutex<MemoryStore>>,
    max_facts: usize,
    max_chars: usize,
}

impl MemorySave {
    pub fn new(store: Arc<Mutex<MemoryStore>>, max_facts: usize, max_chars: usize) -> Self {
        Self {
            store,
            max_facts,
            max_chars,
        }
    }
}

#[async_trait]
impl Tool for MemorySave {
    fn name(&self) -> &'static str {
        "memory_save"
    }

    fn description(&self) -> &'static str {
        "Save a lasting fact about the user to memory, e.g. preferences, \
         background, or standing instructions. Use only for information worth \
         recalling in future conversations."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "fact": {
                    "type": "string",
                    "description": "The fact to remember, phrased as a short standalone sentence."
                }
            },
            "required": ["fact"]
        })
    }

    async fn execute(&self, context: &ToolContext, args: serde_json::Value) -> Result<ToolOutput> {
        let fact = args["fact"].as_str().unwrap_or("").trim().to_string();
        if fact.is_empty() {
            return Ok(ToolOutput::text("No fact was provided to remember."));
        }

        let outcome = self
            .store
            .lock()
            .await
            .save_fact(&context.user_id, &fact, self.max_facts, self.max_chars);

        Ok(match outcome {
            Ok(SaveOutcome::Saved) => ToolOutput::text(format!("Remembered: {fact}")),
            Ok(SaveOutcome::Duplicate) => {
                ToolOutput::text(format!("I already remember that: {fact}"))
            }
            Err(e) => ToolOutput::text(format!("Could not save that fact: {e}")),
        })
    }
}

/// Recall facts from memory, optionally filtered by query tokens.
pub struct MemoryGet {
    store: Arc<Mutex<MemoryStore>>,
}

impl MemoryGet {
    pub fn new(store: Arc<Mutex<MemoryStore>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for MemoryGet {
    fn name(&self) -> &'static str {
        "memory_get"
    }

    fn description(&self) -> &'static str {
        "Look up saved facts about the user. Provide a query to filter, or \
         leave it empty to list everything."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Words to search for. Facts matching any word are returned."
                }
            }
        })
    }

    async fn execute(&self, context: &ToolContext, args: serde_json::Value) -> Result<ToolOutput> {
        let query = args["query"].as_str().unwrap_or("");

        let facts = match self.store.lock().await.search_facts(&context.user_id, query) {
            Ok(facts) => facts,
            Err(e) => return Ok(ToolOutput::text(format!("Could not read memory: {e}"))),
        };

        if facts.is_empty() {
            return Ok(ToolOutput::text("No matching memories found."));
        }

        let listing = facts
            .iter()
            .map(|f| format!("- {}", f.content))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(ToolOutput::text(format!("Saved memories:\n{listing}")))
    }
}
