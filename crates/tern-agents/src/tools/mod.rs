use async_trait::async_trait;
use tern_common::Result;

use crate::providers::ToolDefinition;

pub mod image;
pub mod memory;
pub mod web_search;

pub use image::{GenerateImage, ImageClient};
pub use memory::{MemoryGet, MemorySave};
pub use web_search::WebSearch;

/// Request-scoped context handed to every tool invocation.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub user_id: String,
}

/// A generated image travelling out of the tool-result channel. The model
/// only ever sees the textual confirmation; the image itself is relayed to
/// the client as a side-channel event.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub data_url: String,
    pub revised_prompt: String,
}

/// What a tool produced: a model-facing string, optionally accompanied by an
/// image payload for the client.
#[derive(Debug)]
pub struct ToolOutput {
    pub content: String,
    pub image: Option<GeneratedImage>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            image: None,
        }
    }

    pub fn with_image(content: impl Into<String>, image: GeneratedImage) -> Self {
        Self {
            content: content.into(),
            image: Some(image),
        }
    }
}

/// A built-in tool. Implementations convert every failure mode into a
/// descriptive result string; an `Err` from `execute` is a programming
/// error escape hatch that dispatch converts to a string as well.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn input_schema(&self) -> serde_json::Value;
    async fn execute(&self, context: &ToolContext, args: serde_json::Value) -> Result<ToolOutput>;
}

/// The built-in tool set assembled per request.
pub struct BuiltinTools {
    tools: Vec<Box<dyn Tool>>,
}

impl BuiltinTools {
    pub fn new(tools: Vec<Box<dyn Tool>>) -> Self {
        Self { tools }
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }
}
