use async_trait::async_trait;
use futures::stream::BoxStream;
use tern_common::Result;

pub mod openai;
pub use openai::OpenAiProvider;

/// Trait for the language-model provider integration. One provider family is
/// shipped, but the chat driver is written against this interface only.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (e.g. "openai").
    fn provider_id(&self) -> &str;

    /// One-shot completion returning the response text. Used by background
    /// helpers (titling, memory extraction, research planning).
    async fn complete(&self, request: &LlmRequest) -> Result<String>;

    /// Open a streaming completion.
    async fn stream(&self, request: &LlmRequest) -> Result<LlmStream>;
}

pub type LlmStream = BoxStream<'static, Result<StreamChunk>>;

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature. The provider includes this only for model
    /// families that accept it.
    pub temperature: Option<f64>,
    /// Reasoning effort ("low" | "high"). Included instead of temperature
    /// for reasoning model families; never both.
    pub reasoning_effort: Option<String>,
    pub tools: Vec<ToolDefinition>,
}

impl LlmRequest {
    /// A minimal request carrying a single user turn, used by the one-shot
    /// background helpers.
    pub fn single_turn(model: &str, prompt: String) -> Self {
        Self {
            model: model.to_string(),
            messages: vec![ChatMessage::User {
                content: UserContent::Text(prompt),
            }],
            temperature: None,
            reasoning_effort: None,
            tools: Vec::new(),
        }
    }
}

/// One turn of provider-format history.
#[derive(Debug, Clone)]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: UserContent,
    },
    Assistant {
        content: Option<String>,
        tool_calls: Vec<ToolCallRequest>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Clone)]
pub enum UserContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone)]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { url: String },
}

/// A fully reconstructed tool call carried on an assistant turn.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// Raw argument string as produced by the provider.
    pub arguments: String,
}

#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// One parsed element of the provider's chunked stream.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    TextDelta(String),
    /// Tool-call data arrives as fragments keyed by a positional index;
    /// names and argument strings are delivered incrementally and out of
    /// alignment with text deltas.
    ToolCallFragment(ToolCallFragment),
    /// The finish reason, verbatim (e.g. "stop", "tool_calls").
    Finished(String),
}

#[derive(Debug, Clone)]
pub struct ToolCallFragment {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}
