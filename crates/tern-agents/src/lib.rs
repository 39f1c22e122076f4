pub mod driver;
pub mod events;
pub mod extractor;
pub mod mcp;
pub mod orchestrator;
pub mod providers;
pub mod research;
pub mod search;
pub mod tools;

pub use driver::{ChatDriver, DriverOutcome, ToolExecutor};
pub use events::ChatEvent;
pub use orchestrator::{
    Attachment, AttachmentKind, ChatOrchestrator, ChatRequestInput, ProviderFactory,
};
pub use providers::{
    ChatMessage, ContentPart, LlmProvider, LlmRequest, LlmStream, OpenAiProvider, StreamChunk,
    ToolCallFragment, ToolCallRequest, ToolDefinition, UserContent,
};
pub use search::{SearchClient, SearchHit, SearchResponse};
pub use tools::{BuiltinTools, GeneratedImage, Tool, ToolContext, ToolOutput};
