pub mod chat_store;
pub mod memory_store;
pub mod settings;

pub use chat_store::{ChatStore, Conversation, StoredMessage, ToolServerRow};
pub use memory_store::{MemoryFact, MemoryStore, SaveOutcome};
pub use settings::SettingKey;
