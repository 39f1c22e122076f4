use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tern_common::{CancellationToken, Error, Result};
use tern_config::{LimitsConfig, ProviderEndpoints};
use tern_db::{ChatStore, MemoryFact, MemoryStore, SettingKey};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::driver::{ChatDriver, DriverOutcome, ToolExecutor};
use crate::events::ChatEvent;
use crate::extractor;
use crate::mcp::{McpGateway, RemoteServer};
use crate::providers::{ChatMessage, ContentPart, LlmProvider, ToolDefinition, UserContent};
use crate::research::ResearchPipeline;
use crate::search::SearchClient;
use crate::tools::{
    BuiltinTools, GenerateImage, ImageClient, MemoryGet, MemorySave, Tool, ToolContext,
    ToolOutput, WebSearch,
};

const BASE_PROMPT: &str =
    "You are Tern, a helpful assistant. Be direct, accurate and concise; use \
     markdown where it aids readability.";

const TOOL_GUIDANCE: &str =
    "Tool usage: call memory_save when the user shares a lasting fact about \
     themselves, memory_get to recall saved facts, web_search when current or \
     niche information is needed, and generate_image only when the user asks \
     for a picture. Answer directly when no tool is needed.";

/// Constructs a provider for the credential resolved from the user's
/// settings. The gateway implements this with a capacity-bounded cache of
/// client values; tests substitute their own.
pub trait ProviderFactory: Send + Sync {
    fn provider(&self, api_key: &str) -> Arc<dyn LlmProvider>;
}

/// The body of one chat request as received from the client.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequestInput {
    pub conversation_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub name: Option<String>,
    /// Image attachments carry a data URL passed through to the provider;
    /// text attachments carry the file content.
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    TextFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChatMode {
    Normal,
    Thinking,
    DeepResearch,
}

/// Settings resolved against their documented defaults.
struct EffectiveSettings {
    model: String,
    temperature: f64,
    memory_enabled: bool,
    auto_memory_enabled: bool,
    system_prompt: Option<String>,
    custom_instructions: Option<String>,
    provider_api_key: Option<String>,
    search_api_key: Option<String>,
    mode: ChatMode,
}

impl EffectiveSettings {
    fn from_map(map: &HashMap<SettingKey, String>) -> Self {
        let flag = |key: SettingKey, default: bool| {
            map.get(&key)
                .map(|v| v == "true" || v == "1")
                .unwrap_or(default)
        };
        let non_empty = |key: SettingKey| {
            map.get(&key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Self {
            model: non_empty(SettingKey::ChatModel).unwrap_or_else(|| "gpt-4o-mini".to_string()),
            temperature: map
                .get(&SettingKey::Temperature)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.7_f64)
                .clamp(0.0, 2.0),
            memory_enabled: flag(SettingKey::MemoryEnabled, true),
            auto_memory_enabled: flag(SettingKey::AutoMemoryEnabled, true),
            system_prompt: non_empty(SettingKey::SystemPrompt),
            custom_instructions: non_empty(SettingKey::CustomInstructions),
            provider_api_key: non_empty(SettingKey::ProviderApiKey),
            search_api_key: non_empty(SettingKey::SearchApiKey),
            mode: match map.get(&SettingKey::ChatMode).map(String::as_str) {
                Some("thinking") => ChatMode::Thinking,
                Some("deep_research") => ChatMode::DeepResearch,
                _ => ChatMode::Normal,
            },
        }
    }
}

/// Composes the per-request conversation pipeline: settings resolution,
/// catalog assembly, prompt construction, the streaming driver, and the
/// background post-processing tasks.
pub struct ChatOrchestrator {
    chat: Arc<Mutex<ChatStore>>,
    memory: Arc<Mutex<MemoryStore>>,
    factory: Arc<dyn ProviderFactory>,
    http: reqwest::Client,
    endpoints: ProviderEndpoints,
    limits: LimitsConfig,
}

impl ChatOrchestrator {
    pub fn new(
        chat: Arc<Mutex<ChatStore>>,
        memory: Arc<Mutex<MemoryStore>>,
        factory: Arc<dyn ProviderFactory>,
        http: reqwest::Client,
        endpoints: ProviderEndpoints,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            chat,
            memory,
            factory,
            http,
            endpoints,
            limits,
        }
    }

    /// Run one chat request to completion, relaying events as they occur.
    /// Request-level failures become a terminal `error` event.
    pub async fn run(
        &self,
        user_id: &str,
        input: ChatRequestInput,
        events: mpsc::Sender<ChatEvent>,
        cancel: CancellationToken,
    ) {
        if let Err(e) = self.handle(user_id, input, &events, &cancel).await {
            warn!("chat request failed: {e}");
            let _ = events
                .send(ChatEvent::Error {
                    message: e.to_string(),
                })
                .await;
        }
    }

    async fn handle(
        &self,
        user_id: &str,
        input: ChatRequestInput,
        events: &mpsc::Sender<ChatEvent>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // Resolve or create the target conversation, ownership-checked.
        let conversation = {
            let chat = self.chat.lock().await;
            match &input.conversation_id {
                Some(id) => chat
                    .get_conversation(user_id, id)?
                    .ok_or_else(|| Error::Invalid("conversation not found".to_string()))?,
                None => chat.create_conversation(user_id, "New conversation")?,
            }
        };
        let _ = events
            .send(ChatEvent::ConversationId {
                id: conversation.id.clone(),
            })
            .await;

        // Effective settings; a missing provider credential fails the
        // request before any streaming begins.
        let settings =
            EffectiveSettings::from_map(&self.chat.lock().await.settings_map(user_id)?);
        let Some(api_key) = settings.provider_api_key.clone() else {
            return Err(Error::Config(
                "No provider API key is configured. Add one in settings.".to_string(),
            ));
        };
        let provider = self.factory.provider(&api_key);

        // Memory facts and enabled remote servers for this user.
        let facts: Vec<MemoryFact> = if settings.memory_enabled {
            self.memory.lock().await.list_facts(user_id)?
        } else {
            Vec::new()
        };
        let servers: Vec<RemoteServer> = self
            .chat
            .lock()
            .await
            .list_enabled_tool_servers(user_id)?
            .iter()
            .map(RemoteServer::from_row)
            .collect();

        // Assemble the catalog: built-ins unconditionally, remote tools
        // best-effort. Built-in names take priority over remote ones.
        let search = SearchClient::new(
            self.http.clone(),
            self.endpoints.search_url.clone(),
            self.limits.search_timeout_secs,
        );
        let builtins = BuiltinTools::new(vec![
            Box::new(MemorySave::new(
                Arc::clone(&self.memory),
                self.limits.max_memory_facts,
                self.limits.max_fact_chars,
            )) as Box<dyn Tool>,
            Box::new(MemoryGet::new(Arc::clone(&self.memory))),
            Box::new(WebSearch::new(
                search.clone(),
                settings.search_api_key.clone(),
            )),
            Box::new(GenerateImage::new(
                ImageClient::new(self.http.clone(), self.endpoints.image_base_url.clone()),
                Some(api_key.clone()),
            )),
        ]);

        let gateway = McpGateway::new(self.http.clone(), self.limits.tool_call_timeout_secs);
        let (remote_defs, routing) = gateway.collect_tools(&servers).await;

        let mut catalog = builtins.definitions();
        let builtin_names: Vec<String> = catalog.iter().map(|d| d.name.clone()).collect();
        catalog.extend(
            remote_defs
                .into_iter()
                .filter(|d| !builtin_names.contains(&d.name)),
        );

        let executor = UnifiedExecutor {
            builtins,
            routing,
            gateway,
            context: ToolContext {
                user_id: user_id.to_string(),
            },
            events: events.clone(),
        };

        // Provider-format history window, loaded before the new message is
        // written so it is not doubled.
        let history = self
            .chat
            .lock()
            .await
            .load_recent_messages(&conversation.id, self.limits.history_window)?;

        // Persist the user message before streaming begins; first message
        // triggers best-effort auto-titling.
        let is_first_message = {
            let chat = self.chat.lock().await;
            chat.append_message(&conversation.id, "user", &input.message)?;
            chat.count_messages(&conversation.id)? == 1
        };
        if is_first_message {
            self.spawn_auto_title(
                user_id.to_string(),
                conversation.id.clone(),
                Arc::clone(&provider),
                settings.model.clone(),
                input.message.clone(),
            );
        }

        // Deep-research pre-processing: a failure leaves the prompt without
        // research context rather than failing the request.
        let research_context = if settings.mode == ChatMode::DeepResearch {
            match settings.search_api_key.as_deref() {
                Some(search_key) => {
                    let pipeline =
                        ResearchPipeline::new(provider.as_ref(), &search, search_key, &settings.model);
                    match pipeline.run(&input.message, events, cancel).await {
                        Ok(digest) => Some(digest),
                        Err(e) => {
                            warn!("research stage failed, continuing without it: {e}");
                            None
                        }
                    }
                }
                None => {
                    debug!("deep research requested without a search key; skipping");
                    None
                }
            }
        } else {
            None
        };

        // Final prompt assembly.
        let mut messages = vec![ChatMessage::System {
            content: build_system_prompt(&settings, &facts),
        }];
        if let Some(digest) = &research_context {
            messages.push(ChatMessage::System {
                content: format!("Research context gathered for this question:\n\n{digest}"),
            });
        }
        messages.extend(history.iter().filter_map(stored_to_chat_message));
        messages.push(ChatMessage::User {
            content: build_user_turn(&input.message, &input.attachments),
        });

        let reasoning_effort = match settings.mode {
            ChatMode::Normal => "low",
            ChatMode::Thinking | ChatMode::DeepResearch => "high",
        };

        let driver = ChatDriver::new(
            provider.as_ref(),
            self.limits.max_tool_rounds,
            self.limits.tool_result_event_chars,
        );
        let outcome = driver
            .run(
                messages,
                &settings.model,
                Some(settings.temperature),
                Some(reasoning_effort),
                &catalog,
                Some(&executor),
                events,
                cancel,
            )
            .await?;

        match outcome {
            DriverOutcome::Completed { text } => {
                {
                    let chat = self.chat.lock().await;
                    chat.append_message(&conversation.id, "assistant", &text)?;
                    chat.touch_conversation(&conversation.id)?;
                }
                let _ = events.send(ChatEvent::Done).await;

                if settings.auto_memory_enabled && !text.trim().is_empty() {
                    self.spawn_auto_memory(
                        user_id.to_string(),
                        Arc::clone(&provider),
                        settings.model.clone(),
                        &history,
                        input.message.clone(),
                        text,
                    );
                }
            }
            DriverOutcome::Cancelled { .. } => {
                // Graceful partial completion: nothing persisted, no error
                // event. The done marker goes to a socket that is usually
                // already closed.
                info!("chat request cancelled mid-stream");
                let _ = events.send(ChatEvent::Done).await;
            }
        }

        Ok(())
    }

    /// Fire-and-forget titling from the first user message. Outcome is only
    /// observable via a later conversation read.
    fn spawn_auto_title(
        &self,
        user_id: String,
        conversation_id: String,
        provider: Arc<dyn LlmProvider>,
        model: String,
        first_message: String,
    ) {
        let chat = Arc::clone(&self.chat);
        tokio::spawn(async move {
            if let Some(title) =
                extractor::generate_title(provider.as_ref(), &model, &first_message).await
            {
                match chat
                    .lock()
                    .await
                    .rename_conversation(&user_id, &conversation_id, &title)
                {
                    Ok(_) => debug!("auto-titled conversation {conversation_id}"),
                    Err(e) => debug!("auto-title store write failed: {e}"),
                }
            }
        });
    }

    /// Fire-and-forget memory extraction over the last few turns. Runs
    /// detached from the request's cancellation signal.
    fn spawn_auto_memory(
        &self,
        user_id: String,
        provider: Arc<dyn LlmProvider>,
        model: String,
        history: &[tern_db::StoredMessage],
        user_message: String,
        assistant_message: String,
    ) {
        let mut turns: Vec<(String, String)> = history
            .iter()
            .filter(|m| m.role == "user" || m.role == "assistant")
            .map(|m| (m.role.clone(), m.content.clone()))
            .collect();
        turns.push(("user".to_string(), user_message));
        turns.push(("assistant".to_string(), assistant_message));
        let recent = turns.len().saturating_sub(10);
        turns.drain(..recent);

        let memory = Arc::clone(&self.memory);
        let limits = self.limits;
        tokio::spawn(async move {
            let existing: Vec<String> = match memory.lock().await.list_facts(&user_id) {
                Ok(facts) => facts.into_iter().map(|f| f.content).collect(),
                Err(e) => {
                    debug!("auto-memory fact listing failed: {e}");
                    return;
                }
            };

            let candidates = extractor::extract_memory_facts(
                provider.as_ref(),
                &model,
                &turns,
                &existing,
                limits.auto_memory_max_facts,
                limits.auto_memory_max_words,
            )
            .await;

            for fact in candidates {
                match memory.lock().await.save_fact(
                    &user_id,
                    &fact,
                    limits.max_memory_facts,
                    limits.max_fact_chars,
                ) {
                    Ok(outcome) => debug!("auto-memory fact '{fact}': {outcome:?}"),
                    Err(e) => debug!("auto-memory insert failed: {e}"),
                }
            }
        });
    }
}

/// The unified tool executor: built-in names take priority, anything else
/// routes through the discovery table to its remote server, and an
/// unresolvable name degrades to a "not found" string.
struct UnifiedExecutor {
    builtins: BuiltinTools,
    routing: HashMap<String, RemoteServer>,
    gateway: McpGateway,
    context: ToolContext,
    events: mpsc::Sender<ChatEvent>,
}

#[async_trait]
impl ToolExecutor for UnifiedExecutor {
    async fn execute(&self, name: &str, args: serde_json::Value) -> Result<String> {
        if let Some(tool) = self.builtins.find(name) {
            let output = tool
                .execute(&self.context, args)
                .await
                .unwrap_or_else(|e| ToolOutput::text(format!("Tool '{name}' failed: {e}")));

            // Typed image payloads become a side-channel event; the model
            // only sees the confirmation string.
            if let Some(image) = output.image {
                let _ = self
                    .events
                    .send(ChatEvent::ImageGenerated {
                        data_url: image.data_url,
                        revised_prompt: image.revised_prompt,
                    })
                    .await;
            }
            return Ok(output.content);
        }

        if let Some(server) = self.routing.get(name) {
            return Ok(self.gateway.call_tool(server, name, args).await);
        }

        Ok(format!("Tool '{name}' is not available."))
    }
}

fn build_system_prompt(settings: &EffectiveSettings, facts: &[MemoryFact]) -> String {
    let mut sections = vec![
        settings
            .system_prompt
            .clone()
            .unwrap_or_else(|| BASE_PROMPT.to_string()),
    ];

    match settings.mode {
        ChatMode::Normal => {}
        ChatMode::Thinking => sections.push(
            "Think the problem through step by step before giving the final answer.".to_string(),
        ),
        ChatMode::DeepResearch => sections.push(
            "A research digest may be provided as additional context; ground your \
             answer in it and cite its sources inline."
                .to_string(),
        ),
    }

    sections.push(TOOL_GUIDANCE.to_string());

    if let Some(instructions) = &settings.custom_instructions {
        sections.push(format!("User instructions:\n{instructions}"));
    }

    if settings.memory_enabled && !facts.is_empty() {
        let listing = facts
            .iter()
            .map(|f| format!("- {}", f.content))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("Known facts about the user:\n{listing}"));
    }

    sections.join("\n\n")
}

fn stored_to_chat_message(message: &tern_db::StoredMessage) -> Option<ChatMessage> {
    match message.role.as_str() {
        "system" => Some(ChatMessage::System {
            content: message.content.clone(),
        }),
        "user" => Some(ChatMessage::User {
            content: UserContent::Text(message.content.clone()),
        }),
        "assistant" => Some(ChatMessage::Assistant {
            content: Some(message.content.clone()),
            tool_calls: Vec::new(),
        }),
        // Tool turns are transient; they are never persisted by this loop
        // and rows from other writers cannot be tied back to a call id.
        _ => None,
    }
}

/// Combine the typed text with attachments: image parts pass through as-is,
/// text files are inlined into the text part, fenced.
fn build_user_turn(message: &str, attachments: &[Attachment]) -> UserContent {
    if attachments.is_empty() {
        return UserContent::Text(message.to_string());
    }

    let mut text = message.to_string();
    let mut image_parts = Vec::new();
    for attachment in attachments {
        match attachment.kind {
            AttachmentKind::TextFile => {
                let name = attachment.name.as_deref().unwrap_or("attachment");
                text.push_str(&format!("\n\n```{name}\n{}\n```", attachment.data));
            }
            AttachmentKind::Image => {
                image_parts.push(ContentPart::ImageUrl {
                    url: attachment.data.clone(),
                });
            }
        }
    }

    if image_parts.is_empty() {
        UserContent::Text(text)
    } else {
        let mut parts = vec![ContentPart::Text { text }];
        parts.extend(image_parts);
        UserContent::Parts(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with(map: &[(SettingKey, &str)]) -> EffectiveSettings {
        let map: HashMap<SettingKey, String> = map
            .iter()
            .map(|(k, v)| (*k, v.to_string()))
            .collect();
        EffectiveSettings::from_map(&map)
    }

    #[test]
    fn absent_settings_fall_back_to_defaults() {
        let settings = settings_with(&[]);
        assert_eq!(settings.model, "gpt-4o-mini");
        assert_eq!(settings.temperature, 0.7);
        assert!(settings.memory_enabled);
        assert!(settings.auto_memory_enabled);
        assert_eq!(settings.mode, ChatMode::Normal);
        assert!(settings.provider_api_key.is_none());
    }

    #[test]
    fn stored_settings_are_applied_and_clamped() {
        let settings = settings_with(&[
            (SettingKey::ChatModel, "o3-mini"),
            (SettingKey::Temperature, "9.5"),
            (SettingKey::MemoryEnabled, "false"),
            (SettingKey::ChatMode, "deep_research"),
        ]);
        assert_eq!(settings.model, "o3-mini");
        assert_eq!(settings.temperature, 2.0);
        assert!(!settings.memory_enabled);
        assert_eq!(settings.mode, ChatMode::DeepResearch);
    }

    #[test]
    fn memory_block_requires_toggle_and_facts() {
        let facts = vec![MemoryFact {
            id: "f1".to_string(),
            user_id: "alice".to_string(),
            content: "Lives in Berlin".to_string(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }];

        let on = settings_with(&[]);
        assert!(build_system_prompt(&on, &facts).contains("Lives in Berlin"));
        assert!(!build_system_prompt(&on, &[]).contains("Known facts"));

        let off = settings_with(&[(SettingKey::MemoryEnabled, "false")]);
        assert!(!build_system_prompt(&off, &facts).contains("Lives in Berlin"));
    }

    #[test]
    fn attachments_fold_into_the_user_turn() {
        let plain = build_user_turn("hi", &[]);
        assert!(matches!(plain, UserContent::Text(t) if t == "hi"));

        let with_file = build_user_turn(
            "summarize this",
            &[Attachment {
                kind: AttachmentKind::TextFile,
                name: Some("notes.txt".to_string()),
                data: "line one".to_string(),
            }],
        );
        match with_file {
            UserContent::Text(text) => {
                assert!(text.contains("```notes.txt"));
                assert!(text.contains("line one"));
            }
            _ => panic!("text-only attachments should stay a text turn"),
        }

        let with_image = build_user_turn(
            "what is this",
            &[Attachment {
                kind: AttachmentKind::Image,
                name: None,
                data: "data:image/png;base64,AAAA".to_string(),
            }],
        );
        match with_image {
            UserContent::Parts(parts) => {
                assert_eq!(parts.len(), 2);
                assert!(matches!(&parts[0], ContentPart::Text { .. }));
                assert!(matches!(&parts[1], ContentPart::ImageUrl { .. }));
            }
            _ => panic!("image attachments should produce a multi-part turn"),
        }
    }
}
