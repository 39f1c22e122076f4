use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use tern_common::{CancellationToken, Result, truncate_chars};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::events::ChatEvent;
use crate::providers::{
    ChatMessage, LlmProvider, LlmRequest, StreamChunk, ToolCallRequest, ToolDefinition,
};

/// Executes one tool call on behalf of the driver. Implementations convert
/// their own failures into descriptive result strings where possible; an
/// `Err` is caught by the driver and substituted the same way.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, args: serde_json::Value) -> Result<String>;
}

/// Terminal state of one driver run.
#[derive(Debug)]
pub enum DriverOutcome {
    /// The provider finished normally (or the round bound was reached).
    Completed { text: String },
    /// The cancellation signal fired mid-stream. Carries whatever text had
    /// been accumulated; the caller persists nothing for this case.
    Cancelled { partial: String },
}

/// Per-index accumulator for tool-call fragments within one round.
#[derive(Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

/// The multi-round conversation loop against the provider: streams text out
/// as it arrives, reconstructs tool calls from positional fragments, runs
/// them through the injected executor, folds the results back into the
/// message list, and repeats up to a fixed round bound.
pub struct ChatDriver<'a> {
    provider: &'a dyn LlmProvider,
    max_rounds: usize,
    tool_result_event_chars: usize,
}

impl<'a> ChatDriver<'a> {
    pub fn new(
        provider: &'a dyn LlmProvider,
        max_rounds: usize,
        tool_result_event_chars: usize,
    ) -> Self {
        Self {
            provider,
            max_rounds,
            tool_result_event_chars,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        mut messages: Vec<ChatMessage>,
        model: &str,
        temperature: Option<f64>,
        reasoning_effort: Option<&str>,
        tools: &[ToolDefinition],
        executor: Option<&dyn ToolExecutor>,
        events: &mpsc::Sender<ChatEvent>,
        cancel: &CancellationToken,
    ) -> Result<DriverOutcome> {
        let mut full_text = String::new();

        for round in 0..self.max_rounds {
            let request = LlmRequest {
                model: model.to_string(),
                messages: messages.clone(),
                temperature,
                reasoning_effort: reasoning_effort.map(str::to_string),
                tools: tools.to_vec(),
            };

            let mut stream = tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(DriverOutcome::Cancelled { partial: full_text });
                }
                opened = self.provider.stream(&request) => opened?,
            };

            let mut round_text = String::new();
            let mut pending: BTreeMap<u32, PendingCall> = BTreeMap::new();
            let mut finish_reason: Option<String> = None;

            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => {
                        full_text.push_str(&round_text);
                        return Ok(DriverOutcome::Cancelled { partial: full_text });
                    }
                    chunk = stream.next() => chunk,
                };
                let Some(chunk) = chunk else { break };

                match chunk? {
                    StreamChunk::TextDelta(text) => {
                        round_text.push_str(&text);
                        let _ = events.send(ChatEvent::Delta { content: text }).await;
                    }
                    StreamChunk::ToolCallFragment(frag) => {
                        // Fragments for one index arrive out of alignment with
                        // text deltas; concatenate them in arrival order.
                        let entry = pending.entry(frag.index).or_default();
                        if let Some(id) = frag.id
                            && entry.id.is_empty()
                        {
                            entry.id = id;
                        }
                        if let Some(name) = frag.name {
                            entry.name.push_str(&name);
                        }
                        entry.arguments.push_str(&frag.arguments);
                    }
                    StreamChunk::Finished(reason) => finish_reason = Some(reason),
                }
            }

            full_text.push_str(&round_text);

            let tool_round = finish_reason.as_deref() == Some("tool_calls")
                && !tools.is_empty()
                && !pending.is_empty();
            let Some(executor) = executor.filter(|_| tool_round) else {
                return Ok(DriverOutcome::Completed { text: full_text });
            };

            let calls: Vec<ToolCallRequest> = pending
                .into_values()
                .map(|call| ToolCallRequest {
                    id: if call.id.is_empty() {
                        format!("call_{}", uuid::Uuid::new_v4().simple())
                    } else {
                        call.id
                    },
                    name: call.name,
                    arguments: call.arguments,
                })
                .collect();

            debug!(round, calls = calls.len(), "executing tool round");

            messages.push(ChatMessage::Assistant {
                content: (!round_text.is_empty()).then(|| round_text.clone()),
                tool_calls: calls.clone(),
            });

            for call in &calls {
                let args: serde_json::Value =
                    serde_json::from_str(&call.arguments).unwrap_or_else(|_| serde_json::json!({}));

                let _ = events
                    .send(ChatEvent::ToolCall {
                        name: call.name.clone(),
                        args: args.clone(),
                    })
                    .await;

                let result = match executor.execute(&call.name, args).await {
                    Ok(result) => result,
                    Err(e) => format!("Tool '{}' failed: {e}", call.name),
                };

                let _ = events
                    .send(ChatEvent::ToolResult {
                        name: call.name.clone(),
                        result: truncate_chars(&result, self.tool_result_event_chars),
                    })
                    .await;

                messages.push(ChatMessage::Tool {
                    tool_call_id: call.id.clone(),
                    content: result,
                });
            }
        }

        warn!(
            "tool loop reached the {}-round bound; returning accumulated text",
            self.max_rounds
        );
        Ok(DriverOutcome::Completed { text: full_text })
    }
}
