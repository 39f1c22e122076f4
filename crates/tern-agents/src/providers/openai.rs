use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tern_common::{Error, Result};

use super::{
    ChatMessage, ContentPart, LlmProvider, LlmRequest, LlmStream, StreamChunk, ToolCallFragment,
    UserContent,
};

/// OpenAI-compatible chat-completions provider.
#[derive(Clone)]
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

/// Model families that take a `reasoning_effort` parameter instead of a
/// sampling temperature. The two are mutually exclusive on the wire.
pub fn uses_reasoning_effort(model: &str) -> bool {
    ["o1", "o3", "o4", "gpt-5"]
        .iter()
        .any(|prefix| model.starts_with(prefix))
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        }
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    fn convert_request(&self, request: &LlmRequest, stream: bool) -> WireRequest {
        let messages = request.messages.iter().map(convert_message).collect();

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| WireTool {
                        kind: "function".to_string(),
                        function: WireFunctionDefinition {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.input_schema.clone(),
                        },
                    })
                    .collect(),
            )
        };

        let (temperature, reasoning_effort) = if uses_reasoning_effort(&request.model) {
            (None, request.reasoning_effort.clone())
        } else {
            (request.temperature, None)
        };

        WireRequest {
            model: request.model.clone(),
            messages,
            temperature,
            reasoning_effort,
            tools,
            stream,
        }
    }

    async fn post(&self, body: &WireRequest) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Provider(format!(
                "provider returned {status}: {detail}"
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn provider_id(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &LlmRequest) -> Result<String> {
        let body = self.convert_request(request, false);
        let response = self.post(&body).await?;

        let parsed: WireResponse = response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("failed to parse response: {e}")))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Provider("no choices in response".to_string()))?;
        Ok(choice.message.content.unwrap_or_default())
    }

    async fn stream(&self, request: &LlmRequest) -> Result<LlmStream> {
        let body = self.convert_request(request, true);
        let response = self.post(&body).await?;
        Ok(SseParser::new(response.bytes_stream()).boxed())
    }
}

fn convert_message(msg: &ChatMessage) -> WireMessage {
    match msg {
        ChatMessage::System { content } => WireMessage::System {
            content: content.clone(),
        },
        ChatMessage::User { content } => WireMessage::User {
            content: match content {
                UserContent::Text(text) => WireUserContent::Text(text.clone()),
                UserContent::Parts(parts) => WireUserContent::Parts(
                    parts
                        .iter()
                        .map(|part| match part {
                            ContentPart::Text { text } => WireContentPart::Text {
                                text: text.clone(),
                            },
                            ContentPart::ImageUrl { url } => WireContentPart::ImageUrl {
                                image_url: WireImageUrl { url: url.clone() },
                            },
                        })
                        .collect(),
                ),
            },
        },
        ChatMessage::Assistant {
            content,
            tool_calls,
        } => WireMessage::Assistant {
            content: content.clone(),
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(
                    tool_calls
                        .iter()
                        .map(|call| WireToolCall {
                            id: call.id.clone(),
                            kind: "function".to_string(),
                            function: WireFunctionCall {
                                name: call.name.clone(),
                                arguments: call.arguments.clone(),
                            },
                        })
                        .collect(),
                )
            },
        },
        ChatMessage::Tool {
            tool_call_id,
            content,
        } => WireMessage::Tool {
            tool_call_id: tool_call_id.clone(),
            content: content.clone(),
        },
    }
}

// Request wire types

#[derive(Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    stream: bool,
}

#[derive(Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum WireMessage {
    System {
        content: String,
    },
    User {
        content: WireUserContent,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<WireToolCall>>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Serialize)]
#[serde(untagged)]
enum WireUserContent {
    Text(String),
    Parts(Vec<WireContentPart>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContentPart {
    Text { text: String },
    ImageUrl { image_url: WireImageUrl },
}

#[derive(Serialize)]
struct WireImageUrl {
    url: String,
}

#[derive(Serialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: WireFunctionCall,
}

#[derive(Serialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: String,
    function: WireFunctionDefinition,
}

#[derive(Serialize)]
struct WireFunctionDefinition {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

// Response wire types

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
}

#[derive(Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireStreamChunk {
    choices: Vec<WireStreamChoice>,
}

#[derive(Deserialize)]
struct WireStreamChoice {
    delta: WireStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WireStreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<WireStreamToolCall>>,
}

#[derive(Deserialize)]
struct WireStreamToolCall {
    index: u32,
    id: Option<String>,
    function: Option<WireStreamFunctionCall>,
}

#[derive(Deserialize)]
struct WireStreamFunctionCall {
    name: Option<String>,
    arguments: Option<String>,
}

/// Incremental parser over the provider's SSE body. Each `data:` line is a
/// JSON chunk; `[DONE]` terminates the stream.
struct SseParser {
    stream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    buffer: Vec<u8>,
    queue: VecDeque<Result<StreamChunk>>,
    exhausted: bool,
}

impl SseParser {
    fn new(stream: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static) -> Self {
        Self {
            stream: Box::pin(stream),
            buffer: Vec::new(),
            queue: VecDeque::new(),
            exhausted: false,
        }
    }

    fn drain_complete_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.handle_line(&line);
        }
    }

    fn flush_tail(&mut self) {
        if !self.buffer.is_empty() {
            let tail = std::mem::take(&mut self.buffer);
            self.handle_line(&tail);
        }
    }

    fn handle_line(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        let Some(payload) = line.strip_prefix("data:") else {
            return;
        };
        let payload = payload.trim();
        if payload.is_empty() || payload == "[DONE]" {
            return;
        }

        match serde_json::from_str::<WireStreamChunk>(payload) {
            Ok(chunk) => {
                for choice in chunk.choices {
                    if let Some(text) = choice.delta.content {
                        if !text.is_empty() {
                            self.queue.push_back(Ok(StreamChunk::TextDelta(text)));
                        }
                    }
                    if let Some(calls) = choice.delta.tool_calls {
                        for call in calls {
                            self.queue.push_back(Ok(StreamChunk::ToolCallFragment(
                                ToolCallFragment {
                                    index: call.index,
                                    id: call.id,
                                    name: call.function.as_ref().and_then(|f| f.name.clone()),
                                    arguments: call
                                        .function
                                        .as_ref()
                                        .and_then(|f| f.arguments.clone())
                                        .unwrap_or_default(),
                                },
                            )));
                        }
                    }
                    if let Some(reason) = choice.finish_reason {
                        self.queue.push_back(Ok(StreamChunk::Finished(reason)));
                    }
                }
            }
            Err(e) => {
                self.queue
                    .push_back(Err(Error::Provider(format!("stream parse error: {e}"))));
            }
        }
    }
}

impl Stream for SseParser {
    type Item = Result<StreamChunk>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(item) = this.queue.pop_front() {
                return Poll::Ready(Some(item));
            }
            if this.exhausted {
                return Poll::Ready(None);
            }

            match this.stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.buffer.extend_from_slice(&bytes);
                    this.drain_complete_lines();
                }
                Poll::Ready(Some(Err(e))) => {
                    this.exhausted = true;
                    return Poll::Ready(Some(Err(Error::Provider(format!("stream error: {e}")))));
                }
                Poll::Ready(None) => {
                    this.exhausted = true;
                    this.flush_tail();
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ToolDefinition;

    fn request(model: &str) -> LlmRequest {
        LlmRequest {
            model: model.to_string(),
            messages: vec![ChatMessage::User {
                content: UserContent::Text("hi".to_string()),
            }],
            temperature: Some(0.7),
            reasoning_effort: Some("high".to_string()),
            tools: vec![],
        }
    }

    #[test]
    fn reasoning_families_are_detected() {
        assert!(uses_reasoning_effort("o1-mini"));
        assert!(uses_reasoning_effort("o3"));
        assert!(uses_reasoning_effort("o4-mini-high"));
        assert!(uses_reasoning_effort("gpt-5-turbo"));
        assert!(!uses_reasoning_effort("gpt-4o-mini"));
        assert!(!uses_reasoning_effort("gpt-4.1"));
    }

    #[test]
    fn temperature_and_effort_are_mutually_exclusive() {
        let provider = OpenAiProvider::new("k".to_string(), None);

        let classic = provider.convert_request(&request("gpt-4o-mini"), false);
        let json = serde_json::to_value(&classic).unwrap();
        assert_eq!(json["temperature"], 0.7);
        assert!(json.get("reasoning_effort").is_none());

        let reasoning = provider.convert_request(&request("o3-mini"), false);
        let json = serde_json::to_value(&reasoning).unwrap();
        assert!(json.get("temperature").is_none());
        assert_eq!(json["reasoning_effort"], "high");
    }

    #[test]
    fn tool_catalog_serializes_as_functions() {
        let provider = OpenAiProvider::new("k".to_string(), None);
        let mut req = request("gpt-4o-mini");
        req.tools = vec![ToolDefinition {
            name: "memory_save".to_string(),
            description: "Save a fact".to_string(),
            input_schema: serde_json::json!({"type": "object"}),
        }];

        let json = serde_json::to_value(provider.convert_request(&req, true)).unwrap();
        assert_eq!(json["tools"][0]["type"], "function");
        assert_eq!(json["tools"][0]["function"]["name"], "memory_save");
        assert_eq!(json["stream"], true);
    }

    #[test]
    fn assistant_turn_carries_tool_calls() {
        let msg = ChatMessage::Assistant {
            content: None,
            tool_calls: vec![crate::providers::ToolCallRequest {
                id: "call_1".to_string(),
                name: "web_search".to_string(),
                arguments: "{\"query\":\"rust\"}".to_string(),
            }],
        };
        let json = serde_json::to_value(convert_message(&msg)).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["tool_calls"][0]["function"]["name"], "web_search");
        assert!(json.get("content").is_none());
    }
}
