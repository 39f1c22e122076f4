use serde_json::json;

/// Client-visible streaming events. On the wire each event is one line: the
/// marker immediately followed by a JSON object.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    ConversationId { id: String },
    Delta { content: String },
    ToolCall { name: String, args: serde_json::Value },
    ToolResult { name: String, result: String },
    ImageGenerated { data_url: String, revised_prompt: String },
    ResearchStart,
    ResearchQuery { query: String },
    ResearchDone { query_count: usize },
    Done,
    Error { message: String },
}

impl ChatEvent {
    pub fn encode(&self) -> String {
        match self {
            ChatEvent::ConversationId { id } => {
                format!("conv_id{}", json!({ "conversationId": id }))
            }
            ChatEvent::Delta { content } => format!("delta{}", json!({ "content": content })),
            ChatEvent::ToolCall { name, args } => {
                format!("tool_call{}", json!({ "name": name, "args": args }))
            }
            ChatEvent::ToolResult { name, result } => {
                format!("tool_result{}", json!({ "name": name, "result": result }))
            }
            ChatEvent::ImageGenerated {
                data_url,
                revised_prompt,
            } => format!(
                "image_generated{}",
                json!({ "data_url": data_url, "revised_prompt": revised_prompt })
            ),
            ChatEvent::ResearchStart => format!("research_start{}", json!({})),
            ChatEvent::ResearchQuery { query } => {
                format!("research_query{}", json!({ "query": query }))
            }
            ChatEvent::ResearchDone { query_count } => {
                format!("research_done{}", json!({ "queryCount": query_count }))
            }
            ChatEvent::Done => format!("done{}", json!({})),
            ChatEvent::Error { message } => format!("error{}", json!({ "message": message })),
        }
    }
}
