use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tern_agents::driver::{ChatDriver, DriverOutcome, ToolExecutor};
use tern_agents::{ChatEvent, ChatMessage, OpenAiProvider, ToolDefinition, UserContent};
use tern_common::{CancellationToken, Result};
use tokio::sync::{Mutex, mpsc};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct RecordingExecutor {
    calls: Arc<Mutex<Vec<(String, Value)>>>,
}

#[async_trait]
impl ToolExecutor for RecordingExecutor {
    async fn execute(&self, name: &str, args: Value) -> Result<String> {
        self.calls.lock().await.push((name.to_string(), args));
        Ok(format!("result for {name}"))
    }
}

fn sse_body(chunks: &[Value]) -> String {
    let mut body = String::new();
    for chunk in chunks {
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

fn tool_round_body() -> String {
    sse_body(&[
        json!({"choices":[{"index":0,"delta":{"content":"Let me check."},"finish_reason":null}]}),
        json!({"choices":[{"index":0,"delta":{"tool_calls":[
            {"index":0,"id":"call_a","type":"function","function":{"name":"lookup","arguments":""}}
        ]},"finish_reason":null}]}),
        json!({"choices":[{"index":0,"delta":{"tool_calls":[
            {"index":0,"function":{"arguments":"{\"q\":\"tides\"}"}}
        ]},"finish_reason":null}]}),
        json!({"choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}),
    ])
}

fn final_round_body() -> String {
    sse_body(&[
        json!({"choices":[{"index":0,"delta":{"content":"The answer."},"finish_reason":null}]}),
        json!({"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}),
    ])
}

fn lookup_tool() -> ToolDefinition {
    ToolDefinition {
        name: "lookup".to_string(),
        description: "Look something up".to_string(),
        input_schema: json!({"type": "object"}),
    }
}

fn user_turn(text: &str) -> Vec<ChatMessage> {
    vec![ChatMessage::User {
        content: UserContent::Text(text.to_string()),
    }]
}

async fn drain(rx: &mut mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn tool_round_emits_one_call_and_one_result_per_index() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string(tool_round_body()))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string(final_round_body()))
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new("test-key".to_string(), Some(server.uri()));
    let driver = ChatDriver::new(&provider, 10, 600);
    let calls = Arc::new(Mutex::new(Vec::new()));
    let executor = RecordingExecutor {
        calls: Arc::clone(&calls),
    };
    let (tx, mut rx) = mpsc::channel(64);

    let outcome = driver
        .run(
            user_turn("check the tides"),
            "gpt-4o-mini",
            Some(0.7),
            Some("low"),
            &[lookup_tool()],
            Some(&executor),
            &tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    match outcome {
        DriverOutcome::Completed { text } => assert_eq!(text, "Let me check.The answer."),
        other => panic!("expected completion, got {other:?}"),
    }

    let recorded = calls.lock().await;
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].0, "lookup");
    assert_eq!(recorded[0].1, json!({"q": "tides"}));

    let events = drain(&mut rx).await;
    let tool_calls: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, ChatEvent::ToolCall { .. }))
        .collect();
    let tool_results: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, ChatEvent::ToolResult { .. }))
        .collect();
    assert_eq!(tool_calls.len(), 1);
    assert_eq!(tool_results.len(), 1);

    // the call is announced before its result
    let call_pos = events
        .iter()
        .position(|e| matches!(e, ChatEvent::ToolCall { .. }))
        .unwrap();
    let result_pos = events
        .iter()
        .position(|e| matches!(e, ChatEvent::ToolResult { .. }))
        .unwrap();
    assert!(call_pos < result_pos);

    // no terminal event comes from the driver; the orchestrator owns it
    assert!(!events.iter().any(|e| matches!(e, ChatEvent::Error { .. })));
}

#[tokio::test]
async fn two_indices_produce_two_ordered_call_result_pairs() {
    let server = MockServer::start().await;

    let round = sse_body(&[
        json!({"choices":[{"index":0,"delta":{"tool_calls":[
            {"index":0,"id":"call_a","type":"function","function":{"name":"lookup","arguments":"{}"}},
            {"index":1,"id":"call_b","type":"function","function":{"name":"lookup","arguments":"{}"}}
        ]},"finish_reason":null}]}),
        json!({"choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}),
    ]);

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string(round))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string(final_round_body()))
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new("test-key".to_string(), Some(server.uri()));
    let driver = ChatDriver::new(&provider, 10, 600);
    let calls = Arc::new(Mutex::new(Vec::new()));
    let executor = RecordingExecutor {
        calls: Arc::clone(&calls),
    };
    let (tx, mut rx) = mpsc::channel(64);

    driver
        .run(
            user_turn("two lookups"),
            "gpt-4o-mini",
            None,
            None,
            &[lookup_tool()],
            Some(&executor),
            &tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(calls.lock().await.len(), 2);

    let events = drain(&mut rx).await;
    let markers: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::ToolCall { .. } => Some("call"),
            ChatEvent::ToolResult { .. } => Some("result"),
            _ => None,
        })
        .collect();
    assert_eq!(markers, vec!["call", "result", "call", "result"]);
}

#[tokio::test]
async fn loop_terminates_at_the_round_bound() {
    let server = MockServer::start().await;

    // Every round asks for another tool call; the driver must stop anyway.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string(tool_round_body()))
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new("test-key".to_string(), Some(server.uri()));
    let driver = ChatDriver::new(&provider, 10, 600);
    let calls = Arc::new(Mutex::new(Vec::new()));
    let executor = RecordingExecutor {
        calls: Arc::clone(&calls),
    };
    let (tx, _rx) = mpsc::channel(1024);

    let outcome = driver
        .run(
            user_turn("loop forever"),
            "gpt-4o-mini",
            None,
            None,
            &[lookup_tool()],
            Some(&executor),
            &tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(matches!(outcome, DriverOutcome::Completed { .. }));
    assert_eq!(server.received_requests().await.unwrap().len(), 10);
    assert_eq!(calls.lock().await.len(), 10);
}

#[tokio::test]
async fn unparsable_arguments_fall_back_to_an_empty_object() {
    let server = MockServer::start().await;

    let round = sse_body(&[
        json!({"choices":[{"index":0,"delta":{"tool_calls":[
            {"index":0,"id":"call_a","type":"function","function":{"name":"lookup","arguments":"not json"}}
        ]},"finish_reason":null}]}),
        json!({"choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}),
    ]);

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string(round))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string(final_round_body()))
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new("test-key".to_string(), Some(server.uri()));
    let driver = ChatDriver::new(&provider, 10, 600);
    let calls = Arc::new(Mutex::new(Vec::new()));
    let executor = RecordingExecutor {
        calls: Arc::clone(&calls),
    };
    let (tx, _rx) = mpsc::channel(64);

    driver
        .run(
            user_turn("bad args"),
            "gpt-4o-mini",
            None,
            None,
            &[lookup_tool()],
            Some(&executor),
            &tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(calls.lock().await[0].1, json!({}));
}

#[tokio::test]
async fn cancellation_mid_stream_is_graceful() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(final_round_body())
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new("test-key".to_string(), Some(server.uri()));
    let driver = ChatDriver::new(&provider, 10, 600);
    let (tx, mut rx) = mpsc::channel(64);

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let started = std::time::Instant::now();
    let outcome = driver
        .run(
            user_turn("slow request"),
            "gpt-4o-mini",
            None,
            None,
            &[],
            None,
            &tx,
            &cancel,
        )
        .await
        .unwrap();

    assert!(matches!(outcome, DriverOutcome::Cancelled { .. }));
    assert!(started.elapsed() < Duration::from_secs(4));

    let events = drain(&mut rx).await;
    assert!(!events.iter().any(|e| matches!(e, ChatEvent::Error { .. })));
}
