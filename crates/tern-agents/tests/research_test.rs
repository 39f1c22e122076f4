use serde_json::json;
use tern_agents::research::ResearchPipeline;
use tern_agents::{ChatEvent, OpenAiProvider, SearchClient};
use tern_common::CancellationToken;
use tokio::sync::mpsc;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn completion(text: &str) -> serde_json::Value {
    json!({ "choices": [{ "message": { "content": text }, "finish_reason": "stop" }] })
}

async fn mount_plan(mock: &MockServer, queries: &str) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("planning web research"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(queries)))
        .mount(mock)
        .await;
}

async fn mount_gap(mock: &MockServer, queries: &str) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("reviewing research coverage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(queries)))
        .mount(mock)
        .await;
}

fn events_of(rx: &mut mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn empty_gap_analysis_skips_the_second_round() {
    let mock = MockServer::start().await;
    mount_plan(&mock, r#"{"queries": ["tern migration", "tern habitat", "tern diet"]}"#).await;
    mount_gap(&mock, r#"{"queries": []}"#).await;
    Mock::given(method("POST"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "answer": "Terns migrate very far.",
            "results": [
                { "title": "Arctic tern", "url": "https://example.com/tern", "content": "The Arctic tern has the longest migration." }
            ]
        })))
        .mount(&mock)
        .await;

    let provider = OpenAiProvider::new("k".to_string(), Some(mock.uri()));
    let search = SearchClient::new(reqwest::Client::new(), format!("{}/search", mock.uri()), 20);
    let pipeline = ResearchPipeline::new(&provider, &search, "search-key", "gpt-4o-mini");

    let (tx, mut rx) = mpsc::channel(64);
    let digest = pipeline
        .run("How far do terns migrate?", &tx, &CancellationToken::new())
        .await
        .unwrap();

    assert!(digest.contains("### Search 1: tern migration"));
    assert!(digest.contains("Terns migrate very far."));
    assert!(digest.contains("https://example.com/tern"));

    let events = events_of(&mut rx);
    let queries: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, ChatEvent::ResearchQuery { .. }))
        .collect();
    assert_eq!(queries.len(), 3, "no second-round queries may be issued");
    assert!(events.contains(&ChatEvent::ResearchStart));
    assert!(events.contains(&ChatEvent::ResearchDone { query_count: 3 }));
}

#[tokio::test]
async fn follow_up_round_appends_to_the_digest() {
    let mock = MockServer::start().await;
    mount_plan(&mock, r#"{"queries": ["q one", "q two"]}"#).await;
    mount_gap(&mock, r#"{"queries": ["q three"]}"#).await;
    Mock::given(method("POST"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{ "title": "T", "url": "https://e.com", "content": "c" }]
        })))
        .mount(&mock)
        .await;

    let provider = OpenAiProvider::new("k".to_string(), Some(mock.uri()));
    let search = SearchClient::new(reqwest::Client::new(), format!("{}/search", mock.uri()), 20);
    let pipeline = ResearchPipeline::new(&provider, &search, "search-key", "gpt-4o-mini");

    let (tx, mut rx) = mpsc::channel(64);
    let digest = pipeline
        .run("question", &tx, &CancellationToken::new())
        .await
        .unwrap();

    assert!(digest.contains("### Search 3: q three"));

    let events = events_of(&mut rx);
    assert!(events.contains(&ChatEvent::ResearchDone { query_count: 3 }));
}

#[tokio::test]
async fn failed_queries_become_placeholders_not_errors() {
    let mock = MockServer::start().await;
    mount_plan(&mock, r#"{"queries": ["only query"]}"#).await;
    mount_gap(&mock, r#"{"queries": []}"#).await;
    Mock::given(method("POST"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock)
        .await;

    let provider = OpenAiProvider::new("k".to_string(), Some(mock.uri()));
    let search = SearchClient::new(reqwest::Client::new(), format!("{}/search", mock.uri()), 20);
    let pipeline = ResearchPipeline::new(&provider, &search, "search-key", "gpt-4o-mini");

    let (tx, _rx) = mpsc::channel(64);
    let digest = pipeline
        .run("question", &tx, &CancellationToken::new())
        .await
        .unwrap();

    assert!(digest.contains("[Search 1: failed]"));
}
