use serde_json::json;
use tern_agents::mcp::{McpGateway, RemoteServer, ServerAuth};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn server(url: &str) -> RemoteServer {
    RemoteServer {
        name: "test".to_string(),
        url: url.to_string(),
        auth: ServerAuth::None,
    }
}

async fn mount_initialize(mock: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_partial_json(json!({ "method": "initialize" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 1,
            "result": { "protocolVersion": "2024-11-05", "capabilities": {} }
        })))
        .mount(mock)
        .await;
}

async fn mount_tools_list(mock: &MockServer, tools: serde_json::Value) {
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_partial_json(json!({ "method": "tools/list" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 2,
            "result": { "tools": tools }
        })))
        .mount(mock)
        .await;
}

#[tokio::test]
async fn private_urls_are_rejected_before_any_network_io() {
    let gateway = McpGateway::new(reqwest::Client::new(), 10);

    for url in [
        "http://127.0.0.1/x",
        "http://192.168.1.5/",
        "http://localhost/",
        "http://10.1.2.3/rpc",
        "http://[::1]:8080/",
    ] {
        let err = gateway.list_tools(&server(url)).await.unwrap_err();
        let message = err.to_string();
        assert!(
            message.contains("private") || message.contains("loopback") || message.contains("localhost"),
            "unexpected error for {url}: {message}"
        );
    }
}

#[tokio::test]
async fn discovery_lists_tools_after_the_handshake() {
    let mock = MockServer::start().await;
    mount_initialize(&mock).await;
    mount_tools_list(
        &mock,
        json!([{
            "name": "search",
            "description": "Search things",
            "inputSchema": { "type": "object", "properties": { "q": { "type": "string" } } }
        }]),
    )
    .await;

    let gateway = McpGateway::new(reqwest::Client::new(), 10).allow_private_networks();
    let tools = gateway.list_tools(&server(&mock.uri())).await.unwrap();

    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "search");

    // initialize must precede tools/list
    let requests = mock.received_requests().await.unwrap();
    let methods: Vec<String> = requests
        .iter()
        .map(|r| {
            serde_json::from_slice::<serde_json::Value>(&r.body).unwrap()["method"]
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect();
    assert_eq!(methods, vec!["initialize", "tools/list"]);
}

#[tokio::test]
async fn name_collisions_resolve_first_server_wins() {
    let first = MockServer::start().await;
    let second = MockServer::start().await;

    for mock in [&first, &second] {
        mount_initialize(mock).await;
        mount_tools_list(
            mock,
            json!([{ "name": "search", "description": "dup", "inputSchema": { "type": "object" } }]),
        )
        .await;
    }
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_partial_json(json!({ "method": "tools/call" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 3,
            "result": { "content": [{ "type": "text", "text": "from first" }] }
        })))
        .mount(&first)
        .await;

    let gateway = McpGateway::new(reqwest::Client::new(), 10).allow_private_networks();
    let servers = vec![
        RemoteServer {
            name: "first".to_string(),
            url: first.uri(),
            auth: ServerAuth::None,
        },
        RemoteServer {
            name: "second".to_string(),
            url: second.uri(),
            auth: ServerAuth::None,
        },
    ];

    let (catalog, routing) = gateway.collect_tools(&servers).await;
    assert_eq!(catalog.len(), 1);
    assert_eq!(routing.get("search").unwrap().name, "first");

    // all `search` traffic goes to the winning server
    let result = gateway
        .call_tool(routing.get("search").unwrap(), "search", json!({"q": "x"}))
        .await;
    assert_eq!(result, "from first");

    let second_calls = second
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| {
            serde_json::from_slice::<serde_json::Value>(&r.body).unwrap()["method"] == "tools/call"
        })
        .count();
    assert_eq!(second_calls, 0);
}

#[tokio::test]
async fn one_failing_server_does_not_block_the_others() {
    let healthy = MockServer::start().await;
    mount_initialize(&healthy).await;
    mount_tools_list(
        &healthy,
        json!([{ "name": "weather", "description": "", "inputSchema": { "type": "object" } }]),
    )
    .await;

    let broken = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&broken)
        .await;

    let gateway = McpGateway::new(reqwest::Client::new(), 10).allow_private_networks();
    let servers = vec![
        RemoteServer {
            name: "broken".to_string(),
            url: broken.uri(),
            auth: ServerAuth::None,
        },
        RemoteServer {
            name: "healthy".to_string(),
            url: healthy.uri(),
            auth: ServerAuth::None,
        },
    ];

    let (catalog, routing) = gateway.collect_tools(&servers).await;
    assert_eq!(catalog.len(), 1);
    assert_eq!(catalog[0].name, "weather");
    assert_eq!(routing.get("weather").unwrap().name, "healthy");
}

#[tokio::test]
async fn sse_responses_are_read_to_the_first_result_line() {
    let mock = MockServer::start().await;

    let sse = "event: message\n\
               data: {\"unrelated\": true}\n\
               data: {\"jsonrpc\": \"2.0\", \"id\": 1, \"result\": {\"protocolVersion\": \"2024-11-05\"}}\n\n";
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": "initialize" })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse.as_bytes().to_vec(), "text/event-stream"),
        )
        .mount(&mock)
        .await;
    mount_tools_list(&mock, json!([])).await;

    let gateway = McpGateway::new(reqwest::Client::new(), 10).allow_private_networks();
    let tools = gateway.list_tools(&server(&mock.uri())).await.unwrap();
    assert!(tools.is_empty());
}

#[tokio::test]
async fn sse_stream_without_a_result_is_a_hard_failure() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(
                    "event: message\ndata: {\"no\": \"envelope\"}\n\n"
                        .as_bytes()
                        .to_vec(),
                    "text/event-stream",
                ),
        )
        .mount(&mock)
        .await;

    let gateway = McpGateway::new(reqwest::Client::new(), 10).allow_private_networks();
    let err = gateway.list_tools(&server(&mock.uri())).await.unwrap_err();
    assert!(err.to_string().contains("without a result"));
}

#[tokio::test]
async fn rpc_error_envelopes_fail_even_on_http_200() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 1,
            "error": { "code": -32601, "message": "method not found" }
        })))
        .mount(&mock)
        .await;

    let gateway = McpGateway::new(reqwest::Client::new(), 10).allow_private_networks();
    let err = gateway.list_tools(&server(&mock.uri())).await.unwrap_err();
    assert!(err.to_string().contains("method not found"));
}

#[tokio::test]
async fn call_failures_degrade_to_text_for_the_model() {
    let gateway = McpGateway::new(reqwest::Client::new(), 10).allow_private_networks();

    // server that refuses everything
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock)
        .await;

    let result = gateway
        .call_tool(&server(&mock.uri()), "search", json!({}))
        .await;
    assert!(result.contains("failed"));
}

#[tokio::test]
async fn bearer_tokens_are_sent_for_token_auth() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("authorization", "Bearer sekrit"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 1, "result": {}
        })))
        .mount(&mock)
        .await;

    let gateway = McpGateway::new(reqwest::Client::new(), 10).allow_private_networks();
    let server = RemoteServer {
        name: "auth".to_string(),
        url: mock.uri(),
        auth: ServerAuth::Token("sekrit".to_string()),
    };

    // initialize succeeds only if the header matched; tools/list then gets
    // an empty result object and fails on the missing listing.
    let err = gateway.list_tools(&server).await.unwrap_err();
    assert!(err.to_string().contains("no tool listing"));
}
