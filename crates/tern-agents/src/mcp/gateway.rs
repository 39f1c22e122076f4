use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt, future::join_all};
use serde_json::{Value, json};
use tern_common::{Error, Result};
use tern_db::ToolServerRow;
use tern_security::validate_public_url;
use tracing::{debug, warn};

use crate::providers::ToolDefinition;

const PROTOCOL_VERSION: &str = "2024-11-05";

/// Process-lifetime JSON-RPC request id counter.
static NEXT_REQUEST_ID: AtomicI64 = AtomicI64::new(1);

/// A user-configured remote tool server, as consulted during one request.
#[derive(Debug, Clone)]
pub struct RemoteServer {
    pub name: String,
    pub url: String,
    pub auth: ServerAuth,
}

#[derive(Debug, Clone)]
pub enum ServerAuth {
    None,
    Token(String),
    OAuth(String),
}

impl RemoteServer {
    pub fn from_row(row: &ToolServerRow) -> Self {
        let auth = match (row.auth_kind.as_str(), row.auth_credential.as_deref()) {
            ("token", Some(credential)) => ServerAuth::Token(credential.to_string()),
            ("oauth", Some(credential)) => ServerAuth::OAuth(credential.to_string()),
            _ => ServerAuth::None,
        };
        Self {
            name: row.name.clone(),
            url: row.url.clone(),
            auth,
        }
    }
}

/// A tool advertised by a remote server.
#[derive(Debug, Clone)]
pub struct RemoteTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// JSON-RPC client for remote tool servers. Every server is treated as an
/// untrusted peer: its URL passes the SSRF guard before any I/O, every call
/// carries a bounded timeout, and every failure is contained to that server.
pub struct McpGateway {
    client: reqwest::Client,
    timeout: Duration,
    allow_private_networks: bool,
}

impl McpGateway {
    pub fn new(client: reqwest::Client, timeout_secs: u64) -> Self {
        Self {
            client,
            timeout: Duration::from_secs(timeout_secs),
            allow_private_networks: false,
        }
    }

    /// Skip the public-address requirement. For development setups where
    /// tool servers run on the local network; never enabled by the gateway.
    pub fn allow_private_networks(mut self) -> Self {
        self.allow_private_networks = true;
        self
    }

    /// One JSON-RPC round trip. Accepts both plain JSON responses and SSE
    /// bodies (some servers stream even single-shot calls).
    async fn rpc(&self, server: &RemoteServer, method: &str, params: Value) -> Result<Value> {
        if self.allow_private_networks {
            reqwest::Url::parse(&server.url)
                .map_err(|e| Error::Invalid(format!("invalid server URL '{}': {e}", server.url)))?;
        } else {
            validate_public_url(&server.url)?;
        }

        let envelope = json!({
            "jsonrpc": "2.0",
            "id": NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });

        let mut request = self
            .client
            .post(&server.url)
            .timeout(self.timeout)
            .header("Accept", "application/json, text/event-stream")
            .json(&envelope);

        match &server.auth {
            ServerAuth::None => {}
            ServerAuth::Token(credential) | ServerAuth::OAuth(credential) => {
                request = request.bearer_auth(credential);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Mcp(format!("request to '{}' failed: {e}", server.name)))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::Mcp(format!(
                "server '{}' returned {status}",
                server.name
            )));
        }

        let is_sse = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("text/event-stream"))
            .unwrap_or(false);

        let envelope = if is_sse {
            read_sse_envelope(&server.name, response.bytes_stream()).await?
        } else {
            response
                .json::<Value>()
                .await
                .map_err(|e| Error::Mcp(format!("invalid JSON from '{}': {e}", server.name)))?
        };

        unwrap_envelope(&server.name, envelope)
    }

    /// Capability handshake. Must succeed before `tools/list` or `tools/call`.
    async fn initialize(&self, server: &RemoteServer) -> Result<()> {
        self.rpc(
            server,
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": { "name": "tern", "version": env!("CARGO_PKG_VERSION") },
            }),
        )
        .await?;
        Ok(())
    }

    /// Handshake plus `tools/list` against one server.
    pub async fn list_tools(&self, server: &RemoteServer) -> Result<Vec<RemoteTool>> {
        self.initialize(server).await?;
        let result = self.rpc(server, "tools/list", json!({})).await?;

        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                Error::Mcp(format!(
                    "server '{}' returned no tool listing",
                    server.name
                ))
            })?;

        Ok(tools
            .iter()
            .filter_map(|tool| {
                let name = tool.get("name")?.as_str()?.to_string();
                Some(RemoteTool {
                    name,
                    description: tool
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    input_schema: tool
                        .get("inputSchema")
                        .cloned()
                        .unwrap_or_else(|| json!({ "type": "object" })),
                })
            })
            .collect())
    }

    /// Handshake plus `tools/call`. Never propagates: a broken remote tool
    /// degrades to failure text visible to the model.
    pub async fn call_tool(&self, server: &RemoteServer, name: &str, args: Value) -> String {
        let call = async {
            self.initialize(server).await?;
            self.rpc(
                server,
                "tools/call",
                json!({ "name": name, "arguments": args }),
            )
            .await
        };

        match call.await {
            Ok(result) => extract_text_content(&result),
            Err(e) => {
                warn!("remote tool '{name}' on '{}' failed: {e}", server.name);
                format!("Tool '{name}' failed: {e}")
            }
        }
    }

    /// Query all enabled servers concurrently and merge their catalogs.
    /// Discovery on each server is isolated: a failure or timeout on one
    /// never blocks or fails the others. Name collisions resolve
    /// first-server-wins in iteration order; losing servers never receive
    /// traffic for that name.
    pub async fn collect_tools(
        &self,
        servers: &[RemoteServer],
    ) -> (Vec<ToolDefinition>, HashMap<String, RemoteServer>) {
        let discoveries = join_all(
            servers
                .iter()
                .map(|server| async move { (server, self.list_tools(server).await) }),
        )
        .await;

        let mut catalog = Vec::new();
        let mut routing: HashMap<String, RemoteServer> = HashMap::new();

        for (server, discovery) in discoveries {
            let tools = match discovery {
                Ok(tools) => tools,
                Err(e) => {
                    warn!("tool discovery on '{}' failed: {e}", server.name);
                    continue;
                }
            };

            for tool in tools {
                if routing.contains_key(&tool.name) {
                    debug!(
                        "dropping tool '{}' from '{}': name already taken",
                        tool.name, server.name
                    );
                    continue;
                }
                routing.insert(tool.name.clone(), server.clone());
                catalog.push(ToolDefinition {
                    name: tool.name,
                    description: tool.description,
                    input_schema: tool.input_schema,
                });
            }
        }

        (catalog, routing)
    }
}

/// Read an SSE body incrementally and return the first `data:` payload that
/// carries a JSON-RPC envelope, cancelling the read as soon as it is found.
/// A stream that closes without one is a hard failure.
async fn read_sse_envelope(
    server_name: &str,
    body: impl Stream<Item = reqwest::Result<Bytes>>,
) -> Result<Value> {
    let mut body = std::pin::pin!(body);
    let mut buffer: Vec<u8> = Vec::new();

    loop {
        let chunk = match body.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                return Err(Error::Mcp(format!(
                    "stream from '{server_name}' failed: {e}"
                )));
            }
            None => break,
        };
        buffer.extend_from_slice(&chunk);

        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            if let Some(envelope) = parse_sse_line(&line) {
                return Ok(envelope);
            }
        }
    }

    // Unterminated trailing line.
    if let Some(envelope) = parse_sse_line(&std::mem::take(&mut buffer)) {
        return Ok(envelope);
    }

    Err(Error::Mcp(format!(
        "stream from '{server_name}' ended without a result"
    )))
}

fn parse_sse_line(raw: &[u8]) -> Option<Value> {
    let line = String::from_utf8_lossy(raw);
    let payload = line.trim().strip_prefix("data:")?.trim();
    let value: Value = serde_json::from_str(payload).ok()?;
    if value.get("result").is_some() || value.get("error").is_some() {
        Some(value)
    } else {
        None
    }
}

/// A JSON-RPC error envelope is always a failure, regardless of transport.
fn unwrap_envelope(server_name: &str, envelope: Value) -> Result<Value> {
    if let Some(error) = envelope.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(Error::Mcp(format!(
            "server '{server_name}' returned an error: {message}"
        )));
    }
    envelope
        .get("result")
        .cloned()
        .ok_or_else(|| Error::Mcp(format!("server '{server_name}' returned no result")))
}

/// Pull the text blocks out of a `tools/call` result.
fn extract_text_content(result: &Value) -> String {
    let texts: Vec<&str> = result
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    if texts.is_empty() {
        result.to_string()
    } else {
        texts.join("\n")
    }
}
