use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use serde_json::{Value, json};
use tern_common::Error;
use tern_db::SettingKey;
use tern_security::validate_public_url;

use crate::state::SharedState;

/// The opaque authenticated user identity, supplied by the fronting auth
/// layer. The gateway trusts it absolutely and performs no authentication
/// of its own.
pub struct AuthUser(pub String);

impl<S> axum::extract::FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<Value>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| AuthUser(v.to_string()))
            .ok_or_else(|| {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({ "status": "error", "message": "missing user identity" })),
                )
            })
    }
}

type ApiError = (StatusCode, Json<Value>);
type ApiResult<T> = Result<T, ApiError>;

fn store_error(e: Error) -> ApiError {
    let status = match e {
        Error::Invalid(_) | Error::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({ "status": "error", "message": e.to_string() })),
    )
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "status": "error", "message": message.into() })),
    )
}

fn not_found(message: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "status": "error", "message": message })),
    )
}

pub async fn health() -> &'static str {
    "ok"
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

pub async fn list_conversations(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<Value>> {
    let conversations = state
        .chat
        .lock()
        .await
        .list_conversations(&user)
        .map_err(store_error)?;
    Ok(Json(json!({ "conversations": conversations })))
}

#[derive(serde::Deserialize)]
pub struct CreateConversationRequest {
    pub title: Option<String>,
}

pub async fn create_conversation(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Json(body): Json<CreateConversationRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let title = body
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or("New conversation");

    let conversation = state
        .chat
        .lock()
        .await
        .create_conversation(&user, title)
        .map_err(store_error)?;
    Ok((StatusCode::CREATED, Json(json!({ "conversation": conversation }))))
}

#[derive(serde::Deserialize)]
pub struct RenameConversationRequest {
    pub title: String,
}

pub async fn rename_conversation(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Json(body): Json<RenameConversationRequest>,
) -> ApiResult<Json<Value>> {
    let title = body.title.trim();
    if title.is_empty() {
        return Err(bad_request("title must not be empty"));
    }

    let renamed = state
        .chat
        .lock()
        .await
        .rename_conversation(&user, &id, title)
        .map_err(store_error)?;
    if !renamed {
        return Err(not_found("conversation not found"));
    }
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn delete_conversation(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let deleted = state
        .chat
        .lock()
        .await
        .delete_conversation(&user, &id)
        .map_err(store_error)?;
    if !deleted {
        return Err(not_found("conversation not found"));
    }
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn list_messages(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let messages = state
        .chat
        .lock()
        .await
        .list_messages(&user, &id)
        .map_err(store_error)?;
    Ok(Json(json!({ "messages": messages })))
}

/// The "edit" operation: removes the message and everything after it; the
/// client re-sends the edited content as a fresh chat request.
pub async fn edit_message(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path((conversation_id, message_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let deleted = state
        .chat
        .lock()
        .await
        .delete_from_message(&user, &conversation_id, &message_id)
        .map_err(store_error)?;
    Ok(Json(json!({ "status": "ok", "deleted": deleted })))
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Settings view. Secrets are reported as an "is set" boolean only, never
/// in cleartext.
pub async fn get_settings(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<Value>> {
    let map = state
        .chat
        .lock()
        .await
        .settings_map(&user)
        .map_err(store_error)?;

    let mut view = serde_json::Map::new();
    for key in SettingKey::ALL {
        let value = if key.is_secret() {
            Value::Bool(map.contains_key(&key))
        } else {
            map.get(&key)
                .cloned()
                .map(Value::String)
                .unwrap_or(Value::Null)
        };
        view.insert(key.as_str().to_string(), value);
    }
    Ok(Json(json!({ "settings": view })))
}

/// Accepts a partial key→value object; null clears a key. Unknown keys and
/// unparsable values are rejected before anything is written.
pub async fn put_settings(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Json(body): Json<serde_json::Map<String, Value>>,
) -> ApiResult<Json<Value>> {
    let mut updates: Vec<(SettingKey, Option<String>)> = Vec::new();
    for (raw_key, raw_value) in &body {
        let key = SettingKey::parse(raw_key)
            .ok_or_else(|| bad_request(format!("unknown setting key: {raw_key}")))?;
        let value = match raw_value {
            Value::Null => None,
            Value::String(v) => Some(v.clone()),
            other => Some(other.to_string()),
        };

        if let Some(value) = &value {
            validate_setting(key, value).map_err(bad_request)?;
        }
        updates.push((key, value));
    }

    let chat = state.chat.lock().await;
    for (key, value) in updates {
        match value {
            Some(value) => chat.set_setting(&user, key, &value).map_err(store_error)?,
            None => chat.delete_setting(&user, key).map_err(store_error)?,
        }
    }
    Ok(Json(json!({ "status": "ok" })))
}

fn validate_setting(key: SettingKey, value: &str) -> Result<(), String> {
    match key {
        SettingKey::Temperature => value
            .parse::<f64>()
            .map(drop)
            .map_err(|_| format!("temperature must be a number, got '{value}'")),
        SettingKey::MemoryEnabled | SettingKey::AutoMemoryEnabled => {
            match value {
                "true" | "false" | "1" | "0" => Ok(()),
                _ => Err(format!("{} must be a boolean, got '{value}'", key.as_str())),
            }
        }
        SettingKey::ChatMode => match value {
            "normal" | "thinking" | "deep_research" => Ok(()),
            _ => Err(format!("unknown chat mode '{value}'")),
        },
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

pub async fn list_memory(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<Value>> {
    let facts = state
        .memory
        .lock()
        .await
        .list_facts(&user)
        .map_err(store_error)?;
    Ok(Json(json!({ "facts": facts })))
}

#[derive(serde::Deserialize)]
pub struct AddMemoryRequest {
    pub content: String,
}

pub async fn add_memory(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Json(body): Json<AddMemoryRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let limits = state.config.limits;
    let outcome = state
        .memory
        .lock()
        .await
        .save_fact(
            &user,
            &body.content,
            limits.max_memory_facts,
            limits.max_fact_chars,
        )
        .map_err(store_error)?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "ok", "outcome": format!("{outcome:?}").to_lowercase() })),
    ))
}

pub async fn delete_memory(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let deleted = state
        .memory
        .lock()
        .await
        .delete_fact(&user, &id)
        .map_err(store_error)?;
    if !deleted {
        return Err(not_found("fact not found"));
    }
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn clear_memory(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<Value>> {
    let cleared = state
        .memory
        .lock()
        .await
        .clear_facts(&user)
        .map_err(store_error)?;
    Ok(Json(json!({ "status": "ok", "cleared": cleared })))
}

// ---------------------------------------------------------------------------
// Remote tool servers
// ---------------------------------------------------------------------------

pub async fn list_tool_servers(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<Value>> {
    let servers = state
        .chat
        .lock()
        .await
        .list_tool_servers(&user)
        .map_err(store_error)?;
    Ok(Json(json!({ "servers": servers })))
}

#[derive(serde::Deserialize)]
pub struct ToolServerRequest {
    pub name: String,
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_auth_kind")]
    pub auth_kind: String,
    pub auth_credential: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_auth_kind() -> String {
    "none".to_string()
}

fn validate_tool_server(body: &ToolServerRequest) -> Result<(), ApiError> {
    if body.name.trim().is_empty() {
        return Err(bad_request("server name must not be empty"));
    }
    // The SSRF guard applies at write time too, so a private URL never even
    // reaches the per-request discovery path.
    validate_public_url(&body.url).map_err(store_error)?;
    if !matches!(body.auth_kind.as_str(), "none" | "token" | "oauth") {
        return Err(bad_request(format!(
            "unknown auth kind '{}'; use none, token or oauth",
            body.auth_kind
        )));
    }
    if body.auth_kind != "none" && body.auth_credential.as_deref().unwrap_or("").is_empty() {
        return Err(bad_request("auth credential is required for this auth kind"));
    }
    Ok(())
}

pub async fn add_tool_server(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Json(body): Json<ToolServerRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    validate_tool_server(&body)?;

    let server = state
        .chat
        .lock()
        .await
        .add_tool_server(
            &user,
            body.name.trim(),
            &body.url,
            body.enabled,
            &body.auth_kind,
            body.auth_credential.as_deref(),
        )
        .map_err(store_error)?;
    Ok((StatusCode::CREATED, Json(json!({ "server": server }))))
}

pub async fn update_tool_server(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Json(body): Json<ToolServerRequest>,
) -> ApiResult<Json<Value>> {
    validate_tool_server(&body)?;

    let updated = state
        .chat
        .lock()
        .await
        .update_tool_server(
            &user,
            &id,
            body.name.trim(),
            &body.url,
            body.enabled,
            &body.auth_kind,
            body.auth_credential.as_deref(),
        )
        .map_err(store_error)?;
    if !updated {
        return Err(not_found("server not found"));
    }
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn delete_tool_server(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let deleted = state
        .chat
        .lock()
        .await
        .delete_tool_server(&user, &id)
        .map_err(store_error)?;
    if !deleted {
        return Err(not_found("server not found"));
    }
    Ok(Json(json!({ "status": "ok" })))
}
