use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tern_common::{Error, Result};
use tracing::info;

use crate::settings::SettingKey;

/// A conversation row. Ownership is checked on every access.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted chat message.
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A user-configured remote tool server.
#[derive(Debug, Clone, Serialize)]
pub struct ToolServerRow {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    pub auth_kind: String,
    #[serde(skip_serializing)]
    pub auth_credential: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persistent storage for conversations, messages, per-user settings and
/// remote tool server configurations.
pub struct ChatStore {
    conn: Connection,
}

impl ChatStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening chat store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self { conn };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self { conn };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS conversations (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    title TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_conversations_user
                    ON conversations(user_id, updated_at);

                CREATE TABLE IF NOT EXISTS messages (
                    id TEXT PRIMARY KEY,
                    conversation_id TEXT NOT NULL
                        REFERENCES conversations(id) ON DELETE CASCADE,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_messages_conversation
                    ON messages(conversation_id, created_at);

                CREATE TABLE IF NOT EXISTS settings (
                    user_id TEXT NOT NULL,
                    key TEXT NOT NULL,
                    value TEXT NOT NULL,
                    PRIMARY KEY (user_id, key)
                );

                CREATE TABLE IF NOT EXISTS tool_servers (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    url TEXT NOT NULL,
                    enabled INTEGER NOT NULL DEFAULT 1,
                    auth_kind TEXT NOT NULL DEFAULT 'none',
                    auth_credential TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_tool_servers_user
                    ON tool_servers(user_id);",
            )
            .map_err(|e| Error::Database(format!("migration failed: {e}")))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    pub fn create_conversation(&self, user_id: &str, title: &str) -> Result<Conversation> {
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO conversations (id, user_id, title, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![id, user_id, title, now.to_rfc3339()],
            )
            .map_err(|e| Error::Database(format!("failed to create conversation: {e}")))?;

        Ok(Conversation {
            id,
            user_id: user_id.to_string(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_conversation(&self, user_id: &str, id: &str) -> Result<Option<Conversation>> {
        self.conn
            .query_row(
                "SELECT id, user_id, title, created_at, updated_at
                 FROM conversations WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
                row_to_conversation,
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to load conversation: {e}")))
    }

    /// List a user's conversations, most recently updated first.
    pub fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, user_id, title, created_at, updated_at
                 FROM conversations WHERE user_id = ?1
                 ORDER BY updated_at DESC, rowid DESC",
            )
            .map_err(|e| Error::Database(format!("failed to prepare conversation query: {e}")))?;

        let rows = stmt
            .query_map(params![user_id], row_to_conversation)
            .map_err(|e| Error::Database(format!("failed to list conversations: {e}")))?;

        collect_rows(rows)
    }

    pub fn rename_conversation(&self, user_id: &str, id: &str, title: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE conversations SET title = ?3, updated_at = ?4
                 WHERE id = ?1 AND user_id = ?2",
                params![id, user_id, title, Utc::now().to_rfc3339()],
            )
            .map_err(|e| Error::Database(format!("failed to rename conversation: {e}")))?;
        Ok(rows > 0)
    }

    /// Bump a conversation's updated_at so it sorts to the top of the list.
    pub fn touch_conversation(&self, id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
                params![id, Utc::now().to_rfc3339()],
            )
            .map_err(|e| Error::Database(format!("failed to touch conversation: {e}")))?;
        Ok(())
    }

    /// Delete a conversation and, via the cascade, all of its messages.
    pub fn delete_conversation(&self, user_id: &str, id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "DELETE FROM conversations WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
            .map_err(|e| Error::Database(format!("failed to delete conversation: {e}")))?;
        Ok(rows > 0)
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    pub fn append_message(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
    ) -> Result<StoredMessage> {
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO messages (id, conversation_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, conversation_id, role, content, now.to_rfc3339()],
            )
            .map_err(|e| Error::Database(format!("failed to append message: {e}")))?;

        Ok(StoredMessage {
            id,
            conversation_id: conversation_id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            created_at: now,
        })
    }

    /// Load the most recent `limit` messages in chronological order.
    /// Insertion order (rowid) breaks created_at ties.
    pub fn load_recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, conversation_id, role, content, created_at
                 FROM messages WHERE conversation_id = ?1
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2",
            )
            .map_err(|e| Error::Database(format!("failed to prepare message query: {e}")))?;

        let rows = stmt
            .query_map(params![conversation_id, limit as i64], row_to_message)
            .map_err(|e| Error::Database(format!("failed to load messages: {e}")))?;

        let mut messages = collect_rows(rows)?;
        // Query is DESC for efficient tail fetch; return in chronological order.
        messages.reverse();
        Ok(messages)
    }

    pub fn list_messages(&self, user_id: &str, conversation_id: &str) -> Result<Vec<StoredMessage>> {
        if self.get_conversation(user_id, conversation_id)?.is_none() {
            return Err(Error::Invalid("conversation not found".to_string()));
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, conversation_id, role, content, created_at
                 FROM messages WHERE conversation_id = ?1
                 ORDER BY created_at ASC, rowid ASC",
            )
            .map_err(|e| Error::Database(format!("failed to prepare message query: {e}")))?;

        let rows = stmt
            .query_map(params![conversation_id], row_to_message)
            .map_err(|e| Error::Database(format!("failed to list messages: {e}")))?;

        collect_rows(rows)
    }

    pub fn count_messages(&self, conversation_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT count(*) FROM messages WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(format!("failed to count messages: {e}")))
    }

    /// The "edit" operation: delete the given message and every later message
    /// in the same conversation (by insertion order). The caller re-sends the
    /// edited content as a new message. Returns the number of deleted rows.
    pub fn delete_from_message(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<usize> {
        if self.get_conversation(user_id, conversation_id)?.is_none() {
            return Err(Error::Invalid("conversation not found".to_string()));
        }

        let anchor: Option<i64> = self
            .conn
            .query_row(
                "SELECT rowid FROM messages WHERE id = ?1 AND conversation_id = ?2",
                params![message_id, conversation_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to locate message: {e}")))?;

        let Some(anchor) = anchor else {
            return Err(Error::Invalid("message not found".to_string()));
        };

        let deleted = self
            .conn
            .execute(
                "DELETE FROM messages WHERE conversation_id = ?1 AND rowid >= ?2",
                params![conversation_id, anchor],
            )
            .map_err(|e| Error::Database(format!("failed to delete messages: {e}")))?;
        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub fn set_setting(&self, user_id: &str, key: SettingKey, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO settings (user_id, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id, key) DO UPDATE SET value = excluded.value",
                params![user_id, key.as_str(), value],
            )
            .map_err(|e| Error::Database(format!("failed to store setting: {e}")))?;
        Ok(())
    }

    pub fn get_setting(&self, user_id: &str, key: SettingKey) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM settings WHERE user_id = ?1 AND key = ?2",
                params![user_id, key.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to load setting: {e}")))
    }

    pub fn delete_setting(&self, user_id: &str, key: SettingKey) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM settings WHERE user_id = ?1 AND key = ?2",
                params![user_id, key.as_str()],
            )
            .map_err(|e| Error::Database(format!("failed to delete setting: {e}")))?;
        Ok(())
    }

    /// All of a user's stored settings as a key→value map.
    pub fn settings_map(&self, user_id: &str) -> Result<HashMap<SettingKey, String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM settings WHERE user_id = ?1")
            .map_err(|e| Error::Database(format!("failed to prepare settings query: {e}")))?;

        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| Error::Database(format!("failed to load settings: {e}")))?;

        let mut map = HashMap::new();
        for row in rows {
            let (raw_key, value) =
                row.map_err(|e| Error::Database(format!("failed to read setting row: {e}")))?;
            // Rows written by older versions with retired keys are skipped.
            if let Some(key) = SettingKey::parse(&raw_key) {
                map.insert(key, value);
            }
        }
        Ok(map)
    }

    // ------------------------------------------------------------------
    // Remote tool servers
    // ------------------------------------------------------------------

    pub fn add_tool_server(
        &self,
        user_id: &str,
        name: &str,
        url: &str,
        enabled: bool,
        auth_kind: &str,
        auth_credential: Option<&str>,
    ) -> Result<ToolServerRow> {
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO tool_servers
                   (id, user_id, name, url, enabled, auth_kind, auth_credential,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    id,
                    user_id,
                    name,
                    url,
                    enabled,
                    auth_kind,
                    auth_credential,
                    now.to_rfc3339()
                ],
            )
            .map_err(|e| Error::Database(format!("failed to add tool server: {e}")))?;

        Ok(ToolServerRow {
            id,
            user_id: user_id.to_string(),
            name: name.to_string(),
            url: url.to_string(),
            enabled,
            auth_kind: auth_kind.to_string(),
            auth_credential: auth_credential.map(str::to_string),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn list_tool_servers(&self, user_id: &str) -> Result<Vec<ToolServerRow>> {
        self.query_tool_servers(
            "SELECT id, user_id, name, url, enabled, auth_kind, auth_credential,
                    created_at, updated_at
             FROM tool_servers WHERE user_id = ?1 ORDER BY rowid ASC",
            user_id,
        )
    }

    /// Only enabled servers are consulted during orchestration. Iteration
    /// order (insertion order) decides name-collision winners downstream.
    pub fn list_enabled_tool_servers(&self, user_id: &str) -> Result<Vec<ToolServerRow>> {
        self.query_tool_servers(
            "SELECT id, user_id, name, url, enabled, auth_kind, auth_credential,
                    created_at, updated_at
             FROM tool_servers WHERE user_id = ?1 AND enabled = 1 ORDER BY rowid ASC",
            user_id,
        )
    }

    fn query_tool_servers(&self, sql: &str, user_id: &str) -> Result<Vec<ToolServerRow>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| Error::Database(format!("failed to prepare server query: {e}")))?;

        let rows = stmt
            .query_map(params![user_id], row_to_tool_server)
            .map_err(|e| Error::Database(format!("failed to list tool servers: {e}")))?;

        collect_rows(rows)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_tool_server(
        &self,
        user_id: &str,
        id: &str,
        name: &str,
        url: &str,
        enabled: bool,
        auth_kind: &str,
        auth_credential: Option<&str>,
    ) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE tool_servers SET name = ?3, url = ?4, enabled = ?5,
                        auth_kind = ?6, auth_credential = ?7, updated_at = ?8
                 WHERE id = ?1 AND user_id = ?2",
                params![
                    id,
                    user_id,
                    name,
                    url,
                    enabled,
                    auth_kind,
                    auth_credential,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(|e| Error::Database(format!("failed to update tool server: {e}")))?;
        Ok(rows > 0)
    }

    pub fn delete_tool_server(&self, user_id: &str, id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "DELETE FROM tool_servers WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
            .map_err(|e| Error::Database(format!("failed to delete tool server: {e}")))?;
        Ok(rows > 0)
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        created_at: parse_timestamp(&row.get::<_, String>(3)?),
        updated_at: parse_timestamp(&row.get::<_, String>(4)?),
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        created_at: parse_timestamp(&row.get::<_, String>(4)?),
    })
}

fn row_to_tool_server(row: &rusqlite::Row<'_>) -> rusqlite::Result<ToolServerRow> {
    Ok(ToolServerRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        url: row.get(3)?,
        enabled: row.get(4)?,
        auth_kind: row.get(5)?,
        auth_credential: row.get(6)?,
        created_at: parse_timestamp(&row.get::<_, String>(7)?),
        updated_at: parse_timestamp(&row.get::<_, String>(8)?),
    })
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| Error::Database(format!("failed to read row: {e}")))?);
    }
    Ok(out)
}
