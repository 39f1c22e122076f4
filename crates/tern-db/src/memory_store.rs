use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tern_common::{Error, Result};
use tracing::info;

/// A persisted per-user memory fact.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryFact {
    pub id: String,
    pub user_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a fact insert attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The fact was stored.
    Saved,
    /// An equal fact (case-insensitive) already exists; nothing was written.
    Duplicate,
}

/// Backing store for per-user memory facts. Facts are deduplicated by
/// case-insensitive exact content match and capped per user.
pub struct MemoryStore {
    conn: Connection,
}

impl MemoryStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening memory store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open memory database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self { conn };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        let store = Self { conn };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS memory_facts (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_memory_facts_user
                    ON memory_facts(user_id, updated_at);",
            )
            .map_err(|e| Error::Database(format!("memory migration failed: {e}")))?;
        Ok(())
    }

    /// Insert a fact unless an equal one (case-insensitive) already exists.
    /// Rejects empty and oversized content, and inserts beyond `max_facts`.
    pub fn save_fact(
        &self,
        user_id: &str,
        content: &str,
        max_facts: usize,
        max_chars: usize,
    ) -> Result<SaveOutcome> {
        let content = content.trim();
        if content.is_empty() {
            return Err(Error::Invalid("memory fact must not be empty".to_string()));
        }
        if content.chars().count() > max_chars {
            return Err(Error::Invalid(format!(
                "memory fact exceeds {max_chars} characters"
            )));
        }

        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM memory_facts
                 WHERE user_id = ?1 AND lower(content) = lower(?2)",
                params![user_id, content],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to check for duplicate fact: {e}")))?;

        if existing.is_some() {
            return Ok(SaveOutcome::Duplicate);
        }

        if self.count_facts(user_id)? >= max_facts as i64 {
            return Err(Error::Invalid(format!(
                "memory is full ({max_facts} facts); delete some before adding more"
            )));
        }

        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO memory_facts (id, user_id, content, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![uuid::Uuid::new_v4().to_string(), user_id, content, now],
            )
            .map_err(|e| Error::Database(format!("failed to save fact: {e}")))?;

        Ok(SaveOutcome::Saved)
    }

    /// All facts for a user, most recently updated first.
    pub fn list_facts(&self, user_id: &str) -> Result<Vec<MemoryFact>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, user_id, content, created_at, updated_at
                 FROM memory_facts WHERE user_id = ?1
                 ORDER BY updated_at DESC, rowid DESC",
            )
            .map_err(|e| Error::Database(format!("failed to prepare fact query: {e}")))?;

        let rows = stmt
            .query_map(params![user_id], row_to_fact)
            .map_err(|e| Error::Database(format!("failed to list facts: {e}")))?;

        let mut facts = Vec::new();
        for row in rows {
            facts.push(row.map_err(|e| Error::Database(format!("failed to read fact row: {e}")))?);
        }
        Ok(facts)
    }

    /// Facts whose content contains (case-insensitive) any whitespace token
    /// of `query`. An empty token set returns all facts.
    pub fn search_facts(&self, user_id: &str, query: &str) -> Result<Vec<MemoryFact>> {
        let tokens: Vec<String> = query
            .split_whitespace()
            .map(str::to_lowercase)
            .collect();

        let all = self.list_facts(user_id)?;
        if tokens.is_empty() {
            return Ok(all);
        }

        Ok(all
            .into_iter()
            .filter(|fact| {
                let haystack = fact.content.to_lowercase();
                tokens.iter().any(|t| haystack.contains(t))
            })
            .collect())
    }

    pub fn delete_fact(&self, user_id: &str, id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "DELETE FROM memory_facts WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
            .map_err(|e| Error::Database(format!("failed to delete fact: {e}")))?;
        Ok(rows > 0)
    }

    pub fn clear_facts(&self, user_id: &str) -> Result<usize> {
        let rows = self
            .conn
            .execute(
                "DELETE FROM memory_facts WHERE user_id = ?1",
                params![user_id],
            )
            .map_err(|e| Error::Database(format!("failed to clear facts: {e}")))?;
        Ok(rows)
    }

    pub fn count_facts(&self, user_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT count(*) FROM memory_facts WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(format!("failed to count facts: {e}")))
    }
}

fn row_to_fact(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryFact> {
    let created_raw: String = row.get(3)?;
    let updated_raw: String = row.get(4)?;
    Ok(MemoryFact {
        id: row.get(0)?,
        user_id: row.get(1)?,
        content: row.get(2)?,
        created_at: parse_timestamp(&created_raw),
        updated_at: parse_timestamp(&updated_raw),
    })
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
