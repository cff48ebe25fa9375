//! Per-(course, user) conversation history in `conversations.sqlite`.
//!
//! Turns are ordered by insertion id. Writers for the same key are
//! serialized by a per-key async mutex; different keys never wait on each
//! other beyond SQLite's own write lock. A question and its answer are
//! appended together in one transaction, after references are resolved, so
//! a dropped request leaves no half-written exchange.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{TimeZone, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::error::{validate_course_id, AssistantError, Result};
use crate::models::{Role, Turn};

type Key = (String, String);

pub struct ConversationStore {
    pool: SqlitePool,
    locks: StdMutex<HashMap<Key, Arc<Mutex<()>>>>,
}

impl ConversationStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = crate::db::connect(path).await?;
        crate::migrate::migrate_conversations(&pool).await?;
        Ok(Self::from_pool(pool))
    }

    /// Wrap an already-migrated pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn key_lock(&self, course_id: &str, user_id: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self.locks.lock().map_err(|_| {
            error!(course_id, user_id, "conversation lock map poisoned");
            AssistantError::IndexConsistency {
                course_id: course_id.to_string(),
                message: "conversation lock map poisoned".to_string(),
            }
        })?;
        Ok(Arc::clone(
            locks
                .entry((course_id.to_string(), user_id.to_string()))
                .or_default(),
        ))
    }

    /// Give back a handle from `key_lock`, dropping the map entry once no
    /// other caller holds it. Clones are only handed out under the map lock.
    fn release_key_lock(&self, course_id: &str, user_id: &str, lock: Arc<Mutex<()>>) {
        let Ok(mut locks) = self.locks.lock() else {
            error!(course_id, user_id, "conversation lock map poisoned");
            return;
        };
        drop(lock);
        let key = (course_id.to_string(), user_id.to_string());
        if locks.get(&key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&key);
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or_default()
    }

    /// Append one turn.
    pub async fn append(&self, course_id: &str, user_id: &str, turn: &Turn) -> Result<()> {
        self.append_all(course_id, user_id, std::slice::from_ref(turn))
            .await
    }

    /// Append a question and its answer atomically.
    pub async fn append_exchange(
        &self,
        course_id: &str,
        user_id: &str,
        question: &Turn,
        answer: &Turn,
    ) -> Result<()> {
        self.append_all(course_id, user_id, &[question.clone(), answer.clone()])
            .await
    }

    async fn append_all(&self, course_id: &str, user_id: &str, turns: &[Turn]) -> Result<()> {
        validate_course_id(course_id)?;
        let lock = self.key_lock(course_id, user_id)?;
        let result = {
            let _guard = lock.lock().await;
            self.insert_turns(course_id, user_id, turns).await
        };
        self.release_key_lock(course_id, user_id, lock);
        result
    }

    async fn insert_turns(&self, course_id: &str, user_id: &str, turns: &[Turn]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for turn in turns {
            let route_json = turn.route.as_ref().map(serde_json::to_string).transpose()?;
            sqlx::query(
                "INSERT INTO turns (course_id, user_id, role, content, created_at_ms, references_json, route_json)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(course_id)
            .bind(user_id)
            .bind(turn.role.as_str())
            .bind(&turn.content)
            .bind(turn.timestamp.timestamp_millis())
            .bind(serde_json::to_string(&turn.references)?)
            .bind(route_json)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(course_id, user_id, turns = turns.len(), "appended turns");
        Ok(())
    }

    /// Full history, oldest first.
    pub async fn get_history(&self, course_id: &str, user_id: &str) -> Result<Vec<Turn>> {
        validate_course_id(course_id)?;
        let rows = sqlx::query(
            "SELECT role, content, created_at_ms, references_json, route_json
             FROM turns WHERE course_id = ? AND user_id = ? ORDER BY id",
        )
        .bind(course_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(turn_from_row).collect()
    }

    /// The last `limit` turns, oldest first.
    pub async fn recent(&self, course_id: &str, user_id: &str, limit: usize) -> Result<Vec<Turn>> {
        validate_course_id(course_id)?;
        let rows = sqlx::query(
            "SELECT role, content, created_at_ms, references_json, route_json FROM (
                 SELECT id, role, content, created_at_ms, references_json, route_json
                 FROM turns WHERE course_id = ? AND user_id = ? ORDER BY id DESC LIMIT ?
             ) ORDER BY id",
        )
        .bind(course_id)
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(turn_from_row).collect()
    }

    /// Delete the whole history for one key. Returns the number of turns removed.
    pub async fn clear(&self, course_id: &str, user_id: &str) -> Result<u64> {
        validate_course_id(course_id)?;
        let lock = self.key_lock(course_id, user_id)?;
        let result = {
            let _guard = lock.lock().await;
            sqlx::query("DELETE FROM turns WHERE course_id = ? AND user_id = ?")
                .bind(course_id)
                .bind(user_id)
                .execute(&self.pool)
                .await
        };
        self.release_key_lock(course_id, user_id, lock);
        let removed = result?.rows_affected();
        info!(course_id, user_id, removed, "cleared history");
        Ok(removed)
    }
}

fn turn_from_row(row: &SqliteRow) -> Result<Turn> {
    let role: String = row.get("role");
    let ms: i64 = row.get("created_at_ms");
    let references_json: String = row.get("references_json");
    let route_json: Option<String> = row.get("route_json");
    Ok(Turn {
        role: Role::parse(&role)
            .ok_or_else(|| AssistantError::InvalidInput(format!("unknown role in history: {role}")))?,
        content: row.get("content"),
        timestamp: Utc
            .timestamp_millis_opt(ms)
            .single()
            .unwrap_or_else(Utc::now),
        references: serde_json::from_str(&references_json)?,
        route: route_json.as_deref().map(serde_json::from_str).transpose()?,
    })
}
