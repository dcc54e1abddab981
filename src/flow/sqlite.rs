//! SQLite 持久化（sqlx，完全异步）
//!
//! 两张表：flow_states（cache_key 主键，upsert）与 executions（自增 id 的执行日志）。
//! 需要启用 `async-sqlite` feature。

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::core::AgentError;
use crate::flow::store::{ExecutionEntry, ExecutionRecord, FlowStore, FlowSummary, StoredFlow};
use crate::flow::FlowState;

fn store_err(e: impl std::fmt::Display) -> AgentError {
    AgentError::Store(e.to_string())
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub struct SqliteFlowStore {
    pool: SqlitePool,
}

impl SqliteFlowStore {
    /// 打开（必要时创建）数据库文件并建表
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await
            .map_err(store_err)?;
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), AgentError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS flow_states (
                cache_key TEXT PRIMARY KEY,
                prompt TEXT NOT NULL,
                flow_state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cache_key TEXT NOT NULL,
                prompt TEXT NOT NULL,
                summary TEXT,
                history TEXT,
                status TEXT NOT NULL DEFAULT 'completed',
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_executions_cache_key ON executions(cache_key)")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        Ok(())
    }

    fn row_to_stored(row: &SqliteRow) -> Result<StoredFlow, AgentError> {
        let raw: String = row.try_get("flow_state").map_err(store_err)?;
        let flow_state: FlowState = serde_json::from_str(&raw).map_err(store_err)?;
        let updated_at: String = row.try_get("updated_at").map_err(store_err)?;
        Ok(StoredFlow {
            cache_key: row.try_get("cache_key").map_err(store_err)?,
            prompt: row.try_get("prompt").map_err(store_err)?,
            flow_state,
            updated_at: parse_time(&updated_at),
        })
    }

    fn row_to_execution(row: &SqliteRow) -> Result<ExecutionRecord, AgentError> {
        let history: Option<String> = row.try_get("history").map_err(store_err)?;
        let history = history
            .and_then(|h| serde_json::from_str(&h).ok())
            .unwrap_or(Value::Null);
        let summary: Option<String> = row.try_get("summary").map_err(store_err)?;
        let created_at: String = row.try_get("created_at").map_err(store_err)?;
        Ok(ExecutionRecord {
            id: row.try_get("id").map_err(store_err)?,
            cache_key: row.try_get("cache_key").map_err(store_err)?,
            prompt: row.try_get("prompt").map_err(store_err)?,
            summary: summary.unwrap_or_default(),
            history,
            status: row.try_get("status").map_err(store_err)?,
            created_at: parse_time(&created_at),
        })
    }
}

#[async_trait]
impl FlowStore for SqliteFlowStore {
    async fn put(&self, key: &str, prompt: &str, flow_state: &FlowState) -> Result<(), AgentError> {
        let now = Utc::now().to_rfc3339();
        let payload = serde_json::to_string(flow_state).map_err(store_err)?;
        sqlx::query(
            "INSERT INTO flow_states (cache_key, prompt, flow_state, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(cache_key) DO UPDATE SET
                prompt = excluded.prompt,
                flow_state = excluded.flow_state,
                updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(prompt)
        .bind(&payload)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<StoredFlow>, AgentError> {
        let row = sqlx::query(
            "SELECT cache_key, prompt, flow_state, updated_at FROM flow_states WHERE cache_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.as_ref().map(Self::row_to_stored).transpose()
    }

    async fn delete(&self, key: &str) -> Result<(), AgentError> {
        sqlx::query("DELETE FROM flow_states WHERE cache_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), AgentError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        sqlx::query("DELETE FROM flow_states")
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        sqlx::query("DELETE FROM executions")
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn list_flows(&self, limit: usize) -> Result<Vec<FlowSummary>, AgentError> {
        let rows = sqlx::query(
            "SELECT cache_key, prompt, updated_at FROM flow_states ORDER BY updated_at DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter()
            .map(|row| {
                let updated_at: String = row.try_get("updated_at").map_err(store_err)?;
                Ok(FlowSummary {
                    cache_key: row.try_get("cache_key").map_err(store_err)?,
                    prompt: row.try_get("prompt").map_err(store_err)?,
                    updated_at: parse_time(&updated_at),
                })
            })
            .collect()
    }

    async fn record_execution(&self, entry: ExecutionEntry) -> Result<i64, AgentError> {
        let history = serde_json::to_string(&entry.history).map_err(store_err)?;
        let result = sqlx::query(
            "INSERT INTO executions (cache_key, prompt, summary, history, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.cache_key)
        .bind(&entry.prompt)
        .bind(&entry.summary)
        .bind(&history)
        .bind(&entry.status)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.last_insert_rowid())
    }

    async fn list_executions(&self, limit: usize) -> Result<Vec<ExecutionRecord>, AgentError> {
        let rows = sqlx::query(
            "SELECT id, cache_key, prompt, summary, history, status, created_at
             FROM executions ORDER BY id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(Self::row_to_execution).collect()
    }

    async fn delete_executions(&self, key: &str) -> Result<(), AgentError> {
        sqlx::query("DELETE FROM executions WHERE cache_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}
