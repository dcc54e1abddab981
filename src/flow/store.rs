//! FlowState 存储抽象
//!
//! 以 cacheKey 为键保存 FlowState 快照与执行日志。同一 cacheKey 同时只有一个活跃运行，
//! 因此只需按键的后写覆盖，不做额外并发控制。提供内存实现与 SQLite 实现（`async-sqlite` feature）。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::core::AgentError;
use crate::flow::FlowState;

/// 已保存的 FlowState 记录
#[derive(Clone, Debug, Serialize)]
pub struct StoredFlow {
    pub cache_key: String,
    pub prompt: String,
    pub flow_state: FlowState,
    pub updated_at: DateTime<Utc>,
}

/// 列表视图（不含完整 FlowState）
#[derive(Clone, Debug, Serialize)]
pub struct FlowSummary {
    pub cache_key: String,
    pub prompt: String,
    pub updated_at: DateTime<Utc>,
}

/// 待写入的执行日志
#[derive(Clone, Debug)]
pub struct ExecutionEntry {
    pub cache_key: String,
    pub prompt: String,
    pub summary: String,
    pub history: Value,
    pub status: String,
}

/// 执行日志记录
#[derive(Clone, Debug, Serialize)]
pub struct ExecutionRecord {
    pub id: i64,
    pub cache_key: String,
    pub prompt: String,
    pub summary: String,
    pub history: Value,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// FlowState 存储接口
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// 按 cacheKey upsert；相同内容重复写入在观察上无变化
    async fn put(&self, key: &str, prompt: &str, flow_state: &FlowState) -> Result<(), AgentError>;

    async fn get(&self, key: &str) -> Result<Option<StoredFlow>, AgentError>;

    async fn delete(&self, key: &str) -> Result<(), AgentError>;

    /// 清空所有 FlowState 与执行日志
    async fn clear_all(&self) -> Result<(), AgentError>;

    /// 最近更新的若干条
    async fn list_flows(&self, limit: usize) -> Result<Vec<FlowSummary>, AgentError>;

    async fn record_execution(&self, entry: ExecutionEntry) -> Result<i64, AgentError>;

    /// 最近的执行日志（id 倒序）
    async fn list_executions(&self, limit: usize) -> Result<Vec<ExecutionRecord>, AgentError>;

    async fn delete_executions(&self, key: &str) -> Result<(), AgentError>;
}

#[derive(Default)]
struct MemoryInner {
    flows: HashMap<String, StoredFlow>,
    executions: Vec<ExecutionRecord>,
    next_execution_id: i64,
}

/// 内存存储（测试与无数据库部署）
#[derive(Default)]
pub struct MemoryFlowStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowStore for MemoryFlowStore {
    async fn put(&self, key: &str, prompt: &str, flow_state: &FlowState) -> Result<(), AgentError> {
        let mut inner = self.inner.write().await;
        inner.flows.insert(
            key.to_string(),
            StoredFlow {
                cache_key: key.to_string(),
                prompt: prompt.to_string(),
                flow_state: flow_state.clone(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<StoredFlow>, AgentError> {
        Ok(self.inner.read().await.flows.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), AgentError> {
        self.inner.write().await.flows.remove(key);
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), AgentError> {
        let mut inner = self.inner.write().await;
        inner.flows.clear();
        inner.executions.clear();
        Ok(())
    }

    async fn list_flows(&self, limit: usize) -> Result<Vec<FlowSummary>, AgentError> {
        let inner = self.inner.read().await;
        let mut flows: Vec<FlowSummary> = inner
            .flows
            .values()
            .map(|f| FlowSummary {
                cache_key: f.cache_key.clone(),
                prompt: f.prompt.clone(),
                updated_at: f.updated_at,
            })
            .collect();
        flows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        flows.truncate(limit);
        Ok(flows)
    }

    async fn record_execution(&self, entry: ExecutionEntry) -> Result<i64, AgentError> {
        let mut inner = self.inner.write().await;
        inner.next_execution_id += 1;
        let id = inner.next_execution_id;
        inner.executions.push(ExecutionRecord {
            id,
            cache_key: entry.cache_key,
            prompt: entry.prompt,
            summary: entry.summary,
            history: entry.history,
            status: entry.status,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn list_executions(&self, limit: usize) -> Result<Vec<ExecutionRecord>, AgentError> {
        let inner = self.inner.read().await;
        Ok(inner.executions.iter().rev().take(limit).cloned().collect())
    }

    async fn delete_executions(&self, key: &str) -> Result<(), AgentError> {
        self.inner.write().await.executions.retain(|e| e.cache_key != key);
        Ok(())
    }
}
