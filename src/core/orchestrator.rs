//! 编排器：对外的运行 / 确认 / 回放 / 清理入口
//!
//! 每次运行或回放在独立的 tokio 任务中执行，并独占一条有序事件通道。
//! 同一 cacheKey 或 sessionId 同时只允许一个活跃运行；等待确认的运行继续占用其 cacheKey，
//! 直到确认（回放结束）或拒绝。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{event_channel, AgentError, EventEmitter, Execution, RecoveryEngine, RunStatus};
use crate::flow::{
    generate_cache_key, ExecutionEntry, ExecutionRecord, FlowState, FlowStore, FlowSummary, MemoryFlowStore,
};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::mcp::{HttpTransport, ToolClient, ToolTransport};
use crate::react::{load_system_prompt, run_task, FlowEvent, Planner, RunSession};
use crate::replay::ReplayEngine;

pub const CONFIRMATION_MESSAGE: &str = "Task completed. Do you want to replay deterministically?";
pub const CLEARED_MESSAGE: &str = "All local state data cleared. Ready for new tasks.";

/// 提交一次任务
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub task_prompt: String,
    /// 复用已有 cacheKey；存储中已有该键时载入其 actions 与 startingUrl
    pub cache_key: Option<String>,
    pub max_steps: Option<usize>,
    /// 复用已存在的远端会话（跳过 session_create）
    pub session_id: Option<String>,
}

impl RunRequest {
    pub fn new(task_prompt: impl Into<String>) -> Self {
        Self {
            task_prompt: task_prompt.into(),
            ..Self::default()
        }
    }
}

/// 回放请求：按 cacheKey 从存储读取，或直接提供 FlowState（此时请求中的 cacheKey 优先）
#[derive(Debug, Clone, Default)]
pub struct ReplayRequest {
    pub cache_key: Option<String>,
    pub flow_state: Option<FlowState>,
}

/// 运行或回放的句柄：事件流与取消令牌
#[derive(Debug)]
pub struct RunHandle {
    pub cache_key: String,
    pub events: mpsc::UnboundedReceiver<FlowEvent>,
    pub cancel: CancellationToken,
}

/// 确认结果
#[derive(Debug)]
pub enum Confirmation {
    /// 已批准，返回回放事件流
    Replay(RunHandle),
    /// 已拒绝，状态已清除
    Cleared { cache_key: String },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ClearResponse {
    pub status: String,
    pub message: String,
}

#[derive(Debug, Default)]
struct Registry {
    active_keys: HashSet<String>,
    active_sessions: HashSet<String>,
}

/// cacheKey（及可选 sessionId）的占用凭证；drop 时释放
#[derive(Debug)]
pub struct KeyLease {
    registry: Arc<StdMutex<Registry>>,
    key: String,
    session: Option<String>,
}

impl KeyLease {
    fn acquire(
        registry: &Arc<StdMutex<Registry>>,
        key: &str,
        session: Option<&str>,
    ) -> Result<Self, AgentError> {
        let mut reg = registry.lock().unwrap_or_else(|p| p.into_inner());
        if reg.active_keys.contains(key) {
            return Err(AgentError::SessionInUse(format!("cache key '{key}' is owned by another run")));
        }
        if let Some(s) = session {
            if reg.active_sessions.contains(s) {
                return Err(AgentError::SessionInUse(format!("session '{s}' is owned by another run")));
            }
            reg.active_sessions.insert(s.to_string());
        }
        reg.active_keys.insert(key.to_string());
        Ok(Self {
            registry: registry.clone(),
            key: key.to_string(),
            session: session.map(str::to_string),
        })
    }
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        let mut reg = self.registry.lock().unwrap_or_else(|p| p.into_inner());
        reg.active_keys.remove(&self.key);
        if let Some(s) = &self.session {
            reg.active_sessions.remove(s);
        }
    }
}

/// 等待确认的运行
struct Pending {
    execution: Execution,
    lease: KeyLease,
}

struct Inner {
    planner: Planner,
    client: Arc<ToolClient>,
    replay: ReplayEngine,
    store: Arc<dyn FlowStore>,
    recovery: RecoveryEngine,
    max_steps: usize,
    history_window: usize,
    planner_timeout: Duration,
    registry: Arc<StdMutex<Registry>>,
    pending: Mutex<HashMap<String, Pending>>,
}

/// 编排器（可 Clone，内部共享）
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

/// 根据配置与环境变量选择 LLM 后端（OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty());
    match (provider.as_str(), api_key) {
        ("mock", _) => {
            tracing::info!("Using Mock LLM");
            Arc::new(MockLlmClient)
        }
        (_, Some(key)) => {
            tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
            Arc::new(OpenAiClient::new(cfg.llm.base_url.as_deref(), &cfg.llm.model, Some(&key)))
        }
        (_, None) => {
            tracing::warn!("OPENAI_API_KEY not set, using Mock LLM");
            Arc::new(MockLlmClient)
        }
    }
}

/// 根据配置打开存储
pub async fn create_store_from_config(cfg: &AppConfig) -> Result<Arc<dyn FlowStore>, AgentError> {
    match cfg.store.backend.to_lowercase().as_str() {
        "memory" => Ok(Arc::new(MemoryFlowStore::new())),
        #[cfg(feature = "async-sqlite")]
        "sqlite" => {
            let store = crate::flow::SqliteFlowStore::new(&cfg.store.database_path).await?;
            tracing::info!(path = %cfg.store.database_path.display(), "Using SQLite flow store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "async-sqlite"))]
        "sqlite" => {
            tracing::warn!("async-sqlite feature disabled, using in-memory flow store");
            Ok(Arc::new(MemoryFlowStore::new()))
        }
        other => Err(AgentError::Config(format!("unknown store backend '{other}'"))),
    }
}

impl Orchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        transport: Arc<dyn ToolTransport>,
        store: Arc<dyn FlowStore>,
        cfg: &AppConfig,
    ) -> Self {
        let client = Arc::new(ToolClient::new(
            transport,
            Duration::from_secs(cfg.remote.request_timeout_secs),
        ));
        Self {
            inner: Arc::new(Inner {
                planner: Planner::new(llm, load_system_prompt()),
                replay: ReplayEngine::new(client.clone()),
                client,
                store,
                recovery: RecoveryEngine::new(cfg.agent.step_retry_budget, cfg.agent.retry_backoff_ms),
                max_steps: cfg.agent.max_steps,
                history_window: cfg.agent.history_window,
                planner_timeout: Duration::from_secs(cfg.llm.timeouts.request),
                registry: Arc::new(StdMutex::new(Registry::default())),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// 按配置组装：HTTP 传输、LLM、存储
    pub async fn from_config(cfg: &AppConfig) -> Result<Self, AgentError> {
        let transport = HttpTransport::new(
            cfg.remote.mcp_url.clone(),
            Duration::from_secs(cfg.remote.request_timeout_secs),
        )?;
        tracing::info!(endpoint = %transport.endpoint(), "remote tool surface");
        let store = create_store_from_config(cfg).await?;
        Ok(Self::new(create_llm_from_config(cfg), Arc::new(transport), store, cfg))
    }

    /// 提交任务；校验失败或键/会话被占用时立即返回错误，否则在后台运行并返回事件流
    pub async fn submit_run(&self, req: RunRequest) -> Result<RunHandle, AgentError> {
        let prompt = req.task_prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(AgentError::InvalidRequest("task_prompt is required".to_string()));
        }
        let max_steps = req.max_steps.unwrap_or(self.inner.max_steps);
        if max_steps == 0 {
            return Err(AgentError::InvalidRequest("max_steps must be greater than 0".to_string()));
        }
        let cache_key = req
            .cache_key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .unwrap_or_else(generate_cache_key);
        let session_id = req.session_id.filter(|s| !s.is_empty());

        let lease = KeyLease::acquire(&self.inner.registry, &cache_key, session_id.as_deref())?;

        let mut flow = match self.inner.store.get(&cache_key).await? {
            Some(stored) => {
                tracing::info!(cache_key = %cache_key, actions = stored.flow_state.actions.len(), "hydrating stored FlowState");
                let mut flow = stored.flow_state;
                flow.session_id = None;
                flow
            }
            None => FlowState::default(),
        };
        flow.cache_key = cache_key.clone();
        flow.session_id = session_id;

        let execution = Execution::new(prompt, max_steps);
        let (emitter, events) = event_channel(cache_key.clone());
        let cancel = CancellationToken::new();

        tracing::info!(cache_key = %cache_key, run = %execution.id, max_steps, "run submitted");
        let this = self.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            this.execute_run(execution, flow, emitter, token, lease).await;
        });

        Ok(RunHandle { cache_key, events, cancel })
    }

    async fn execute_run(
        &self,
        execution: Execution,
        flow: FlowState,
        emitter: EventEmitter,
        cancel: CancellationToken,
        lease: KeyLease,
    ) {
        let inner = &self.inner;
        let outcome = {
            let session = RunSession::new(&inner.planner, &inner.client, &inner.recovery, &emitter, cancel)
                .with_history_window(inner.history_window)
                .with_planner_timeout(inner.planner_timeout);
            run_task(&session, execution, flow).await
        };
        let (prompt_tokens, completion_tokens, total_tokens) = inner.planner.token_usage();
        tracing::debug!(prompt_tokens, completion_tokens, total_tokens, "planner token usage");

        let cache_key = outcome.flow_state.cache_key.clone();
        let mut execution = outcome.execution;
        let persisted = match &outcome.error {
            None => inner
                .store
                .put(&cache_key, &execution.task_prompt, &outcome.flow_state)
                .await
                .map_err(|e| {
                    tracing::error!(cache_key = %cache_key, error = %e, "failed to persist FlowState");
                    e
                }),
            Some(_) => Ok(()),
        };

        let error = match (outcome.error, persisted) {
            (Some(e), _) | (None, Err(e)) => Some(e),
            (None, Ok(())) => None,
        };
        if error.is_some() && execution.status != RunStatus::Failed {
            execution.status = RunStatus::Failed;
        }

        let entry = ExecutionEntry {
            cache_key: cache_key.clone(),
            prompt: execution.task_prompt.clone(),
            summary: outcome.summary.clone(),
            history: execution.history(),
            status: if error.is_none() { "completed" } else { "failed" }.to_string(),
        };
        if let Err(e) = inner.store.record_execution(entry).await {
            tracing::warn!(cache_key = %cache_key, error = %e, "failed to record execution");
        }

        emitter.emit(FlowEvent::Final {
            status: execution.status,
            cache_key: cache_key.clone(),
            summary: outcome.summary,
            total_steps: execution.steps.len(),
            flow_state: outcome.flow_state,
            steps: execution.steps.clone(),
        });

        match error {
            None => {
                inner
                    .pending
                    .lock()
                    .await
                    .insert(cache_key.clone(), Pending { execution, lease });
                emitter.close(FlowEvent::ConfirmationRequired {
                    message: CONFIRMATION_MESSAGE.to_string(),
                    cache_key,
                });
            }
            Some(err) => {
                drop(lease);
                emitter.close(FlowEvent::error(&err));
            }
        }
    }

    /// 对等待确认的运行作出决定：批准则开始回放，拒绝则清除其状态
    pub async fn confirm(&self, cache_key: &str, approved: bool) -> Result<Confirmation, AgentError> {
        let pending = self.inner.pending.lock().await.remove(cache_key).ok_or_else(|| {
            AgentError::InvalidRequest(format!("no run awaiting confirmation for '{cache_key}'"))
        })?;
        let Pending { mut execution, lease } = pending;

        if approved {
            let flow = match self.inner.store.get(cache_key).await? {
                Some(stored) => stored.flow_state,
                None => {
                    return Err(AgentError::Precondition(format!("no FlowState stored for '{cache_key}'")))
                }
            };
            tracing::info!(cache_key = %cache_key, run = %execution.id, "confirmation approved, replaying");
            return self.start_replay(flow, lease).map(Confirmation::Replay);
        }

        execution.transition(RunStatus::Cleared)?;
        self.forget(cache_key).await?;
        drop(lease);
        tracing::info!(cache_key = %cache_key, run = %execution.id, "confirmation denied, state cleared");
        Ok(Confirmation::Cleared { cache_key: cache_key.to_string() })
    }

    /// 回放；缺失或为空的 FlowState 立即以 Precondition 拒绝，不发出任何远端调用
    pub async fn submit_replay(&self, req: ReplayRequest) -> Result<RunHandle, AgentError> {
        let key = req.cache_key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty());
        let flow = match (req.flow_state, key) {
            (Some(mut flow), key) => {
                if let Some(key) = key {
                    flow.cache_key = key;
                }
                flow
            }
            (None, Some(key)) => match self.inner.store.get(&key).await? {
                Some(stored) => stored.flow_state,
                None => return Err(AgentError::Precondition(format!("no FlowState stored for '{key}'"))),
            },
            (None, None) => {
                return Err(AgentError::InvalidRequest(
                    "either cache_key or flow_state is required".to_string(),
                ))
            }
        };
        if flow.actions.is_empty() {
            return Err(AgentError::Precondition(format!(
                "FlowState '{}' has no recorded actions to replay",
                flow.cache_key
            )));
        }
        if flow.cache_key.is_empty() {
            return Err(AgentError::Precondition("FlowState has no cacheKey".to_string()));
        }
        let lease = KeyLease::acquire(&self.inner.registry, &flow.cache_key, flow.session_id.as_deref())?;
        self.start_replay(flow, lease)
    }

    fn start_replay(&self, flow: FlowState, lease: KeyLease) -> Result<RunHandle, AgentError> {
        let cache_key = flow.cache_key.clone();
        let (emitter, events) = event_channel(cache_key.clone());
        let cancel = CancellationToken::new();
        let this = self.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            let key = flow.cache_key.clone();
            let replayed = this.inner.replay.replay(flow, &emitter, &token).await;
            match replayed {
                Ok(report) => {
                    if let Err(e) = this.forget(&key).await {
                        tracing::warn!(cache_key = %key, error = %e, "failed to clear replayed FlowState");
                    }
                    drop(lease);
                    emitter.close(FlowEvent::ReplayComplete {
                        summary: report.summary,
                        flow_state: report.flow_state,
                        cache_key: key,
                        self_healed: report.self_healed,
                    });
                }
                Err(err) => {
                    tracing::warn!(cache_key = %key, error = %err, "replay failed");
                    drop(lease);
                    emitter.close(FlowEvent::error(&err));
                }
            }
        });
        Ok(RunHandle { cache_key, events, cancel })
    }

    async fn forget(&self, cache_key: &str) -> Result<(), AgentError> {
        self.inner.store.delete(cache_key).await?;
        self.inner.store.delete_executions(cache_key).await
    }

    /// 删除所有 FlowState 与执行日志，并放弃所有等待确认的运行
    pub async fn clear(&self) -> Result<ClearResponse, AgentError> {
        let abandoned: Vec<Pending> = self.inner.pending.lock().await.drain().map(|(_, p)| p).collect();
        for mut p in abandoned {
            if let Err(e) = p.execution.transition(RunStatus::Cleared) {
                tracing::debug!(error = %e, "clear");
            }
        }
        self.inner.store.clear_all().await?;
        tracing::info!("all local state cleared");
        Ok(ClearResponse {
            status: "success".to_string(),
            message: CLEARED_MESSAGE.to_string(),
        })
    }

    /// 等待确认的 cacheKey
    pub async fn pending_confirmations(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.pending.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn list_flows(&self, limit: usize) -> Result<Vec<FlowSummary>, AgentError> {
        self.inner.store.list_flows(limit).await
    }

    pub async fn list_executions(&self, limit: usize) -> Result<Vec<ExecutionRecord>, AgentError> {
        self.inner.store.list_executions(limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_rejects_second_owner_and_releases_on_drop() {
        let registry = Arc::new(StdMutex::new(Registry::default()));
        let lease = KeyLease::acquire(&registry, "flow-1", Some("sess-1")).unwrap();
        assert!(matches!(
            KeyLease::acquire(&registry, "flow-1", None),
            Err(AgentError::SessionInUse(_))
        ));
        assert!(matches!(
            KeyLease::acquire(&registry, "flow-2", Some("sess-1")),
            Err(AgentError::SessionInUse(_))
        ));
        drop(lease);
        assert!(KeyLease::acquire(&registry, "flow-1", Some("sess-1")).is_ok());
    }
}
