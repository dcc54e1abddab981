//! 确定性回放：把录制好的 FlowState 整段交给远端一次执行
//!
//! 事件顺序：replay_start -> 回放前截图 -> replay_action x N -> （远端执行）-> 回放后截图。
//! 回放调用不重试；截图与会话关闭均为尽力而为。取消只中断进行中的回放调用，会话仍会关闭。
//! 持久化或删除 FlowState 由调用方负责。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, EventEmitter};
use crate::flow::FlowState;
use crate::mcp::ToolClient;
use crate::react::FlowEvent;
use crate::tools::{BrowserToolCall, RemoteCall};

/// 远端响应中表示「自愈」的标记（大小写不敏感）
pub const SELF_HEAL_MARKERS: &[&str] = &[
    "self-heal",
    "self heal",
    "selfheal",
    "healed",
    "fallback locator",
    "fallback selector",
    "used fallback",
];

/// 统计提及自愈标记的行数
pub fn count_self_healing(text: &str) -> usize {
    text.lines()
        .map(str::to_lowercase)
        .filter(|line| SELF_HEAL_MARKERS.iter().any(|m| line.contains(m)))
        .count()
}

#[derive(Debug, Clone)]
pub struct ReplayReport {
    pub summary: String,
    pub self_healed: usize,
    pub flow_state: FlowState,
}

pub struct ReplayEngine {
    client: Arc<ToolClient>,
}

impl ReplayEngine {
    pub fn new(client: Arc<ToolClient>) -> Self {
        Self { client }
    }

    /// 回放；actions 为空或缺少 cacheKey 时不发出任何调用
    pub async fn replay(
        &self,
        flow: FlowState,
        emitter: &EventEmitter,
        cancel: &CancellationToken,
    ) -> Result<ReplayReport, AgentError> {
        if flow.actions.is_empty() {
            return Err(AgentError::Precondition(format!(
                "FlowState '{}' has no recorded actions to replay",
                flow.cache_key
            )));
        }
        if flow.cache_key.is_empty() {
            return Err(AgentError::Precondition("FlowState has no cacheKey".to_string()));
        }

        let total = flow.actions.len();
        tracing::info!(cache_key = %flow.cache_key, actions = total, "replay start");
        emitter.emit(FlowEvent::ReplayStart {
            message: format!("Starting deterministic replay of {total} actions"),
            cache_key: flow.cache_key.clone(),
        });

        self.screenshot(&flow, emitter, "Initial state before replay").await;

        for (i, action) in flow.actions.iter().enumerate() {
            emitter.emit(FlowEvent::ReplayAction {
                action_index: i + 1,
                total_actions: total,
                description: action.describe(i),
                action_type: action.kind,
            });
        }

        let call = RemoteCall::Replay(flow.clone());
        let outcome = tokio::select! {
            r = self.client.invoke(&call, &flow) => r,
            _ = cancel.cancelled() => {
                tracing::warn!(cache_key = %flow.cache_key, "replay cancelled");
                Err(AgentError::Cancelled)
            }
        };
        let mut updated = flow.clone();
        let report = match outcome {
            Ok(result) => {
                updated.merge(result.flow_state, true);
                let scanned = if result.text.trim().is_empty() {
                    result.raw.to_string()
                } else {
                    result.text.clone()
                };
                let self_healed = count_self_healing(&scanned);
                let summary = if self_healed > 0 {
                    format!("[self-healed: {self_healed}] {}", result.content)
                } else {
                    result.content
                };
                if self_healed > 0 {
                    tracing::info!(cache_key = %updated.cache_key, self_healed, "replay recovered with self-healing");
                }
                Ok(ReplayReport { summary, self_healed, flow_state: updated.clone() })
            }
            Err(e) => Err(e),
        };

        if report.is_ok() {
            self.screenshot(&updated, emitter, "Final state after replay").await;
        }
        self.close(&updated).await;
        report
    }

    async fn screenshot(&self, flow: &FlowState, emitter: &EventEmitter, message: &str) {
        match self
            .client
            .invoke(&RemoteCall::Tool(BrowserToolCall::Screenshot), flow)
            .await
        {
            Ok(result) => {
                if let Some(screenshot) = result.screenshot {
                    emitter.emit(FlowEvent::ReplayScreenshot {
                        screenshot,
                        message: message.to_string(),
                    });
                }
            }
            Err(e) => tracing::warn!(cache_key = %flow.cache_key, error = %e, "replay screenshot skipped"),
        }
    }

    async fn close(&self, flow: &FlowState) {
        if let Err(e) = self
            .client
            .invoke(&RemoteCall::Tool(BrowserToolCall::SessionClose), flow)
            .await
        {
            tracing::warn!(cache_key = %flow.cache_key, error = %e, "replay session close failed");
        }
    }
}
