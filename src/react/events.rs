//! 运行与回放过程事件：按发送顺序推送给唯一的消费者（SSE / CLI 等）

use serde::Serialize;
use serde_json::Value;

use crate::core::{RunStatus, StepRecord};
use crate::flow::{ActionKind, FlowState};

/// 过程事件（可序列化为 JSON，`type` 字段为 snake_case 标签）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    /// Planner 本轮推理
    Reasoning { step: usize, text: String },
    /// 一次工具调用完成并合并了 FlowState
    Step {
        step: usize,
        max_steps: usize,
        tool: String,
        args: Value,
        /// 工具结果预览
        result: String,
        flow_state: FlowState,
        #[serde(skip_serializing_if = "Option::is_none")]
        screenshot: Option<String>,
    },
    /// 运行结束（成功或失败）
    Final {
        status: RunStatus,
        cache_key: String,
        summary: String,
        total_steps: usize,
        flow_state: FlowState,
        steps: Vec<StepRecord>,
    },
    /// 请求确认是否确定性回放（成功运行的终止事件）
    ConfirmationRequired { message: String, cache_key: String },
    /// 远端会话已关闭（或尝试关闭）
    SessionClosed { message: String },
    ReplayStart { message: String, cache_key: String },
    ReplayAction {
        /// 从 1 开始
        action_index: usize,
        total_actions: usize,
        description: String,
        action_type: ActionKind,
    },
    ReplayScreenshot { screenshot: String, message: String },
    /// 回放的终止事件
    ReplayComplete {
        summary: String,
        flow_state: FlowState,
        cache_key: String,
        self_healed: usize,
    },
    Error { kind: String, message: String },
}

impl FlowEvent {
    pub fn error(err: &crate::core::AgentError) -> Self {
        FlowEvent::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    /// 终止事件发送后通道即关闭
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowEvent::ConfirmationRequired { .. }
                | FlowEvent::ReplayComplete { .. }
                | FlowEvent::Error { .. }
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            FlowEvent::Reasoning { .. } => "reasoning",
            FlowEvent::Step { .. } => "step",
            FlowEvent::Final { .. } => "final",
            FlowEvent::ConfirmationRequired { .. } => "confirmation_required",
            FlowEvent::SessionClosed { .. } => "session_closed",
            FlowEvent::ReplayStart { .. } => "replay_start",
            FlowEvent::ReplayAction { .. } => "replay_action",
            FlowEvent::ReplayScreenshot { .. } => "replay_screenshot",
            FlowEvent::ReplayComplete { .. } => "replay_complete",
            FlowEvent::Error { .. } => "error",
        }
    }
}
