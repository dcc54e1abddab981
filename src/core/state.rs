//! 运行状态：Execution（一次任务提交）与逐步记录
//!
//! Execution 由编排器独占，逐步追加 StepRecord；状态迁移受限于
//! running -> completed_awaiting_confirmation | failed -> cleared。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::AgentError;
use crate::flow::FlowState;

/// 运行状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    CompletedAwaitingConfirmation,
    Failed,
    Cleared,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::CompletedAwaitingConfirmation => "completed_awaiting_confirmation",
            RunStatus::Failed => "failed",
            RunStatus::Cleared => "cleared",
        }
    }

    fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Running, RunStatus::CompletedAwaitingConfirmation)
                | (RunStatus::Running, RunStatus::Failed)
                | (RunStatus::CompletedAwaitingConfirmation, RunStatus::Cleared)
                | (RunStatus::Failed, RunStatus::Cleared)
        )
    }
}

/// 已校验并派发的工具调用（名称 + 参数，不含 FlowState）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool: String,
    pub args: Value,
}

/// 单步记录
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: usize,
    pub reasoning: String,
    pub tool_call: ToolCallRecord,
    pub tool_result: String,
    pub flow_state_snapshot: FlowState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}

/// 一次任务提交
#[derive(Clone, Debug, Serialize)]
pub struct Execution {
    pub id: String,
    pub task_prompt: String,
    pub max_steps: usize,
    pub steps: Vec<StepRecord>,
    pub status: RunStatus,
}

impl Execution {
    pub fn new(task_prompt: impl Into<String>, max_steps: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_prompt: task_prompt.into(),
            max_steps,
            steps: Vec::new(),
            status: RunStatus::Running,
        }
    }

    pub fn push_step(&mut self, step: StepRecord) {
        self.steps.push(step);
    }

    pub fn transition(&mut self, next: RunStatus) -> Result<(), AgentError> {
        if !self.status.can_transition_to(next) {
            return Err(AgentError::InvalidRequest(format!(
                "run {} cannot move from {} to {}",
                self.id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        tracing::debug!(run = %self.id, from = self.status.as_str(), to = next.as_str(), "run status");
        self.status = next;
        Ok(())
    }

    /// 不含截图的步骤历史（写入执行日志）
    pub fn history(&self) -> Value {
        let steps: Vec<Value> = self
            .steps
            .iter()
            .map(|s| {
                serde_json::json!({
                    "step": s.step,
                    "reasoning": s.reasoning,
                    "tool_call": s.tool_call,
                    "tool_result": s.tool_result,
                })
            })
            .collect();
        Value::Array(steps)
    }
}
