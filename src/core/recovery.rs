//! 错误恢复引擎
//!
//! 根据 AgentError 类型与当前尝试次数返回 RecoveryAction：
//! 契约违规与格式错误回灌给 Planner，传输类错误在单步预算内退避重试，其余终止。

use std::time::Duration;

use crate::core::{AgentError, RecoveryAction};

/// 单步重试预算默认值（不含首次尝试）
pub const DEFAULT_STEP_RETRY_BUDGET: u32 = 2;

#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    step_retry_budget: u32,
    backoff: Duration,
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(DEFAULT_STEP_RETRY_BUDGET, 500)
    }
}

impl RecoveryEngine {
    pub fn new(step_retry_budget: u32, backoff_ms: u64) -> Self {
        Self {
            step_retry_budget,
            backoff: Duration::from_millis(backoff_ms),
        }
    }

    pub fn step_retry_budget(&self) -> u32 {
        self.step_retry_budget
    }

    /// `attempt` 为本步已失败的重试次数（首次失败时为 0）
    pub fn handle(&self, err: &AgentError, attempt: u32) -> RecoveryAction {
        match err {
            AgentError::ToolContract(msg) => RecoveryAction::RetryWithPrompt(format!(
                "Your previous tool call was rejected before dispatch: {msg}. \
                Only use tools from the allow-list with exactly the documented arguments. \
                For `perform`, supply exactly one of `action` (text) or `observation` (object)."
            )),
            AgentError::PlannerOutput(raw) => RecoveryAction::RetryWithPrompt(format!(
                "Your previous reply could not be parsed: {raw}. \
                Reply with exactly one JSON object, either \
                {{\"reasoning\": \"...\", \"tool\": \"<name>\", \"args\": {{...}}}} or \
                {{\"reasoning\": \"...\", \"finish\": true, \"summary\": \"...\"}}. No prose, no Markdown."
            )),
            e if e.is_retryable() && attempt < self.step_retry_budget => RecoveryAction::Retry {
                backoff: self.backoff * (attempt + 1),
            },
            _ => RecoveryAction::Abort,
        }
    }
}
