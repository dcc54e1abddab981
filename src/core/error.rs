//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定 RetryWithPrompt / Retry / Abort。

use std::time::Duration;

use thiserror::Error;

/// 编排、工具调用、回放与存储过程中可能出现的错误
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    /// 与 Planner 或远端工具面通信失败（网络、HTTP 状态、MCP error）
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// 响应不符合任何已知结构
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// 回放空的或不存在的 FlowState
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Planner 提议了不在白名单中的工具或参数不合法
    #[error("Tool contract violation: {0}")]
    ToolContract(String),

    /// Planner 输出无法解析为 JSON 决策
    #[error("Planner output error: {0}")]
    PlannerOutput(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// 同一 sessionId / cacheKey 已被另一个活跃运行占用
    #[error("Session in use: {0}")]
    SessionInUse(String),

    #[error("Cancelled")]
    Cancelled,
}

impl AgentError {
    /// 传输类错误（可在单步重试预算内重试）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Transport(_)
                | AgentError::Timeout(_)
                | AgentError::MalformedResponse(_)
                | AgentError::Llm(_)
        )
    }

    /// 事件流中 error 事件的 kind 字段
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Transport(_) => "transport",
            AgentError::Timeout(_) => "timeout",
            AgentError::MalformedResponse(_) => "malformed_response",
            AgentError::Precondition(_) => "precondition",
            AgentError::ToolContract(_) => "tool_contract",
            AgentError::PlannerOutput(_) => "planner_output",
            AgentError::Llm(_) => "llm",
            AgentError::Store(_) => "store",
            AgentError::Config(_) => "config",
            AgentError::InvalidRequest(_) => "invalid_request",
            AgentError::SessionInUse(_) => "session_in_use",
            AgentError::Cancelled => "cancelled",
        }
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 将纠正提示注入下一轮规划（工具契约违规、输出格式错误）
    RetryWithPrompt(String),
    /// 等待后重试同一调用（传输类错误，预算内）
    Retry { backoff: Duration },
    /// 终止当前运行
    Abort,
}
