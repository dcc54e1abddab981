//! Planner 决策 JSON Schema 生成（schemars）
//!
//! 将「合法决策」的 JSON 结构与工具白名单拼入 system prompt，减少 LLM 输出格式错误。

use schemars::{schema_for, JsonSchema};
use serde_json::{Map, Value};

use crate::tools::call::ALLOWED_TOOLS;

/// Planner 每轮输出格式（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct PlannerDecisionFormat {
    /// 本轮推理：当前页面状态与下一步打算
    pub reasoning: String,
    /// 要调用的工具名（见工具列表）；finish 为 true 时省略
    pub tool: Option<String>,
    /// 工具参数对象
    pub args: Option<Map<String, Value>>,
    /// 任务已完成时为 true
    pub finish: Option<bool>,
    /// finish 时的任务总结
    pub summary: Option<String>,
}

/// 返回 Planner 决策的 JSON Schema 字符串
pub fn decision_schema_json() -> String {
    let schema = schema_for!(PlannerDecisionFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}

/// 工具白名单说明，逐行 `- name args: purpose`
pub fn tool_catalog() -> String {
    ALLOWED_TOOLS
        .iter()
        .map(|(name, args, purpose)| format!("- {name} {args}: {purpose}"))
        .collect::<Vec<_>>()
        .join("\n")
}
