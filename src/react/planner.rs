//! Planner：调用 LLM 得到下一步决策并解析
//!
//! LLM 回复须为单个 JSON 对象：`{"reasoning", "tool", "args"}` 或 `{"reasoning", "finish": true, "summary"}`。
//! parse_llm_output 容忍 ```json 代码块与前后多余文字；无法解析时返回 PlannerOutput 错误，由主循环反馈给 LLM。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;
use crate::flow::FlowState;
use crate::llm::{LlmClient, Message};
use crate::react::context::RunContext;
use crate::tools::{decision_schema_json, tool_catalog};

/// LLM 提议的工具调用（尚未校验）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolProposal {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

/// Planner 输出
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerOutput {
    /// 任务完成
    Finish { summary: String },
    ToolCall(ToolProposal),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannerDecision {
    pub reasoning: String,
    pub output: PlannerOutput,
}

#[derive(Deserialize)]
struct RawDecision {
    #[serde(default, alias = "thought")]
    reasoning: Option<String>,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    args: Option<Value>,
    #[serde(default)]
    finish: Option<bool>,
    #[serde(default)]
    summary: Option<String>,
}

/// 解析 LLM 输出为决策
pub fn parse_llm_output(output: &str) -> Result<PlannerDecision, AgentError> {
    let trimmed = output.trim();

    // 尝试提取 JSON 块（```json ... ``` 或首个 { 到最后一个 }）
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            &trimmed[start..=end]
        } else {
            trimmed
        }
    } else {
        return Err(AgentError::PlannerOutput(format!(
            "expected a JSON object, got: {}",
            trimmed.chars().take(200).collect::<String>()
        )));
    };

    let raw: RawDecision = serde_json::from_str(json_str)
        .map_err(|e| AgentError::PlannerOutput(format!("{}: {}", e, json_str)))?;
    let reasoning = raw.reasoning.unwrap_or_default();

    if raw.finish.unwrap_or(false) {
        return Ok(PlannerDecision {
            reasoning,
            output: PlannerOutput::Finish {
                summary: raw.summary.unwrap_or_default(),
            },
        });
    }

    match raw.tool.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()) {
        Some(tool) => Ok(PlannerDecision {
            reasoning,
            output: PlannerOutput::ToolCall(ToolProposal {
                tool,
                args: raw.args.unwrap_or(Value::Null),
            }),
        }),
        None => Err(AgentError::PlannerOutput(
            "decision has neither a tool nor finish: true".to_string(),
        )),
    }
}

/// 默认 system prompt；`config/prompts/planner.txt` 存在时优先使用，其中 `{tools}` 与 `{schema}` 会被替换
const DEFAULT_SYSTEM_PROMPT: &str = "You control a remote browser to complete the user's task.
Each turn you receive the task, the current FlowState, your recent steps and possibly a screenshot.
Choose exactly one tool per turn, or finish when the task is done.

Tools:
{tools}

Rules:
- Prefer `observe` first and then `perform` with the returned `observation`, so the step can be replayed deterministically.
- Use `perform` with `action` only when no locator is available.
- Never invent tools or arguments.

Reply with one JSON object matching this schema:
{schema}";

pub fn load_system_prompt() -> String {
    let template = ["config/prompts/planner.txt", "../config/prompts/planner.txt"]
        .into_iter()
        .find_map(|p| std::fs::read_to_string(p).ok())
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
    template
        .replace("{tools}", &tool_catalog())
        .replace("{schema}", &decision_schema_json())
}

/// Planner：持有 LLM 与 system prompt
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    /// 请求下一步决策；最新截图作为图片附在 user 消息上
    pub async fn plan(
        &self,
        context: &RunContext,
        flow: &FlowState,
        step: usize,
        max_steps: usize,
    ) -> Result<PlannerDecision, AgentError> {
        let messages = vec![
            Message::system(self.system_prompt.clone()),
            Message::user(context.render_prompt(flow, step, max_steps))
                .with_image(context.latest_screenshot().map(str::to_string)),
        ];
        let output = self.llm.complete(&messages).await.map_err(AgentError::Llm)?;
        parse_llm_output(&output)
    }
}
