//! 运行上下文：Planner 每轮看到的目标、最近步骤、纠错反馈与最新截图
//!
//! 只保留最近 history_window 步，避免提示词随步数线性增长。

use std::collections::VecDeque;

use crate::flow::FlowState;

const RESULT_PREVIEW_CHARS: usize = 400;

/// 提示词中的一步摘要
#[derive(Clone, Debug)]
pub struct StepNote {
    pub step: usize,
    pub tool: String,
    pub args: String,
    pub result: String,
}

#[derive(Debug)]
pub struct RunContext {
    goal: String,
    recent: VecDeque<StepNote>,
    window: usize,
    feedback: Vec<String>,
    latest_screenshot: Option<String>,
}

impl RunContext {
    pub fn new(goal: impl Into<String>, window: usize) -> Self {
        Self {
            goal: goal.into(),
            recent: VecDeque::new(),
            window: window.max(1),
            feedback: Vec::new(),
            latest_screenshot: None,
        }
    }

    pub fn record_step(&mut self, step: usize, tool: &str, args: &serde_json::Value, result: &str) {
        if self.recent.len() == self.window {
            self.recent.pop_front();
        }
        self.recent.push_back(StepNote {
            step,
            tool: tool.to_string(),
            args: args.to_string(),
            result: result.chars().take(RESULT_PREVIEW_CHARS).collect(),
        });
    }

    /// 被拒绝的提议或无法解析的输出，下一轮作为纠错输入
    pub fn push_feedback(&mut self, msg: impl Into<String>) {
        self.feedback.push(msg.into());
    }

    pub fn clear_feedback(&mut self) {
        self.feedback.clear();
    }

    pub fn set_screenshot(&mut self, screenshot: Option<String>) {
        if screenshot.is_some() {
            self.latest_screenshot = screenshot;
        }
    }

    pub fn latest_screenshot(&self) -> Option<&str> {
        self.latest_screenshot.as_deref()
    }

    pub fn recent_steps(&self) -> impl Iterator<Item = &StepNote> {
        self.recent.iter()
    }

    /// 本轮 user 提示词
    pub fn render_prompt(&self, flow: &FlowState, step: usize, max_steps: usize) -> String {
        let mut out = format!("Task: {}\n\nStep {} of {}.\n", self.goal, step, max_steps);
        out.push_str(&format!("\nFlowState: {}\n", flow.describe()));
        out.push_str(&format!("FlowState JSON: {}\n", flow.to_value()));

        if self.recent.is_empty() {
            out.push_str("\nNo tools have been called yet.\n");
        } else {
            out.push_str("\nRecent steps:\n");
            for note in &self.recent {
                out.push_str(&format!(
                    "- step {}: {} {} -> {}\n",
                    note.step, note.tool, note.args, note.result
                ));
            }
        }

        if !self.feedback.is_empty() {
            out.push_str("\nYour previous proposal was rejected:\n");
            for msg in &self.feedback {
                out.push_str(&format!("- {msg}\n"));
            }
            out.push_str("Correct the proposal and try again.\n");
        }

        if self.latest_screenshot.is_some() {
            out.push_str("\nThe latest screenshot of the page is attached.\n");
        }
        out.push_str("\nRespond with a single JSON object.");
        out
    }
}
