//! Mock LLM 客户端（用于测试与无 API Key 的本地运行）
//!
//! MockLlmClient 立即给出 finish 决策；ScriptedLlmClient 按顺序返回预置回复，并记录收到的提示词。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message, Role};

const FINISH_REPLY: &str =
    r#"{"reasoning": "No planner backend configured; finishing.", "finish": true, "summary": "Mock planner finished without browsing."}"#;

/// Mock 客户端：总是结束任务
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, _messages: &[Message]) -> Result<String, String> {
        Ok(FINISH_REPLY.to_string())
    }
}

/// 脚本化客户端：逐条返回预置回复，耗尽后结束任务
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<Result<String, String>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlmClient {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// 追加一次失败回复（模拟 LLM 接口错误）
    pub fn push_failure(&self, err: impl Into<String>) {
        if let Ok(mut q) = self.replies.lock() {
            q.push_back(Err(err.into()));
        }
    }

    /// 已收到的 user 提示词（按调用顺序）
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        if let Ok(mut p) = self.prompts.lock() {
            p.push(last_user);
        }
        let next = self.replies.lock().ok().and_then(|mut q| q.pop_front());
        next.unwrap_or_else(|| Ok(FINISH_REPLY.to_string()))
    }
}
