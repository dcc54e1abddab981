//! Tool Client：向远端工具面派发调用并归一化结果
//!
//! 每次调用附加当前 FlowState（回放调用除外，只带 replayState），在超时内经 ToolTransport 发出，
//! 输出结构化审计日志（JSON），再把结果归一化为 ToolResult。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::time::timeout;

use crate::core::AgentError;
use crate::flow::{FlowState, FlowStatePatch};
use crate::mcp::extract::{
    content_text, extract_flow_state, extract_screenshot, summarize_result, ExtractSource,
};
use crate::mcp::transport::ToolTransport;
use crate::tools::RemoteCall;

/// 归一化后的工具结果
#[derive(Clone, Debug)]
pub struct ToolResult {
    /// 人类可读摘要（远端 isError 时以 "Error: " 开头）
    pub content: String,
    /// 全部文本（用于自愈标记扫描）
    pub text: String,
    pub flow_state: FlowStatePatch,
    pub flow_state_source: ExtractSource,
    pub screenshot: Option<String>,
    /// 远端以 isError 报告的工具级失败（不视为传输错误）
    pub is_error: bool,
    pub raw: Value,
}

impl ToolResult {
    /// 从 JSON-RPC result 构造；非对象结果视为格式错误
    pub fn from_value(raw: Value) -> Result<Self, AgentError> {
        if !raw.is_object() {
            return Err(AgentError::MalformedResponse(format!(
                "tool result is not an object: {}",
                args_preview(&raw)
            )));
        }
        let is_error = raw.get("isError").and_then(Value::as_bool).unwrap_or(false);
        let summary = summarize_result(&raw);
        let (flow_state, flow_state_source) = extract_flow_state(&raw);
        Ok(Self {
            content: if is_error { format!("Error: {summary}") } else { summary },
            text: content_text(&raw),
            flow_state,
            flow_state_source,
            screenshot: extract_screenshot(&raw),
            is_error,
            raw,
        })
    }
}

pub struct ToolClient {
    transport: Arc<dyn ToolTransport>,
    timeout: Duration,
}

impl ToolClient {
    pub fn new(transport: Arc<dyn ToolTransport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// 派发一次远端调用
    pub async fn invoke(&self, call: &RemoteCall, flow_state: &FlowState) -> Result<ToolResult, AgentError> {
        let name = call.remote_name();
        let arguments = call.arguments();
        let preview = args_preview(&Value::Object(arguments.clone()));
        let outbound = attach_flow_state(call, arguments, flow_state);

        let start = Instant::now();
        let result = timeout(self.timeout, self.transport.call_tool(name, outbound)).await;
        let result = match result {
            Ok(inner) => inner.and_then(ToolResult::from_value),
            Err(_) => Err(AgentError::Timeout(format!("remote tool '{name}'"))),
        };

        let (ok, outcome): (bool, &str) = match &result {
            Ok(r) if r.is_error => (false, "tool_error"),
            Ok(_) => (true, "ok"),
            Err(AgentError::Timeout(_)) => (false, "timeout"),
            Err(AgentError::MalformedResponse(_)) => (false, "malformed"),
            Err(_) => (false, "error"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": name,
            "cache_key": flow_state.cache_key,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        result
    }
}

/// 出站参数：附加 flowState（cacheKey 必定存在）；回放调用保持原样
fn attach_flow_state(call: &RemoteCall, mut arguments: Map<String, Value>, flow_state: &FlowState) -> Value {
    if call.carries_flow_state() {
        let mut state = flow_state.clone();
        state.ensure_cache_key();
        arguments.insert("flowState".to_string(), state.to_value());
    }
    Value::Object(arguments)
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::BrowserToolCall;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct Canned {
        reply: Value,
        delay: Duration,
        seen: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl ToolTransport for Canned {
        async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, AgentError> {
            self.seen.lock().unwrap().push((name.to_string(), arguments));
            tokio::time::sleep(self.delay).await;
            Ok(self.reply.clone())
        }
    }

    fn client(reply: Value, delay: Duration) -> (ToolClient, Arc<Canned>) {
        let transport = Arc::new(Canned { reply, delay, seen: Mutex::new(Vec::new()) });
        (ToolClient::new(transport.clone(), Duration::from_millis(200)), transport)
    }

    #[tokio::test]
    async fn test_attaches_flow_state_with_cache_key() {
        let (client, transport) = client(json!({"content": [{"type": "text", "text": "ok"}]}), Duration::ZERO);
        let state = FlowState::new("flow-7");
        let call = RemoteCall::Tool(BrowserToolCall::GetUrl);
        let result = client.invoke(&call, &state).await.unwrap();
        assert_eq!(result.content, "ok");
        assert_eq!(result.flow_state_source, ExtractSource::CallerFallback);

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].0, "browserbase_stagehand_get_url");
        assert_eq!(seen[0].1["flowState"]["cacheKey"], "flow-7");
    }

    #[tokio::test]
    async fn test_replay_sends_only_replay_state() {
        let (client, transport) = client(json!({"content": []}), Duration::ZERO);
        let mut state = FlowState::new("flow-r");
        state.actions.push(crate::flow::Action::action("click", 1));
        client.invoke(&RemoteCall::Replay(state.clone()), &state).await.unwrap();

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].0, "browserbase_stagehand_act");
        assert!(seen[0].1.get("flowState").is_none());
        assert_eq!(seen[0].1["replayState"]["actions"][0]["data"], "click");
    }

    #[tokio::test]
    async fn test_non_object_result_is_malformed() {
        let (client, _) = client(json!("just text"), Duration::ZERO);
        let err = client
            .invoke(&RemoteCall::Tool(BrowserToolCall::Screenshot), &FlowState::new("k"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::MalformedResponse(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_slow_transport_times_out() {
        let (client, _) = client(json!({}), Duration::from_secs(5));
        let err = client
            .invoke(&RemoteCall::SessionCreate, &FlowState::new("k"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));
    }

    #[test]
    fn test_is_error_result_passes_through_as_content() {
        let result = ToolResult::from_value(json!({
            "isError": true,
            "content": [{"type": "text", "text": "element not found"}]
        }))
        .unwrap();
        assert!(result.is_error);
        assert_eq!(result.content, "Error: element not found");
    }
}
