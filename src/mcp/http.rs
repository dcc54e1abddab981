//! JSON-RPC over HTTP 传输（MCP `tools/call`）
//!
//! 响应体可能是普通 JSON，也可能是 SSE（取第一条非空 `data: ` 行作为载荷）。
//! JSON-RPC `error` 成员统一映射为 Transport("MCP error: ...")。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::{json, Value};

use crate::core::AgentError;
use crate::mcp::transport::ToolTransport;

const BODY_PREVIEW_CHARS: usize = 400;

fn preview(text: &str) -> String {
    if text.is_empty() {
        return "<empty>".to_string();
    }
    text.chars().take(BODY_PREVIEW_CHARS).collect()
}

/// 解析响应体：SSE 取第一条 data 行，否则按 JSON 解析
pub fn parse_body(body: &str, content_type: &str) -> Result<Value, AgentError> {
    if body.trim().is_empty() {
        return Err(AgentError::MalformedResponse(
            "remote tool surface returned an empty body".to_string(),
        ));
    }
    if content_type.contains("text/event-stream") {
        let payload = body
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(str::trim)
            .find(|data| !data.is_empty())
            .ok_or_else(|| {
                AgentError::MalformedResponse("no data line in SSE payload".to_string())
            })?;
        return serde_json::from_str(payload).map_err(|e| {
            AgentError::MalformedResponse(format!("SSE data is not JSON ({e}): {}", preview(payload)))
        });
    }
    serde_json::from_str(body).map_err(|e| {
        AgentError::MalformedResponse(format!(
            "non-JSON payload (type={content_type}, {e}): {}",
            preview(body)
        ))
    })
}

/// 从 JSON-RPC 信封取出 result；`error` 成员映射为 Transport
pub fn rpc_result(envelope: Value) -> Result<Value, AgentError> {
    let Value::Object(mut map) = envelope else {
        return Err(AgentError::MalformedResponse(format!(
            "JSON-RPC envelope is not an object: {}",
            preview(&envelope.to_string())
        )));
    };
    if let Some(err) = map.remove("error").filter(|e| !e.is_null()) {
        let msg = match &err {
            Value::Object(o) => o
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string()),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Err(AgentError::Transport(format!("MCP error: {msg}")));
    }
    Ok(map.remove("result").unwrap_or(Value::Object(map)))
}

/// 基于 reqwest 的 MCP 传输
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn map_reqwest(&self, name: &str, e: reqwest::Error) -> AgentError {
        if e.is_timeout() {
            AgentError::Timeout(format!("remote tool '{name}'"))
        } else {
            AgentError::Transport(format!("{name} request to {} failed: {e}", self.endpoint))
        }
    }
}

#[async_trait]
impl ToolTransport for HttpTransport {
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, AgentError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": { "name": name, "arguments": arguments },
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .json(&payload)
            .send()
            .await
            .map_err(|e| self.map_reqwest(name, e))?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.text().await.map_err(|e| self.map_reqwest(name, e))?;

        if !status.is_success() {
            return Err(AgentError::Transport(format!(
                "{name} returned HTTP {status}: {}",
                preview(&body)
            )));
        }

        rpc_result(parse_body(&body, &content_type)?)
    }
}
