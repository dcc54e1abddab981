//! 远端工具面传输抽象
//!
//! ToolClient 只依赖该 trait；生产环境为 HttpTransport（JSON-RPC over HTTP），测试中可注入假实现。

use async_trait::async_trait;
use serde_json::Value;

use crate::core::AgentError;

#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// 调用远端工具，返回 JSON-RPC `result` 成员（未做结构校验）
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, AgentError>;
}
