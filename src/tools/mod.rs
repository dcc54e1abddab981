//! 工具层：Planner 可选工具白名单、参数契约与决策 Schema

pub mod call;
pub mod schema;

pub use call::{remote, BrowserToolCall, PerformIntent, RemoteCall, ALLOWED_TOOLS};
pub use schema::{decision_schema_json, tool_catalog};
