//! 远端工具面（MCP）客户端：传输、结果归一化、派发

pub mod client;
pub mod extract;
pub mod http;
pub mod transport;

pub use client::{ToolClient, ToolResult};
pub use extract::{extract_flow_state, extract_screenshot, summarize_result, ExtractSource};
pub use http::HttpTransport;
pub use transport::ToolTransport;
