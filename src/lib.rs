//! Flowpilot - LLM 驱动的浏览器自动化编排器
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、运行状态、事件流、编排器
//! - **flow**: FlowState 数据模型、合并策略与持久化
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **mcp**: 远端工具面客户端（JSON-RPC 传输、结果归一化）
//! - **react**: Planner、运行上下文与主循环
//! - **replay**: 确定性回放与自愈统计
//! - **tools**: 工具白名单、参数契约与决策 Schema

pub mod config;
pub mod core;
pub mod flow;
pub mod llm;
pub mod mcp;
pub mod observability;
pub mod react;
pub mod replay;
pub mod tools;

pub use crate::core::{Orchestrator, ReplayRequest, RunHandle, RunRequest};
pub use crate::flow::FlowState;
pub use crate::react::FlowEvent;
