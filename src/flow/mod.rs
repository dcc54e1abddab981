//! FlowState 数据模型与持久化

pub mod state;
pub mod store;
#[cfg(feature = "async-sqlite")]
pub mod sqlite;

pub use state::{
    generate_cache_key, Action, ActionData, ActionKind, FlowState, FlowStatePatch, MergeOutcome,
};
pub use store::{
    ExecutionEntry, ExecutionRecord, FlowStore, FlowSummary, MemoryFlowStore, StoredFlow,
};
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteFlowStore;
