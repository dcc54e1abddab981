//! 核心编排层：错误与恢复、运行状态、事件流、编排器

pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod state;
pub mod stream;

pub use error::{AgentError, RecoveryAction};
pub use orchestrator::{
    ClearResponse, Confirmation, KeyLease, Orchestrator, ReplayRequest, RunHandle, RunRequest,
    CLEARED_MESSAGE, CONFIRMATION_MESSAGE,
};
pub use recovery::RecoveryEngine;
pub use state::{Execution, RunStatus, StepRecord, ToolCallRecord};
pub use stream::{event_channel, EventEmitter};
