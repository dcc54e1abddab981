//! 认知层：Planner、运行上下文、主循环与过程事件

pub mod context;
pub mod events;
pub mod loop_;
pub mod planner;

pub use context::RunContext;
pub use events::FlowEvent;
pub use loop_::{run_task, with_retries, RunOutcome, RunSession};
pub use planner::{load_system_prompt, parse_llm_output, Planner, PlannerDecision, PlannerOutput, ToolProposal};
