//! 确定性回放

pub mod engine;

pub use engine::{count_self_healing, ReplayEngine, ReplayReport, SELF_HEAL_MARKERS};
