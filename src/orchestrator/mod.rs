//! 任务编排
//!
//! 把一个任务经 LLM 分解为带依赖的子任务计划，校验后按波次并发执行，
//! 最后综合为单一答案。

pub mod dag;
pub mod decompose;
pub mod engine;
pub mod types;

pub use engine::Orchestrator;
pub use types::{
    ExecContext, ExecutionReport, OrchestratorError, SubTask, SubTaskStatus, TaskPlan,
};
