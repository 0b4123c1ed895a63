//! 执行追踪
//!
//! 记录编排执行的波次、工具调用与终态，按策略持久化到状态层。

pub mod recorder;
pub mod types;

pub use recorder::{TraceGuard, TraceHandle, TraceRecorder};
pub use types::{ExecutionTrace, ToolCallRecord, TraceStatus};
