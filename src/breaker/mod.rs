//! 熔断层：按依赖隔离外呼失败，防止级联故障
//!
//! 每个外部依赖（LLM、持久化存储、各技能执行器）持有独立熔断器，
//! 全部外呼经 call 包裹：施加超时、计数失败、按状态快速失败。

pub mod circuit;
pub mod registry;

pub use circuit::{BreakerConfig, BreakerError, BreakerState, BreakerStats, CircuitBreaker};
pub use registry::BreakerRegistry;
