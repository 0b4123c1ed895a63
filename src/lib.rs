//! Hive - 弹性任务编排层
//!
//! 模块划分：
//! - **breaker**: 依赖级熔断器（CLOSED / OPEN / HALF_OPEN）与注册表
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **llm**: LLM 客户端抽象（complete 接口与 Mock 实现）
//! - **observability**: tracing 初始化
//! - **orchestrator**: 任务分解、依赖校验与波次并发执行
//! - **skills**: 技能抽象与注册表
//! - **state**: 文档存储与两级状态缓存
//! - **trace**: 执行追踪与持久化策略

pub mod breaker;
pub mod config;
pub mod llm;
pub mod observability;
pub mod orchestrator;
pub mod skills;
pub mod state;
pub mod trace;

pub use orchestrator::Orchestrator;
