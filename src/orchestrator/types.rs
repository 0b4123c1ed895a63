//! 编排数据模型

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::breaker::BreakerError;
use crate::trace::TraceHandle;

/// 子任务状态
///
/// 依赖失败的子任务不执行，直接标记 Failed，error 记录失败来源。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubTaskStatus {
    /// 等待执行
    Pending,
    /// 正在执行
    Running,
    /// 已完成
    Completed,
    /// 执行失败或依赖失败
    Failed,
}

impl Default for SubTaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// LLM 分解出的子任务
///
/// depends_on 来自模型输出，按不可信输入处理：下标越界、自指与重复
/// 在执行前由 sanitize_dependencies 剔除。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    /// 子任务描述
    pub description: String,
    /// 要调用的技能名；缺省时由 LLM 直接完成该子任务
    #[serde(default)]
    pub skill: Option<String>,
    /// 技能输入；缺省时用 description
    #[serde(default)]
    pub input: Option<String>,
    /// 依赖的子任务下标（指向同一计划内的位置）
    #[serde(default)]
    pub depends_on: Vec<usize>,
    /// 执行状态
    #[serde(default)]
    pub status: SubTaskStatus,
    /// 执行结果
    #[serde(default)]
    pub result: Option<String>,
    /// 错误信息
    #[serde(default)]
    pub error: Option<String>,
}

impl SubTask {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            skill: None,
            input: None,
            depends_on: Vec::new(),
            status: SubTaskStatus::Pending,
            result: None,
            error: None,
        }
    }

    pub fn with_skill(mut self, skill: impl Into<String>) -> Self {
        self.skill = Some(skill.into());
        self
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_depends_on(mut self, depends_on: Vec<usize>) -> Self {
        self.depends_on = depends_on;
        self
    }
}

/// 分解得到的执行计划
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    /// 原始任务
    pub task: String,
    /// 子任务列表；depends_on 以此列表下标为准
    pub subtasks: Vec<SubTask>,
}

impl TaskPlan {
    pub fn new(task: impl Into<String>, subtasks: Vec<SubTask>) -> Self {
        Self {
            task: task.into(),
            subtasks,
        }
    }
}

/// 执行上下文：随一次编排显式传递，不依赖任何全局状态
#[derive(Clone, Default)]
pub struct ExecContext {
    /// 发起方 ID
    pub requester_id: Option<String>,
    /// 会话 ID；存在时执行结束后追加会话历史
    pub session_id: Option<String>,
    /// 取消令牌
    pub cancel: CancellationToken,
    /// 关联的追踪句柄，由编排器在执行开始时填充并随技能上下文下发
    pub trace: Option<TraceHandle>,
}

impl ExecContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_requester(mut self, requester_id: impl Into<String>) -> Self {
        self.requester_id = Some(requester_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// 编排错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Task decomposition failed: {0}")]
    Decompose(String),

    #[error("Decomposition produced an empty plan")]
    EmptyPlan,

    #[error("Cyclic dependency detected: {0}")]
    CyclicDependency(String),

    #[error("Execution deadlocked with {pending} subtasks unable to run")]
    Deadlock { pending: usize },

    #[error("Execution cancelled")]
    Cancelled,

    #[error(transparent)]
    Breaker(#[from] BreakerError),
}

/// 一次编排的执行报告
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    /// 最终答案
    pub answer: String,
    /// 执行后的计划，含每个子任务的终态与结果
    pub plan: TaskPlan,
    /// 关联的追踪 ID
    pub trace_id: String,
    /// 总耗时（毫秒）
    pub duration_ms: u64,
    /// 答案是否由 LLM 综合；false 表示回退为拼接
    pub synthesized: bool,
}
