//! 执行追踪数据模型

use serde::{Deserialize, Serialize};

/// 追踪状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraceStatus {
    /// 执行中
    Running,
    /// 成功结束
    Success,
    /// 失败结束
    Error,
    /// 超时结束
    Timeout,
}

impl TraceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceStatus::Running => "RUNNING",
            TraceStatus::Success => "SUCCESS",
            TraceStatus::Error => "ERROR",
            TraceStatus::Timeout => "TIMEOUT",
        }
    }
}

impl std::fmt::Display for TraceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 单次工具调用记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// 工具名
    pub name: String,
    /// 输入摘要
    pub input: String,
    /// 输出（超限时按字符截断）
    pub output: String,
    /// 截断前的原始字符数；未截断时为空
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_len: Option<usize>,
    /// 耗时（毫秒）
    pub duration_ms: u64,
    /// 是否出错
    pub is_error: bool,
    /// 调用时间（毫秒时间戳）
    pub timestamp: i64,
}

/// 一次编排执行的完整追踪
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTrace {
    /// 追踪 ID
    pub trace_id: String,
    /// 发起方 ID
    pub requester_id: Option<String>,
    /// 关联的会话 ID
    pub session_id: Option<String>,
    /// 任务描述
    pub task: String,
    /// 追踪状态
    pub status: TraceStatus,
    /// 开始时间（毫秒时间戳）
    pub started_at: i64,
    /// 结束时间
    pub ended_at: Option<i64>,
    /// 总耗时（毫秒）
    pub duration_ms: Option<u64>,
    /// 执行波次计数
    pub iterations: u32,
    /// 工具调用记录
    pub tool_calls: Vec<ToolCallRecord>,
    /// 最终答案；只在成功终结时写入
    pub final_output: Option<String>,
    /// 错误信息
    pub error: Option<String>,
    /// 元数据
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ExecutionTrace {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            trace_id: format!("trace_{}", uuid::Uuid::new_v4()),
            requester_id: None,
            session_id: None,
            task: task.into(),
            status: TraceStatus::Running,
            started_at: chrono::Utc::now().timestamp_millis(),
            ended_at: None,
            duration_ms: None,
            iterations: 0,
            tool_calls: Vec::new(),
            final_output: None,
            error: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_requester(mut self, requester_id: impl Into<String>) -> Self {
        self.requester_id = Some(requester_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// 是否已终结（ended_at 只在终结时写入一次）
    pub fn is_finalized(&self) -> bool {
        self.ended_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_format() {
        let value = serde_json::to_value(TraceStatus::Error).unwrap();
        assert_eq!(value, serde_json::json!("ERROR"));
        let parsed: TraceStatus = serde_json::from_value(serde_json::json!("TIMEOUT")).unwrap();
        assert_eq!(parsed, TraceStatus::Timeout);
    }

    #[test]
    fn test_new_trace_is_running() {
        let trace = ExecutionTrace::new("demo").with_requester("u1");
        assert!(trace.trace_id.starts_with("trace_"));
        assert_eq!(trace.status, TraceStatus::Running);
        assert!(!trace.is_finalized());
        assert_eq!(trace.requester_id.as_deref(), Some("u1"));
    }
}
