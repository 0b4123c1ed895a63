//! 追踪记录器
//!
//! 追踪上下文通过 TraceHandle 显式传递，不依赖线程局部状态。
//! 持久化策略：ERROR / TIMEOUT 必定落库，SUCCESS 按采样率落库；
//! 追踪落库失败只记警告，从不影响编排结果。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::state::{QueryOrder, StateError, StateManager};
use crate::trace::types::{ExecutionTrace, ToolCallRecord, TraceStatus};

/// 追踪文档所在的集合名
const TRACE_COLLECTION: &str = "traces";

/// 追踪记录器
#[derive(Clone)]
pub struct TraceRecorder {
    state: Arc<StateManager>,
    sample_rate: f64,
    max_output_chars: usize,
}

/// 单条追踪的共享句柄；随执行上下文流动，可跨任务克隆
#[derive(Clone)]
pub struct TraceHandle {
    inner: Arc<Mutex<ExecutionTrace>>,
    max_output_chars: usize,
}

impl TraceHandle {
    pub fn trace_id(&self) -> String {
        self.inner.lock().unwrap().trace_id.clone()
    }

    /// 记录一次工具调用；输入输出都按上限截断，输出额外保留原始字符数
    pub fn record_tool_call(
        &self,
        name: &str,
        input: &str,
        output: &str,
        duration_ms: u64,
        is_error: bool,
    ) {
        let (input, _) = truncate_chars(input, self.max_output_chars);
        let (stored, original_len) = truncate_chars(output, self.max_output_chars);
        let record = ToolCallRecord {
            name: name.to_string(),
            input,
            output: stored,
            original_len,
            duration_ms,
            is_error,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.inner.lock().unwrap().tool_calls.push(record);
    }

    pub fn bump_iteration(&self) {
        self.inner.lock().unwrap().iterations += 1;
    }

    pub fn add_metadata(&self, key: &str, value: Value) {
        self.inner
            .lock()
            .unwrap()
            .metadata
            .insert(key.to_string(), value);
    }

    /// 记录最终答案；在终结前调用
    pub fn set_final_output(&self, output: &str) {
        self.inner.lock().unwrap().final_output = Some(output.to_string());
    }

    pub fn snapshot(&self) -> ExecutionTrace {
        self.inner.lock().unwrap().clone()
    }

    /// 置为终态；只有第一次调用生效并返回终态快照
    fn mark_finalized(&self, status: TraceStatus, error: Option<String>) -> Option<ExecutionTrace> {
        let mut trace = self.inner.lock().unwrap();
        if trace.ended_at.is_some() {
            return None;
        }
        let now = chrono::Utc::now().timestamp_millis();
        trace.status = status;
        trace.ended_at = Some(now);
        trace.duration_ms = Some((now - trace.started_at).max(0) as u64);
        trace.error = error;
        Some(trace.clone())
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> (String, Option<usize>) {
    let total = text.chars().count();
    if total <= max_chars {
        (text.to_string(), None)
    } else {
        (text.chars().take(max_chars).collect(), Some(total))
    }
}

impl TraceRecorder {
    pub fn new(state: Arc<StateManager>, sample_rate: f64, max_output_chars: usize) -> Self {
        Self {
            state,
            sample_rate,
            max_output_chars,
        }
    }

    pub fn from_config(state: Arc<StateManager>, cfg: &crate::config::TraceSection) -> Self {
        Self::new(state, cfg.sample_rate, cfg.max_output_chars)
    }

    /// 开启一条新追踪
    pub fn begin(
        &self,
        task: &str,
        requester_id: Option<String>,
        session_id: Option<String>,
    ) -> TraceHandle {
        let mut trace = ExecutionTrace::new(task);
        trace.requester_id = requester_id;
        trace.session_id = session_id;
        let handle = TraceHandle {
            inner: Arc::new(Mutex::new(trace)),
            max_output_chars: self.max_output_chars,
        };
        tracing::debug!(trace_id = %handle.trace_id(), "Trace started");
        handle
    }

    /// 开启一条带护栏的追踪：护栏被丢弃时自动以 ERROR 终结
    pub fn begin_guarded(
        &self,
        task: &str,
        requester_id: Option<String>,
        session_id: Option<String>,
    ) -> TraceGuard {
        TraceGuard {
            recorder: self.clone(),
            handle: self.begin(task, requester_id, session_id),
            armed: true,
        }
    }

    /// 终结追踪并按策略持久化；重复调用是无操作
    pub async fn finalize(&self, handle: &TraceHandle, status: TraceStatus, error: Option<String>) {
        let Some(snapshot) = handle.mark_finalized(status, error) else {
            return;
        };
        self.persist(snapshot).await;
    }

    async fn persist(&self, snapshot: ExecutionTrace) {
        if !self.should_persist(snapshot.status) {
            tracing::debug!(trace_id = %snapshot.trace_id, "Trace sampled out");
            return;
        }
        let trace_id = snapshot.trace_id.clone();
        let value = match serde_json::to_value(&snapshot) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(trace_id = %trace_id, error = %e, "Failed to serialize trace");
                return;
            }
        };
        // 追踪只进持久层，不占 L1
        if let Err(e) = self
            .state
            .set(TRACE_COLLECTION, &trace_id, value, Duration::ZERO, true)
            .await
        {
            tracing::warn!(trace_id = %trace_id, error = %e, "Failed to persist trace");
        } else {
            tracing::debug!(trace_id = %trace_id, status = %snapshot.status, "Trace persisted");
        }
    }

    fn should_persist(&self, status: TraceStatus) -> bool {
        match status {
            TraceStatus::Error | TraceStatus::Timeout => true,
            TraceStatus::Success | TraceStatus::Running => self.sample(),
        }
    }

    /// 采样判定；0.0 与 1.0 为确定性端点
    fn sample(&self) -> bool {
        if self.sample_rate >= 1.0 {
            return true;
        }
        if self.sample_rate <= 0.0 {
            return false;
        }
        rand::random::<f64>() < self.sample_rate
    }

    pub async fn get_trace(&self, trace_id: &str) -> Result<Option<ExecutionTrace>, StateError> {
        let Some(value) = self
            .state
            .get(TRACE_COLLECTION, trace_id, Duration::ZERO)
            .await?
        else {
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(trace) => Ok(Some(trace)),
            Err(e) => {
                tracing::warn!(trace_id, error = %e, "Malformed trace document");
                Ok(None)
            }
        }
    }

    /// 按发起方列出追踪，最近落库的在前
    pub async fn list_by_requester(
        &self,
        requester_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ExecutionTrace>, StateError> {
        let filters = vec![(
            "requester_id".to_string(),
            serde_json::json!(requester_id),
        )];
        let rows = self
            .state
            .query(TRACE_COLLECTION, filters, QueryOrder::NewestFirst, limit)
            .await?;
        Ok(parse_rows(rows))
    }

    /// 按终态列出追踪，最近落库的在前
    pub async fn list_by_status(
        &self,
        status: TraceStatus,
        limit: Option<usize>,
    ) -> Result<Vec<ExecutionTrace>, StateError> {
        let filters = vec![("status".to_string(), serde_json::json!(status))];
        let rows = self
            .state
            .query(TRACE_COLLECTION, filters, QueryOrder::NewestFirst, limit)
            .await?;
        Ok(parse_rows(rows))
    }
}

fn parse_rows(rows: Vec<Value>) -> Vec<ExecutionTrace> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value(row) {
            Ok(trace) => Some(trace),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed trace document");
                None
            }
        })
        .collect()
}

/// 追踪护栏：正常路径调用 finish；护栏脱落时 Drop 兜底终结为 ERROR
pub struct TraceGuard {
    recorder: TraceRecorder,
    handle: TraceHandle,
    armed: bool,
}

impl TraceGuard {
    pub fn handle(&self) -> TraceHandle {
        self.handle.clone()
    }

    pub fn trace_id(&self) -> String {
        self.handle.trace_id()
    }

    pub async fn finish(mut self, status: TraceStatus, error: Option<String>) {
        self.armed = false;
        self.recorder.finalize(&self.handle, status, error).await;
    }
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(snapshot) = self.handle.mark_finalized(
            TraceStatus::Error,
            Some("Trace dropped before finalize".to_string()),
        ) else {
            return;
        };
        let recorder = self.recorder.clone();
        // Drop 无法 await，持久化交给运行时；运行时不存在时只保留内存终态
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                recorder.persist(snapshot).await;
            });
        }
    }
}
