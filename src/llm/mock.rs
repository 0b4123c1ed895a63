//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 支持两种模式：预设回复队列（push_response / push_error，按顺序弹出），
//! 队列为空时回显最后一条 User 消息，便于本地跑通完整编排流程。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message, Role};

/// Mock 客户端：按脚本回复或回显
#[derive(Debug, Default)]
pub struct MockLlmClient {
    responses: Mutex<VecDeque<Result<String, String>>>,
    calls: AtomicUsize,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预设一批成功回复（按顺序弹出）
    pub fn with_responses(responses: Vec<impl Into<String>>) -> Self {
        let client = Self::new();
        for r in responses {
            client.push_response(r);
        }
        client
    }

    /// 追加一条成功回复
    pub fn push_response(&self, response: impl Into<String>) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(response.into()));
    }

    /// 追加一条失败回复（complete 将返回 Err）
    pub fn push_error(&self, error: impl Into<String>) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(error.into()));
    }

    /// 已调用次数
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(scripted) = self.responses.lock().unwrap().pop_front() {
            return scripted;
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        Ok(format!("Echo from Mock: {}", last_user))
    }
}
