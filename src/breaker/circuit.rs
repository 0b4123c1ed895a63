//! 熔断器状态机
//!
//! 三态：CLOSED（正常放行）/ OPEN（快速失败）/ HALF_OPEN（冷却期满后试探）。
//! 连续失败达到阈值则打开；冷却期满后下一次调用转入半开；半开期一次失败立即重开，
//! 连续成功达到配额则关闭。锁只保护状态迁移本身，时间比较与日志都在锁外。

use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::time::timeout;

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        };
        write!(f, "{}", s)
    }
}

/// 熔断器错误：打开拒绝 / 调用超时 / 调用失败
#[derive(Error, Debug, Clone)]
pub enum BreakerError {
    #[error("Circuit open for {dependency}, retry in {remaining_ms}ms")]
    CircuitOpen {
        dependency: String,
        remaining_ms: u64,
    },

    #[error("{dependency} call timed out after {timeout_ms}ms")]
    Timeout { dependency: String, timeout_ms: u64 },

    #[error("{dependency} call failed: {message}")]
    Operation { dependency: String, message: String },
}

/// 熔断器配置
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// 连续失败多少次后打开
    pub failure_threshold: usize,
    /// 打开后固定冷却时长，期满转入半开（策略仅通过配置可调，无退避）
    pub cooldown: Duration,
    /// 半开期连续成功多少次后关闭
    pub half_open_quota: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            half_open_quota: 2,
        }
    }
}

impl BreakerConfig {
    pub fn from_config(cfg: &crate::config::BreakerSection) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold,
            cooldown: Duration::from_secs(cfg.cooldown_secs),
            half_open_quota: cfg.half_open_quota,
        }
    }

    pub fn with_failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_half_open_quota(mut self, quota: usize) -> Self {
        self.half_open_quota = quota;
        self
    }
}

/// 统计快照（可序列化，供宿主上报）
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub dependency: String,
    pub state: BreakerState,
    pub consecutive_failures: usize,
    pub consecutive_successes: usize,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
    pub last_failure_ms: Option<i64>,
    pub last_success_ms: Option<i64>,
    pub remaining_cooldown_ms: u64,
    pub last_transition_ms: i64,
}

/// 锁内的迁移簿记（计数均为「连续」，非滑动窗口）
struct BreakerCore {
    state: BreakerState,
    consecutive_failures: usize,
    consecutive_successes: usize,
    opened_at: Option<Instant>,
    total_successes: u64,
    total_failures: u64,
    total_rejected: u64,
    last_failure_ms: Option<i64>,
    last_success_ms: Option<i64>,
    last_transition_ms: i64,
}

impl BreakerCore {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            total_successes: 0,
            total_failures: 0,
            total_rejected: 0,
            last_failure_ms: None,
            last_success_ms: None,
            last_transition_ms: 0,
        }
    }
}

/// 单依赖熔断器：call 包裹一次外呼并施加超时，失败与超时都计入熔断
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    core: Mutex<BreakerCore>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            core: Mutex::new(BreakerCore::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 包裹一次外呼：OPEN 且冷却未满则快速失败且不调用 op；
    /// 超时计为失败并返回 Timeout；op 返回 Err 计为失败并返回 Operation
    pub async fn call<T, F, Fut>(&self, call_timeout: Duration, op: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        self.admit(Instant::now())?;

        match timeout(call_timeout, op()).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(message)) => {
                self.record_failure(Instant::now(), &message);
                Err(BreakerError::Operation {
                    dependency: self.name.clone(),
                    message,
                })
            }
            Err(_) => {
                self.record_failure(Instant::now(), "timeout");
                Err(BreakerError::Timeout {
                    dependency: self.name.clone(),
                    timeout_ms: call_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// 入口判定：冷却期满的迁移在这里惰性发生（无后台定时器）
    fn admit(&self, now: Instant) -> Result<(), BreakerError> {
        let (state, opened_at) = {
            let core = self.core.lock().unwrap();
            (core.state, core.opened_at)
        };

        match state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = opened_at
                    .map(|t| now.duration_since(t))
                    .unwrap_or(self.config.cooldown);

                if elapsed >= self.config.cooldown {
                    // 冷却期满，转入半开试探。竞争窗口内多个调用可能同时放行，
                    // 关闭仍由成功配额把关
                    let ts = chrono::Utc::now().timestamp_millis();
                    let transitioned = {
                        let mut core = self.core.lock().unwrap();
                        if core.state == BreakerState::Open {
                            core.state = BreakerState::HalfOpen;
                            core.consecutive_successes = 0;
                            core.last_transition_ms = ts;
                            true
                        } else {
                            false
                        }
                    };
                    if transitioned {
                        tracing::info!(
                            dependency = %self.name,
                            "Circuit breaker half-open, probing"
                        );
                    }
                    Ok(())
                } else {
                    let remaining = self.config.cooldown - elapsed;
                    {
                        let mut core = self.core.lock().unwrap();
                        core.total_rejected += 1;
                    }
                    tracing::debug!(
                        dependency = %self.name,
                        remaining_ms = remaining.as_millis() as u64,
                        "Circuit open, rejecting call"
                    );
                    Err(BreakerError::CircuitOpen {
                        dependency: self.name.clone(),
                        remaining_ms: remaining.as_millis() as u64,
                    })
                }
            }
        }
    }

    fn record_success(&self) {
        let ts = chrono::Utc::now().timestamp_millis();
        let closed_now = {
            let mut core = self.core.lock().unwrap();
            core.total_successes += 1;
            core.last_success_ms = Some(ts);
            match core.state {
                BreakerState::Closed => {
                    core.consecutive_successes += 1;
                    core.consecutive_failures = 0;
                    false
                }
                BreakerState::HalfOpen => {
                    core.consecutive_successes += 1;
                    if core.consecutive_successes >= self.config.half_open_quota {
                        core.state = BreakerState::Closed;
                        core.consecutive_failures = 0;
                        core.consecutive_successes = 0;
                        core.opened_at = None;
                        core.last_transition_ms = ts;
                        true
                    } else {
                        false
                    }
                }
                // 打开前发起的慢调用此时才返回成功，不影响已打开的状态
                BreakerState::Open => false,
            }
        };

        if closed_now {
            tracing::info!(dependency = %self.name, "Circuit breaker closed");
        }
    }

    fn record_failure(&self, now: Instant, reason: &str) {
        let ts = chrono::Utc::now().timestamp_millis();
        let opened_now = {
            let mut core = self.core.lock().unwrap();
            core.total_failures += 1;
            core.last_failure_ms = Some(ts);
            match core.state {
                BreakerState::Closed => {
                    core.consecutive_failures += 1;
                    core.consecutive_successes = 0;
                    if core.consecutive_failures >= self.config.failure_threshold {
                        core.state = BreakerState::Open;
                        core.opened_at = Some(now);
                        core.last_transition_ms = ts;
                        true
                    } else {
                        false
                    }
                }
                // 半开期一次失败立即重开并重置冷却
                BreakerState::HalfOpen => {
                    core.state = BreakerState::Open;
                    core.opened_at = Some(now);
                    core.consecutive_successes = 0;
                    core.last_transition_ms = ts;
                    true
                }
                BreakerState::Open => false,
            }
        };

        if opened_now {
            tracing::warn!(
                dependency = %self.name,
                reason = %reason,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "Circuit breaker opened"
            );
        }
    }

    /// 当前状态（只读，不触发惰性迁移）
    pub fn state(&self) -> BreakerState {
        self.core.lock().unwrap().state
    }

    /// 统计快照
    pub fn stats(&self) -> BreakerStats {
        let now = Instant::now();
        let core = self.core.lock().unwrap();

        let remaining_cooldown_ms = match (core.state, core.opened_at) {
            (BreakerState::Open, Some(t)) => self
                .config
                .cooldown
                .saturating_sub(now.duration_since(t))
                .as_millis() as u64,
            _ => 0,
        };

        BreakerStats {
            dependency: self.name.clone(),
            state: core.state,
            consecutive_failures: core.consecutive_failures,
            consecutive_successes: core.consecutive_successes,
            total_successes: core.total_successes,
            total_failures: core.total_failures,
            total_rejected: core.total_rejected,
            last_failure_ms: core.last_failure_ms,
            last_success_ms: core.last_success_ms,
            remaining_cooldown_ms,
            last_transition_ms: core.last_transition_ms,
        }
    }

    /// 回到 CLOSED 并清零连续计数（累计统计保留）
    pub fn reset(&self) {
        {
            let mut core = self.core.lock().unwrap();
            core.state = BreakerState::Closed;
            core.consecutive_failures = 0;
            core.consecutive_successes = 0;
            core.opened_at = None;
            core.last_transition_ms = chrono::Utc::now().timestamp_millis();
        }
        tracing::info!(dependency = %self.name, "Circuit breaker reset");
    }

    /// 手动打开（管理与测试用）
    pub fn force_open(&self) {
        let now = Instant::now();
        {
            let mut core = self.core.lock().unwrap();
            core.state = BreakerState::Open;
            core.opened_at = Some(now);
            core.consecutive_successes = 0;
            core.last_transition_ms = chrono::Utc::now().timestamp_millis();
        }
        tracing::warn!(dependency = %self.name, "Circuit breaker forced open");
    }
}
