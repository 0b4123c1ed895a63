//! 熔断器注册表
//!
//! 每个依赖名一个熔断器，按需懒创建（读锁快路径 + 写锁双检）。
//! 注册表本身由宿主显式注入，不做全局单例。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::breaker::{BreakerConfig, BreakerStats, CircuitBreaker};

/// 熔断器注册表：依赖名 -> 熔断器
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    default_config: BreakerConfig,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config,
        }
    }

    /// 获取或创建指定依赖的熔断器（默认配置）
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().unwrap().get(name) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write().unwrap();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(dependency = %name, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(name, self.default_config.clone()))
            })
            .clone()
    }

    /// 以指定配置注册熔断器；依赖名已存在时保留原实例
    pub fn register(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.write().unwrap();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    /// 所有熔断器的统计快照
    pub fn stats(&self) -> Vec<BreakerStats> {
        self.breakers
            .read()
            .unwrap()
            .values()
            .map(|b| b.stats())
            .collect()
    }

    /// 将所有熔断器重置回 CLOSED
    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().unwrap().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
        tracing::info!("All circuit breakers reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerState;
    use std::time::Duration;

    fn fast_registry() -> Arc<BreakerRegistry> {
        Arc::new(BreakerRegistry::new(
            BreakerConfig::default()
                .with_failure_threshold(1)
                .with_cooldown(Duration::from_millis(50)),
        ))
    }

    #[tokio::test]
    async fn test_same_name_returns_same_instance() {
        let registry = fast_registry();
        let a = registry.breaker("llm");
        let b = registry.breaker("llm");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_concurrent_creation_single_instance() {
        let registry = fast_registry();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move { registry.breaker("store") }));
        }

        let mut breakers = Vec::new();
        for handle in handles {
            breakers.push(handle.await.unwrap());
        }
        for breaker in &breakers[1..] {
            assert!(Arc::ptr_eq(&breakers[0], breaker));
        }
    }

    #[tokio::test]
    async fn test_breakers_are_isolated_per_dependency() {
        let registry = fast_registry();

        let _ = registry
            .breaker("a")
            .call(Duration::from_secs(1), || async {
                Err::<(), _>("boom".to_string())
            })
            .await;

        assert_eq!(registry.breaker("a").state(), BreakerState::Open);
        assert_eq!(registry.breaker("b").state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_reset_all() {
        let registry = fast_registry();
        registry.breaker("a").force_open();
        registry.breaker("b").force_open();

        registry.reset_all();

        for stats in registry.stats() {
            assert_eq!(stats.state, BreakerState::Closed);
        }
    }
}
