//! 两级状态缓存
//!
//! L1 为进程内有界 map（TTL + LRU），L2 为经熔断器访问的持久化文档存储。
//! 持久化写遵循「先落库、后进缓存」：库写失败时不触碰 L1，缓存永远不领先于持久层。
//! L1 锁从不跨存储 I/O 持有；append_bounded 的读改写通过独立的单写者锁串行化。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::breaker::{BreakerError, BreakerRegistry};
use crate::state::{DocumentStore, QueryOrder};

/// 持久化存储的熔断器依赖名
const STORE_BREAKER: &str = "store";

/// 状态层错误；L1 未命中不是错误（返回 Ok(None)）
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Durable store unavailable: {0}")]
    StoreUnavailable(#[from] BreakerError),
}

/// L1 条目：值、过期时刻、最近使用序号
struct CacheEntry {
    value: Value,
    expires_at: Instant,
    last_used: u64,
}

/// 缓存统计快照
#[derive(Debug, Clone, Serialize, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub l1_len: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// 两级状态管理器
pub struct StateManager {
    store: Arc<dyn DocumentStore>,
    breakers: Arc<BreakerRegistry>,
    entries: Mutex<HashMap<(String, String), CacheEntry>>,
    /// append_bounded 的读改写临界区，与 L1 锁无关
    writer: tokio::sync::Mutex<()>,
    max_entries: usize,
    store_timeout: Duration,
    default_ttl: Duration,
    tick: AtomicU64,
    counters: Counters,
}

impl StateManager {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        breakers: Arc<BreakerRegistry>,
        max_entries: usize,
        store_timeout: Duration,
        default_ttl: Duration,
    ) -> Self {
        Self {
            store,
            breakers,
            entries: Mutex::new(HashMap::new()),
            writer: tokio::sync::Mutex::new(()),
            max_entries,
            store_timeout,
            default_ttl,
            tick: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    pub fn from_config(
        store: Arc<dyn DocumentStore>,
        breakers: Arc<BreakerRegistry>,
        cfg: &crate::config::CacheSection,
    ) -> Self {
        Self::new(
            store,
            breakers,
            cfg.max_entries,
            Duration::from_secs(cfg.store_timeout_secs),
            Duration::from_secs(cfg.default_ttl_secs),
        )
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// 读取：L1 新鲜命中直接返回；未命中或过期则穿透到存储并回填。
    /// ttl 为零表示不缓存（始终读存储）；存储未命中不回填（无负缓存）
    pub async fn get(
        &self,
        collection: &str,
        id: &str,
        ttl: Duration,
    ) -> Result<Option<Value>, StateError> {
        let key = (collection.to_string(), id.to_string());

        if !ttl.is_zero() {
            let now = Instant::now();
            let cached = {
                let mut entries = self.entries.lock().unwrap();
                match entries.get_mut(&key) {
                    Some(entry) if entry.expires_at > now => {
                        entry.last_used = self.tick.fetch_add(1, Ordering::Relaxed);
                        self.counters.hits.fetch_add(1, Ordering::Relaxed);
                        Some(entry.value.clone())
                    }
                    Some(_) => {
                        // 过期条目按未命中处理并移除
                        entries.remove(&key);
                        self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                        self.counters.misses.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                    None => {
                        self.counters.misses.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                }
            };
            if let Some(value) = cached {
                tracing::debug!(collection, id, "L1 hit");
                return Ok(Some(value));
            }
        }

        match self.store_get(collection, id).await? {
            Some(value) => {
                if !ttl.is_zero() {
                    self.insert_l1(key, value.clone(), ttl);
                }
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 写入：persist 时先写持久层（失败则不触碰 L1 并上抛），成功后回填 L1；
    /// persist 为 false 时仅写 L1（进程内临时状态）
    pub async fn set(
        &self,
        collection: &str,
        id: &str,
        value: Value,
        ttl: Duration,
        persist: bool,
    ) -> Result<(), StateError> {
        if persist {
            let store = self.store.clone();
            let c = collection.to_string();
            let i = id.to_string();
            let v = value.clone();
            self.breakers
                .breaker(STORE_BREAKER)
                .call(self.store_timeout, || async move {
                    store.set(&c, &i, v).await
                })
                .await?;
        }

        if !ttl.is_zero() {
            self.insert_l1((collection.to_string(), id.to_string()), value, ttl);
        }
        Ok(())
    }

    /// 丢弃 L1 条目；持久层不受影响
    pub fn invalidate(&self, collection: &str, id: &str) -> bool {
        let key = (collection.to_string(), id.to_string());
        self.entries.lock().unwrap().remove(&key).is_some()
    }

    /// 字段级原子合并：由存储侧保证合并原子性，随后用合并结果刷新 L1
    pub async fn merge_update(
        &self,
        collection: &str,
        id: &str,
        partial: Value,
        ttl: Duration,
    ) -> Result<Value, StateError> {
        let store = self.store.clone();
        let c = collection.to_string();
        let i = id.to_string();
        let merged = self
            .breakers
            .breaker(STORE_BREAKER)
            .call(self.store_timeout, || async move {
                store.atomic_merge(&c, &i, partial).await
            })
            .await?;

        if !ttl.is_zero() {
            self.insert_l1((collection.to_string(), id.to_string()), merged.clone(), ttl);
        }
        Ok(merged)
    }

    /// 有界列表追加：写入时裁剪，只保留最新 cap 条。
    /// 整个读改写在单写者锁内完成，并发追加不会互相覆盖
    pub async fn append_bounded(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        item: Value,
        cap: usize,
        ttl: Duration,
    ) -> Result<Value, StateError> {
        let _writer = self.writer.lock().await;

        let mut doc = match self.store_get(collection, id).await? {
            Some(value) if value.is_object() => value,
            Some(_) => {
                tracing::warn!(collection, id, "Existing document is not an object, resetting");
                Value::Object(serde_json::Map::new())
            }
            None => Value::Object(serde_json::Map::new()),
        };

        let mut list = match doc.get(field) {
            Some(Value::Array(items)) => items.clone(),
            Some(_) => {
                tracing::warn!(collection, id, field, "Existing field is not a list, resetting");
                Vec::new()
            }
            None => Vec::new(),
        };
        list.push(item);
        if list.len() > cap {
            let excess = list.len() - cap;
            list.drain(0..excess);
        }

        if let Value::Object(map) = &mut doc {
            map.insert(field.to_string(), Value::Array(list));
        }

        let store = self.store.clone();
        let c = collection.to_string();
        let i = id.to_string();
        let v = doc.clone();
        self.breakers
            .breaker(STORE_BREAKER)
            .call(self.store_timeout, || async move {
                store.set(&c, &i, v).await
            })
            .await?;

        if !ttl.is_zero() {
            self.insert_l1((collection.to_string(), id.to_string()), doc.clone(), ttl);
        }
        Ok(doc)
    }

    /// 等值过滤查询（直达存储，不经过 L1）
    pub async fn query(
        &self,
        collection: &str,
        filters: Vec<(String, Value)>,
        order: QueryOrder,
        limit: Option<usize>,
    ) -> Result<Vec<Value>, StateError> {
        let store = self.store.clone();
        let c = collection.to_string();
        let rows = self
            .breakers
            .breaker(STORE_BREAKER)
            .call(self.store_timeout, || async move {
                store.query(&c, &filters, order, limit).await
            })
            .await?;
        Ok(rows)
    }

    /// 清扫 L1 中所有已过期条目，返回移除数量
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let removed = {
            let mut entries = self.entries.lock().unwrap();
            let before = entries.len();
            entries.retain(|_, entry| entry.expires_at > now);
            before - entries.len()
        };
        if removed > 0 {
            self.counters
                .expirations
                .fetch_add(removed as u64, Ordering::Relaxed);
            tracing::debug!(removed, "Expired cache entries swept");
        }
        removed
    }

    /// 启动后台清扫任务，直到 cancel 触发
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.cleanup_expired();
                    }
                }
            }
            tracing::debug!("Cache sweeper stopped");
        })
    }

    pub fn l1_len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            l1_len: self.l1_len(),
        }
    }

    async fn store_get(&self, collection: &str, id: &str) -> Result<Option<Value>, StateError> {
        let store = self.store.clone();
        let c = collection.to_string();
        let i = id.to_string();
        let value = self
            .breakers
            .breaker(STORE_BREAKER)
            .call(self.store_timeout, || async move {
                store.get(&c, &i).await
            })
            .await?;
        Ok(value)
    }

    /// 插入 L1；容量满且是新键时先逐出最久未使用的条目
    fn insert_l1(&self, key: (String, String), value: Value, ttl: Duration) {
        let now = Instant::now();
        let victim = {
            let mut entries = self.entries.lock().unwrap();
            let mut victim = None;
            if !entries.contains_key(&key) && entries.len() >= self.max_entries {
                if let Some(lru_key) = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_used)
                    .map(|(k, _)| k.clone())
                {
                    entries.remove(&lru_key);
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    victim = Some(lru_key);
                }
            }
            entries.insert(
                key,
                CacheEntry {
                    value,
                    expires_at: now + ttl,
                    last_used: self.tick.fetch_add(1, Ordering::Relaxed),
                },
            );
            victim
        };
        if let Some((collection, id)) = victim {
            tracing::debug!(%collection, %id, "L1 entry evicted");
        }
    }
}
