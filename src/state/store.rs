//! 持久化文档存储抽象
//!
//! 定义统一的文档存储接口（get / set / atomic_merge / query），支持内存和 SQLite 两种实现。
//! 具体远端驱动（如云端文档库）由宿主按此 trait 注入。

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

/// 查询结果的排序方向，按文档最近一次写入的先后
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOrder {
    /// 最近写入的在前
    NewestFirst,
    /// 最早写入的在前
    OldestFirst,
}

/// 文档存储接口：键为 (collection, id)，值为 JSON 文档
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// 读取文档；不存在返回 Ok(None)
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, String>;

    /// 全量写入（覆盖已有文档）
    async fn set(&self, collection: &str, id: &str, value: Value) -> Result<(), String>;

    /// 原子合并 partial 到现有文档并返回合并结果；文档不存在时等同创建
    async fn atomic_merge(
        &self,
        collection: &str,
        id: &str,
        partial: Value,
    ) -> Result<Value, String>;

    /// 按顶层字段等值过滤查询；先按写入时间排序，再取条数上限
    async fn query(
        &self,
        collection: &str,
        filters: &[(String, Value)],
        order: QueryOrder,
        limit: Option<usize>,
    ) -> Result<Vec<Value>, String>;
}

/// JSON 合并补丁：对象按字段递归合并，null 删除字段，其余类型整体覆盖
/// （与 SQLite json_patch 的语义一致，两种存储实现的合并行为保持相同）
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(patch_map) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            if let Value::Object(target_map) = target {
                for (key, patch_value) in patch_map {
                    if patch_value.is_null() {
                        target_map.remove(key);
                    } else {
                        merge_patch(
                            target_map.entry(key.clone()).or_insert(Value::Null),
                            patch_value,
                        );
                    }
                }
            }
        }
        _ => *target = patch.clone(),
    }
}

/// 内存存储的文档条目；seq 记录最近一次写入的先后，查询排序以它为准
struct StoredDoc {
    value: Value,
    seq: u64,
}

/// 内存文档存储（测试与单机模式）
///
/// atomic_merge 在写锁内完成读改写，进程内原子。
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, HashMap<String, StoredDoc>>>,
    seq: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定集合的文档数（测试用）
    pub async fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(|docs| docs.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, String> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|doc| doc.value.clone()))
    }

    async fn set(&self, collection: &str, id: &str, value: Value) -> Result<(), String> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), StoredDoc { value, seq });
        Ok(())
    }

    async fn atomic_merge(
        &self,
        collection: &str,
        id: &str,
        partial: Value,
    ) -> Result<Value, String> {
        let mut collections = self.collections.write().await;
        let doc = collections
            .entry(collection.to_string())
            .or_default()
            .entry(id.to_string())
            .or_insert_with(|| StoredDoc {
                value: Value::Object(serde_json::Map::new()),
                seq: 0,
            });
        merge_patch(&mut doc.value, &partial);
        doc.seq = self.seq.fetch_add(1, Ordering::Relaxed);
        Ok(doc.value.clone())
    }

    async fn query(
        &self,
        collection: &str,
        filters: &[(String, Value)],
        order: QueryOrder,
        limit: Option<usize>,
    ) -> Result<Vec<Value>, String> {
        let collections = self.collections.read().await;
        let docs = match collections.get(collection) {
            Some(docs) => docs,
            None => return Ok(Vec::new()),
        };

        let mut matched: Vec<&StoredDoc> = docs
            .values()
            .filter(|doc| {
                filters
                    .iter()
                    .all(|(field, expected)| doc.value.get(field) == Some(expected))
            })
            .collect();
        // 排序在截断之前，limit 取的是按时间最前面的若干条
        match order {
            QueryOrder::NewestFirst => matched.sort_by(|a, b| b.seq.cmp(&a.seq)),
            QueryOrder::OldestFirst => matched.sort_by_key(|doc| doc.seq),
        }

        Ok(matched
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|doc| doc.value.clone())
            .collect())
    }
}

/// 创建文档存储
///
/// 如果提供了 db_path 且启用了 async-sqlite feature，则使用 SQLite 存储；否则使用内存存储
pub async fn create_document_store(db_path: Option<&Path>) -> Arc<dyn DocumentStore> {
    #[cfg(feature = "async-sqlite")]
    if let Some(path) = db_path {
        match crate::state::SqliteDocumentStore::new(path).await {
            Ok(store) => {
                tracing::info!("Using SQLite document store: {:?}", path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to open SQLite store, falling back to memory: {}", e);
            }
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    if db_path.is_some() {
        tracing::warn!(
            "Persistent document store requested but async-sqlite feature not enabled, using memory store"
        );
    }

    tracing::info!("Using in-memory document store");
    Arc::new(MemoryStore::new())
}
