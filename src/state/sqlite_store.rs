//! SQLite 文档存储（异步）
//!
//! 使用 sqlx 提供完全异步的数据库操作，避免在 async 上下文中阻塞。
//! atomic_merge 用单条 json_patch upsert，由 SQLite 保证合并原子性。
//! 需要启用 `async-sqlite` feature。

#[cfg(feature = "async-sqlite")]
mod sqlx_impl {
    use std::path::Path;

    use async_trait::async_trait;
    use serde_json::Value;
    use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
    use sqlx::Row;

    use crate::state::{DocumentStore, QueryOrder};

    /// SQLite 实现的文档存储
    pub struct SqliteDocumentStore {
        pool: SqlitePool,
    }

    impl SqliteDocumentStore {
        /// 打开（或创建）数据库并初始化表
        pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
            let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&db_url)
                .await?;

            let store = Self { pool };
            store.init_tables().await?;

            Ok(store)
        }

        /// 从连接池创建
        pub fn from_pool(pool: SqlitePool) -> Self {
            Self { pool }
        }

        /// 初始化数据库表
        async fn init_tables(&self) -> Result<(), sqlx::Error> {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS documents (
                    collection TEXT NOT NULL,
                    id TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (collection, id)
                )",
            )
            .execute(&self.pool)
            .await?;

            sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection)",
            )
            .execute(&self.pool)
            .await?;

            Ok(())
        }

        /// 关闭连接池
        pub async fn close(&self) {
            self.pool.close().await;
        }
    }

    #[async_trait]
    impl DocumentStore for SqliteDocumentStore {
        async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, String> {
            let row = sqlx::query("SELECT payload FROM documents WHERE collection = ? AND id = ?")
                .bind(collection)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| e.to_string())?;

            match row {
                Some(row) => {
                    let payload: String = row.get("payload");
                    serde_json::from_str(&payload)
                        .map(Some)
                        .map_err(|e| e.to_string())
                }
                None => Ok(None),
            }
        }

        async fn set(&self, collection: &str, id: &str, value: Value) -> Result<(), String> {
            let now = chrono::Utc::now().to_rfc3339();

            sqlx::query(
                "INSERT OR REPLACE INTO documents (collection, id, payload, updated_at)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(collection)
            .bind(id)
            .bind(value.to_string())
            .bind(&now)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;

            Ok(())
        }

        async fn atomic_merge(
            &self,
            collection: &str,
            id: &str,
            partial: Value,
        ) -> Result<Value, String> {
            let now = chrono::Utc::now().to_rfc3339();
            let mut tx = self.pool.begin().await.map_err(|e| e.to_string())?;

            // 插入路径也过一遍 json_patch，使 null 字段与合并路径同样被丢弃
            sqlx::query(
                "INSERT INTO documents (collection, id, payload, updated_at)
                 VALUES (?, ?, json_patch('{}', json(?)), ?)
                 ON CONFLICT(collection, id) DO UPDATE SET
                     payload = json_patch(documents.payload, excluded.payload),
                     updated_at = excluded.updated_at",
            )
            .bind(collection)
            .bind(id)
            .bind(partial.to_string())
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(|e| e.to_string())?;

            let row = sqlx::query("SELECT payload FROM documents WHERE collection = ? AND id = ?")
                .bind(collection)
                .bind(id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| e.to_string())?;

            tx.commit().await.map_err(|e| e.to_string())?;

            let payload: String = row.get("payload");
            serde_json::from_str(&payload).map_err(|e| e.to_string())
        }

        async fn query(
            &self,
            collection: &str,
            filters: &[(String, Value)],
            order: QueryOrder,
            limit: Option<usize>,
        ) -> Result<Vec<Value>, String> {
            let mut sql = String::from("SELECT payload FROM documents WHERE collection = ?");
            for _ in filters {
                sql.push_str(" AND json_extract(payload, ?) = ?");
            }
            // id 做第二排序键，同刻写入的结果顺序保持稳定
            sql.push_str(match order {
                QueryOrder::NewestFirst => " ORDER BY updated_at DESC, id DESC",
                QueryOrder::OldestFirst => " ORDER BY updated_at ASC, id ASC",
            });
            if limit.is_some() {
                sql.push_str(" LIMIT ?");
            }

            let mut query = sqlx::query(&sql).bind(collection);
            for (field, value) in filters {
                query = query.bind(format!("$.{}", field));
                query = match value {
                    Value::String(s) => query.bind(s.clone()),
                    Value::Bool(b) => query.bind(*b),
                    Value::Number(n) if n.is_i64() => query.bind(n.as_i64().unwrap_or(0)),
                    Value::Number(n) => query.bind(n.as_f64().unwrap_or(0.0)),
                    other => query.bind(other.to_string()),
                };
            }
            if let Some(l) = limit {
                query = query.bind(l as i64);
            }

            let rows = query
                .fetch_all(&self.pool)
                .await
                .map_err(|e| e.to_string())?;

            rows.into_iter()
                .map(|row| {
                    let payload: String = row.get("payload");
                    serde_json::from_str(&payload).map_err(|e| e.to_string())
                })
                .collect()
        }
    }
}

#[cfg(feature = "async-sqlite")]
pub use sqlx_impl::SqliteDocumentStore;

#[cfg(all(test, feature = "async-sqlite"))]
mod tests {
    use super::*;
    use crate::state::{DocumentStore, QueryOrder};
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sqlite_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("docs.db");

        let store = SqliteDocumentStore::new(&db_path).await.unwrap();

        store
            .set("sessions", "s1", json!({"user": "u1", "turns": 3}))
            .await
            .unwrap();

        let doc = store.get("sessions", "s1").await.unwrap();
        assert_eq!(doc, Some(json!({"user": "u1", "turns": 3})));
        assert_eq!(store.get("sessions", "missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sqlite_store_atomic_merge() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("docs.db");

        let store = SqliteDocumentStore::new(&db_path).await.unwrap();

        // 文档不存在时等同创建
        let merged = store
            .atomic_merge("docs", "a", json!({"count": 1}))
            .await
            .unwrap();
        assert_eq!(merged, json!({"count": 1}));

        // 合并保留未触及字段
        let merged = store
            .atomic_merge("docs", "a", json!({"status": "done"}))
            .await
            .unwrap();
        assert_eq!(merged, json!({"count": 1, "status": "done"}));
    }

    #[tokio::test]
    async fn test_sqlite_store_query_by_field() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("docs.db");

        let store = SqliteDocumentStore::new(&db_path).await.unwrap();
        for i in 0..4 {
            let status = if i < 3 { "ERROR" } else { "SUCCESS" };
            store
                .set("traces", &format!("t{i}"), json!({"status": status, "n": i}))
                .await
                .unwrap();
        }

        let errors = store
            .query(
                "traces",
                &[("status".to_string(), json!("ERROR"))],
                QueryOrder::NewestFirst,
                None,
            )
            .await
            .unwrap();
        assert_eq!(errors.len(), 3);
        assert_eq!(errors[0]["n"], json!(2));
        assert_eq!(errors[2]["n"], json!(0));

        let limited = store
            .query(
                "traces",
                &[("status".to_string(), json!("ERROR"))],
                QueryOrder::OldestFirst,
                Some(2),
            )
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0]["n"], json!(0));
    }
}
