//! 状态层
//!
//! 文档存储抽象（内存 / SQLite）与两级状态缓存。
//! 所有持久化 I/O 经「store」熔断器保护。

pub mod cache;
pub mod sqlite_store;
pub mod store;

pub use cache::{CacheStats, StateError, StateManager};
pub use store::{create_document_store, merge_patch, DocumentStore, MemoryStore, QueryOrder};

#[cfg(feature = "async-sqlite")]
pub use sqlite_store::SqliteDocumentStore;
