//! # Oculus数据库模块
//!
//! 负责病例、检查清单、状态历史、手术、用户、审计和通知的持久化。
//! 提供统一的 [`Store`] 接口，以及PostgreSQL实现和用于测试的内存实现。

pub mod connection;
pub mod memory;
pub mod models;
pub mod queries;
pub mod store;

// 重新导出主要类型
pub use connection::DatabasePool;
pub use memory::MemoryStore;
pub use models::*;
pub use queries::DatabaseQueries;
pub use store::Store;
