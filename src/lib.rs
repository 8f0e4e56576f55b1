//! # Oculus
//!
//! 眼科手术术前准备流程管理系统。各功能位于独立的crate中，这里统一重新导出。

pub use oculus_admin as admin;
pub use oculus_core as core;
pub use oculus_database as database;
pub use oculus_storage as storage;
pub use oculus_workflow as workflow;
