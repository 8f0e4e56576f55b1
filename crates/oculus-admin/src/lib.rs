//! # Oculus管理模块
//!
//! 提供配置加载与校验、日志初始化、审计日志持久化和Prometheus指标等运维功能

pub mod audit;
pub mod config;
pub mod logging;
pub mod metrics;

// 重新导出主要类型
pub use audit::{audit_channel, AuditLogger, AuditPersister};
pub use config::{
    AppConfig, AuditConfig, AuthConfig, DatabaseConfig, LoggingConfig, RegistriesConfig,
    ServerConfig, StorageBackend, StorageConfig, SweeperConfig, TelegramConfig,
};
pub use logging::init_logging;
pub use metrics::Metrics;
