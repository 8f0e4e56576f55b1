//! 配置管理
//!
//! 启动时按以下顺序合并配置：内置默认值 → 可选的TOML文件 → 环境变量
//! （前缀 `OCULUS`，节之间用 `__` 分隔，例如 `OCULUS_DATABASE__HOST`）。
//! 配置记录在启动时构造一次，显式传递给各个组件。

use anyhow::{Context, Result};
use chrono::{FixedOffset, NaiveTime};
use config::{Config, Environment, File};
use oculus_core::OculusError;
use oculus_storage::S3Settings;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// 系统完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub storage: StorageConfig,
    pub telegram: TelegramConfig,
    pub sweeper: SweeperConfig,
    pub audit: AuditConfig,
    pub logging: LoggingConfig,
    pub registries: RegistriesConfig,
}

/// HTTP服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// 单个请求的超时时间（秒）
    pub request_timeout_secs: u64,
    /// 上传文件大小上限（字节）
    pub max_upload_bytes: usize,
    /// 允许的CORS来源，为空时允许任意来源
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_secs: 30,
            max_upload_bytes: 20 * 1024 * 1024,
            cors_allowed_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// 完整连接串，设置后忽略下面的分项
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub sslmode: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            user: "oculus".to_string(),
            password: "oculus".to_string(),
            name: "oculus".to_string(),
            sslmode: "disable".to_string(),
            max_connections: 10,
            acquire_timeout_secs: 5,
        }
    }
}

impl DatabaseConfig {
    /// 组装PostgreSQL连接串
    pub fn connection_url(&self) -> String {
        match &self.url {
            Some(url) if !url.is_empty() => url.clone(),
            _ => format!(
                "postgres://{}:{}@{}:{}/{}?sslmode={}",
                self.user, self.password, self.host, self.port, self.name, self.sslmode
            ),
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// 认证配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub access_secret: String,
    pub refresh_secret: String,
    pub access_ttl_minutes: i64,
    pub refresh_ttl_hours: i64,
    /// bcrypt代价因子（4..=31）
    pub bcrypt_cost: u32,
    /// 用户表为空时创建的初始管理员
    pub bootstrap_admin_email: Option<String>,
    pub bootstrap_admin_password: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            access_secret: "dev-access-secret-change-me".to_string(),
            refresh_secret: "dev-refresh-secret-change-me".to_string(),
            access_ttl_minutes: 15,
            refresh_ttl_hours: 168,
            bcrypt_cost: 12,
            bootstrap_admin_email: None,
            bootstrap_admin_password: None,
        }
    }
}

/// 文件存储后端
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Local,
    S3,
    Memory,
}

/// 文件存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub local_path: String,
    pub s3: S3Settings,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            local_path: "./data/media".to_string(),
            s3: S3Settings {
                region: "us-east-1".to_string(),
                ..S3Settings::default()
            },
        }
    }
}

/// Telegram机器人配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub bot_token: Option<String>,
    pub api_base: String,
    /// getUpdates长轮询超时（秒）
    pub poll_timeout_secs: u64,
    /// 两次发送之间的最小间隔（毫秒）
    pub min_send_interval_ms: u64,
    /// 待推送状态变化的队列容量，满时丢弃
    pub send_queue_capacity: usize,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: None,
            api_base: "https://api.telegram.org".to_string(),
            poll_timeout_secs: 25,
            min_send_interval_ms: 100,
            send_queue_capacity: 256,
        }
    }
}

/// 定时任务配置，时间均为本地时间（UTC偏移 `utc_offset_hours`）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub enabled: bool,
    pub tick_secs: u64,
    pub utc_offset_hours: i32,
    pub expire_items_at: String,
    pub cleanup_orphans_at: String,
    pub surgery_reminders_at: String,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_secs: 60,
            utc_offset_hours: 9,
            expire_items_at: "02:00".to_string(),
            cleanup_orphans_at: "03:00".to_string(),
            surgery_reminders_at: "09:00".to_string(),
        }
    }
}

fn parse_job_time(field: &str, value: &str) -> oculus_core::Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| OculusError::Config(format!("{} 应为HH:MM格式: {}", field, value)))
}

impl SweeperConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn offset(&self) -> oculus_core::Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_hours * 3600)
            .ok_or_else(|| OculusError::Config(format!("UTC偏移无效: {}", self.utc_offset_hours)))
    }

    pub fn expire_items_time(&self) -> oculus_core::Result<NaiveTime> {
        parse_job_time("sweeper.expire_items_at", &self.expire_items_at)
    }

    pub fn cleanup_orphans_time(&self) -> oculus_core::Result<NaiveTime> {
        parse_job_time("sweeper.cleanup_orphans_at", &self.cleanup_orphans_at)
    }

    pub fn surgery_reminders_time(&self) -> oculus_core::Result<NaiveTime> {
        parse_job_time("sweeper.surgery_reminders_at", &self.surgery_reminders_at)
    }
}

/// 审计日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub channel_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { channel_capacity: 1024 }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// tracing过滤表达式，`RUST_LOG` 优先
    pub level: String,
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: true,
        }
    }
}

/// 外部医疗登记系统配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistriesConfig {
    pub enabled: Vec<String>,
}

impl Default for RegistriesConfig {
    fn default() -> Self {
        Self {
            enabled: vec!["emias".to_string(), "riams".to_string()],
        }
    }
}

impl AppConfig {
    /// 加载配置：默认值 → 配置文件 → 环境变量
    pub fn load(path: Option<&str>) -> Result<Self> {
        let defaults = Config::try_from(&AppConfig::default()).context("无法序列化默认配置")?;
        let mut builder = Config::builder().add_source(defaults);

        if let Some(path) = path {
            info!("Loading configuration from {}", path);
            builder = builder.add_source(File::with_name(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("OCULUS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("registries.enabled")
                .with_list_parse_key("server.cors_allowed_origins"),
        );

        let config: AppConfig = builder
            .build()
            .context("配置加载失败")?
            .try_deserialize()
            .context("配置格式错误")?;

        config.validate()?;
        Ok(config)
    }

    /// 校验配置
    pub fn validate(&self) -> oculus_core::Result<()> {
        let auth = &self.auth;
        if auth.access_secret.trim().is_empty() || auth.refresh_secret.trim().is_empty() {
            return Err(OculusError::Config("JWT密钥不能为空".to_string()));
        }
        if auth.access_secret == auth.refresh_secret {
            return Err(OculusError::Config("访问令牌与刷新令牌必须使用不同的密钥".to_string()));
        }
        if auth.access_ttl_minutes <= 0 || auth.refresh_ttl_hours <= 0 {
            return Err(OculusError::Config("令牌有效期必须为正数".to_string()));
        }
        if !(4..=31).contains(&auth.bcrypt_cost) {
            return Err(OculusError::Config("bcrypt代价因子必须在4到31之间".to_string()));
        }
        if self.server.port == 0 {
            return Err(OculusError::Config("端口不能为0".to_string()));
        }
        if self.audit.channel_capacity == 0 {
            return Err(OculusError::Config("审计通道容量不能为0".to_string()));
        }
        if self.sweeper.tick_secs == 0 {
            return Err(OculusError::Config("定时任务间隔不能为0".to_string()));
        }
        self.sweeper.offset()?;
        self.sweeper.expire_items_time()?;
        self.sweeper.cleanup_orphans_time()?;
        self.sweeper.surgery_reminders_time()?;

        if self.telegram.enabled && self.telegram.bot_token.as_deref().map_or(true, str::is_empty) {
            return Err(OculusError::Config("启用Telegram时必须配置bot_token".to_string()));
        }
        if self.telegram.send_queue_capacity == 0 {
            return Err(OculusError::Config("Telegram发送队列容量不能为0".to_string()));
        }
        if self.storage.backend == StorageBackend::S3 && self.storage.s3.bucket.is_empty() {
            return Err(OculusError::Config("S3存储需要配置bucket".to_string()));
        }
        Ok(())
    }
}
