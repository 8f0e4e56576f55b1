//! 错误定义模块

use thiserror::Error;

/// 术前准备系统统一错误类型
#[derive(Error, Debug)]
pub enum OculusError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("外部系统错误: {0}")]
    Integration(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("未认证: {0}")]
    Unauthenticated(String),

    #[error("权限错误: {0}")]
    Permission(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("资源冲突: {0}")]
    Conflict(String),

    #[error("无效状态转换: 从 {from} 到 {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("检查清单未完成: {0}")]
    NotReady(String),

    #[error("系统内部错误: {0}")]
    Internal(String),
}

/// 错误类别，Web层据此选择HTTP状态码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadInput,
    Unauthenticated,
    Forbidden,
    NotFound,
    Conflict,
    InvalidTransition,
    NotReady,
    DependencyFailure,
}

impl OculusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OculusError::Validation(_) | OculusError::Serialization(_) => ErrorKind::BadInput,
            OculusError::Unauthenticated(_) => ErrorKind::Unauthenticated,
            OculusError::Permission(_) => ErrorKind::Forbidden,
            OculusError::NotFound(_) => ErrorKind::NotFound,
            OculusError::Conflict(_) => ErrorKind::Conflict,
            OculusError::InvalidStateTransition { .. } => ErrorKind::InvalidTransition,
            OculusError::NotReady(_) => ErrorKind::NotReady,
            OculusError::Config(_)
            | OculusError::Database(_)
            | OculusError::Storage(_)
            | OculusError::Integration(_)
            | OculusError::Io(_)
            | OculusError::Internal(_) => ErrorKind::DependencyFailure,
        }
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        OculusError::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for OculusError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => OculusError::NotFound("记录不存在".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                OculusError::Conflict(db.message().to_string())
            }
            _ => OculusError::Database(e.to_string()),
        }
    }
}

/// 系统统一结果类型
pub type Result<T> = std::result::Result<T, OculusError>;
