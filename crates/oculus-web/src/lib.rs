//! # Oculus Web模块
//!
//! 基于axum的HTTP接口，基础路径 `/api/v1`：
//! - JWT认证（访问令牌/刷新令牌）与患者访问码登录
//! - 病例、检查清单、手术、通知、文件、用户管理端点
//! - 审计中间件、统一响应格式、健康检查与Prometheus指标

pub mod audit;
pub mod auth;
pub mod checklist;
pub mod handlers;
pub mod integrations;
pub mod notifications;
pub mod patients;
pub mod server;
pub mod state;
pub mod surgeries;
pub mod users;

// 重新导出主要类型
pub use auth::{AuthService, AuthUser, Claims, TokenPair};
pub use handlers::{ApiError, ApiResponse, ApiResult};
pub use server::{create_app, WebServer};
pub use state::AppState;
