//! 处理器共享状态

use crate::auth::AuthService;
use oculus_admin::{AuditLogger, Metrics};
use oculus_integration::RegistryHub;
use oculus_workflow::WorkflowEngine;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct AppState {
    pub engine: WorkflowEngine,
    pub auth: Arc<AuthService>,
    pub audit: AuditLogger,
    pub registries: Arc<RegistryHub>,
    /// 审计中间件缓冲请求体的上限
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn metrics(&self) -> &Metrics {
        self.engine.metrics()
    }
}
