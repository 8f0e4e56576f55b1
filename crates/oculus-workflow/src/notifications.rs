//! 站内通知
//!
//! 通知写库失败只记录警告，不影响触发它的业务操作。
//! 面向患者的推送（Telegram）通过 [`PatientNotifier`] 注入。

use crate::engine::WorkflowEngine;
use crate::rbac::Caller;
use async_trait::async_trait;
use oculus_core::models::{Notification, NotificationType, PatientCase, UserRole};
use oculus_core::query::{Page, Pagination};
use oculus_core::{OculusError, Result};
use oculus_database::NewNotification;
use tracing::{debug, warn};

/// 病例状态变化时向患者推送消息
#[async_trait]
pub trait PatientNotifier: Send + Sync {
    /// 实现不得阻塞调用方
    async fn case_status_changed(&self, case: &PatientCase);
}

/// 不推送任何消息
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl PatientNotifier for NoopNotifier {
    async fn case_status_changed(&self, case: &PatientCase) {
        debug!("No patient channel for case {} ({})", case.id, case.status);
    }
}

/// 与病例相关的通知内容
pub(crate) struct CaseMessage {
    pub kind: NotificationType,
    pub title: String,
    pub body: String,
}

impl CaseMessage {
    pub fn new(kind: NotificationType, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            body: body.into(),
        }
    }
}

pub(crate) fn patient_name(case: &PatientCase) -> String {
    format!("{} {}", case.last_name, case.first_name)
}

impl WorkflowEngine {
    /// 给单个用户发送通知
    pub(crate) async fn notify_user(&self, user_id: i64, case_id: i64, message: &CaseMessage) {
        let notification = NewNotification {
            user_id,
            notification_type: message.kind,
            title: message.title.clone(),
            body: message.body.clone(),
            entity_type: Some("patient".to_string()),
            entity_id: Some(case_id),
        };
        if let Err(e) = self.store().insert_notification(notification).await {
            warn!(
                "Failed to create {} notification for user {}: {}",
                message.kind.as_str(),
                user_id,
                e
            );
        }
    }

    /// 给某角色的所有在职用户发送通知
    pub(crate) async fn notify_role(&self, role: UserRole, case_id: i64, message: &CaseMessage) {
        match self.store().active_user_ids(role).await {
            Ok(ids) => {
                for user_id in ids {
                    self.notify_user(user_id, case_id, message).await;
                }
            }
            Err(e) => warn!("Failed to resolve {} recipients: {}", role, e),
        }
    }

    pub async fn list_notifications(
        &self,
        caller: &Caller,
        page: Pagination,
    ) -> Result<Page<Notification>> {
        self.store().list_notifications(caller.user_id, page).await
    }

    /// 标记为已读；重复标记不报错
    pub async fn mark_notification_read(&self, caller: &Caller, id: i64) -> Result<()> {
        if self.store().mark_notification_read(id, caller.user_id).await? {
            Ok(())
        } else {
            Err(OculusError::NotFound(format!("通知不存在: {}", id)))
        }
    }

    pub async fn mark_all_notifications_read(&self, caller: &Caller) -> Result<u64> {
        self.store().mark_all_notifications_read(caller.user_id).await
    }

    pub async fn unread_notification_count(&self, caller: &Caller) -> Result<i64> {
        self.store().unread_notification_count(caller.user_id).await
    }
}
