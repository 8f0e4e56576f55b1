//! 检查清单引擎
//!
//! 创建病例时按模板生成清单项；更新和审核清单项后重新评估就绪状态，
//! 满足条件时自动把病例从PREPARATION推进到REVIEW_NEEDED。

use crate::engine::WorkflowEngine;
use crate::notifications::{patient_name, CaseMessage};
use crate::rbac::Caller;
use crate::readiness::{is_ready, ChecklistProgress};
use crate::templates::templates_for;
use chrono::{DateTime, Duration, Utc};
use oculus_core::models::{
    CaseStatus, ChecklistItem, ChecklistStatus, NotificationType, OperationType, PatientCase,
    UserRole,
};
use oculus_core::utils::normalize_optional;
use oculus_core::{OculusError, Result};
use oculus_database::NewChecklistItem;
use serde::Deserialize;
use tracing::{debug, info};

/// 按手术类型模板生成清单项
pub fn materialize(operation_type: OperationType, now: DateTime<Utc>) -> Vec<NewChecklistItem> {
    templates_for(operation_type)
        .into_iter()
        .map(|entry| NewChecklistItem {
            name: entry.name.to_string(),
            description: Some(entry.description.to_string()).filter(|d| !d.is_empty()),
            category: entry.category,
            is_required: entry.is_required,
            sort_order: entry.sort_order,
            expires_at: (entry.expires_in_days > 0)
                .then(|| now + Duration::days(entry.expires_in_days)),
        })
        .collect()
}

/// 清单项更新请求，缺省字段保持不变
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChecklistPatch {
    pub status: Option<ChecklistStatus>,
    pub result: Option<String>,
    pub notes: Option<String>,
    pub media_id: Option<i64>,
}

/// 外科医生审核请求
#[derive(Debug, Clone, Deserialize)]
pub struct ItemReview {
    pub status: ChecklistStatus,
    pub review_note: Option<String>,
}

fn ensure_open(case: &PatientCase) -> Result<()> {
    if case.status.is_terminal() {
        return Err(OculusError::Validation(format!(
            "病例 {} 已处于终态 {}，清单不可修改",
            case.id, case.status
        )));
    }
    Ok(())
}

impl WorkflowEngine {
    pub(crate) async fn load_item(&self, id: i64) -> Result<ChecklistItem> {
        self.store()
            .get_item(id)
            .await?
            .ok_or_else(|| OculusError::NotFound(format!("检查清单项不存在: {}", id)))
    }

    pub async fn list_checklist(&self, caller: &Caller, case_id: i64) -> Result<Vec<ChecklistItem>> {
        let case = self.load_case(case_id).await?;
        caller.ensure_can_view(&case)?;
        self.store().list_items(case_id).await
    }

    pub async fn checklist_progress(&self, caller: &Caller, case_id: i64) -> Result<ChecklistProgress> {
        let case = self.load_case(case_id).await?;
        caller.ensure_can_view(&case)?;
        Ok(self.store().checklist_counts(case_id).await?.into())
    }

    /// 更新清单项的状态、结果、备注或附件
    pub async fn update_item(
        &self,
        caller: &Caller,
        item_id: i64,
        patch: ChecklistPatch,
    ) -> Result<ChecklistItem> {
        let mut item = self.load_item(item_id).await?;
        let case = self.load_case(item.case_id).await?;
        caller.ensure_can_mutate(&case)?;
        ensure_open(&case)?;

        if let Some(status) = patch.status {
            match status {
                ChecklistStatus::Pending | ChecklistStatus::InProgress | ChecklistStatus::Completed => {}
                other => {
                    return Err(OculusError::Validation(format!(
                        "清单项状态不能直接设置为 {}",
                        other
                    )))
                }
            }
            if status == ChecklistStatus::Completed && item.status != ChecklistStatus::Completed {
                item.completed_at = Some(Utc::now());
                item.completed_by = caller.actor_id();
            } else if status != ChecklistStatus::Completed {
                item.completed_at = None;
                item.completed_by = None;
            }
            item.status = status;
        }
        if patch.result.is_some() {
            item.result = normalize_optional(patch.result);
        }
        if patch.notes.is_some() {
            item.notes = normalize_optional(patch.notes);
        }
        if let Some(media_id) = patch.media_id {
            let media = self
                .store()
                .get_media(media_id)
                .await?
                .filter(|m| m.case_id == item.case_id)
                .ok_or_else(|| OculusError::Validation(format!("文件 {} 不属于该病例", media_id)))?;
            item.media_id = Some(media.id);
        }

        let saved = self.store().save_item(&item).await?;
        debug!("Checklist item {} of case {} now {}", saved.id, saved.case_id, saved.status);

        self.advance_if_ready(case, caller.actor_id()).await?;
        Ok(saved)
    }

    /// 外科医生审核清单项：确认完成或驳回
    pub async fn review_item(
        &self,
        caller: &Caller,
        item_id: i64,
        review: ItemReview,
    ) -> Result<ChecklistItem> {
        caller.require_role(&[UserRole::Surgeon, UserRole::Admin])?;
        let mut item = self.load_item(item_id).await?;
        let case = self.load_case(item.case_id).await?;
        caller.ensure_can_view(&case)?;
        ensure_open(&case)?;

        let note = normalize_optional(review.review_note);
        match review.status {
            ChecklistStatus::Completed => {
                item.completed_at = Some(Utc::now());
                if item.completed_by.is_none() {
                    item.completed_by = caller.actor_id();
                }
            }
            ChecklistStatus::Rejected => {
                if note.is_none() {
                    return Err(OculusError::Validation("驳回时必须填写审核意见".to_string()));
                }
                item.completed_at = None;
                item.completed_by = None;
            }
            other => {
                return Err(OculusError::Validation(format!(
                    "审核结果只能是COMPLETED或REJECTED，收到 {}",
                    other
                )))
            }
        }
        item.status = review.status;
        item.reviewed_by = caller.actor_id();
        item.review_note = note;

        let saved = self.store().save_item(&item).await?;
        info!(
            "Checklist item {} of case {} reviewed as {} by {}",
            saved.id, saved.case_id, saved.status, caller.user_id
        );

        if saved.status == ChecklistStatus::Rejected {
            let message = CaseMessage::new(
                NotificationType::ChecklistReviewed,
                "Пункт чек-листа отклонён",
                format!(
                    "{}: «{}» — {}",
                    patient_name(&case),
                    saved.name,
                    saved.review_note.as_deref().unwrap_or_default()
                ),
            );
            self.notify_user(case.doctor_id, case.id, &message).await;
        }

        self.advance_if_ready(case, caller.actor_id()).await?;
        Ok(saved)
    }

    /// 病例处于PREPARATION且就绪时自动提交审核，其余状态不做任何事
    pub(crate) async fn advance_if_ready(
        &self,
        case: PatientCase,
        actor: Option<i64>,
    ) -> Result<PatientCase> {
        if case.status != CaseStatus::Preparation {
            return Ok(case);
        }
        let counts = self.store().checklist_counts(case.id).await?;
        if !is_ready(&counts) {
            return Ok(case);
        }

        let Some(updated) = self
            .try_transition(
                &case,
                CaseStatus::ReviewNeeded,
                actor,
                Some("Все обязательные пункты выполнены".to_string()),
                None,
            )
            .await?
        else {
            // 已被并发请求推进
            return self.load_case(case.id).await;
        };

        let message = CaseMessage::new(
            NotificationType::ReviewRequested,
            "Пациент готов к проверке",
            format!("{}: все обязательные обследования выполнены", patient_name(&updated)),
        );
        self.notify_role(UserRole::Surgeon, updated.id, &message).await;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{fixture, intake};
    use crate::templates::templates_for;
    use oculus_database::Store;

    #[test]
    fn test_materialize_copies_template() {
        let now = Utc::now();
        let items = materialize(OperationType::Antiglaucoma, now);
        let templates = templates_for(OperationType::Antiglaucoma);
        assert_eq!(items.len(), templates.len());
        for (item, entry) in items.iter().zip(&templates) {
            assert_eq!(item.name, entry.name);
            assert_eq!(item.is_required, entry.is_required);
            match item.expires_at {
                Some(at) => assert_eq!(at, now + Duration::days(entry.expires_in_days)),
                None => assert_eq!(entry.expires_in_days, 0),
            }
        }
    }

    #[tokio::test]
    async fn test_completing_required_items_requests_review_once() {
        let f = fixture().await;
        let case = f.engine.create_case(&f.doctor, intake(OperationType::Phaco)).await.unwrap();
        let items = f.engine.list_checklist(&f.doctor, case.id).await.unwrap();
        let required: Vec<_> = items.iter().filter(|i| i.is_required).collect();
        assert_eq!(required.len(), 11);

        for (n, item) in required.iter().enumerate() {
            let patch = ChecklistPatch {
                status: Some(ChecklistStatus::Completed),
                ..Default::default()
            };
            let saved = f.engine.update_item(&f.doctor, item.id, patch).await.unwrap();
            assert_eq!(saved.completed_by, Some(f.doctor.user_id));
            assert!(saved.completed_at.is_some());

            let status = f.store.get_case(case.id).await.unwrap().unwrap().status;
            if n + 1 < required.len() {
                assert_eq!(status, CaseStatus::Preparation);
            } else {
                assert_eq!(status, CaseStatus::ReviewNeeded);
            }
        }

        // 之后的更新不会再次触发
        let optional = items.iter().find(|i| !i.is_required).unwrap();
        let patch = ChecklistPatch {
            status: Some(ChecklistStatus::Completed),
            ..Default::default()
        };
        f.engine.update_item(&f.doctor, optional.id, patch).await.unwrap();

        let history = f.store.list_history(case.id).await.unwrap();
        let review_entries = history
            .iter()
            .filter(|h| {
                h.from_status == Some(CaseStatus::Preparation) && h.to_status == CaseStatus::ReviewNeeded
            })
            .count();
        assert_eq!(review_entries, 1);

        let surgeon_inbox = f.store.unread_notification_count(f.surgeon.user_id).await.unwrap();
        assert_eq!(surgeon_inbox, 1);

        let progress = f.engine.checklist_progress(&f.doctor, case.id).await.unwrap();
        assert_eq!(progress.required_completed, 11);
        assert_eq!(progress.completed, 12);
        assert!(progress.ready);
    }

    #[tokio::test]
    async fn test_patch_rules() {
        let f = fixture().await;
        let case = f.engine.create_case(&f.doctor, intake(OperationType::Phaco)).await.unwrap();
        let item = f.engine.list_checklist(&f.doctor, case.id).await.unwrap()[0].clone();

        let rejected = ChecklistPatch {
            status: Some(ChecklistStatus::Rejected),
            ..Default::default()
        };
        assert!(matches!(
            f.engine.update_item(&f.doctor, item.id, rejected).await,
            Err(OculusError::Validation(_))
        ));

        let done = ChecklistPatch {
            status: Some(ChecklistStatus::Completed),
            result: Some("  Hb 135 г/л ".to_string()),
            ..Default::default()
        };
        let saved = f.engine.update_item(&f.doctor, item.id, done).await.unwrap();
        assert_eq!(saved.result.as_deref(), Some("Hb 135 г/л"));

        let reopen = ChecklistPatch {
            status: Some(ChecklistStatus::InProgress),
            ..Default::default()
        };
        let saved = f.engine.update_item(&f.doctor, item.id, reopen).await.unwrap();
        assert_eq!(saved.completed_at, None);
        assert_eq!(saved.completed_by, None);

        let stranger = Caller::staff(999, UserRole::DistrictDoctor);
        assert!(matches!(
            f.engine.update_item(&stranger, item.id, ChecklistPatch::default()).await,
            Err(OculusError::Permission(_))
        ));
    }

    #[tokio::test]
    async fn test_review_requires_note_for_rejection() {
        let f = fixture().await;
        let case = f.engine.create_case(&f.doctor, intake(OperationType::Phaco)).await.unwrap();
        let item = f.engine.list_checklist(&f.doctor, case.id).await.unwrap()[0].clone();

        let review = ItemReview {
            status: ChecklistStatus::Rejected,
            review_note: Some("   ".to_string()),
        };
        assert!(matches!(
            f.engine.review_item(&f.admin, item.id, review).await,
            Err(OculusError::Validation(_))
        ));

        let review = ItemReview {
            status: ChecklistStatus::InProgress,
            review_note: None,
        };
        assert!(matches!(
            f.engine.review_item(&f.admin, item.id, review).await,
            Err(OculusError::Validation(_))
        ));

        let review = ItemReview {
            status: ChecklistStatus::Completed,
            review_note: None,
        };
        assert!(matches!(
            f.engine.review_item(&f.doctor, item.id, review).await,
            Err(OculusError::Permission(_))
        ));
    }
}
