//! 病例生命周期
//!
//! 收治、查询、编辑、手动状态变更、访问码重置和删除。

use crate::checklist::materialize;
use crate::engine::WorkflowEngine;
use crate::notifications::{patient_name, CaseMessage};
use crate::rbac::Caller;
use crate::readiness::ChecklistProgress;
use crate::state_machine::CaseEvent;
use chrono::{NaiveDate, Utc};
use oculus_core::models::{
    CaseStatus, Eye, NotificationType, OperationType, PatientCase, StatusHistoryEntry, Surgery,
    UserRole,
};
use oculus_core::query::{CaseFilter, Page, Pagination};
use oculus_core::utils::{generate_access_code, normalize_optional, require_text};
use oculus_core::{OculusError, Result};
use oculus_database::{CaseUpdate, NewCase};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// 访问码冲突时的最大重试次数
const ACCESS_CODE_ATTEMPTS: usize = 5;

/// 收治请求
#[derive(Debug, Clone, Deserialize)]
pub struct NewCaseRequest {
    pub first_name: String,
    pub last_name: String,
    pub middle_name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub snils: Option<String>,
    pub oms_policy: Option<String>,
    pub diagnosis: Option<String>,
    pub operation_type: OperationType,
    pub eye: Eye,
    pub district_id: Option<i64>,
    /// 仅管理员可以代为指定
    pub doctor_id: Option<i64>,
    pub notes: Option<String>,
}

/// 病例列表的请求参数
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaseQuery {
    pub status: Option<CaseStatus>,
    pub search: Option<String>,
    pub district_id: Option<i64>,
}

/// 病例详情
#[derive(Debug, Clone, Serialize)]
pub struct CaseDetail {
    #[serde(rename = "case")]
    pub case: PatientCase,
    pub progress: ChecklistProgress,
    pub surgery: Option<Surgery>,
}

impl WorkflowEngine {
    /// 收治新病例：生成清单，写入 `null→NEW`，并自动进入PREPARATION
    pub async fn create_case(&self, caller: &Caller, request: NewCaseRequest) -> Result<PatientCase> {
        caller.require_role(&[UserRole::DistrictDoctor, UserRole::Admin])?;
        let first_name = require_text("first_name", &request.first_name)?;
        let last_name = require_text("last_name", &request.last_name)?;
        let doctor_id = match caller.role {
            UserRole::Admin => request.doctor_id.unwrap_or(caller.user_id),
            _ => caller.user_id,
        };
        let actor = caller.actor_id();

        let mut attempt = 0;
        let case = loop {
            attempt += 1;
            let new_case = NewCase {
                access_code: generate_access_code(),
                first_name: first_name.clone(),
                last_name: last_name.clone(),
                middle_name: normalize_optional(request.middle_name.clone()),
                birth_date: request.birth_date,
                phone: normalize_optional(request.phone.clone()),
                email: normalize_optional(request.email.clone()),
                address: normalize_optional(request.address.clone()),
                snils: normalize_optional(request.snils.clone()),
                oms_policy: normalize_optional(request.oms_policy.clone()),
                diagnosis: normalize_optional(request.diagnosis.clone()),
                operation_type: request.operation_type,
                eye: request.eye,
                doctor_id,
                district_id: request.district_id,
                notes: normalize_optional(request.notes.clone()),
            };
            let items = materialize(request.operation_type, Utc::now());
            match self.store().insert_case(new_case, items, actor).await {
                Ok(case) => break case,
                Err(OculusError::Conflict(msg)) if attempt < ACCESS_CODE_ATTEMPTS => {
                    warn!("Access code collision on intake (attempt {}): {}", attempt, msg);
                }
                Err(e) => return Err(e),
            }
        };
        info!(
            "Case {} created by {} for {} {}",
            case.id,
            caller.user_id,
            case.operation_type.as_str(),
            case.eye.as_str()
        );

        let case = self
            .apply_transition(
                &case,
                CaseStatus::Preparation,
                actor,
                Some("Чек-лист сформирован".to_string()),
                None,
            )
            .await?;
        self.advance_if_ready(case, actor).await
    }

    /// 病例详情：病例本身、清单进度和当前有效手术
    pub async fn get_case_detail(&self, caller: &Caller, id: i64) -> Result<CaseDetail> {
        let case = self.load_case(id).await?;
        caller.ensure_can_view(&case)?;
        let progress = self.store().checklist_counts(id).await?.into();
        let surgery = self.store().active_surgery_for_case(id).await?;
        Ok(CaseDetail {
            case,
            progress,
            surgery,
        })
    }

    /// 按调用者角色范围分页列出病例
    pub async fn list_cases(
        &self,
        caller: &Caller,
        query: CaseQuery,
        page: Pagination,
    ) -> Result<Page<PatientCase>> {
        let mut filter = CaseFilter {
            status: query.status,
            search: normalize_optional(query.search),
            district_id: query.district_id,
            ..Default::default()
        };
        caller.scope().apply(&mut filter);
        self.store().list_cases(&filter, page).await
    }

    /// 编辑人口学信息和备注；手术类型、眼别和主治医生不可修改
    pub async fn update_case(&self, caller: &Caller, id: i64, update: CaseUpdate) -> Result<PatientCase> {
        let case = self.load_case(id).await?;
        caller.ensure_can_mutate(&case)?;
        if let Some(first_name) = &update.first_name {
            require_text("first_name", first_name)?;
        }
        if let Some(last_name) = &update.last_name {
            require_text("last_name", last_name)?;
        }
        self.store()
            .update_case(id, &update)
            .await?
            .ok_or_else(|| OculusError::NotFound(format!("病例不存在: {}", id)))
    }

    /// 手动状态变更
    ///
    /// 自动事件（开始准备、提交审核）和手术预约不能通过此入口触发。
    pub async fn change_status(
        &self,
        caller: &Caller,
        id: i64,
        to: CaseStatus,
        comment: Option<String>,
    ) -> Result<PatientCase> {
        let case = self.load_case(id).await?;
        caller.ensure_can_view(&case)?;
        if case.status == to {
            return Ok(case);
        }

        let event = self.state_machine().check(case.status, to)?;
        if !event.is_manual() {
            return Err(OculusError::invalid_transition(case.status, to));
        }
        caller.require_role(event.allowed_roles())?;
        match event {
            CaseEvent::Submit | CaseEvent::Resubmit | CaseEvent::Cancel => {
                caller.ensure_can_mutate(&case)?;
            }
            CaseEvent::Complete if !caller.is_admin() => {
                if case.surgeon_id != Some(caller.user_id) {
                    return Err(OculusError::Permission("只有主刀医生可以完成病例".to_string()));
                }
            }
            _ => {}
        }

        let surgeon_id = (event == CaseEvent::Approve && caller.role == UserRole::Surgeon)
            .then_some(caller.user_id);
        let updated = self
            .apply_transition(&case, to, caller.actor_id(), normalize_optional(comment), surgeon_id)
            .await?;

        let updated = match event {
            CaseEvent::Cancel => {
                let cancelled = self.store().cancel_active_surgeries(id).await?;
                if cancelled > 0 {
                    info!("Cancelled {} surgeries of case {}", cancelled, id);
                }
                updated
            }
            CaseEvent::Resubmit => self.advance_if_ready(updated, caller.actor_id()).await?,
            _ => updated,
        };

        if caller.user_id != updated.doctor_id {
            let message = CaseMessage::new(
                NotificationType::StatusChanged,
                "Статус пациента изменён",
                format!("{}: {} → {}", patient_name(&updated), case.status, to),
            );
            self.notify_user(updated.doctor_id, updated.id, &message).await;
        }
        Ok(updated)
    }

    /// 重置访问码，原访问码的Telegram绑定随之失效
    pub async fn regenerate_access_code(&self, caller: &Caller, id: i64) -> Result<PatientCase> {
        let case = self.load_case(id).await?;
        caller.ensure_can_mutate(&case)?;

        let mut attempt = 0;
        let updated = loop {
            attempt += 1;
            match self.store().set_access_code(id, &generate_access_code()).await {
                Ok(Some(updated)) => break updated,
                Ok(None) => return Err(OculusError::NotFound(format!("病例不存在: {}", id))),
                Err(OculusError::Conflict(_)) if attempt < ACCESS_CODE_ATTEMPTS => {}
                Err(e) => return Err(e),
            }
        };

        for binding in self.store().active_bindings_for_case(id).await? {
            self.store().deactivate_telegram_binding(binding.chat_id).await?;
        }
        info!("Access code of case {} regenerated by {}", id, caller.user_id);
        Ok(updated)
    }

    /// 删除病例；状态历史保留，文件由孤儿清理任务回收
    pub async fn delete_case(&self, caller: &Caller, id: i64) -> Result<()> {
        caller.require_role(&[UserRole::Admin])?;
        if !self.store().delete_case(id).await? {
            return Err(OculusError::NotFound(format!("病例不存在: {}", id)));
        }
        info!("Case {} deleted by {}", id, caller.user_id);
        Ok(())
    }

    pub async fn case_history(&self, caller: &Caller, id: i64) -> Result<Vec<StatusHistoryEntry>> {
        let case = self.load_case(id).await?;
        caller.ensure_can_view(&case)?;
        self.store().list_history(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checklist::{ChecklistPatch, ItemReview};
    use crate::engine::tests::{fixture, intake, Fixture};
    use oculus_core::models::ChecklistStatus;
    use oculus_core::utils::is_valid_access_code;
    use oculus_database::Store;

    async fn complete_required(f: &Fixture, case_id: i64) {
        let items = f.store.list_items(case_id).await.unwrap();
        for item in items.iter().filter(|i| i.is_required) {
            let patch = ChecklistPatch {
                status: Some(ChecklistStatus::Completed),
                ..Default::default()
            };
            f.engine.update_item(&f.doctor, item.id, patch).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_intake_prepares_case() {
        let f = fixture().await;
        let case = f.engine.create_case(&f.doctor, intake(OperationType::Phaco)).await.unwrap();

        assert_eq!(case.status, CaseStatus::Preparation);
        assert_eq!(case.doctor_id, f.doctor.user_id);
        assert!(is_valid_access_code(&case.access_code));
        assert!(f.store.list_items(case.id).await.unwrap().len() >= 14);

        let history = f.store.list_history(case.id).await.unwrap();
        let edges: Vec<_> = history.iter().map(|h| (h.from_status, h.to_status)).collect();
        assert_eq!(
            edges,
            vec![
                (None, CaseStatus::New),
                (Some(CaseStatus::New), CaseStatus::Preparation)
            ]
        );
    }

    #[tokio::test]
    async fn test_intake_roles() {
        let f = fixture().await;
        assert!(matches!(
            f.engine.create_case(&f.surgeon, intake(OperationType::Phaco)).await,
            Err(OculusError::Permission(_))
        ));

        let mut request = intake(OperationType::Vitrectomy);
        request.doctor_id = Some(f.doctor.user_id);
        let case = f.engine.create_case(&f.admin, request).await.unwrap();
        assert_eq!(case.doctor_id, f.doctor.user_id);

        let mut request = intake(OperationType::Phaco);
        request.last_name = "  ".to_string();
        assert!(matches!(
            f.engine.create_case(&f.doctor, request).await,
            Err(OculusError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_automatic_events_are_not_manual() {
        let f = fixture().await;
        let case = f.engine.create_case(&f.doctor, intake(OperationType::Phaco)).await.unwrap();
        let err = f
            .engine
            .change_status(&f.admin, case.id, CaseStatus::ReviewNeeded, None)
            .await
            .unwrap_err();
        assert!(matches!(err, OculusError::InvalidStateTransition { .. }));

        let err = f
            .engine
            .change_status(&f.admin, case.id, CaseStatus::Approved, None)
            .await
            .unwrap_err();
        assert!(matches!(err, OculusError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_review_cycle_with_correction() {
        let f = fixture().await;
        let case = f.engine.create_case(&f.doctor, intake(OperationType::Phaco)).await.unwrap();
        complete_required(&f, case.id).await;

        // 地区医生不能批准
        assert!(matches!(
            f.engine.change_status(&f.doctor, case.id, CaseStatus::Approved, None).await,
            Err(OculusError::Permission(_))
        ));

        let corrected = f
            .engine
            .change_status(&f.surgeon, case.id, CaseStatus::NeedsCorrection, Some("Повторить ЭКГ".into()))
            .await
            .unwrap();
        assert_eq!(corrected.status, CaseStatus::NeedsCorrection);
        assert_eq!(f.store.unread_notification_count(f.doctor.user_id).await.unwrap(), 1);

        // 重新提交后必填项仍然完成，立即回到审核
        let resubmitted = f
            .engine
            .change_status(&f.doctor, case.id, CaseStatus::Preparation, None)
            .await
            .unwrap();
        assert_eq!(resubmitted.status, CaseStatus::ReviewNeeded);

        let approved = f
            .engine
            .change_status(&f.surgeon, case.id, CaseStatus::Approved, None)
            .await
            .unwrap();
        assert_eq!(approved.surgeon_id, Some(f.surgeon.user_id));
    }

    #[tokio::test]
    async fn test_rejected_item_blocks_resubmission_readiness() {
        let f = fixture().await;
        let case = f.engine.create_case(&f.doctor, intake(OperationType::Phaco)).await.unwrap();
        complete_required(&f, case.id).await;

        let item = f.store.list_items(case.id).await.unwrap()[0].clone();
        let review = ItemReview {
            status: ChecklistStatus::Rejected,
            review_note: Some("Анализ просрочен".into()),
        };
        f.engine.review_item(&f.surgeon, item.id, review).await.unwrap();
        f.engine
            .change_status(&f.surgeon, case.id, CaseStatus::NeedsCorrection, None)
            .await
            .unwrap();
        let resubmitted = f
            .engine
            .change_status(&f.doctor, case.id, CaseStatus::Preparation, None)
            .await
            .unwrap();
        assert_eq!(resubmitted.status, CaseStatus::Preparation);
    }

    #[tokio::test]
    async fn test_terminal_case_rejects_transitions() {
        let f = fixture().await;
        let case = f.engine.create_case(&f.doctor, intake(OperationType::Phaco)).await.unwrap();
        let cancelled = f
            .engine
            .change_status(&f.doctor, case.id, CaseStatus::Cancelled, Some("Отказ пациента".into()))
            .await
            .unwrap();
        assert_eq!(cancelled.status, CaseStatus::Cancelled);

        let err = f
            .engine
            .change_status(&f.doctor, case.id, CaseStatus::Preparation, None)
            .await
            .unwrap_err();
        assert!(matches!(err, OculusError::InvalidStateTransition { .. }));

        // 同状态为空操作
        let same = f
            .engine
            .change_status(&f.doctor, case.id, CaseStatus::Cancelled, None)
            .await
            .unwrap();
        assert_eq!(same.status, CaseStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_list_scoping_and_search() {
        let f = fixture().await;
        let first = f.engine.create_case(&f.doctor, intake(OperationType::Phaco)).await.unwrap();
        let mut other = intake(OperationType::Vitrectomy);
        other.last_name = "Иванова".into();
        let second = f.engine.create_case(&f.admin, other).await.unwrap();

        let mine = f
            .engine
            .list_cases(&f.doctor, CaseQuery::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(mine.total, 1);
        assert_eq!(mine.items[0].id, first.id);

        let all = f
            .engine
            .list_cases(&f.admin, CaseQuery::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(all.total, 2);

        let query = CaseQuery {
            search: Some("иванова".into()),
            ..Default::default()
        };
        let found = f.engine.list_cases(&f.admin, query, Pagination::default()).await.unwrap();
        assert_eq!(found.items.iter().map(|c| c.id).collect::<Vec<_>>(), vec![second.id]);

        let surgeon_view = f
            .engine
            .list_cases(&f.surgeon, CaseQuery::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(surgeon_view.total, 0);
    }

    #[tokio::test]
    async fn test_regenerate_code_and_delete() {
        let f = fixture().await;
        let case = f.engine.create_case(&f.doctor, intake(OperationType::Phaco)).await.unwrap();
        f.store.upsert_telegram_binding(555, case.id, &case.access_code).await.unwrap();

        let updated = f.engine.regenerate_access_code(&f.doctor, case.id).await.unwrap();
        assert_ne!(updated.access_code, case.access_code);
        assert!(is_valid_access_code(&updated.access_code));
        assert!(f.store.active_bindings_for_case(case.id).await.unwrap().is_empty());

        assert!(matches!(
            f.engine.delete_case(&f.doctor, case.id).await,
            Err(OculusError::Permission(_))
        ));
        f.engine.delete_case(&f.admin, case.id).await.unwrap();
        assert!(f.store.get_case(case.id).await.unwrap().is_none());
        assert!(!f.store.list_history(case.id).await.unwrap().is_empty());
        assert!(matches!(
            f.engine.delete_case(&f.admin, case.id).await,
            Err(OculusError::NotFound(_))
        ));
    }
}
