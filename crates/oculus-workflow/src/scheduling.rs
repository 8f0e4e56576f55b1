//! 手术预约
//!
//! 预约前依次校验：病例存在、清单就绪、日期格式、病例已批准。
//! 手术记录、病例状态、手术日期和主刀医生在同一事务中写入。

use crate::engine::WorkflowEngine;
use crate::notifications::{patient_name, CaseMessage};
use crate::rbac::Caller;
use crate::readiness::is_ready;
use chrono::NaiveDate;
use oculus_core::models::{CaseStatus, NotificationType, Surgery, SurgeryStatus, UserRole};
use oculus_core::query::{Page, Pagination, SurgeryFilter};
use oculus_core::utils::{normalize_optional, parse_date};
use oculus_core::{OculusError, Result};
use oculus_database::{SurgeryBooking, SurgeryUpdate};
use serde::Deserialize;
use tracing::info;

/// 预约请求
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleRequest {
    pub patient_id: i64,
    /// `YYYY-MM-DD`
    pub scheduled_date: String,
    pub notes: Option<String>,
    /// 管理员代为预约时指定主刀医生
    pub surgeon_id: Option<i64>,
}

/// 手术修改请求
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SurgeryPatch {
    pub scheduled_date: Option<String>,
    pub status: Option<SurgeryStatus>,
    pub notes: Option<String>,
}

/// 手术列表的请求参数
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SurgeryQuery {
    pub status: Option<SurgeryStatus>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl WorkflowEngine {
    /// 预约手术并把病例转为SURGERY_SCHEDULED
    pub async fn schedule(&self, caller: &Caller, request: ScheduleRequest) -> Result<Surgery> {
        caller.require_role(&[UserRole::Surgeon, UserRole::Admin])?;
        let case = self.load_case(request.patient_id).await?;
        caller.ensure_can_view(&case)?;

        let counts = self.store().checklist_counts(case.id).await?;
        if !is_ready(&counts) {
            return Err(OculusError::NotReady(format!(
                "病例 {} 的必填项未全部完成 ({}/{})",
                case.id, counts.required_completed, counts.required
            )));
        }
        let scheduled_date = parse_date(&request.scheduled_date)?;
        if case.status != CaseStatus::Approved {
            return Err(OculusError::invalid_transition(case.status, CaseStatus::SurgeryScheduled));
        }
        self.state_machine().check(case.status, CaseStatus::SurgeryScheduled)?;

        let surgeon_id = match caller.role {
            UserRole::Surgeon => caller.user_id,
            _ => request.surgeon_id.or(case.surgeon_id).ok_or_else(|| {
                OculusError::Validation("需要指定主刀医生 surgeon_id".to_string())
            })?,
        };

        let booking = SurgeryBooking {
            case_id: case.id,
            expected_status: case.status,
            surgeon_id,
            scheduled_date,
            notes: normalize_optional(request.notes),
            actor: caller.actor_id(),
            comment: Some(format!("Операция назначена на {}", scheduled_date)),
        };
        let Some((surgery, updated)) = self.store().book_surgery(&booking).await? else {
            return Err(OculusError::invalid_transition(case.status, CaseStatus::SurgeryScheduled));
        };

        self.metrics().record_transition(CaseStatus::SurgeryScheduled);
        info!(
            "Surgery {} booked for case {} on {} with surgeon {}",
            surgery.id, updated.id, scheduled_date, surgeon_id
        );
        self.notifier().case_status_changed(&updated).await;

        let message = CaseMessage::new(
            NotificationType::SurgeryScheduled,
            "Операция назначена",
            format!("{}: операция {}", patient_name(&updated), scheduled_date),
        );
        self.notify_user(updated.doctor_id, updated.id, &message).await;
        Ok(surgery)
    }

    pub(crate) async fn load_surgery(&self, id: i64) -> Result<Surgery> {
        self.store()
            .get_surgery(id)
            .await?
            .ok_or_else(|| OculusError::NotFound(format!("手术不存在: {}", id)))
    }

    pub async fn get_surgery(&self, caller: &Caller, id: i64) -> Result<Surgery> {
        let surgery = self.load_surgery(id).await?;
        let case = self.store().get_case(surgery.case_id).await?;
        if !caller.can_view_surgery(&surgery, case.as_ref()) {
            return Err(OculusError::Permission(format!("无权访问手术 {}", id)));
        }
        Ok(surgery)
    }

    pub async fn list_surgeries(
        &self,
        caller: &Caller,
        query: SurgeryQuery,
        page: Pagination,
    ) -> Result<Page<Surgery>> {
        let mut filter = SurgeryFilter {
            status: query.status,
            date_from: query.date_from,
            date_to: query.date_to,
            ..Default::default()
        };
        caller.apply_surgery_scope(&mut filter);
        self.store().list_surgeries(&filter, page).await
    }

    /// 修改手术日期、状态或备注
    ///
    /// 改期会同步病例的手术日期并清除已发送提醒的记录；
    /// 手术完成不会自动关闭病例。
    pub async fn update_surgery(&self, caller: &Caller, id: i64, patch: SurgeryPatch) -> Result<Surgery> {
        let surgery = self.load_surgery(id).await?;
        let allowed = caller.is_admin()
            || (caller.role == UserRole::Surgeon && surgery.surgeon_id == caller.user_id);
        if !allowed {
            return Err(OculusError::Permission(format!("无权修改手术 {}", id)));
        }
        if surgery.status == SurgeryStatus::Cancelled {
            return Err(OculusError::Validation(format!("手术 {} 已取消，不可修改", id)));
        }

        let scheduled_date = patch.scheduled_date.as_deref().map(parse_date).transpose()?;
        let update = SurgeryUpdate {
            scheduled_date,
            status: patch.status,
            notes: normalize_optional(patch.notes),
        };
        let updated = self
            .store()
            .update_surgery(id, &update)
            .await?
            .ok_or_else(|| OculusError::NotFound(format!("手术不存在: {}", id)))?;

        if scheduled_date.is_some_and(|date| date != surgery.scheduled_date) {
            self.store()
                .set_case_surgery_date(updated.case_id, Some(updated.scheduled_date))
                .await?;
            self.store().clear_reminders(updated.id).await?;
            info!(
                "Surgery {} rescheduled {} -> {}",
                updated.id, surgery.scheduled_date, updated.scheduled_date
            );
        }
        if updated.status != surgery.status {
            info!("Surgery {} status {} -> {}", updated.id, surgery.status.as_str(), updated.status.as_str());
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checklist::{ChecklistPatch, ItemReview};
    use crate::engine::tests::{fixture, intake, Fixture};
    use oculus_core::models::{ChecklistStatus, OperationType, PatientCase};
    use oculus_database::Store;

    fn request(case_id: i64, date: &str) -> ScheduleRequest {
        ScheduleRequest {
            patient_id: case_id,
            scheduled_date: date.to_string(),
            notes: None,
            surgeon_id: None,
        }
    }

    async fn reviewed_case(f: &Fixture) -> PatientCase {
        let case = f.engine.create_case(&f.doctor, intake(OperationType::Phaco)).await.unwrap();
        for item in f.store.list_items(case.id).await.unwrap().iter().filter(|i| i.is_required) {
            let patch = ChecklistPatch {
                status: Some(ChecklistStatus::Completed),
                ..Default::default()
            };
            f.engine.update_item(&f.doctor, item.id, patch).await.unwrap();
        }
        f.store.get_case(case.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_schedule_blocked_then_succeeds() {
        let f = fixture().await;
        let case = reviewed_case(&f).await;
        assert_eq!(case.status, CaseStatus::ReviewNeeded);

        let item = f.store.list_items(case.id).await.unwrap()[0].clone();
        let reject = ItemReview {
            status: ChecklistStatus::Rejected,
            review_note: Some("Нет печати".into()),
        };
        f.engine.review_item(&f.surgeon, item.id, reject).await.unwrap();

        let err = f.engine.schedule(&f.surgeon, request(case.id, "2025-06-01")).await.unwrap_err();
        assert!(matches!(err, OculusError::NotReady(_)));
        assert!(f.store.active_surgery_for_case(case.id).await.unwrap().is_none());
        assert_eq!(
            f.store.get_case(case.id).await.unwrap().unwrap().status,
            CaseStatus::ReviewNeeded
        );

        let accept = ItemReview {
            status: ChecklistStatus::Completed,
            review_note: None,
        };
        f.engine.review_item(&f.surgeon, item.id, accept).await.unwrap();

        // 就绪但尚未批准
        let err = f.engine.schedule(&f.surgeon, request(case.id, "2025-06-01")).await.unwrap_err();
        assert!(matches!(err, OculusError::InvalidStateTransition { .. }));

        f.engine
            .change_status(&f.surgeon, case.id, CaseStatus::Approved, None)
            .await
            .unwrap();
        let err = f.engine.schedule(&f.surgeon, request(case.id, "01.06.2025")).await.unwrap_err();
        assert!(matches!(err, OculusError::Validation(_)));

        let surgery = f.engine.schedule(&f.surgeon, request(case.id, "2025-06-01")).await.unwrap();
        assert_eq!(surgery.status, SurgeryStatus::Scheduled);
        assert_eq!(surgery.operation_type, case.operation_type);
        assert_eq!(surgery.eye, case.eye);

        let scheduled = f.store.get_case(case.id).await.unwrap().unwrap();
        assert_eq!(scheduled.status, CaseStatus::SurgeryScheduled);
        assert_eq!(scheduled.surgery_date, NaiveDate::from_ymd_opt(2025, 6, 1));
        assert_eq!(scheduled.surgeon_id, Some(f.surgeon.user_id));
    }

    #[tokio::test]
    async fn test_reschedule_syncs_case_and_cancel_cascades() {
        let f = fixture().await;
        let case = reviewed_case(&f).await;
        f.engine
            .change_status(&f.surgeon, case.id, CaseStatus::Approved, None)
            .await
            .unwrap();
        let surgery = f.engine.schedule(&f.surgeon, request(case.id, "2025-06-01")).await.unwrap();
        assert!(f.store.record_reminder(surgery.id, 3).await.unwrap());

        let patch = SurgeryPatch {
            scheduled_date: Some("2025-06-10".into()),
            ..Default::default()
        };
        assert!(matches!(
            f.engine.update_surgery(&f.doctor, surgery.id, patch.clone()).await,
            Err(OculusError::Permission(_))
        ));
        let moved = f.engine.update_surgery(&f.surgeon, surgery.id, patch).await.unwrap();
        assert_eq!(moved.scheduled_date, NaiveDate::from_ymd_opt(2025, 6, 10).unwrap());
        assert_eq!(
            f.store.get_case(case.id).await.unwrap().unwrap().surgery_date,
            NaiveDate::from_ymd_opt(2025, 6, 10)
        );
        // 改期后提醒记录被清除
        assert!(f.store.record_reminder(surgery.id, 3).await.unwrap());

        let doctor_view = f
            .engine
            .list_surgeries(&f.doctor, SurgeryQuery::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(doctor_view.total, 1);
        assert!(f.engine.get_surgery(&f.doctor, surgery.id).await.is_ok());

        f.engine
            .change_status(&f.doctor, case.id, CaseStatus::Cancelled, None)
            .await
            .unwrap();
        let cancelled = f.store.get_surgery(surgery.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, SurgeryStatus::Cancelled);
        assert!(matches!(
            f.engine.update_surgery(&f.surgeon, surgery.id, SurgeryPatch::default()).await,
            Err(OculusError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_completing_surgery_leaves_case_open() {
        let f = fixture().await;
        let case = reviewed_case(&f).await;
        f.engine
            .change_status(&f.surgeon, case.id, CaseStatus::Approved, None)
            .await
            .unwrap();
        let surgery = f.engine.schedule(&f.surgeon, request(case.id, "2025-06-01")).await.unwrap();

        let patch = SurgeryPatch {
            status: Some(SurgeryStatus::Completed),
            ..Default::default()
        };
        f.engine.update_surgery(&f.surgeon, surgery.id, patch).await.unwrap();
        let open = f.store.get_case(case.id).await.unwrap().unwrap();
        assert_eq!(open.status, CaseStatus::SurgeryScheduled);

        let done = f
            .engine
            .change_status(&f.surgeon, case.id, CaseStatus::Completed, None)
            .await
            .unwrap();
        assert_eq!(done.status, CaseStatus::Completed);
    }
}
