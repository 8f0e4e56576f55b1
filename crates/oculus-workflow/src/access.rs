//! 患者访问视图
//!
//! 公开视图只凭访问码即可查询，仅包含姓名、状态、手术日期和状态历史；
//! 患者门户视图需要患者令牌，并且只能访问令牌绑定的病例。

use crate::engine::WorkflowEngine;
use crate::rbac::Caller;
use crate::readiness::ChecklistProgress;
use chrono::{DateTime, NaiveDate, Utc};
use oculus_core::models::{
    CaseStatus, ChecklistItem, PatientCase, StatusHistoryEntry, Surgery, UserRole,
};
use oculus_core::utils::is_valid_access_code;
use oculus_core::{OculusError, Result};
use serde::Serialize;

/// 公开状态历史条目，不含操作者与备注
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublicHistoryEntry {
    pub from_status: Option<CaseStatus>,
    pub to_status: CaseStatus,
    pub created_at: DateTime<Utc>,
}

impl From<&StatusHistoryEntry> for PublicHistoryEntry {
    fn from(entry: &StatusHistoryEntry) -> Self {
        Self {
            from_status: entry.from_status,
            to_status: entry.to_status,
            created_at: entry.created_at,
        }
    }
}

/// 按访问码公开的病例投影
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublicCaseView {
    pub access_code: String,
    pub first_name: String,
    pub last_name: String,
    pub status: CaseStatus,
    pub surgery_date: Option<NaiveDate>,
    pub status_history: Vec<PublicHistoryEntry>,
}

/// 患者门户视图
#[derive(Debug, Clone, Serialize)]
pub struct PortalView {
    #[serde(rename = "case")]
    pub case: PatientCase,
    pub checklist: Vec<ChecklistItem>,
    pub progress: ChecklistProgress,
    pub history: Vec<StatusHistoryEntry>,
    pub surgery: Option<Surgery>,
}

impl WorkflowEngine {
    /// 按访问码查找病例；格式错误与不存在同样返回NotFound
    pub async fn resolve_access_code(&self, code: &str) -> Result<PatientCase> {
        let code = code.trim().to_ascii_lowercase();
        if !is_valid_access_code(&code) {
            return Err(OculusError::NotFound("访问码无效".to_string()));
        }
        self.store()
            .get_case_by_access_code(&code)
            .await?
            .ok_or_else(|| OculusError::NotFound("访问码无效".to_string()))
    }

    pub async fn public_view(&self, code: &str) -> Result<PublicCaseView> {
        let case = self.resolve_access_code(code).await?;
        let history = self.store().list_history(case.id).await?;
        Ok(PublicCaseView {
            access_code: case.access_code,
            first_name: case.first_name,
            last_name: case.last_name,
            status: case.status,
            surgery_date: case.surgery_date,
            status_history: history.iter().map(PublicHistoryEntry::from).collect(),
        })
    }

    /// 患者令牌对应病例的完整视图
    pub async fn portal_view(&self, caller: &Caller) -> Result<PortalView> {
        caller.require_role(&[UserRole::Patient])?;
        let case_id = caller
            .case_id
            .ok_or_else(|| OculusError::Unauthenticated("令牌未绑定病例".to_string()))?;
        let case = self.load_case(case_id).await?;
        caller.ensure_can_view(&case)?;

        let checklist = self.store().list_items(case_id).await?;
        let progress = self.store().checklist_counts(case_id).await?.into();
        let history = self.store().list_history(case_id).await?;
        let surgery = self.store().active_surgery_for_case(case_id).await?;
        Ok(PortalView {
            case,
            checklist,
            progress,
            history,
            surgery,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{fixture, intake};
    use oculus_core::models::OperationType;

    #[tokio::test]
    async fn test_public_view_hides_private_fields() {
        let f = fixture().await;
        let case = f.engine.create_case(&f.doctor, intake(OperationType::Phaco)).await.unwrap();

        let view = f.engine.public_view(&case.access_code.to_uppercase()).await.unwrap();
        assert_eq!(view.status, CaseStatus::Preparation);
        assert_eq!(view.status_history.len(), 2);

        let json = serde_json::to_value(&view).unwrap();
        let mut keys: Vec<&str> = json.as_object().unwrap().keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec!["access_code", "first_name", "last_name", "status", "status_history", "surgery_date"]
        );
        let text = json.to_string();
        assert!(!text.contains("H25.1"));
        assert!(!text.contains("changed_by"));
    }

    #[tokio::test]
    async fn test_unknown_or_malformed_code_is_not_found() {
        let f = fixture().await;
        assert!(matches!(f.engine.public_view("ffffffff").await, Err(OculusError::NotFound(_))));
        assert!(matches!(f.engine.public_view("zz").await, Err(OculusError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_portal_is_bound_to_token_case() {
        let f = fixture().await;
        let case = f.engine.create_case(&f.doctor, intake(OperationType::Phaco)).await.unwrap();
        let patient = Caller::patient(case.id);

        let view = f.engine.portal_view(&patient).await.unwrap();
        assert_eq!(view.case.id, case.id);
        assert_eq!(view.checklist.len() as i64, view.progress.total);
        assert!(view.surgery.is_none());

        assert!(matches!(
            f.engine.portal_view(&f.doctor).await,
            Err(OculusError::Permission(_))
        ));
        assert!(matches!(
            f.engine.get_case_detail(&patient, case.id + 1000).await,
            Err(OculusError::NotFound(_))
        ));
    }
}
