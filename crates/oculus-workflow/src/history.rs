//! 状态历史回放
//!
//! 历史只追加：第一条记录的原状态为空，之后每条的原状态等于上一条的目标状态，
//! 且每一步都是状态机允许的边。回放结果应当等于病例当前状态。

use crate::engine::WorkflowEngine;
use crate::state_machine::CaseStateMachine;
use oculus_core::models::{CaseStatus, StatusHistoryEntry};
use oculus_core::{OculusError, Result};
use tracing::warn;

/// 从初始记录开始回放，返回最终状态；空历史返回 `None`
pub fn replay(
    state_machine: &CaseStateMachine,
    entries: &[StatusHistoryEntry],
) -> Result<Option<CaseStatus>> {
    let mut current: Option<CaseStatus> = None;
    for entry in entries {
        match (current, entry.from_status) {
            (None, None) => {}
            (Some(state), Some(from)) if state == from => {
                state_machine.check(from, entry.to_status)?;
            }
            (_, from) => {
                return Err(OculusError::Internal(format!(
                    "病例 {} 的历史记录 {} 不连续: {:?} -> {}",
                    entry.case_id, entry.id, from, entry.to_status
                )))
            }
        }
        current = Some(entry.to_status);
    }
    Ok(current)
}

impl WorkflowEngine {
    /// 校验病例历史可以回放到当前状态
    pub async fn verify_history(&self, case_id: i64) -> Result<bool> {
        let case = self.load_case(case_id).await?;
        let history = self.store().list_history(case_id).await?;
        let replayed = replay(self.state_machine(), &history)?;
        if replayed != Some(case.status) {
            warn!(
                "History of case {} replays to {:?}, current status {}",
                case_id, replayed, case.status
            );
            return Ok(false);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checklist::ChecklistPatch;
    use crate::engine::tests::{fixture, intake};
    use chrono::Utc;
    use oculus_core::models::{ChecklistStatus, OperationType};
    use oculus_database::Store;

    fn entry(id: i64, from: Option<CaseStatus>, to: CaseStatus) -> StatusHistoryEntry {
        StatusHistoryEntry {
            id,
            case_id: 1,
            from_status: from,
            to_status: to,
            changed_by: None,
            comment: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_replay_valid_chain() {
        let sm = CaseStateMachine::new();
        let chain = vec![
            entry(1, None, CaseStatus::New),
            entry(2, Some(CaseStatus::New), CaseStatus::Preparation),
            entry(3, Some(CaseStatus::Preparation), CaseStatus::Cancelled),
        ];
        assert_eq!(replay(&sm, &chain).unwrap(), Some(CaseStatus::Cancelled));
        assert_eq!(replay(&sm, &[]).unwrap(), None);
    }

    #[test]
    fn test_replay_rejects_gaps_and_illegal_edges() {
        let sm = CaseStateMachine::new();
        let gap = vec![
            entry(1, None, CaseStatus::New),
            entry(2, Some(CaseStatus::Preparation), CaseStatus::ReviewNeeded),
        ];
        assert!(matches!(replay(&sm, &gap), Err(OculusError::Internal(_))));

        let illegal = vec![
            entry(1, None, CaseStatus::New),
            entry(2, Some(CaseStatus::New), CaseStatus::Approved),
        ];
        assert!(matches!(
            replay(&sm, &illegal),
            Err(OculusError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_engine_history_replays_to_current_status() {
        let f = fixture().await;
        let case = f.engine.create_case(&f.doctor, intake(OperationType::Phaco)).await.unwrap();
        for item in f.store.list_items(case.id).await.unwrap().iter().filter(|i| i.is_required) {
            let patch = ChecklistPatch {
                status: Some(ChecklistStatus::Completed),
                ..Default::default()
            };
            f.engine.update_item(&f.doctor, item.id, patch).await.unwrap();
        }
        f.engine
            .change_status(&f.surgeon, case.id, CaseStatus::Approved, None)
            .await
            .unwrap();
        assert!(f.engine.verify_history(case.id).await.unwrap());
        assert_eq!(f.store.list_history(case.id).await.unwrap().len(), 4);
    }
}
