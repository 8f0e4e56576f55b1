//! 病例状态机
//!
//! 管理病例从收治到手术完成的完整生命周期状态转换

use oculus_core::models::{CaseStatus, UserRole};
use oculus_core::{OculusError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 病例状态转换事件
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseEvent {
    /// 提交草稿
    Submit,
    /// 清单生成后自动开始准备
    StartPreparation,
    /// 必填项全部完成，自动提交审核
    ChecklistReady,
    Approve,
    RequestCorrection,
    /// 修正后重新进入准备阶段
    Resubmit,
    /// 仅由手术预约触发
    Schedule,
    Complete,
    Cancel,
    Reject,
}

impl CaseEvent {
    /// 由系统自动触发的事件
    pub fn is_automatic(&self) -> bool {
        matches!(self, Self::StartPreparation | Self::ChecklistReady)
    }

    /// 可以通过手动状态变更接口触发的事件
    pub fn is_manual(&self) -> bool {
        !self.is_automatic() && *self != Self::Schedule
    }

    /// 允许手动触发该事件的角色
    pub fn allowed_roles(&self) -> &'static [UserRole] {
        match self {
            Self::Submit | Self::Resubmit | Self::Cancel => &[UserRole::DistrictDoctor, UserRole::Admin],
            Self::Approve | Self::RequestCorrection | Self::Reject | Self::Complete => {
                &[UserRole::Surgeon, UserRole::Admin]
            }
            Self::Schedule => &[UserRole::Surgeon, UserRole::Admin],
            Self::StartPreparation | Self::ChecklistReady => &[],
        }
    }
}

/// 病例状态机
#[derive(Debug)]
pub struct CaseStateMachine {
    transitions: HashMap<(CaseStatus, CaseEvent), CaseStatus>,
}

impl CaseStateMachine {
    /// 创建新的状态机实例
    pub fn new() -> Self {
        use CaseEvent::*;
        use CaseStatus::*;

        let mut transitions = HashMap::new();

        transitions.insert((Draft, Submit), New);
        transitions.insert((New, StartPreparation), Preparation);
        transitions.insert((Preparation, ChecklistReady), ReviewNeeded);
        transitions.insert((ReviewNeeded, Approve), Approved);
        transitions.insert((ReviewNeeded, RequestCorrection), NeedsCorrection);
        transitions.insert((ReviewNeeded, Reject), Rejected);
        transitions.insert((NeedsCorrection, Resubmit), Preparation);
        transitions.insert((Approved, Schedule), SurgeryScheduled);
        transitions.insert((SurgeryScheduled, Complete), Completed);

        // 任何非终态都可以取消
        for status in CaseStatus::all() {
            if !status.is_terminal() {
                transitions.insert((status, Cancel), Cancelled);
            }
        }

        Self { transitions }
    }

    /// 检查状态转换是否有效
    pub fn can_transition(&self, from: CaseStatus, event: CaseEvent) -> bool {
        self.transitions.contains_key(&(from, event))
    }

    /// 执行状态转换
    pub fn transition(&self, from: CaseStatus, event: CaseEvent) -> Result<CaseStatus> {
        self.transitions
            .get(&(from, event))
            .copied()
            .ok_or_else(|| OculusError::invalid_transition(from, format!("{:?}", event)))
    }

    /// 找出连接两个状态的事件
    pub fn event_between(&self, from: CaseStatus, to: CaseStatus) -> Option<CaseEvent> {
        self.transitions
            .iter()
            .find(|((state, _), target)| *state == from && **target == to)
            .map(|((_, event), _)| *event)
    }

    /// `from → to` 是否为允许的边
    pub fn is_permitted(&self, from: CaseStatus, to: CaseStatus) -> bool {
        self.event_between(from, to).is_some()
    }

    /// 校验 `from → to`，不允许时返回 `InvalidStateTransition`
    pub fn check(&self, from: CaseStatus, to: CaseStatus) -> Result<CaseEvent> {
        self.event_between(from, to)
            .ok_or_else(|| OculusError::invalid_transition(from, to))
    }

    /// 获取状态的所有可能事件
    pub fn get_possible_events(&self, current: CaseStatus) -> Vec<CaseEvent> {
        let mut events: Vec<CaseEvent> = self
            .transitions
            .keys()
            .filter(|(state, _)| *state == current)
            .map(|(_, event)| *event)
            .collect();
        events.sort_by_key(|e| format!("{:?}", e));
        events
    }

    /// 所有允许的 `(from, to)` 边
    pub fn edges(&self) -> Vec<(CaseStatus, CaseStatus)> {
        self.transitions
            .iter()
            .map(|((from, _), to)| (*from, *to))
            .collect()
    }
}

impl Default for CaseStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        let sm = CaseStateMachine::new();

        assert!(sm.can_transition(CaseStatus::New, CaseEvent::StartPreparation));
        assert!(sm.can_transition(CaseStatus::Preparation, CaseEvent::ChecklistReady));
        assert!(sm.can_transition(CaseStatus::ReviewNeeded, CaseEvent::Approve));
        assert!(sm.can_transition(CaseStatus::NeedsCorrection, CaseEvent::Resubmit));
        assert!(sm.is_permitted(CaseStatus::Approved, CaseStatus::SurgeryScheduled));
        assert!(sm.is_permitted(CaseStatus::ReviewNeeded, CaseStatus::Rejected));
    }

    #[test]
    fn test_invalid_transitions() {
        let sm = CaseStateMachine::new();

        assert!(!sm.is_permitted(CaseStatus::Preparation, CaseStatus::Approved));
        assert!(!sm.is_permitted(CaseStatus::New, CaseStatus::SurgeryScheduled));
        assert!(!sm.is_permitted(CaseStatus::Approved, CaseStatus::Rejected));
        assert!(matches!(
            sm.check(CaseStatus::Preparation, CaseStatus::Completed),
            Err(OculusError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_terminal_states_have_no_outgoing_edges() {
        let sm = CaseStateMachine::new();
        for status in [CaseStatus::Completed, CaseStatus::Cancelled, CaseStatus::Rejected] {
            assert!(sm.get_possible_events(status).is_empty(), "{:?}", status);
        }
    }

    #[test]
    fn test_every_non_terminal_state_can_cancel() {
        let sm = CaseStateMachine::new();
        for status in CaseStatus::all().into_iter().filter(|s| !s.is_terminal()) {
            assert_eq!(sm.transition(status, CaseEvent::Cancel).unwrap(), CaseStatus::Cancelled);
        }
    }

    #[test]
    fn test_manual_events() {
        assert!(!CaseEvent::ChecklistReady.is_manual());
        assert!(!CaseEvent::Schedule.is_manual());
        assert!(CaseEvent::Approve.is_manual());
        assert!(CaseEvent::Approve.allowed_roles().contains(&UserRole::Surgeon));
        assert!(!CaseEvent::Approve.allowed_roles().contains(&UserRole::DistrictDoctor));
    }
}
