//! 基于角色的访问范围
//!
//! 列表接口通过 [`CaseScope`] 把调用者身份转换为附加的查询条件；
//! 写操作另外使用 [`Caller::can_mutate_case`] 等按操作授权。

use oculus_core::models::{CaseStatus, PatientCase, Surgery, UserRole};
use oculus_core::query::{CaseFilter, SurgeryFilter};
use oculus_core::{OculusError, Result};
use serde::{Deserialize, Serialize};

/// 外科医生可见的病例状态（达到审核门槛之后）
pub const SURGEON_VISIBLE_STATUSES: [CaseStatus; 5] = [
    CaseStatus::ReviewNeeded,
    CaseStatus::Approved,
    CaseStatus::SurgeryScheduled,
    CaseStatus::Completed,
    CaseStatus::NeedsCorrection,
];

/// 已认证的调用者
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: i64,
    pub role: UserRole,
    /// 仅患者令牌携带
    pub case_id: Option<i64>,
}

impl Caller {
    pub fn staff(user_id: i64, role: UserRole) -> Self {
        Self {
            user_id,
            role,
            case_id: None,
        }
    }

    pub fn patient(case_id: i64) -> Self {
        Self {
            user_id: 0,
            role: UserRole::Patient,
            case_id: Some(case_id),
        }
    }

    /// 写入历史和审计时使用的操作者id，患者没有用户记录
    pub fn actor_id(&self) -> Option<i64> {
        match self.role {
            UserRole::Patient => None,
            _ => Some(self.user_id),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    pub fn scope(&self) -> CaseScope {
        CaseScope::for_caller(self)
    }

    /// 要求调用者属于给定角色之一
    pub fn require_role(&self, roles: &[UserRole]) -> Result<()> {
        if roles.contains(&self.role) {
            Ok(())
        } else {
            Err(OculusError::Permission(format!("角色 {} 无权执行此操作", self.role)))
        }
    }

    /// 管理员、病例所属地区医生或已指派的外科医生可以修改病例
    pub fn can_mutate_case(&self, case: &PatientCase) -> bool {
        match self.role {
            UserRole::Admin => true,
            UserRole::DistrictDoctor => case.doctor_id == self.user_id,
            UserRole::Surgeon => case.surgeon_id == Some(self.user_id),
            UserRole::CallCenter | UserRole::Patient => false,
        }
    }

    pub fn ensure_can_view(&self, case: &PatientCase) -> Result<()> {
        if self.scope().permits(case) {
            Ok(())
        } else {
            Err(OculusError::Permission(format!("无权访问病例 {}", case.id)))
        }
    }

    pub fn ensure_can_mutate(&self, case: &PatientCase) -> Result<()> {
        if self.can_mutate_case(case) {
            Ok(())
        } else {
            Err(OculusError::Permission(format!("无权修改病例 {}", case.id)))
        }
    }

    /// 手术可见性：外科医生看自己的手术，地区医生看自己病例的手术
    pub fn can_view_surgery(&self, surgery: &Surgery, case: Option<&PatientCase>) -> bool {
        match self.role {
            UserRole::Admin | UserRole::CallCenter => true,
            UserRole::Surgeon => surgery.surgeon_id == self.user_id,
            UserRole::DistrictDoctor => case.is_some_and(|c| c.doctor_id == self.user_id),
            UserRole::Patient => self.case_id == Some(surgery.case_id),
        }
    }

    /// 按角色收窄手术列表
    pub fn apply_surgery_scope(&self, filter: &mut SurgeryFilter) {
        match self.role {
            UserRole::Admin | UserRole::CallCenter => {}
            UserRole::Surgeon => filter.surgeon_id = Some(self.user_id),
            UserRole::DistrictDoctor => filter.doctor_id = Some(self.user_id),
            UserRole::Patient => filter.case_id = Some(self.case_id.unwrap_or(0)),
        }
    }
}

/// 病例查询范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseScope {
    All,
    Doctor(i64),
    Surgeon,
    Case(i64),
}

impl CaseScope {
    pub fn for_caller(caller: &Caller) -> Self {
        match caller.role {
            UserRole::Admin | UserRole::CallCenter => Self::All,
            UserRole::DistrictDoctor => Self::Doctor(caller.user_id),
            UserRole::Surgeon => Self::Surgeon,
            // 没有病例id的患者令牌什么也看不到
            UserRole::Patient => Self::Case(caller.case_id.unwrap_or(0)),
        }
    }

    /// 把范围写入过滤条件，与请求参数同时生效
    pub fn apply(&self, filter: &mut CaseFilter) {
        match self {
            Self::All => {}
            Self::Doctor(id) => filter.doctor_id = Some(*id),
            Self::Surgeon => filter.statuses = Some(SURGEON_VISIBLE_STATUSES.to_vec()),
            Self::Case(id) => filter.case_id = Some(*id),
        }
    }

    /// 单个病例是否落在范围内
    pub fn permits(&self, case: &PatientCase) -> bool {
        match self {
            Self::All => true,
            Self::Doctor(id) => case.doctor_id == *id,
            Self::Surgeon => SURGEON_VISIBLE_STATUSES.contains(&case.status),
            Self::Case(id) => case.id == *id,
        }
    }
}
