//! 核心数据模型定义

use crate::error::{OculusError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 手术类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OperationType {
    /// 白内障超声乳化
    #[serde(rename = "PHACO", alias = "PHACOEMULSIFICATION")]
    Phaco,
    /// 抗青光眼手术
    #[serde(rename = "ANTIGLAUCOMA")]
    Antiglaucoma,
    /// 玻璃体切除
    #[serde(rename = "VITRECTOMY")]
    Vitrectomy,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Phaco => "PHACO",
            Self::Antiglaucoma => "ANTIGLAUCOMA",
            Self::Vitrectomy => "VITRECTOMY",
        }
    }

    pub fn all() -> [OperationType; 3] {
        [Self::Phaco, Self::Antiglaucoma, Self::Vitrectomy]
    }
}

impl TryFrom<&str> for OperationType {
    type Error = OculusError;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "PHACO" | "PHACOEMULSIFICATION" => Ok(Self::Phaco),
            "ANTIGLAUCOMA" => Ok(Self::Antiglaucoma),
            "VITRECTOMY" => Ok(Self::Vitrectomy),
            _ => Err(OculusError::Validation(format!("未知手术类型: {}", value))),
        }
    }
}

/// 手术眼别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Eye {
    /// 右眼
    Od,
    /// 左眼
    Os,
    /// 双眼
    Ou,
}

impl Eye {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Od => "OD",
            Self::Os => "OS",
            Self::Ou => "OU",
        }
    }
}

impl TryFrom<&str> for Eye {
    type Error = OculusError;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "OD" => Ok(Self::Od),
            "OS" => Ok(Self::Os),
            "OU" => Ok(Self::Ou),
            _ => Err(OculusError::Validation(format!("未知眼别: {}", value))),
        }
    }
}

/// 病例状态
///
/// 输入时兼容旧的状态名：`IN_PROGRESS`、`PENDING_REVIEW`、`SCHEDULED`。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseStatus {
    Draft,
    New,
    #[serde(alias = "IN_PROGRESS")]
    Preparation,
    #[serde(alias = "PENDING_REVIEW")]
    ReviewNeeded,
    NeedsCorrection,
    Approved,
    #[serde(alias = "SCHEDULED")]
    SurgeryScheduled,
    Completed,
    Rejected,
    Cancelled,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::New => "NEW",
            Self::Preparation => "PREPARATION",
            Self::ReviewNeeded => "REVIEW_NEEDED",
            Self::NeedsCorrection => "NEEDS_CORRECTION",
            Self::Approved => "APPROVED",
            Self::SurgeryScheduled => "SURGERY_SCHEDULED",
            Self::Completed => "COMPLETED",
            Self::Rejected => "REJECTED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// 终态没有出边
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Rejected)
    }

    /// 病例是否已经过外科医生批准（可以绑定外科医生）
    pub fn is_approved_or_later(&self) -> bool {
        matches!(self, Self::Approved | Self::SurgeryScheduled | Self::Completed)
    }

    pub fn all() -> [CaseStatus; 10] {
        [
            Self::Draft,
            Self::New,
            Self::Preparation,
            Self::ReviewNeeded,
            Self::NeedsCorrection,
            Self::Approved,
            Self::SurgeryScheduled,
            Self::Completed,
            Self::Rejected,
            Self::Cancelled,
        ]
    }
}

impl TryFrom<&str> for CaseStatus {
    type Error = OculusError;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "DRAFT" => Ok(Self::Draft),
            "NEW" => Ok(Self::New),
            "PREPARATION" | "IN_PROGRESS" => Ok(Self::Preparation),
            "REVIEW_NEEDED" | "PENDING_REVIEW" => Ok(Self::ReviewNeeded),
            "NEEDS_CORRECTION" => Ok(Self::NeedsCorrection),
            "APPROVED" => Ok(Self::Approved),
            "SURGERY_SCHEDULED" | "SCHEDULED" => Ok(Self::SurgeryScheduled),
            "COMPLETED" => Ok(Self::Completed),
            "REJECTED" => Ok(Self::Rejected),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(OculusError::Validation(format!("未知病例状态: {}", value))),
        }
    }
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 患者病例（术前准备记录）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatientCase {
    pub id: i64,
    pub access_code: String,
    pub first_name: String,
    pub last_name: String,
    pub middle_name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub snils: Option<String>,            // 个人保险账号
    pub oms_policy: Option<String>,       // 强制医疗保险单号
    pub diagnosis: Option<String>,
    pub operation_type: OperationType,
    pub eye: Eye,
    pub status: CaseStatus,
    pub doctor_id: i64,
    pub surgeon_id: Option<i64>,
    pub district_id: Option<i64>,
    pub surgery_date: Option<NaiveDate>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 检查清单类别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChecklistCategory {
    Laboratory,
    Imaging,
    Consultation,
    Other,
}

impl ChecklistCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Laboratory => "LABORATORY",
            Self::Imaging => "IMAGING",
            Self::Consultation => "CONSULTATION",
            Self::Other => "OTHER",
        }
    }
}

impl TryFrom<&str> for ChecklistCategory {
    type Error = OculusError;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "LABORATORY" => Ok(Self::Laboratory),
            "IMAGING" => Ok(Self::Imaging),
            "CONSULTATION" => Ok(Self::Consultation),
            "OTHER" => Ok(Self::Other),
            _ => Err(OculusError::Validation(format!("未知清单类别: {}", value))),
        }
    }
}

/// 检查清单项状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChecklistStatus {
    Pending,
    InProgress,
    Completed,
    Rejected,
    Expired,
}

impl ChecklistStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
        }
    }
}

impl TryFrom<&str> for ChecklistStatus {
    type Error = OculusError;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "REJECTED" => Ok(Self::Rejected),
            "EXPIRED" => Ok(Self::Expired),
            _ => Err(OculusError::Validation(format!("未知清单项状态: {}", value))),
        }
    }
}

impl fmt::Display for ChecklistStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 检查清单项
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChecklistItem {
    pub id: i64,
    pub case_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub category: ChecklistCategory,
    pub is_required: bool,
    pub sort_order: i32,
    pub status: ChecklistStatus,
    pub result: Option<String>,
    pub notes: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_by: Option<i64>,
    pub reviewed_by: Option<i64>,
    pub review_note: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub media_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 状态变更历史（只追加）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusHistoryEntry {
    pub id: i64,
    pub case_id: i64,
    pub from_status: Option<CaseStatus>,
    pub to_status: CaseStatus,
    pub changed_by: Option<i64>,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 手术状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SurgeryStatus {
    Scheduled,
    Completed,
    Cancelled,
}

impl SurgeryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl TryFrom<&str> for SurgeryStatus {
    type Error = OculusError;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "SCHEDULED" => Ok(Self::Scheduled),
            "COMPLETED" => Ok(Self::Completed),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(OculusError::Validation(format!("未知手术状态: {}", value))),
        }
    }
}

/// 手术安排
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Surgery {
    pub id: i64,
    pub case_id: i64,
    pub surgeon_id: i64,
    pub scheduled_date: NaiveDate,
    pub operation_type: OperationType,
    pub eye: Eye,
    pub status: SurgeryStatus,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 用户角色
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    /// 管理员
    Admin,
    /// 眼科外科医生
    Surgeon,
    /// 地区医生，负责收治与术前准备
    DistrictDoctor,
    /// 呼叫中心
    CallCenter,
    /// 患者（通过访问码登录）
    Patient,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "ADMIN",
            Self::Surgeon => "SURGEON",
            Self::DistrictDoctor => "DISTRICT_DOCTOR",
            Self::CallCenter => "CALL_CENTER",
            Self::Patient => "PATIENT",
        }
    }
}

impl TryFrom<&str> for UserRole {
    type Error = OculusError;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "ADMIN" => Ok(Self::Admin),
            "SURGEON" => Ok(Self::Surgeon),
            "DISTRICT_DOCTOR" => Ok(Self::DistrictDoctor),
            "CALL_CENTER" => Ok(Self::CallCenter),
            "PATIENT" => Ok(Self::Patient),
            _ => Err(OculusError::Validation(format!("未知用户角色: {}", value))),
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 系统用户
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: i64,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub middle_name: Option<String>,
    pub phone: Option<String>,
    pub role: UserRole,
    pub district_id: Option<i64>,
    pub is_active: bool,
    #[serde(skip_serializing, default)]
    pub refresh_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn full_name(&self) -> String {
        match &self.middle_name {
            Some(middle) => format!("{} {} {}", self.last_name, self.first_name, middle),
            None => format!("{} {}", self.last_name, self.first_name),
        }
    }
}

/// 审计动作
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    /// 根据HTTP方法推导审计动作，非变更方法返回None
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "POST" => Some(Self::Create),
            "PUT" | "PATCH" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl TryFrom<&str> for AuditAction {
    type Error = OculusError;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            _ => Err(OculusError::Validation(format!("未知审计动作: {}", value))),
        }
    }
}

/// 审计记录（只追加）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub id: i64,
    pub user_id: Option<i64>,
    pub action: AuditAction,
    pub entity: String,
    pub entity_id: Option<i64>,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub ip: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 通知类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    StatusChanged,
    ReviewRequested,
    ChecklistReviewed,
    SurgeryScheduled,
    SurgeryReminder,
    ItemExpired,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatusChanged => "STATUS_CHANGED",
            Self::ReviewRequested => "REVIEW_REQUESTED",
            Self::ChecklistReviewed => "CHECKLIST_REVIEWED",
            Self::SurgeryScheduled => "SURGERY_SCHEDULED",
            Self::SurgeryReminder => "SURGERY_REMINDER",
            Self::ItemExpired => "ITEM_EXPIRED",
        }
    }
}

impl TryFrom<&str> for NotificationType {
    type Error = OculusError;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "STATUS_CHANGED" => Ok(Self::StatusChanged),
            "REVIEW_REQUESTED" => Ok(Self::ReviewRequested),
            "CHECKLIST_REVIEWED" => Ok(Self::ChecklistReviewed),
            "SURGERY_SCHEDULED" => Ok(Self::SurgeryScheduled),
            "SURGERY_REMINDER" => Ok(Self::SurgeryReminder),
            "ITEM_EXPIRED" => Ok(Self::ItemExpired),
            _ => Err(OculusError::Validation(format!("未知通知类型: {}", value))),
        }
    }
}

/// 站内通知
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: i64,
    pub user_id: i64,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub title: String,
    pub body: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<i64>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// Telegram聊天与病例的绑定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelegramBinding {
    pub id: i64,
    pub chat_id: i64,
    pub case_id: i64,
    pub access_code: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// 上传的文件（检查结果扫描件等）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Media {
    pub id: i64,
    pub case_id: i64,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub storage_key: String,
    pub uploaded_by: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_status_aliases() {
        assert_eq!(CaseStatus::try_from("IN_PROGRESS").unwrap(), CaseStatus::Preparation);
        assert_eq!(CaseStatus::try_from("PENDING_REVIEW").unwrap(), CaseStatus::ReviewNeeded);
        assert_eq!(CaseStatus::try_from("SCHEDULED").unwrap(), CaseStatus::SurgeryScheduled);
        assert!(CaseStatus::try_from("UNKNOWN").is_err());

        let parsed: CaseStatus = serde_json::from_str("\"PENDING_REVIEW\"").unwrap();
        assert_eq!(parsed, CaseStatus::ReviewNeeded);
        assert_eq!(serde_json::to_string(&parsed).unwrap(), "\"REVIEW_NEEDED\"");
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for status in CaseStatus::all() {
            assert_eq!(CaseStatus::try_from(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn test_operation_type_alias() {
        let op: OperationType = serde_json::from_str("\"PHACOEMULSIFICATION\"").unwrap();
        assert_eq!(op, OperationType::Phaco);
        assert_eq!(serde_json::to_string(&op).unwrap(), "\"PHACO\"");
    }

    #[test]
    fn test_terminal_states() {
        assert!(CaseStatus::Completed.is_terminal());
        assert!(CaseStatus::Rejected.is_terminal());
        assert!(CaseStatus::Cancelled.is_terminal());
        assert!(!CaseStatus::Approved.is_terminal());
    }

    #[test]
    fn test_audit_action_from_method() {
        assert_eq!(AuditAction::from_method("POST"), Some(AuditAction::Create));
        assert_eq!(AuditAction::from_method("PATCH"), Some(AuditAction::Update));
        assert_eq!(AuditAction::from_method("DELETE"), Some(AuditAction::Delete));
        assert_eq!(AuditAction::from_method("GET"), None);
    }

    #[test]
    fn test_notification_type_field_name() {
        let n = Notification {
            id: 1,
            user_id: 2,
            notification_type: NotificationType::SurgeryReminder,
            title: "t".into(),
            body: "b".into(),
            entity_type: None,
            entity_id: None,
            is_read: false,
            created_at: Utc::now(),
        };
        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(value["type"], "SURGERY_REMINDER");
    }
}
