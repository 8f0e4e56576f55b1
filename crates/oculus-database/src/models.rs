//! 数据库模型

use chrono::{DateTime, NaiveDate, Utc};
use oculus_core::models::*;
use oculus_core::{OculusError, Result};
use serde::Deserialize;
use sqlx::FromRow;

// 数据库表模型 - 使用FromRow trait用于SQL查询，枚举列存储为字符串

fn decode<T>(column: &str, value: &str) -> Result<T>
where
    for<'a> T: TryFrom<&'a str, Error = OculusError>,
{
    T::try_from(value).map_err(|_| OculusError::Database(format!("列 {} 的值无效: {}", column, value)))
}

/// 数据库病例表
#[derive(Debug, FromRow)]
pub struct DbCase {
    pub id: i64,
    pub access_code: String,
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
    pub operation_type: String,
    pub eye: String,
    pub status: String,
    pub doctor_id: i64,
    pub surgeon_id: Option<i64>,
    pub district_id: Option<i64>,
    pub surgery_date: Option<NaiveDate>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DbCase> for PatientCase {
    type Error = OculusError;

    fn try_from(row: DbCase) -> Result<Self> {
        Ok(PatientCase {
            id: row.id,
            access_code: row.access_code,
            first_name: row.first_name,
            last_name: row.last_name,
            middle_name: row.middle_name,
            birth_date: row.birth_date,
            phone: row.phone,
            email: row.email,
            address: row.address,
            snils: row.snils,
            oms_policy: row.oms_policy,
            diagnosis: row.diagnosis,
            operation_type: decode("operation_type", &row.operation_type)?,
            eye: decode("eye", &row.eye)?,
            status: decode("status", &row.status)?,
            doctor_id: row.doctor_id,
            surgeon_id: row.surgeon_id,
            district_id: row.district_id,
            surgery_date: row.surgery_date,
            notes: row.notes,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// 数据库检查清单项表
#[derive(Debug, FromRow)]
pub struct DbChecklistItem {
    pub id: i64,
    pub case_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub category: String,
    pub is_required: bool,
    pub sort_order: i32,
    pub status: String,
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

impl TryFrom<DbChecklistItem> for ChecklistItem {
    type Error = OculusError;

    fn try_from(row: DbChecklistItem) -> Result<Self> {
        Ok(ChecklistItem {
            id: row.id,
            case_id: row.case_id,
            name: row.name,
            description: row.description,
            category: decode("category", &row.category)?,
            is_required: row.is_required,
            sort_order: row.sort_order,
            status: decode("status", &row.status)?,
            result: row.result,
            notes: row.notes,
            completed_at: row.completed_at,
            completed_by: row.completed_by,
            reviewed_by: row.reviewed_by,
            review_note: row.review_note,
            expires_at: row.expires_at,
            media_id: row.media_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// 数据库状态历史表
#[derive(Debug, FromRow)]
pub struct DbStatusHistory {
    pub id: i64,
    pub case_id: i64,
    pub from_status: Option<String>,
    pub to_status: String,
    pub changed_by: Option<i64>,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<DbStatusHistory> for StatusHistoryEntry {
    type Error = OculusError;

    fn try_from(row: DbStatusHistory) -> Result<Self> {
        Ok(StatusHistoryEntry {
            id: row.id,
            case_id: row.case_id,
            from_status: row
                .from_status
                .as_deref()
                .map(|s| decode("from_status", s))
                .transpose()?,
            to_status: decode("to_status", &row.to_status)?,
            changed_by: row.changed_by,
            comment: row.comment,
            created_at: row.created_at,
        })
    }
}

/// 数据库手术表
#[derive(Debug, FromRow)]
pub struct DbSurgery {
    pub id: i64,
    pub case_id: i64,
    pub surgeon_id: i64,
    pub scheduled_date: NaiveDate,
    pub operation_type: String,
    pub eye: String,
    pub status: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DbSurgery> for Surgery {
    type Error = OculusError;

    fn try_from(row: DbSurgery) -> Result<Self> {
        Ok(Surgery {
            id: row.id,
            case_id: row.case_id,
            surgeon_id: row.surgeon_id,
            scheduled_date: row.scheduled_date,
            operation_type: decode("operation_type", &row.operation_type)?,
            eye: decode("eye", &row.eye)?,
            status: decode("status", &row.status)?,
            notes: row.notes,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// 数据库用户表
#[derive(Debug, FromRow)]
pub struct DbUser {
    pub id: i64,
    pub email: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub middle_name: Option<String>,
    pub phone: Option<String>,
    pub role: String,
    pub district_id: Option<i64>,
    pub is_active: bool,
    pub refresh_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DbUser> for User {
    type Error = OculusError;

    fn try_from(row: DbUser) -> Result<Self> {
        Ok(User {
            id: row.id,
            email: row.email,
            password_hash: row.password_hash,
            first_name: row.first_name,
            last_name: row.last_name,
            middle_name: row.middle_name,
            phone: row.phone,
            role: decode("role", &row.role)?,
            district_id: row.district_id,
            is_active: row.is_active,
            refresh_token: row.refresh_token,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// 数据库审计表
#[derive(Debug, FromRow)]
pub struct DbAuditEntry {
    pub id: i64,
    pub user_id: Option<i64>,
    pub action: String,
    pub entity: String,
    pub entity_id: Option<i64>,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub ip: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<DbAuditEntry> for AuditEntry {
    type Error = OculusError;

    fn try_from(row: DbAuditEntry) -> Result<Self> {
        Ok(AuditEntry {
            id: row.id,
            user_id: row.user_id,
            action: decode("action", &row.action)?,
            entity: row.entity,
            entity_id: row.entity_id,
            old_value: row.old_value,
            new_value: row.new_value,
            ip: row.ip,
            created_at: row.created_at,
        })
    }
}

/// 数据库通知表
#[derive(Debug, FromRow)]
pub struct DbNotification {
    pub id: i64,
    pub user_id: i64,
    pub notification_type: String,
    pub title: String,
    pub body: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<i64>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<DbNotification> for Notification {
    type Error = OculusError;

    fn try_from(row: DbNotification) -> Result<Self> {
        Ok(Notification {
            id: row.id,
            user_id: row.user_id,
            notification_type: decode("notification_type", &row.notification_type)?,
            title: row.title,
            body: row.body,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            is_read: row.is_read,
            created_at: row.created_at,
        })
    }
}

/// 数据库Telegram绑定表
#[derive(Debug, FromRow)]
pub struct DbTelegramBinding {
    pub id: i64,
    pub chat_id: i64,
    pub case_id: i64,
    pub access_code: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<DbTelegramBinding> for TelegramBinding {
    fn from(row: DbTelegramBinding) -> Self {
        TelegramBinding {
            id: row.id,
            chat_id: row.chat_id,
            case_id: row.case_id,
            access_code: row.access_code,
            is_active: row.is_active,
            created_at: row.created_at,
        }
    }
}

/// 数据库文件表
#[derive(Debug, FromRow)]
pub struct DbMedia {
    pub id: i64,
    pub case_id: i64,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub storage_key: String,
    pub uploaded_by: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl From<DbMedia> for Media {
    fn from(row: DbMedia) -> Self {
        Media {
            id: row.id,
            case_id: row.case_id,
            file_name: row.file_name,
            content_type: row.content_type,
            size_bytes: row.size_bytes,
            storage_key: row.storage_key,
            uploaded_by: row.uploaded_by,
            created_at: row.created_at,
        }
    }
}

// 插入模型 - 用于创建新记录

/// 新病例插入模型，初始状态由存储层写为NEW
#[derive(Debug, Clone)]
pub struct NewCase {
    pub access_code: String,
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
    pub doctor_id: i64,
    pub district_id: Option<i64>,
    pub notes: Option<String>,
}

/// 新检查清单项插入模型
#[derive(Debug, Clone, PartialEq)]
pub struct NewChecklistItem {
    pub name: String,
    pub description: Option<String>,
    pub category: ChecklistCategory,
    pub is_required: bool,
    pub sort_order: i32,
    pub expires_at: Option<DateTime<Utc>>,
}

/// 病例资料更新（手术类型、眼别和负责医生不可修改）
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaseUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub middle_name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub snils: Option<String>,
    pub oms_policy: Option<String>,
    pub diagnosis: Option<String>,
    pub district_id: Option<i64>,
    pub notes: Option<String>,
}

impl CaseUpdate {
    pub fn apply_to(&self, case: &mut PatientCase) {
        if let Some(v) = &self.first_name {
            case.first_name = v.clone();
        }
        if let Some(v) = &self.last_name {
            case.last_name = v.clone();
        }
        if let Some(v) = &self.middle_name {
            case.middle_name = Some(v.clone());
        }
        if let Some(v) = self.birth_date {
            case.birth_date = Some(v);
        }
        if let Some(v) = &self.phone {
            case.phone = Some(v.clone());
        }
        if let Some(v) = &self.email {
            case.email = Some(v.clone());
        }
        if let Some(v) = &self.address {
            case.address = Some(v.clone());
        }
        if let Some(v) = &self.snils {
            case.snils = Some(v.clone());
        }
        if let Some(v) = &self.oms_policy {
            case.oms_policy = Some(v.clone());
        }
        if let Some(v) = &self.diagnosis {
            case.diagnosis = Some(v.clone());
        }
        if let Some(v) = self.district_id {
            case.district_id = Some(v);
        }
        if let Some(v) = &self.notes {
            case.notes = Some(v.clone());
        }
    }
}

/// 病例状态转换（带乐观并发检查：仅当当前状态等于 `from` 时生效）
#[derive(Debug, Clone)]
pub struct CaseTransition {
    pub case_id: i64,
    pub from: CaseStatus,
    pub to: CaseStatus,
    pub actor: Option<i64>,
    pub comment: Option<String>,
    pub surgeon_id: Option<i64>,
}

/// 手术预约：创建手术、转换病例状态并写入历史，在同一事务内完成
#[derive(Debug, Clone)]
pub struct SurgeryBooking {
    pub case_id: i64,
    pub expected_status: CaseStatus,
    pub surgeon_id: i64,
    pub scheduled_date: NaiveDate,
    pub notes: Option<String>,
    pub actor: Option<i64>,
    pub comment: Option<String>,
}

/// 手术更新
#[derive(Debug, Clone, Default)]
pub struct SurgeryUpdate {
    pub scheduled_date: Option<NaiveDate>,
    pub status: Option<SurgeryStatus>,
    pub notes: Option<String>,
}

/// 新用户插入模型
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub middle_name: Option<String>,
    pub phone: Option<String>,
    pub role: UserRole,
    pub district_id: Option<i64>,
}

/// 用户更新
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub middle_name: Option<String>,
    pub phone: Option<String>,
    pub role: Option<UserRole>,
    pub district_id: Option<i64>,
    pub is_active: Option<bool>,
    pub password_hash: Option<String>,
}

/// 新审计记录
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    pub user_id: Option<i64>,
    pub action: AuditAction,
    pub entity: String,
    pub entity_id: Option<i64>,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub ip: Option<String>,
}

/// 新通知
#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub user_id: i64,
    pub notification_type: NotificationType,
    pub title: String,
    pub body: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<i64>,
}

/// 新文件记录
#[derive(Debug, Clone)]
pub struct NewMedia {
    pub case_id: i64,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub storage_key: String,
    pub uploaded_by: Option<i64>,
}
