//! 统一存储接口
//!
//! 工作流引擎只依赖此trait；PostgreSQL实现见 [`crate::queries`]，
//! 内存实现见 [`crate::memory`]。

use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use oculus_core::models::*;
use oculus_core::query::*;
use oculus_core::Result;

#[async_trait]
pub trait Store: Send + Sync {
    // ========== 病例 ==========

    /// 在同一事务内创建病例（状态NEW）、写入初始历史 `null→NEW` 并批量插入清单项
    async fn insert_case(
        &self,
        case: NewCase,
        items: Vec<NewChecklistItem>,
        actor: Option<i64>,
    ) -> Result<PatientCase>;

    async fn get_case(&self, id: i64) -> Result<Option<PatientCase>>;

    async fn get_case_by_access_code(&self, code: &str) -> Result<Option<PatientCase>>;

    /// 按过滤条件分页查询，按创建时间倒序
    async fn list_cases(&self, filter: &CaseFilter, page: Pagination) -> Result<Page<PatientCase>>;

    async fn update_case(&self, id: i64, update: &CaseUpdate) -> Result<Option<PatientCase>>;

    /// 替换访问码；与其他病例重复时返回 `Conflict`
    async fn set_access_code(&self, id: i64, code: &str) -> Result<Option<PatientCase>>;

    /// 仅当病例当前状态等于 `transition.from` 时更新状态并追加历史。
    /// 状态不匹配或病例不存在时返回 `None`。
    async fn transition_case(&self, transition: &CaseTransition) -> Result<Option<PatientCase>>;

    async fn set_case_surgery_date(&self, case_id: i64, date: Option<NaiveDate>) -> Result<()>;

    /// 删除病例及其清单项、手术，停用Telegram绑定；保留状态历史和文件记录
    async fn delete_case(&self, id: i64) -> Result<bool>;

    /// 状态历史，按时间升序（同一时间按id）
    async fn list_history(&self, case_id: i64) -> Result<Vec<StatusHistoryEntry>>;

    // ========== 检查清单 ==========

    async fn list_items(&self, case_id: i64) -> Result<Vec<ChecklistItem>>;

    async fn get_item(&self, id: i64) -> Result<Option<ChecklistItem>>;

    /// 保存清单项的可变字段
    async fn save_item(&self, item: &ChecklistItem) -> Result<ChecklistItem>;

    async fn checklist_counts(&self, case_id: i64) -> Result<ChecklistCounts>;

    /// 将 `expires_at < now` 且状态不是EXPIRED/COMPLETED的清单项标记为EXPIRED，返回被修改的项
    async fn expire_items(&self, now: DateTime<Utc>) -> Result<Vec<ChecklistItem>>;

    // ========== 手术 ==========

    /// 锁定病例行、校验状态与有效手术、创建手术并将病例转为SURGERY_SCHEDULED。
    /// 病例状态不等于 `expected_status` 时返回 `None`；已有未取消的手术时返回 `Conflict`。
    async fn book_surgery(&self, booking: &SurgeryBooking) -> Result<Option<(Surgery, PatientCase)>>;

    async fn get_surgery(&self, id: i64) -> Result<Option<Surgery>>;

    async fn active_surgery_for_case(&self, case_id: i64) -> Result<Option<Surgery>>;

    async fn list_surgeries(&self, filter: &SurgeryFilter, page: Pagination) -> Result<Page<Surgery>>;

    async fn update_surgery(&self, id: i64, update: &SurgeryUpdate) -> Result<Option<Surgery>>;

    /// 取消病例所有SCHEDULED状态的手术，返回受影响行数
    async fn cancel_active_surgeries(&self, case_id: i64) -> Result<u64>;

    /// 日期区间内（含两端）状态为SCHEDULED的手术
    async fn scheduled_surgeries_between(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<Surgery>>;

    /// 记录提醒幂等键，首次记录返回true
    async fn record_reminder(&self, surgery_id: i64, offset_days: i32) -> Result<bool>;

    async fn clear_reminders(&self, surgery_id: i64) -> Result<()>;

    // ========== 用户 ==========

    async fn insert_user(&self, user: NewUser) -> Result<User>;

    async fn get_user(&self, id: i64) -> Result<Option<User>>;

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>>;

    async fn list_users(&self, filter: &UserFilter, page: Pagination) -> Result<Page<User>>;

    async fn update_user(&self, id: i64, update: &UserUpdate) -> Result<Option<User>>;

    async fn set_refresh_token(&self, id: i64, token: Option<String>) -> Result<()>;

    async fn count_users(&self) -> Result<i64>;

    /// 指定角色的在职用户id
    async fn active_user_ids(&self, role: UserRole) -> Result<Vec<i64>>;

    // ========== 审计 ==========

    async fn insert_audit(&self, entry: NewAuditEntry) -> Result<AuditEntry>;

    async fn list_audit(&self, entity: Option<String>, page: Pagination) -> Result<Page<AuditEntry>>;

    // ========== 通知 ==========

    async fn insert_notification(&self, notification: NewNotification) -> Result<Notification>;

    async fn list_notifications(&self, user_id: i64, page: Pagination) -> Result<Page<Notification>>;

    /// 标记已读，通知属于该用户时返回true（已读的通知再次标记同样返回true）
    async fn mark_notification_read(&self, id: i64, user_id: i64) -> Result<bool>;

    async fn mark_all_notifications_read(&self, user_id: i64) -> Result<u64>;

    async fn unread_notification_count(&self, user_id: i64) -> Result<i64>;

    // ========== Telegram ==========

    /// 按chat_id插入或重新绑定
    async fn upsert_telegram_binding(
        &self,
        chat_id: i64,
        case_id: i64,
        access_code: &str,
    ) -> Result<TelegramBinding>;

    async fn get_telegram_binding(&self, chat_id: i64) -> Result<Option<TelegramBinding>>;

    async fn active_bindings_for_case(&self, case_id: i64) -> Result<Vec<TelegramBinding>>;

    async fn deactivate_telegram_binding(&self, chat_id: i64) -> Result<bool>;

    // ========== 文件 ==========

    async fn insert_media(&self, media: NewMedia) -> Result<Media>;

    async fn get_media(&self, id: i64) -> Result<Option<Media>>;

    async fn list_media(&self, case_id: i64) -> Result<Vec<Media>>;

    /// 删除病例已不存在的文件记录，返回被删除的记录
    async fn delete_orphan_media(&self) -> Result<Vec<Media>>;
}
