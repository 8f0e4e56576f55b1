//! 内存存储实现，用于测试与演示
//!
//! 所有表位于同一把读写锁之后，因此每个操作天然是原子的，
//! 与PostgreSQL实现的事务语义一致。

use crate::models::*;
use crate::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use oculus_core::models::*;
use oculus_core::query::*;
use oculus_core::{OculusError, Result};
use std::collections::{BTreeMap, HashSet};
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    next_id: i64,
    cases: BTreeMap<i64, PatientCase>,
    items: BTreeMap<i64, ChecklistItem>,
    history: Vec<StatusHistoryEntry>,
    surgeries: BTreeMap<i64, Surgery>,
    reminders: HashSet<(i64, i32)>,
    users: BTreeMap<i64, User>,
    audit: Vec<AuditEntry>,
    notifications: BTreeMap<i64, Notification>,
    bindings: BTreeMap<i64, TelegramBinding>,
    media: BTreeMap<i64, Media>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn push_history(
        &mut self,
        case_id: i64,
        from: Option<CaseStatus>,
        to: CaseStatus,
        actor: Option<i64>,
        comment: Option<String>,
    ) {
        let id = self.next_id();
        self.history.push(StatusHistoryEntry {
            id,
            case_id,
            from_status: from,
            to_status: to,
            changed_by: actor,
            comment,
            created_at: Utc::now(),
        });
    }
}

/// 内存存储
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn paginate<T: Clone>(mut items: Vec<T>, page: Pagination) -> Page<T> {
    let total = items.len() as i64;
    let start = (page.offset() as usize).min(items.len());
    let end = (start + page.limit as usize).min(items.len());
    let slice = items.drain(start..end).collect();
    Page::new(slice, total, page)
}

fn contains_ci(haystack: &Option<String>, needle: &str) -> bool {
    haystack
        .as_deref()
        .map(|h| h.to_lowercase().contains(needle))
        .unwrap_or(false)
}

fn case_matches(case: &PatientCase, filter: &CaseFilter) -> bool {
    if filter.doctor_id.is_some_and(|d| case.doctor_id != d) {
        return false;
    }
    if let Some(statuses) = &filter.statuses {
        if !statuses.contains(&case.status) {
            return false;
        }
    }
    if filter.case_id.is_some_and(|id| case.id != id) {
        return false;
    }
    if filter.status.is_some_and(|s| case.status != s) {
        return false;
    }
    if filter.district_id.is_some_and(|d| case.district_id != Some(d)) {
        return false;
    }
    if let Some(search) = &filter.search {
        let needle = search.to_lowercase();
        let hit = case.last_name.to_lowercase().contains(&needle)
            || case.first_name.to_lowercase().contains(&needle)
            || contains_ci(&case.middle_name, &needle)
            || contains_ci(&case.snils, &needle)
            || case.access_code == needle;
        if !hit {
            return false;
        }
    }
    true
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_case(
        &self,
        case: NewCase,
        items: Vec<NewChecklistItem>,
        actor: Option<i64>,
    ) -> Result<PatientCase> {
        let mut t = self.tables.write().await;
        if t.cases.values().any(|c| c.access_code == case.access_code) {
            return Err(OculusError::Conflict(format!("访问码重复: {}", case.access_code)));
        }

        let now = Utc::now();
        let id = t.next_id();
        let record = PatientCase {
            id,
            access_code: case.access_code,
            first_name: case.first_name,
            last_name: case.last_name,
            middle_name: case.middle_name,
            birth_date: case.birth_date,
            phone: case.phone,
            email: case.email,
            address: case.address,
            snils: case.snils,
            oms_policy: case.oms_policy,
            diagnosis: case.diagnosis,
            operation_type: case.operation_type,
            eye: case.eye,
            status: CaseStatus::New,
            doctor_id: case.doctor_id,
            surgeon_id: None,
            district_id: case.district_id,
            surgery_date: None,
            notes: case.notes,
            created_at: now,
            updated_at: now,
        };
        t.cases.insert(id, record.clone());
        t.push_history(id, None, CaseStatus::New, actor, None);

        for item in items {
            let item_id = t.next_id();
            t.items.insert(
                item_id,
                ChecklistItem {
                    id: item_id,
                    case_id: id,
                    name: item.name,
                    description: item.description,
                    category: item.category,
                    is_required: item.is_required,
                    sort_order: item.sort_order,
                    status: ChecklistStatus::Pending,
                    result: None,
                    notes: None,
                    completed_at: None,
                    completed_by: None,
                    reviewed_by: None,
                    review_note: None,
                    expires_at: item.expires_at,
                    media_id: None,
                    created_at: now,
                    updated_at: now,
                },
            );
        }
        Ok(record)
    }

    async fn get_case(&self, id: i64) -> Result<Option<PatientCase>> {
        Ok(self.tables.read().await.cases.get(&id).cloned())
    }

    async fn get_case_by_access_code(&self, code: &str) -> Result<Option<PatientCase>> {
        let t = self.tables.read().await;
        Ok(t.cases.values().find(|c| c.access_code == code).cloned())
    }

    async fn list_cases(&self, filter: &CaseFilter, page: Pagination) -> Result<Page<PatientCase>> {
        let t = self.tables.read().await;
        let mut matched: Vec<PatientCase> = t
            .cases
            .values()
            .filter(|c| case_matches(c, filter))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(paginate(matched, page))
    }

    async fn update_case(&self, id: i64, update: &CaseUpdate) -> Result<Option<PatientCase>> {
        let mut t = self.tables.write().await;
        Ok(t.cases.get_mut(&id).map(|case| {
            update.apply_to(case);
            case.updated_at = Utc::now();
            case.clone()
        }))
    }

    async fn set_access_code(&self, id: i64, code: &str) -> Result<Option<PatientCase>> {
        let mut t = self.tables.write().await;
        if t.cases.values().any(|c| c.id != id && c.access_code == code) {
            return Err(OculusError::Conflict(format!("访问码重复: {}", code)));
        }
        Ok(t.cases.get_mut(&id).map(|case| {
            case.access_code = code.to_string();
            case.updated_at = Utc::now();
            case.clone()
        }))
    }

    async fn transition_case(&self, transition: &CaseTransition) -> Result<Option<PatientCase>> {
        let mut t = self.tables.write().await;
        let updated = match t.cases.get_mut(&transition.case_id) {
            Some(case) if case.status == transition.from => {
                case.status = transition.to;
                if transition.surgeon_id.is_some() {
                    case.surgeon_id = transition.surgeon_id;
                }
                case.updated_at = Utc::now();
                case.clone()
            }
            _ => return Ok(None),
        };
        t.push_history(
            transition.case_id,
            Some(transition.from),
            transition.to,
            transition.actor,
            transition.comment.clone(),
        );
        Ok(Some(updated))
    }

    async fn set_case_surgery_date(&self, case_id: i64, date: Option<NaiveDate>) -> Result<()> {
        let mut t = self.tables.write().await;
        if let Some(case) = t.cases.get_mut(&case_id) {
            case.surgery_date = date;
            case.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete_case(&self, id: i64) -> Result<bool> {
        let mut t = self.tables.write().await;
        t.items.retain(|_, item| item.case_id != id);
        let surgery_ids: Vec<i64> = t
            .surgeries
            .values()
            .filter(|s| s.case_id == id)
            .map(|s| s.id)
            .collect();
        t.reminders.retain(|(sid, _)| !surgery_ids.contains(sid));
        t.surgeries.retain(|_, s| s.case_id != id);
        for binding in t.bindings.values_mut().filter(|b| b.case_id == id) {
            binding.is_active = false;
        }
        Ok(t.cases.remove(&id).is_some())
    }

    async fn list_history(&self, case_id: i64) -> Result<Vec<StatusHistoryEntry>> {
        let t = self.tables.read().await;
        // 按追加顺序即按时间与id排序
        Ok(t.history.iter().filter(|h| h.case_id == case_id).cloned().collect())
    }

    async fn list_items(&self, case_id: i64) -> Result<Vec<ChecklistItem>> {
        let t = self.tables.read().await;
        let mut items: Vec<ChecklistItem> = t
            .items
            .values()
            .filter(|i| i.case_id == case_id)
            .cloned()
            .collect();
        items.sort_by_key(|i| (i.sort_order, i.id));
        Ok(items)
    }

    async fn get_item(&self, id: i64) -> Result<Option<ChecklistItem>> {
        Ok(self.tables.read().await.items.get(&id).cloned())
    }

    async fn save_item(&self, item: &ChecklistItem) -> Result<ChecklistItem> {
        let mut t = self.tables.write().await;
        let stored = t
            .items
            .get_mut(&item.id)
            .ok_or_else(|| OculusError::NotFound(format!("检查清单项不存在: {}", item.id)))?;
        stored.status = item.status;
        stored.result = item.result.clone();
        stored.notes = item.notes.clone();
        stored.completed_at = item.completed_at;
        stored.completed_by = item.completed_by;
        stored.reviewed_by = item.reviewed_by;
        stored.review_note = item.review_note.clone();
        stored.expires_at = item.expires_at;
        stored.media_id = item.media_id;
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn checklist_counts(&self, case_id: i64) -> Result<ChecklistCounts> {
        let t = self.tables.read().await;
        let mut counts = ChecklistCounts::default();
        for item in t.items.values().filter(|i| i.case_id == case_id) {
            let done = item.status == ChecklistStatus::Completed;
            counts.total += 1;
            counts.completed += done as i64;
            if item.is_required {
                counts.required += 1;
                counts.required_completed += done as i64;
            }
        }
        Ok(counts)
    }

    async fn expire_items(&self, now: DateTime<Utc>) -> Result<Vec<ChecklistItem>> {
        let mut t = self.tables.write().await;
        let mut expired = Vec::new();
        for item in t.items.values_mut() {
            let stale = item.expires_at.is_some_and(|at| at < now);
            let open = !matches!(item.status, ChecklistStatus::Expired | ChecklistStatus::Completed);
            if stale && open {
                item.status = ChecklistStatus::Expired;
                item.updated_at = now;
                expired.push(item.clone());
            }
        }
        Ok(expired)
    }

    async fn book_surgery(&self, booking: &SurgeryBooking) -> Result<Option<(Surgery, PatientCase)>> {
        let mut t = self.tables.write().await;
        let case = match t.cases.get(&booking.case_id) {
            Some(case) if case.status == booking.expected_status => case.clone(),
            _ => return Ok(None),
        };
        if let Some(existing) = t
            .surgeries
            .values()
            .find(|s| s.case_id == booking.case_id && s.status != SurgeryStatus::Cancelled)
        {
            return Err(OculusError::Conflict(format!(
                "病例 {} 已有未取消的手术 {}",
                booking.case_id, existing.id
            )));
        }

        let now = Utc::now();
        let surgery_id = t.next_id();
        let surgery = Surgery {
            id: surgery_id,
            case_id: case.id,
            surgeon_id: booking.surgeon_id,
            scheduled_date: booking.scheduled_date,
            operation_type: case.operation_type,
            eye: case.eye,
            status: SurgeryStatus::Scheduled,
            notes: booking.notes.clone(),
            created_at: now,
            updated_at: now,
        };
        t.surgeries.insert(surgery_id, surgery.clone());

        let updated = match t.cases.get_mut(&booking.case_id) {
            Some(stored) => {
                stored.status = CaseStatus::SurgeryScheduled;
                stored.surgery_date = Some(booking.scheduled_date);
                stored.surgeon_id = Some(booking.surgeon_id);
                stored.updated_at = now;
                stored.clone()
            }
            None => return Ok(None),
        };
        t.push_history(
            booking.case_id,
            Some(booking.expected_status),
            CaseStatus::SurgeryScheduled,
            booking.actor,
            booking.comment.clone(),
        );
        Ok(Some((surgery, updated)))
    }

    async fn get_surgery(&self, id: i64) -> Result<Option<Surgery>> {
        Ok(self.tables.read().await.surgeries.get(&id).cloned())
    }

    async fn active_surgery_for_case(&self, case_id: i64) -> Result<Option<Surgery>> {
        let t = self.tables.read().await;
        Ok(t.surgeries
            .values()
            .rev()
            .find(|s| s.case_id == case_id && s.status != SurgeryStatus::Cancelled)
            .cloned())
    }

    async fn list_surgeries(&self, filter: &SurgeryFilter, page: Pagination) -> Result<Page<Surgery>> {
        let t = self.tables.read().await;
        let mut matched: Vec<Surgery> = t
            .surgeries
            .values()
            .filter(|s| {
                filter.surgeon_id.map_or(true, |id| s.surgeon_id == id)
                    && filter.doctor_id.map_or(true, |doctor| {
                        t.cases.get(&s.case_id).is_some_and(|c| c.doctor_id == doctor)
                    })
                    && filter.case_id.map_or(true, |id| s.case_id == id)
                    && filter.status.map_or(true, |st| s.status == st)
                    && filter.date_from.map_or(true, |d| s.scheduled_date >= d)
                    && filter.date_to.map_or(true, |d| s.scheduled_date <= d)
            })
            .cloned()
            .collect();
        matched.sort_by_key(|s| (s.scheduled_date, s.id));
        Ok(paginate(matched, page))
    }

    async fn update_surgery(&self, id: i64, update: &SurgeryUpdate) -> Result<Option<Surgery>> {
        let mut t = self.tables.write().await;
        Ok(t.surgeries.get_mut(&id).map(|surgery| {
            if let Some(date) = update.scheduled_date {
                surgery.scheduled_date = date;
            }
            if let Some(status) = update.status {
                surgery.status = status;
            }
            if let Some(notes) = &update.notes {
                surgery.notes = Some(notes.clone());
            }
            surgery.updated_at = Utc::now();
            surgery.clone()
        }))
    }

    async fn cancel_active_surgeries(&self, case_id: i64) -> Result<u64> {
        let mut t = self.tables.write().await;
        let mut cancelled = 0;
        for surgery in t
            .surgeries
            .values_mut()
            .filter(|s| s.case_id == case_id && s.status == SurgeryStatus::Scheduled)
        {
            surgery.status = SurgeryStatus::Cancelled;
            surgery.updated_at = Utc::now();
            cancelled += 1;
        }
        Ok(cancelled)
    }

    async fn scheduled_surgeries_between(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<Surgery>> {
        let t = self.tables.read().await;
        let mut found: Vec<Surgery> = t
            .surgeries
            .values()
            .filter(|s| s.status == SurgeryStatus::Scheduled && s.scheduled_date >= from && s.scheduled_date <= to)
            .cloned()
            .collect();
        found.sort_by_key(|s| (s.scheduled_date, s.id));
        Ok(found)
    }

    async fn record_reminder(&self, surgery_id: i64, offset_days: i32) -> Result<bool> {
        Ok(self.tables.write().await.reminders.insert((surgery_id, offset_days)))
    }

    async fn clear_reminders(&self, surgery_id: i64) -> Result<()> {
        self.tables
            .write()
            .await
            .reminders
            .retain(|(sid, _)| *sid != surgery_id);
        Ok(())
    }

    async fn insert_user(&self, user: NewUser) -> Result<User> {
        let mut t = self.tables.write().await;
        if t.users.values().any(|u| u.email.eq_ignore_ascii_case(&user.email)) {
            return Err(OculusError::Conflict(format!("邮箱已存在: {}", user.email)));
        }
        let now = Utc::now();
        let id = t.next_id();
        let record = User {
            id,
            email: user.email,
            password_hash: user.password_hash,
            first_name: user.first_name,
            last_name: user.last_name,
            middle_name: user.middle_name,
            phone: user.phone,
            role: user.role,
            district_id: user.district_id,
            is_active: true,
            refresh_token: None,
            created_at: now,
            updated_at: now,
        };
        t.users.insert(id, record.clone());
        Ok(record)
    }

    async fn get_user(&self, id: i64) -> Result<Option<User>> {
        Ok(self.tables.read().await.users.get(&id).cloned())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let t = self.tables.read().await;
        Ok(t.users.values().find(|u| u.email.eq_ignore_ascii_case(email)).cloned())
    }

    async fn list_users(&self, filter: &UserFilter, page: Pagination) -> Result<Page<User>> {
        let t = self.tables.read().await;
        let matched: Vec<User> = t
            .users
            .values()
            .filter(|u| {
                filter.role.map_or(true, |r| u.role == r)
                    && filter.is_active.map_or(true, |a| u.is_active == a)
            })
            .cloned()
            .collect();
        Ok(paginate(matched, page))
    }

    async fn update_user(&self, id: i64, update: &UserUpdate) -> Result<Option<User>> {
        let mut t = self.tables.write().await;
        Ok(t.users.get_mut(&id).map(|user| {
            if let Some(v) = &update.first_name {
                user.first_name = v.clone();
            }
            if let Some(v) = &update.last_name {
                user.last_name = v.clone();
            }
            if let Some(v) = &update.middle_name {
                user.middle_name = Some(v.clone());
            }
            if let Some(v) = &update.phone {
                user.phone = Some(v.clone());
            }
            if let Some(v) = update.role {
                user.role = v;
            }
            if let Some(v) = update.district_id {
                user.district_id = Some(v);
            }
            if let Some(v) = update.is_active {
                user.is_active = v;
            }
            if let Some(v) = &update.password_hash {
                user.password_hash = v.clone();
            }
            user.updated_at = Utc::now();
            user.clone()
        }))
    }

    async fn set_refresh_token(&self, id: i64, token: Option<String>) -> Result<()> {
        let mut t = self.tables.write().await;
        if let Some(user) = t.users.get_mut(&id) {
            user.refresh_token = token;
        }
        Ok(())
    }

    async fn count_users(&self) -> Result<i64> {
        Ok(self.tables.read().await.users.len() as i64)
    }

    async fn active_user_ids(&self, role: UserRole) -> Result<Vec<i64>> {
        let t = self.tables.read().await;
        Ok(t.users
            .values()
            .filter(|u| u.role == role && u.is_active)
            .map(|u| u.id)
            .collect())
    }

    async fn insert_audit(&self, entry: NewAuditEntry) -> Result<AuditEntry> {
        let mut t = self.tables.write().await;
        let id = t.next_id();
        let record = AuditEntry {
            id,
            user_id: entry.user_id,
            action: entry.action,
            entity: entry.entity,
            entity_id: entry.entity_id,
            old_value: entry.old_value,
            new_value: entry.new_value,
            ip: entry.ip,
            created_at: Utc::now(),
        };
        t.audit.push(record.clone());
        Ok(record)
    }

    async fn list_audit(&self, entity: Option<String>, page: Pagination) -> Result<Page<AuditEntry>> {
        let t = self.tables.read().await;
        let matched: Vec<AuditEntry> = t
            .audit
            .iter()
            .rev()
            .filter(|a| entity.as_deref().map_or(true, |e| a.entity == e))
            .cloned()
            .collect();
        Ok(paginate(matched, page))
    }

    async fn insert_notification(&self, notification: NewNotification) -> Result<Notification> {
        let mut t = self.tables.write().await;
        let id = t.next_id();
        let record = Notification {
            id,
            user_id: notification.user_id,
            notification_type: notification.notification_type,
            title: notification.title,
            body: notification.body,
            entity_type: notification.entity_type,
            entity_id: notification.entity_id,
            is_read: false,
            created_at: Utc::now(),
        };
        t.notifications.insert(id, record.clone());
        Ok(record)
    }

    async fn list_notifications(&self, user_id: i64, page: Pagination) -> Result<Page<Notification>> {
        let t = self.tables.read().await;
        let matched: Vec<Notification> = t
            .notifications
            .values()
            .rev()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect();
        Ok(paginate(matched, page))
    }

    async fn mark_notification_read(&self, id: i64, user_id: i64) -> Result<bool> {
        let mut t = self.tables.write().await;
        match t.notifications.get_mut(&id) {
            Some(n) if n.user_id == user_id => {
                n.is_read = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_all_notifications_read(&self, user_id: i64) -> Result<u64> {
        let mut t = self.tables.write().await;
        let mut marked = 0;
        for n in t
            .notifications
            .values_mut()
            .filter(|n| n.user_id == user_id && !n.is_read)
        {
            n.is_read = true;
            marked += 1;
        }
        Ok(marked)
    }

    async fn unread_notification_count(&self, user_id: i64) -> Result<i64> {
        let t = self.tables.read().await;
        Ok(t.notifications
            .values()
            .filter(|n| n.user_id == user_id && !n.is_read)
            .count() as i64)
    }

    async fn upsert_telegram_binding(
        &self,
        chat_id: i64,
        case_id: i64,
        access_code: &str,
    ) -> Result<TelegramBinding> {
        let mut t = self.tables.write().await;
        let id = match t.bindings.get(&chat_id) {
            Some(existing) => existing.id,
            None => t.next_id(),
        };
        let binding = TelegramBinding {
            id,
            chat_id,
            case_id,
            access_code: access_code.to_string(),
            is_active: true,
            created_at: Utc::now(),
        };
        t.bindings.insert(chat_id, binding.clone());
        Ok(binding)
    }

    async fn get_telegram_binding(&self, chat_id: i64) -> Result<Option<TelegramBinding>> {
        Ok(self.tables.read().await.bindings.get(&chat_id).cloned())
    }

    async fn active_bindings_for_case(&self, case_id: i64) -> Result<Vec<TelegramBinding>> {
        let t = self.tables.read().await;
        Ok(t.bindings
            .values()
            .filter(|b| b.case_id == case_id && b.is_active)
            .cloned()
            .collect())
    }

    async fn deactivate_telegram_binding(&self, chat_id: i64) -> Result<bool> {
        let mut t = self.tables.write().await;
        match t.bindings.get_mut(&chat_id) {
            Some(b) if b.is_active => {
                b.is_active = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_media(&self, media: NewMedia) -> Result<Media> {
        let mut t = self.tables.write().await;
        let id = t.next_id();
        let record = Media {
            id,
            case_id: media.case_id,
            file_name: media.file_name,
            content_type: media.content_type,
            size_bytes: media.size_bytes,
            storage_key: media.storage_key,
            uploaded_by: media.uploaded_by,
            created_at: Utc::now(),
        };
        t.media.insert(id, record.clone());
        Ok(record)
    }

    async fn get_media(&self, id: i64) -> Result<Option<Media>> {
        Ok(self.tables.read().await.media.get(&id).cloned())
    }

    async fn list_media(&self, case_id: i64) -> Result<Vec<Media>> {
        let t = self.tables.read().await;
        Ok(t.media.values().filter(|m| m.case_id == case_id).cloned().collect())
    }

    async fn delete_orphan_media(&self) -> Result<Vec<Media>> {
        let mut t = self.tables.write().await;
        let orphan_ids: Vec<i64> = t
            .media
            .values()
            .filter(|m| !t.cases.contains_key(&m.case_id))
            .map(|m| m.id)
            .collect();
        Ok(orphan_ids
            .into_iter()
            .filter_map(|id| t.media.remove(&id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_case(code: &str) -> NewCase {
        NewCase {
            access_code: code.to_string(),
            first_name: "Туяра".into(),
            last_name: "Алексеева".into(),
            middle_name: None,
            birth_date: None,
            phone: Some("+79140000000".into()),
            email: None,
            address: None,
            snils: None,
            oms_policy: None,
            diagnosis: Some("H25.1".into()),
            operation_type: OperationType::Phaco,
            eye: Eye::Od,
            doctor_id: 10,
            district_id: Some(1),
            notes: None,
        }
    }

    fn item(name: &str, required: bool, sort_order: i32) -> NewChecklistItem {
        NewChecklistItem {
            name: name.to_string(),
            description: None,
            category: ChecklistCategory::Laboratory,
            is_required: required,
            sort_order,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_insert_case_writes_history_and_items() {
        let store = MemoryStore::new();
        let case = store
            .insert_case(new_case("0a1b2c3d"), vec![item("a", true, 1), item("b", false, 2)], Some(10))
            .await
            .unwrap();

        assert_eq!(case.status, CaseStatus::New);
        let history = store.list_history(case.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from_status, None);
        assert_eq!(history[0].to_status, CaseStatus::New);

        let counts = store.checklist_counts(case.id).await.unwrap();
        assert_eq!(counts, ChecklistCounts { total: 2, completed: 0, required: 1, required_completed: 0 });
    }

    #[tokio::test]
    async fn test_duplicate_access_code_conflicts() {
        let store = MemoryStore::new();
        store.insert_case(new_case("0a1b2c3d"), vec![], None).await.unwrap();
        let err = store.insert_case(new_case("0a1b2c3d"), vec![], None).await.unwrap_err();
        assert!(matches!(err, OculusError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_transition_requires_expected_status() {
        let store = MemoryStore::new();
        let case = store.insert_case(new_case("0a1b2c3d"), vec![], None).await.unwrap();

        let stale = CaseTransition {
            case_id: case.id,
            from: CaseStatus::Preparation,
            to: CaseStatus::ReviewNeeded,
            actor: None,
            comment: None,
            surgeon_id: None,
        };
        assert!(store.transition_case(&stale).await.unwrap().is_none());

        let ok = CaseTransition { from: CaseStatus::New, to: CaseStatus::Preparation, ..stale };
        let updated = store.transition_case(&ok).await.unwrap().unwrap();
        assert_eq!(updated.status, CaseStatus::Preparation);
        assert_eq!(store.list_history(case.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_book_surgery_rejects_second_active_surgery() {
        let store = MemoryStore::new();
        let case = store.insert_case(new_case("0a1b2c3d"), vec![], None).await.unwrap();
        let booking = SurgeryBooking {
            case_id: case.id,
            expected_status: CaseStatus::New,
            surgeon_id: 20,
            scheduled_date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            notes: None,
            actor: Some(20),
            comment: None,
        };
        let (surgery, updated) = store.book_surgery(&booking).await.unwrap().unwrap();
        assert_eq!(surgery.operation_type, case.operation_type);
        assert_eq!(surgery.eye, case.eye);
        assert_eq!(updated.status, CaseStatus::SurgeryScheduled);
        assert_eq!(updated.surgeon_id, Some(20));

        // 状态已变化，期望状态不再匹配
        assert!(store.book_surgery(&booking).await.unwrap().is_none());

        let again = SurgeryBooking { expected_status: CaseStatus::SurgeryScheduled, ..booking };
        assert!(matches!(store.book_surgery(&again).await, Err(OculusError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_expire_items_skips_completed_and_expired() {
        let store = MemoryStore::new();
        let past = Utc::now() - chrono::Duration::days(1);
        let mut stale = item("stale", true, 1);
        stale.expires_at = Some(past);
        let mut done = item("done", true, 2);
        done.expires_at = Some(past);
        let case = store.insert_case(new_case("0a1b2c3d"), vec![stale, done], None).await.unwrap();

        let mut items = store.list_items(case.id).await.unwrap();
        items[1].status = ChecklistStatus::Completed;
        store.save_item(&items[1]).await.unwrap();

        let expired = store.expire_items(Utc::now()).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].name, "stale");
        assert!(store.expire_items(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_notification_read_is_idempotent_and_scoped() {
        let store = MemoryStore::new();
        let n = store
            .insert_notification(NewNotification {
                user_id: 5,
                notification_type: NotificationType::StatusChanged,
                title: "t".into(),
                body: "b".into(),
                entity_type: None,
                entity_id: None,
            })
            .await
            .unwrap();

        assert!(!store.mark_notification_read(n.id, 6).await.unwrap());
        assert!(store.mark_notification_read(n.id, 5).await.unwrap());
        assert!(store.mark_notification_read(n.id, 5).await.unwrap());
        assert_eq!(store.unread_notification_count(5).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reminder_keys_and_orphan_media() {
        let store = MemoryStore::new();
        assert!(store.record_reminder(1, 3).await.unwrap());
        assert!(!store.record_reminder(1, 3).await.unwrap());
        store.clear_reminders(1).await.unwrap();
        assert!(store.record_reminder(1, 3).await.unwrap());

        let case = store.insert_case(new_case("0a1b2c3d"), vec![], None).await.unwrap();
        store
            .insert_media(NewMedia {
                case_id: case.id,
                file_name: "ecg.pdf".into(),
                content_type: "application/pdf".into(),
                size_bytes: 4,
                storage_key: "cases/1/x-ecg.pdf".into(),
                uploaded_by: None,
            })
            .await
            .unwrap();
        assert!(store.delete_orphan_media().await.unwrap().is_empty());

        assert!(store.delete_case(case.id).await.unwrap());
        assert_eq!(store.delete_orphan_media().await.unwrap().len(), 1);
        // 历史保留
        assert_eq!(store.list_history(case.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_cases_search_and_pagination() {
        let store = MemoryStore::new();
        store.insert_case(new_case("00000001"), vec![], None).await.unwrap();
        let mut other = new_case("00000002");
        other.last_name = "Иванов".into();
        store.insert_case(other, vec![], None).await.unwrap();

        let filter = CaseFilter { search: Some("иван".into()), ..Default::default() };
        let page = store.list_cases(&filter, Pagination::default()).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].last_name, "Иванов");

        let page = store
            .list_cases(&CaseFilter::default(), Pagination::new(Some(2), Some(1)))
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);
    }
}
