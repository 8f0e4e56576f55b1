//! 数据库查询操作（PostgreSQL）

use crate::connection::DatabasePool;
use crate::models::*;
use crate::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use oculus_core::models::*;
use oculus_core::query::*;
use oculus_core::{OculusError, Result};
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info};

/// PostgreSQL存储实现
#[derive(Clone, Debug)]
pub struct DatabaseQueries {
    pool: DatabasePool,
}

fn convert_rows<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = OculusError>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn convert_row<R, T>(row: Option<R>) -> Result<Option<T>>
where
    T: TryFrom<R, Error = OculusError>,
{
    row.map(T::try_from).transpose()
}

impl DatabaseQueries {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// 创建数据库表
    pub async fn create_tables(&self) -> Result<()> {
        let pool = self.pool.pool();

        let tables = [
            // 用户表
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id BIGSERIAL PRIMARY KEY,
                email VARCHAR(255) UNIQUE NOT NULL,
                password_hash VARCHAR(255) NOT NULL,
                first_name VARCHAR(128) NOT NULL,
                last_name VARCHAR(128) NOT NULL,
                middle_name VARCHAR(128),
                phone VARCHAR(32),
                role VARCHAR(32) NOT NULL,
                district_id BIGINT,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                refresh_token TEXT,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
            "#,
            // 病例表
            r#"
            CREATE TABLE IF NOT EXISTS patient_cases (
                id BIGSERIAL PRIMARY KEY,
                access_code CHAR(8) UNIQUE NOT NULL,
                first_name VARCHAR(128) NOT NULL,
                last_name VARCHAR(128) NOT NULL,
                middle_name VARCHAR(128),
                birth_date DATE,
                phone VARCHAR(32),
                email VARCHAR(255),
                address TEXT,
                snils VARCHAR(32),
                oms_policy VARCHAR(32),
                diagnosis TEXT,
                operation_type VARCHAR(32) NOT NULL,
                eye VARCHAR(2) NOT NULL,
                status VARCHAR(32) NOT NULL,
                doctor_id BIGINT NOT NULL REFERENCES users(id),
                surgeon_id BIGINT REFERENCES users(id),
                district_id BIGINT,
                surgery_date DATE,
                notes TEXT,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
            "#,
            // 检查清单项表
            r#"
            CREATE TABLE IF NOT EXISTS checklist_items (
                id BIGSERIAL PRIMARY KEY,
                case_id BIGINT NOT NULL,
                name VARCHAR(255) NOT NULL,
                description TEXT,
                category VARCHAR(32) NOT NULL,
                is_required BOOLEAN NOT NULL,
                sort_order INTEGER NOT NULL,
                status VARCHAR(20) NOT NULL DEFAULT 'PENDING',
                result TEXT,
                notes TEXT,
                completed_at TIMESTAMP WITH TIME ZONE,
                completed_by BIGINT,
                reviewed_by BIGINT,
                review_note TEXT,
                expires_at TIMESTAMP WITH TIME ZONE,
                media_id BIGINT,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
            "#,
            // 状态历史表（只追加，不随病例删除）
            r#"
            CREATE TABLE IF NOT EXISTS status_history (
                id BIGSERIAL PRIMARY KEY,
                case_id BIGINT NOT NULL,
                from_status VARCHAR(32),
                to_status VARCHAR(32) NOT NULL,
                changed_by BIGINT,
                comment TEXT,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
            "#,
            // 手术表
            r#"
            CREATE TABLE IF NOT EXISTS surgeries (
                id BIGSERIAL PRIMARY KEY,
                case_id BIGINT NOT NULL,
                surgeon_id BIGINT NOT NULL REFERENCES users(id),
                scheduled_date DATE NOT NULL,
                operation_type VARCHAR(32) NOT NULL,
                eye VARCHAR(2) NOT NULL,
                status VARCHAR(20) NOT NULL DEFAULT 'SCHEDULED',
                notes TEXT,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
            "#,
            // 手术提醒幂等键
            r#"
            CREATE TABLE IF NOT EXISTS surgery_reminders (
                surgery_id BIGINT NOT NULL,
                offset_days INTEGER NOT NULL,
                sent_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                PRIMARY KEY (surgery_id, offset_days)
            )
            "#,
            // 审计表
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id BIGSERIAL PRIMARY KEY,
                user_id BIGINT,
                action VARCHAR(16) NOT NULL,
                entity VARCHAR(64) NOT NULL,
                entity_id BIGINT,
                old_value JSONB,
                new_value JSONB,
                ip VARCHAR(64),
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
            "#,
            // 通知表
            r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id BIGSERIAL PRIMARY KEY,
                user_id BIGINT NOT NULL,
                notification_type VARCHAR(32) NOT NULL,
                title VARCHAR(255) NOT NULL,
                body TEXT NOT NULL,
                entity_type VARCHAR(64),
                entity_id BIGINT,
                is_read BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
            "#,
            // Telegram绑定表
            r#"
            CREATE TABLE IF NOT EXISTS telegram_bindings (
                id BIGSERIAL PRIMARY KEY,
                chat_id BIGINT UNIQUE NOT NULL,
                case_id BIGINT NOT NULL,
                access_code CHAR(8) NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
            "#,
            // 文件表（病例删除后由清理任务处理）
            r#"
            CREATE TABLE IF NOT EXISTS media (
                id BIGSERIAL PRIMARY KEY,
                case_id BIGINT NOT NULL,
                file_name VARCHAR(255) NOT NULL,
                content_type VARCHAR(128) NOT NULL,
                size_bytes BIGINT NOT NULL,
                storage_key VARCHAR(512) UNIQUE NOT NULL,
                uploaded_by BIGINT,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
            "#,
        ];

        for sql in tables {
            sqlx::query(sql).execute(pool).await?;
        }

        // 创建索引以优化查询性能
        self.create_indexes().await?;

        info!("Database tables created successfully");
        Ok(())
    }

    /// 创建数据库索引
    async fn create_indexes(&self) -> Result<()> {
        let pool = self.pool.pool();

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_cases_doctor_id ON patient_cases(doctor_id)",
            "CREATE INDEX IF NOT EXISTS idx_cases_status ON patient_cases(status)",
            "CREATE INDEX IF NOT EXISTS idx_cases_created_at ON patient_cases(created_at)",
            "CREATE INDEX IF NOT EXISTS idx_items_case_id ON checklist_items(case_id)",
            "CREATE INDEX IF NOT EXISTS idx_items_expires_at ON checklist_items(expires_at)",
            "CREATE INDEX IF NOT EXISTS idx_history_case_id ON status_history(case_id, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_surgeries_case_id ON surgeries(case_id)",
            "CREATE INDEX IF NOT EXISTS idx_surgeries_date ON surgeries(scheduled_date)",
            // 每个病例最多一台未取消的手术
            "CREATE UNIQUE INDEX IF NOT EXISTS uq_surgeries_active_case ON surgeries(case_id) WHERE status <> 'CANCELLED'",
            "CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_log(entity, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id, is_read)",
            "CREATE INDEX IF NOT EXISTS idx_bindings_case_id ON telegram_bindings(case_id)",
            "CREATE INDEX IF NOT EXISTS idx_media_case_id ON media(case_id)",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql).execute(pool).await?;
        }

        info!("Database indexes created successfully");
        Ok(())
    }
}

fn push_case_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &CaseFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(doctor_id) = filter.doctor_id {
        qb.push(" AND doctor_id = ").push_bind(doctor_id);
    }
    if let Some(statuses) = &filter.statuses {
        let values: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        qb.push(" AND status = ANY(").push_bind(values).push(")");
    }
    if let Some(case_id) = filter.case_id {
        qb.push(" AND id = ").push_bind(case_id);
    }
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(district_id) = filter.district_id {
        qb.push(" AND district_id = ").push_bind(district_id);
    }
    if let Some(search) = &filter.search {
        let pattern = format!("%{}%", search);
        qb.push(" AND (last_name ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR first_name ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR middle_name ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR snils ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR access_code = ")
            .push_bind(search.to_lowercase())
            .push(")");
    }
}

fn push_surgery_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &SurgeryFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(surgeon_id) = filter.surgeon_id {
        qb.push(" AND surgeon_id = ").push_bind(surgeon_id);
    }
    if let Some(doctor_id) = filter.doctor_id {
        qb.push(" AND case_id IN (SELECT id FROM patient_cases WHERE doctor_id = ")
            .push_bind(doctor_id)
            .push(")");
    }
    if let Some(case_id) = filter.case_id {
        qb.push(" AND case_id = ").push_bind(case_id);
    }
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(from) = filter.date_from {
        qb.push(" AND scheduled_date >= ").push_bind(from);
    }
    if let Some(to) = filter.date_to {
        qb.push(" AND scheduled_date <= ").push_bind(to);
    }
}

const INSERT_HISTORY: &str = r#"
    INSERT INTO status_history (case_id, from_status, to_status, changed_by, comment)
    VALUES ($1, $2, $3, $4, $5)
"#;

#[async_trait]
impl Store for DatabaseQueries {
    // ========== 病例相关操作 ==========

    async fn insert_case(
        &self,
        case: NewCase,
        items: Vec<NewChecklistItem>,
        actor: Option<i64>,
    ) -> Result<PatientCase> {
        let mut tx = self.pool.pool().begin().await?;

        let row = sqlx::query_as::<_, DbCase>(
            r#"
            INSERT INTO patient_cases (access_code, first_name, last_name, middle_name, birth_date,
                phone, email, address, snils, oms_policy, diagnosis, operation_type, eye, status,
                doctor_id, district_id, notes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING *
            "#,
        )
        .bind(&case.access_code)
        .bind(&case.first_name)
        .bind(&case.last_name)
        .bind(&case.middle_name)
        .bind(case.birth_date)
        .bind(&case.phone)
        .bind(&case.email)
        .bind(&case.address)
        .bind(&case.snils)
        .bind(&case.oms_policy)
        .bind(&case.diagnosis)
        .bind(case.operation_type.as_str())
        .bind(case.eye.as_str())
        .bind(CaseStatus::New.as_str())
        .bind(case.doctor_id)
        .bind(case.district_id)
        .bind(&case.notes)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(INSERT_HISTORY)
            .bind(row.id)
            .bind(None::<String>)
            .bind(CaseStatus::New.as_str())
            .bind(actor)
            .bind(None::<String>)
            .execute(&mut *tx)
            .await?;

        if !items.is_empty() {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO checklist_items (case_id, name, description, category, is_required, sort_order, status, expires_at) ",
            );
            qb.push_values(items.iter(), |mut b, item| {
                b.push_bind(row.id)
                    .push_bind(item.name.clone())
                    .push_bind(item.description.clone())
                    .push_bind(item.category.as_str())
                    .push_bind(item.is_required)
                    .push_bind(item.sort_order)
                    .push_bind(ChecklistStatus::Pending.as_str())
                    .push_bind(item.expires_at);
            });
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        debug!("Inserted case {} with {} checklist items", row.id, items.len());
        PatientCase::try_from(row)
    }

    async fn get_case(&self, id: i64) -> Result<Option<PatientCase>> {
        let row = sqlx::query_as::<_, DbCase>("SELECT * FROM patient_cases WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;
        convert_row(row)
    }

    async fn get_case_by_access_code(&self, code: &str) -> Result<Option<PatientCase>> {
        let row = sqlx::query_as::<_, DbCase>("SELECT * FROM patient_cases WHERE access_code = $1")
            .bind(code)
            .fetch_optional(self.pool.pool())
            .await?;
        convert_row(row)
    }

    async fn list_cases(&self, filter: &CaseFilter, page: Pagination) -> Result<Page<PatientCase>> {
        let pool = self.pool.pool();

        let mut count_qb = QueryBuilder::new("SELECT COUNT(*) FROM patient_cases");
        push_case_filter(&mut count_qb, filter);
        let total: i64 = count_qb.build_query_scalar().fetch_one(pool).await?;

        let mut qb = QueryBuilder::new("SELECT * FROM patient_cases");
        push_case_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(page.limit)
            .push(" OFFSET ")
            .push_bind(page.offset());
        let rows: Vec<DbCase> = qb.build_query_as().fetch_all(pool).await?;

        Ok(Page::new(convert_rows(rows)?, total, page))
    }

    async fn update_case(&self, id: i64, update: &CaseUpdate) -> Result<Option<PatientCase>> {
        let row = sqlx::query_as::<_, DbCase>(
            r#"
            UPDATE patient_cases SET
                first_name = COALESCE($2, first_name),
                last_name = COALESCE($3, last_name),
                middle_name = COALESCE($4, middle_name),
                birth_date = COALESCE($5, birth_date),
                phone = COALESCE($6, phone),
                email = COALESCE($7, email),
                address = COALESCE($8, address),
                snils = COALESCE($9, snils),
                oms_policy = COALESCE($10, oms_policy),
                diagnosis = COALESCE($11, diagnosis),
                district_id = COALESCE($12, district_id),
                notes = COALESCE($13, notes),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&update.first_name)
        .bind(&update.last_name)
        .bind(&update.middle_name)
        .bind(update.birth_date)
        .bind(&update.phone)
        .bind(&update.email)
        .bind(&update.address)
        .bind(&update.snils)
        .bind(&update.oms_policy)
        .bind(&update.diagnosis)
        .bind(update.district_id)
        .bind(&update.notes)
        .fetch_optional(self.pool.pool())
        .await?;
        convert_row(row)
    }

    async fn set_access_code(&self, id: i64, code: &str) -> Result<Option<PatientCase>> {
        let row = sqlx::query_as::<_, DbCase>(
            "UPDATE patient_cases SET access_code = $2, updated_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(code)
        .fetch_optional(self.pool.pool())
        .await?;
        convert_row(row)
    }

    async fn transition_case(&self, transition: &CaseTransition) -> Result<Option<PatientCase>> {
        let mut tx = self.pool.pool().begin().await?;

        // 乐观并发：WHERE子句中带上期望的原状态
        let row = sqlx::query_as::<_, DbCase>(
            r#"
            UPDATE patient_cases
            SET status = $3, surgeon_id = COALESCE($4, surgeon_id), updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(transition.case_id)
        .bind(transition.from.as_str())
        .bind(transition.to.as_str())
        .bind(transition.surgeon_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query(INSERT_HISTORY)
            .bind(transition.case_id)
            .bind(Some(transition.from.as_str()))
            .bind(transition.to.as_str())
            .bind(transition.actor)
            .bind(&transition.comment)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        PatientCase::try_from(row).map(Some)
    }

    async fn set_case_surgery_date(&self, case_id: i64, date: Option<NaiveDate>) -> Result<()> {
        sqlx::query("UPDATE patient_cases SET surgery_date = $2, updated_at = NOW() WHERE id = $1")
            .bind(case_id)
            .bind(date)
            .execute(self.pool.pool())
            .await?;
        Ok(())
    }

    async fn delete_case(&self, id: i64) -> Result<bool> {
        let mut tx = self.pool.pool().begin().await?;

        sqlx::query("DELETE FROM checklist_items WHERE case_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM surgery_reminders WHERE surgery_id IN (SELECT id FROM surgeries WHERE case_id = $1)")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM surgeries WHERE case_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE telegram_bindings SET is_active = FALSE WHERE case_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM patient_cases WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(deleted > 0)
    }

    async fn list_history(&self, case_id: i64) -> Result<Vec<StatusHistoryEntry>> {
        let rows = sqlx::query_as::<_, DbStatusHistory>(
            "SELECT * FROM status_history WHERE case_id = $1 ORDER BY created_at, id",
        )
        .bind(case_id)
        .fetch_all(self.pool.pool())
        .await?;
        convert_rows(rows)
    }

    // ========== 检查清单相关操作 ==========

    async fn list_items(&self, case_id: i64) -> Result<Vec<ChecklistItem>> {
        let rows = sqlx::query_as::<_, DbChecklistItem>(
            "SELECT * FROM checklist_items WHERE case_id = $1 ORDER BY sort_order, id",
        )
        .bind(case_id)
        .fetch_all(self.pool.pool())
        .await?;
        convert_rows(rows)
    }

    async fn get_item(&self, id: i64) -> Result<Option<ChecklistItem>> {
        let row = sqlx::query_as::<_, DbChecklistItem>("SELECT * FROM checklist_items WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;
        convert_row(row)
    }

    async fn save_item(&self, item: &ChecklistItem) -> Result<ChecklistItem> {
        let row = sqlx::query_as::<_, DbChecklistItem>(
            r#"
            UPDATE checklist_items SET
                status = $2, result = $3, notes = $4, completed_at = $5, completed_by = $6,
                reviewed_by = $7, review_note = $8, expires_at = $9, media_id = $10,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(item.id)
        .bind(item.status.as_str())
        .bind(&item.result)
        .bind(&item.notes)
        .bind(item.completed_at)
        .bind(item.completed_by)
        .bind(item.reviewed_by)
        .bind(&item.review_note)
        .bind(item.expires_at)
        .bind(item.media_id)
        .fetch_optional(self.pool.pool())
        .await?
        .ok_or_else(|| OculusError::NotFound(format!("检查清单项不存在: {}", item.id)))?;
        ChecklistItem::try_from(row)
    }

    async fn checklist_counts(&self, case_id: i64) -> Result<ChecklistCounts> {
        let (total, completed, required, required_completed) =
            sqlx::query_as::<_, (i64, i64, i64, i64)>(
                r#"
                SELECT
                    COUNT(*),
                    COUNT(*) FILTER (WHERE status = 'COMPLETED'),
                    COUNT(*) FILTER (WHERE is_required),
                    COUNT(*) FILTER (WHERE is_required AND status = 'COMPLETED')
                FROM checklist_items
                WHERE case_id = $1
                "#,
            )
            .bind(case_id)
            .fetch_one(self.pool.pool())
            .await?;
        Ok(ChecklistCounts {
            total,
            completed,
            required,
            required_completed,
        })
    }

    async fn expire_items(&self, now: DateTime<Utc>) -> Result<Vec<ChecklistItem>> {
        let rows = sqlx::query_as::<_, DbChecklistItem>(
            r#"
            UPDATE checklist_items SET status = 'EXPIRED', updated_at = NOW()
            WHERE expires_at < $1 AND status NOT IN ('EXPIRED', 'COMPLETED')
            RETURNING *
            "#,
        )
        .bind(now)
        .fetch_all(self.pool.pool())
        .await?;
        convert_rows(rows)
    }

    // ========== 手术相关操作 ==========

    async fn book_surgery(&self, booking: &SurgeryBooking) -> Result<Option<(Surgery, PatientCase)>> {
        let mut tx = self.pool.pool().begin().await?;

        let locked = sqlx::query_as::<_, DbCase>("SELECT * FROM patient_cases WHERE id = $1 FOR UPDATE")
            .bind(booking.case_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(locked) = locked else {
            return Ok(None);
        };
        let case = PatientCase::try_from(locked)?;
        if case.status != booking.expected_status {
            return Ok(None);
        }

        let active: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM surgeries WHERE case_id = $1 AND status <> 'CANCELLED' LIMIT 1",
        )
        .bind(booking.case_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(existing) = active {
            return Err(OculusError::Conflict(format!(
                "病例 {} 已有未取消的手术 {}",
                booking.case_id, existing
            )));
        }

        let surgery = sqlx::query_as::<_, DbSurgery>(
            r#"
            INSERT INTO surgeries (case_id, surgeon_id, scheduled_date, operation_type, eye, status, notes)
            VALUES ($1, $2, $3, $4, $5, 'SCHEDULED', $6)
            RETURNING *
            "#,
        )
        .bind(booking.case_id)
        .bind(booking.surgeon_id)
        .bind(booking.scheduled_date)
        .bind(case.operation_type.as_str())
        .bind(case.eye.as_str())
        .bind(&booking.notes)
        .fetch_one(&mut *tx)
        .await?;

        let updated = sqlx::query_as::<_, DbCase>(
            r#"
            UPDATE patient_cases
            SET status = $2, surgery_date = $3, surgeon_id = $4, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(booking.case_id)
        .bind(CaseStatus::SurgeryScheduled.as_str())
        .bind(booking.scheduled_date)
        .bind(booking.surgeon_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(INSERT_HISTORY)
            .bind(booking.case_id)
            .bind(Some(booking.expected_status.as_str()))
            .bind(CaseStatus::SurgeryScheduled.as_str())
            .bind(booking.actor)
            .bind(&booking.comment)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some((Surgery::try_from(surgery)?, PatientCase::try_from(updated)?)))
    }

    async fn get_surgery(&self, id: i64) -> Result<Option<Surgery>> {
        let row = sqlx::query_as::<_, DbSurgery>("SELECT * FROM surgeries WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;
        convert_row(row)
    }

    async fn active_surgery_for_case(&self, case_id: i64) -> Result<Option<Surgery>> {
        let row = sqlx::query_as::<_, DbSurgery>(
            "SELECT * FROM surgeries WHERE case_id = $1 AND status <> 'CANCELLED' ORDER BY id DESC LIMIT 1",
        )
        .bind(case_id)
        .fetch_optional(self.pool.pool())
        .await?;
        convert_row(row)
    }

    async fn list_surgeries(&self, filter: &SurgeryFilter, page: Pagination) -> Result<Page<Surgery>> {
        let pool = self.pool.pool();

        let mut count_qb = QueryBuilder::new("SELECT COUNT(*) FROM surgeries");
        push_surgery_filter(&mut count_qb, filter);
        let total: i64 = count_qb.build_query_scalar().fetch_one(pool).await?;

        let mut qb = QueryBuilder::new("SELECT * FROM surgeries");
        push_surgery_filter(&mut qb, filter);
        qb.push(" ORDER BY scheduled_date, id LIMIT ")
            .push_bind(page.limit)
            .push(" OFFSET ")
            .push_bind(page.offset());
        let rows: Vec<DbSurgery> = qb.build_query_as().fetch_all(pool).await?;

        Ok(Page::new(convert_rows(rows)?, total, page))
    }

    async fn update_surgery(&self, id: i64, update: &SurgeryUpdate) -> Result<Option<Surgery>> {
        let row = sqlx::query_as::<_, DbSurgery>(
            r#"
            UPDATE surgeries SET
                scheduled_date = COALESCE($2, scheduled_date),
                status = COALESCE($3, status),
                notes = COALESCE($4, notes),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(update.scheduled_date)
        .bind(update.status.map(|s| s.as_str()))
        .bind(&update.notes)
        .fetch_optional(self.pool.pool())
        .await?;
        convert_row(row)
    }

    async fn cancel_active_surgeries(&self, case_id: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE surgeries SET status = 'CANCELLED', updated_at = NOW() WHERE case_id = $1 AND status = 'SCHEDULED'",
        )
        .bind(case_id)
        .execute(self.pool.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn scheduled_surgeries_between(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<Surgery>> {
        let rows = sqlx::query_as::<_, DbSurgery>(
            r#"
            SELECT * FROM surgeries
            WHERE status = 'SCHEDULED' AND scheduled_date BETWEEN $1 AND $2
            ORDER BY scheduled_date, id
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(self.pool.pool())
        .await?;
        convert_rows(rows)
    }

    async fn record_reminder(&self, surgery_id: i64, offset_days: i32) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO surgery_reminders (surgery_id, offset_days) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(surgery_id)
        .bind(offset_days)
        .execute(self.pool.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn clear_reminders(&self, surgery_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM surgery_reminders WHERE surgery_id = $1")
            .bind(surgery_id)
            .execute(self.pool.pool())
            .await?;
        Ok(())
    }

    // ========== 用户相关操作 ==========

    async fn insert_user(&self, user: NewUser) -> Result<User> {
        let row = sqlx::query_as::<_, DbUser>(
            r#"
            INSERT INTO users (email, password_hash, first_name, last_name, middle_name, phone, role, district_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.middle_name)
        .bind(&user.phone)
        .bind(user.role.as_str())
        .bind(user.district_id)
        .fetch_one(self.pool.pool())
        .await?;
        User::try_from(row)
    }

    async fn get_user(&self, id: i64) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, DbUser>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;
        convert_row(row)
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, DbUser>("SELECT * FROM users WHERE LOWER(email) = LOWER($1)")
            .bind(email)
            .fetch_optional(self.pool.pool())
            .await?;
        convert_row(row)
    }

    async fn list_users(&self, filter: &UserFilter, page: Pagination) -> Result<Page<User>> {
        let pool = self.pool.pool();
        let role = filter.role.map(|r| r.as_str());

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM users WHERE ($1::text IS NULL OR role = $1) AND ($2::boolean IS NULL OR is_active = $2)",
        )
        .bind(role)
        .bind(filter.is_active)
        .fetch_one(pool)
        .await?;

        let rows = sqlx::query_as::<_, DbUser>(
            r#"
            SELECT * FROM users
            WHERE ($1::text IS NULL OR role = $1) AND ($2::boolean IS NULL OR is_active = $2)
            ORDER BY id
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(role)
        .bind(filter.is_active)
        .bind(page.limit)
        .bind(page.offset())
        .fetch_all(pool)
        .await?;

        Ok(Page::new(convert_rows(rows)?, total, page))
    }

    async fn update_user(&self, id: i64, update: &UserUpdate) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, DbUser>(
            r#"
            UPDATE users SET
                first_name = COALESCE($2, first_name),
                last_name = COALESCE($3, last_name),
                middle_name = COALESCE($4, middle_name),
                phone = COALESCE($5, phone),
                role = COALESCE($6, role),
                district_id = COALESCE($7, district_id),
                is_active = COALESCE($8, is_active),
                password_hash = COALESCE($9, password_hash),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&update.first_name)
        .bind(&update.last_name)
        .bind(&update.middle_name)
        .bind(&update.phone)
        .bind(update.role.map(|r| r.as_str()))
        .bind(update.district_id)
        .bind(update.is_active)
        .bind(&update.password_hash)
        .fetch_optional(self.pool.pool())
        .await?;
        convert_row(row)
    }

    async fn set_refresh_token(&self, id: i64, token: Option<String>) -> Result<()> {
        sqlx::query("UPDATE users SET refresh_token = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(token)
            .execute(self.pool.pool())
            .await?;
        Ok(())
    }

    async fn count_users(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(self.pool.pool())
            .await?;
        Ok(count)
    }

    async fn active_user_ids(&self, role: UserRole) -> Result<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM users WHERE role = $1 AND is_active ORDER BY id")
            .bind(role.as_str())
            .fetch_all(self.pool.pool())
            .await?;
        Ok(ids)
    }

    // ========== 审计相关操作 ==========

    async fn insert_audit(&self, entry: NewAuditEntry) -> Result<AuditEntry> {
        let row = sqlx::query_as::<_, DbAuditEntry>(
            r#"
            INSERT INTO audit_log (user_id, action, entity, entity_id, old_value, new_value, ip)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(entry.user_id)
        .bind(entry.action.as_str())
        .bind(&entry.entity)
        .bind(entry.entity_id)
        .bind(&entry.old_value)
        .bind(&entry.new_value)
        .bind(&entry.ip)
        .fetch_one(self.pool.pool())
        .await?;
        AuditEntry::try_from(row)
    }

    async fn list_audit(&self, entity: Option<String>, page: Pagination) -> Result<Page<AuditEntry>> {
        let pool = self.pool.pool();

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_log WHERE ($1::text IS NULL OR entity = $1)")
            .bind(&entity)
            .fetch_one(pool)
            .await?;

        let rows = sqlx::query_as::<_, DbAuditEntry>(
            r#"
            SELECT * FROM audit_log
            WHERE ($1::text IS NULL OR entity = $1)
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(&entity)
        .bind(page.limit)
        .bind(page.offset())
        .fetch_all(pool)
        .await?;

        Ok(Page::new(convert_rows(rows)?, total, page))
    }

    // ========== 通知相关操作 ==========

    async fn insert_notification(&self, notification: NewNotification) -> Result<Notification> {
        let row = sqlx::query_as::<_, DbNotification>(
            r#"
            INSERT INTO notifications (user_id, notification_type, title, body, entity_type, entity_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(notification.user_id)
        .bind(notification.notification_type.as_str())
        .bind(&notification.title)
        .bind(&notification.body)
        .bind(&notification.entity_type)
        .bind(notification.entity_id)
        .fetch_one(self.pool.pool())
        .await?;
        Notification::try_from(row)
    }

    async fn list_notifications(&self, user_id: i64, page: Pagination) -> Result<Page<Notification>> {
        let pool = self.pool.pool();

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notifications WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(pool)
            .await?;

        let rows = sqlx::query_as::<_, DbNotification>(
            "SELECT * FROM notifications WHERE user_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3",
        )
        .bind(user_id)
        .bind(page.limit)
        .bind(page.offset())
        .fetch_all(pool)
        .await?;

        Ok(Page::new(convert_rows(rows)?, total, page))
    }

    async fn mark_notification_read(&self, id: i64, user_id: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE notifications SET is_read = TRUE WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .execute(self.pool.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_all_notifications_read(&self, user_id: i64) -> Result<u64> {
        let result = sqlx::query("UPDATE notifications SET is_read = TRUE WHERE user_id = $1 AND NOT is_read")
            .bind(user_id)
            .execute(self.pool.pool())
            .await?;
        Ok(result.rows_affected())
    }

    async fn unread_notification_count(&self, user_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notifications WHERE user_id = $1 AND NOT is_read")
            .bind(user_id)
            .fetch_one(self.pool.pool())
            .await?;
        Ok(count)
    }

    // ========== Telegram相关操作 ==========

    async fn upsert_telegram_binding(
        &self,
        chat_id: i64,
        case_id: i64,
        access_code: &str,
    ) -> Result<TelegramBinding> {
        let row = sqlx::query_as::<_, DbTelegramBinding>(
            r#"
            INSERT INTO telegram_bindings (chat_id, case_id, access_code, is_active)
            VALUES ($1, $2, $3, TRUE)
            ON CONFLICT (chat_id) DO UPDATE
            SET case_id = EXCLUDED.case_id, access_code = EXCLUDED.access_code, is_active = TRUE
            RETURNING *
            "#,
        )
        .bind(chat_id)
        .bind(case_id)
        .bind(access_code)
        .fetch_one(self.pool.pool())
        .await?;
        Ok(row.into())
    }

    async fn get_telegram_binding(&self, chat_id: i64) -> Result<Option<TelegramBinding>> {
        let row = sqlx::query_as::<_, DbTelegramBinding>("SELECT * FROM telegram_bindings WHERE chat_id = $1")
            .bind(chat_id)
            .fetch_optional(self.pool.pool())
            .await?;
        Ok(row.map(TelegramBinding::from))
    }

    async fn active_bindings_for_case(&self, case_id: i64) -> Result<Vec<TelegramBinding>> {
        let rows = sqlx::query_as::<_, DbTelegramBinding>(
            "SELECT * FROM telegram_bindings WHERE case_id = $1 AND is_active ORDER BY id",
        )
        .bind(case_id)
        .fetch_all(self.pool.pool())
        .await?;
        Ok(rows.into_iter().map(TelegramBinding::from).collect())
    }

    async fn deactivate_telegram_binding(&self, chat_id: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE telegram_bindings SET is_active = FALSE WHERE chat_id = $1 AND is_active")
            .bind(chat_id)
            .execute(self.pool.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ========== 文件相关操作 ==========

    async fn insert_media(&self, media: NewMedia) -> Result<Media> {
        let row = sqlx::query_as::<_, DbMedia>(
            r#"
            INSERT INTO media (case_id, file_name, content_type, size_bytes, storage_key, uploaded_by)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(media.case_id)
        .bind(&media.file_name)
        .bind(&media.content_type)
        .bind(media.size_bytes)
        .bind(&media.storage_key)
        .bind(media.uploaded_by)
        .fetch_one(self.pool.pool())
        .await?;
        Ok(row.into())
    }

    async fn get_media(&self, id: i64) -> Result<Option<Media>> {
        let row = sqlx::query_as::<_, DbMedia>("SELECT * FROM media WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;
        Ok(row.map(Media::from))
    }

    async fn list_media(&self, case_id: i64) -> Result<Vec<Media>> {
        let rows = sqlx::query_as::<_, DbMedia>("SELECT * FROM media WHERE case_id = $1 ORDER BY id")
            .bind(case_id)
            .fetch_all(self.pool.pool())
            .await?;
        Ok(rows.into_iter().map(Media::from).collect())
    }

    async fn delete_orphan_media(&self) -> Result<Vec<Media>> {
        let rows = sqlx::query_as::<_, DbMedia>(
            r#"
            DELETE FROM media
            WHERE NOT EXISTS (SELECT 1 FROM patient_cases c WHERE c.id = media.case_id)
            RETURNING *
            "#,
        )
        .fetch_all(self.pool.pool())
        .await?;
        Ok(rows.into_iter().map(Media::from).collect())
    }
}
