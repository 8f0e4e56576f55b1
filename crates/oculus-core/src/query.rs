//! 查询参数与分页

use crate::models::{CaseStatus, SurgeryStatus, UserRole};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 100;
/// 页码上限，保证偏移量不溢出
pub const MAX_PAGE: i64 = i64::MAX / MAX_PAGE_SIZE;

/// 分页参数，越界值会被收敛到合法范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub page: i64,
    pub limit: i64,
}

impl Pagination {
    pub fn new(page: Option<i64>, limit: Option<i64>) -> Self {
        Self {
            page: page.unwrap_or(1).clamp(1, MAX_PAGE),
            limit: limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> i64 {
        self.page.saturating_sub(1).max(0).saturating_mul(self.limit)
    }

    pub fn total_pages(&self, total: i64) -> i64 {
        if total <= 0 {
            0
        } else {
            (total + self.limit - 1) / self.limit
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// 一页结果
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub pagination: Pagination,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, pagination: Pagination) -> Self {
        Self { items, total, pagination }
    }

    pub fn total_pages(&self) -> i64 {
        self.pagination.total_pages(self.total)
    }
}

/// 病例列表过滤条件
///
/// `doctor_id`/`statuses`/`case_id` 由角色范围限定器填充，
/// `status`/`search`/`district_id` 来自请求参数，两者同时生效。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaseFilter {
    pub doctor_id: Option<i64>,
    pub statuses: Option<Vec<CaseStatus>>,
    pub case_id: Option<i64>,
    pub status: Option<CaseStatus>,
    pub district_id: Option<i64>,
    pub search: Option<String>,
}

/// 手术列表过滤条件
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SurgeryFilter {
    pub surgeon_id: Option<i64>,
    pub doctor_id: Option<i64>,
    pub case_id: Option<i64>,
    pub status: Option<SurgeryStatus>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

/// 用户列表过滤条件
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserFilter {
    pub role: Option<UserRole>,
    pub is_active: Option<bool>,
}

/// 检查清单聚合计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistCounts {
    pub total: i64,
    pub completed: i64,
    pub required: i64,
    pub required_completed: i64,
}
