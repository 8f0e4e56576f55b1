//! 就绪判定
//!
//! 病例就绪当且仅当至少有一个必填项，且所有必填项都已完成。

use oculus_core::models::{ChecklistItem, ChecklistStatus};
use oculus_core::query::ChecklistCounts;
use serde::Serialize;

/// 基于聚合计数的就绪判定
pub fn is_ready(counts: &ChecklistCounts) -> bool {
    counts.required > 0 && counts.required_completed == counts.required
}

/// 直接基于清单项的就绪判定
pub fn items_ready(items: &[ChecklistItem]) -> bool {
    let mut required = items.iter().filter(|i| i.is_required).peekable();
    required.peek().is_some() && required.all(|i| i.status == ChecklistStatus::Completed)
}

/// 清单进度
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChecklistProgress {
    pub total: i64,
    pub completed: i64,
    pub required: i64,
    pub required_completed: i64,
    /// 全部清单项（不仅是必填项）的完成百分比
    pub percentage: f64,
    pub ready: bool,
}

impl From<ChecklistCounts> for ChecklistProgress {
    fn from(counts: ChecklistCounts) -> Self {
        let percentage = if counts.total > 0 {
            counts.completed as f64 / counts.total as f64 * 100.0
        } else {
            0.0
        };
        Self {
            total: counts.total,
            completed: counts.completed,
            required: counts.required,
            required_completed: counts.required_completed,
            percentage,
            ready: is_ready(&counts),
        }
    }
}
