//! # Oculus工作流模块
//!
//! 眼科手术术前准备的病例生命周期引擎，包括：
//! - 清单模板与清单引擎：按手术类型生成清单，跟踪完成与审核
//! - 病例状态机：校验状态转换并追加状态历史
//! - 就绪判定与手术预约：必填项全部完成后才能预约手术
//! - 访问视图与角色范围：公开访问码视图、患者门户、按角色收窄的查询
//! - 周期任务：清单项过期、手术提醒、孤儿文件清理

pub mod access;
pub mod checklist;
pub mod engine;
pub mod history;
pub mod iol;
pub mod lifecycle;
pub mod media;
pub mod notifications;
pub mod pdf;
pub mod rbac;
pub mod readiness;
pub mod scheduling;
pub mod state_machine;
pub mod sweeper;
pub mod templates;

// 重新导出主要类型
pub use access::{PortalView, PublicCaseView, PublicHistoryEntry};
pub use checklist::{ChecklistPatch, ItemReview};
pub use engine::WorkflowEngine;
pub use iol::{IolFormula, IolInput, IolResult, Srk2};
pub use lifecycle::{CaseDetail, CaseQuery, NewCaseRequest};
pub use media::MediaUpload;
pub use notifications::{NoopNotifier, PatientNotifier};
pub use pdf::{CaseSummary, PdfRenderer, TextPdfRenderer};
pub use rbac::{Caller, CaseScope, SURGEON_VISIBLE_STATUSES};
pub use readiness::{is_ready, ChecklistProgress};
pub use scheduling::{ScheduleRequest, SurgeryPatch, SurgeryQuery};
pub use state_machine::{CaseEvent, CaseStateMachine};
pub use sweeper::{SweepJob, Sweeper};
pub use templates::{templates_for, TemplateEntry};
