//! 病例生命周期演示程序
//!
//! 使用内存存储走完一次完整流程：收治、完成清单、外科审核、预约手术、完成手术

use chrono::{Duration, Utc};
use oculus::admin::Metrics;
use oculus::core::models::{CaseStatus, ChecklistStatus, Eye, OperationType, UserRole};
use oculus::database::{MemoryStore, NewUser, Store};
use oculus::storage::StorageManager;
use oculus::workflow::{
    Caller, ChecklistPatch, ItemReview, NewCaseRequest, ScheduleRequest, WorkflowEngine,
};
use std::sync::Arc;
use tracing::info;

async fn add_user(store: &MemoryStore, email: &str, role: UserRole) -> anyhow::Result<Caller> {
    let user = store
        .insert_user(NewUser {
            email: email.to_string(),
            password_hash: String::new(),
            first_name: "Демо".to_string(),
            last_name: role.as_str().to_string(),
            middle_name: None,
            phone: None,
            role,
            district_id: Some(1),
        })
        .await?;
    Ok(Caller::staff(user.id, role))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt::init();

    let store = Arc::new(MemoryStore::new());
    let engine = WorkflowEngine::new(store.clone(), StorageManager::in_memory(), Metrics::new()?);
    let doctor = add_user(&store, "doctor@demo.local", UserRole::DistrictDoctor).await?;
    let surgeon = add_user(&store, "surgeon@demo.local", UserRole::Surgeon).await?;

    println!("Oculus 术前准备流程演示\n");

    // 1. 收治
    let case = engine
        .create_case(
            &doctor,
            NewCaseRequest {
                first_name: "Туяра".to_string(),
                last_name: "Алексеева".to_string(),
                middle_name: None,
                birth_date: None,
                phone: Some("+7 914 000-00-00".to_string()),
                email: None,
                address: None,
                snils: None,
                oms_policy: None,
                diagnosis: Some("H25.1".to_string()),
                operation_type: OperationType::Phaco,
                eye: Eye::Od,
                district_id: Some(1),
                doctor_id: None,
                notes: None,
            },
        )
        .await?;
    println!("1. 病例 {} 已收治，访问码 {}，状态 {}", case.id, case.access_code, case.status);

    // 2. 完成全部必填项
    let items = engine.list_checklist(&doctor, case.id).await?;
    println!("2. 清单共 {} 项，其中必填 {} 项", items.len(), items.iter().filter(|i| i.is_required).count());
    for item in items.iter().filter(|i| i.is_required) {
        engine
            .update_item(
                &doctor,
                item.id,
                ChecklistPatch {
                    status: Some(ChecklistStatus::Completed),
                    result: Some("норма".to_string()),
                    ..Default::default()
                },
            )
            .await?;
    }
    let progress = engine.checklist_progress(&doctor, case.id).await?;
    let detail = engine.get_case_detail(&doctor, case.id).await?;
    println!("   进度 {:.0}%，病例状态 {}", progress.percentage, detail.case.status);

    // 3. 外科医生确认一项并批准
    if let Some(item) = items.iter().find(|i| i.is_required) {
        engine
            .review_item(
                &surgeon,
                item.id,
                ItemReview {
                    status: ChecklistStatus::Completed,
                    review_note: Some("проверено".to_string()),
                },
            )
            .await?;
    }
    let approved = engine
        .change_status(&surgeon, case.id, CaseStatus::Approved, Some("годен к операции".to_string()))
        .await?;
    println!("3. 外科审核完成，病例状态 {}", approved.status);

    // 4. 预约手术
    let date = (Utc::now() + Duration::days(14)).date_naive();
    let surgery = engine
        .schedule(
            &surgeon,
            ScheduleRequest {
                patient_id: case.id,
                scheduled_date: date.format("%Y-%m-%d").to_string(),
                notes: None,
                surgeon_id: None,
            },
        )
        .await?;
    println!("4. 手术 {} 已预约在 {}", surgery.id, surgery.scheduled_date);

    // 5. 完成手术
    let completed = engine
        .change_status(&surgeon, case.id, CaseStatus::Completed, None)
        .await?;
    println!("5. 病例状态 {}\n", completed.status);

    // 公开视图与状态历史
    let public = engine.public_view(&case.access_code).await?;
    println!("公开视图状态历史:");
    for entry in &public.status_history {
        let from = entry.from_status.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
        println!("   {} → {}", from, entry.to_status);
    }
    println!("历史回放一致: {}", engine.verify_history(case.id).await?);

    let unread = engine.unread_notification_count(&doctor).await?;
    println!("地区医生未读通知: {}", unread);
    info!("Demo finished for case {}", case.id);
    Ok(())
}
