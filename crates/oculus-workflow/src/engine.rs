//! 工作流引擎
//!
//! 协调存储、状态机、文件存储和患者通知渠道的核心引擎。
//! 各业务操作按领域拆分在 `lifecycle`、`checklist`、`scheduling`、`access`、
//! `media` 等模块的 `impl WorkflowEngine` 块中。

use crate::notifications::{NoopNotifier, PatientNotifier};
use crate::pdf::{PdfRenderer, TextPdfRenderer};
use crate::state_machine::CaseStateMachine;
use oculus_admin::Metrics;
use oculus_core::models::{CaseStatus, PatientCase};
use oculus_core::{OculusError, Result};
use oculus_database::{CaseTransition, Store};
use oculus_storage::StorageManager;
use std::sync::Arc;
use tracing::{debug, info};

/// 工作流引擎
///
/// 克隆开销很小，所有字段都是共享句柄。
#[derive(Clone)]
pub struct WorkflowEngine {
    store: Arc<dyn Store>,
    storage: StorageManager,
    notifier: Arc<dyn PatientNotifier>,
    pdf_renderer: Arc<dyn PdfRenderer>,
    metrics: Metrics,
    state_machine: Arc<CaseStateMachine>,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("storage", &self.storage)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl WorkflowEngine {
    /// 创建新的工作流引擎，默认不向患者推送
    pub fn new(store: Arc<dyn Store>, storage: StorageManager, metrics: Metrics) -> Self {
        Self {
            store,
            storage,
            notifier: Arc::new(NoopNotifier),
            pdf_renderer: Arc::new(TextPdfRenderer),
            metrics,
            state_machine: Arc::new(CaseStateMachine::new()),
        }
    }

    /// 替换患者通知渠道
    pub fn with_notifier(mut self, notifier: Arc<dyn PatientNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// 替换PDF渲染器
    pub fn with_pdf_renderer(mut self, renderer: Arc<dyn PdfRenderer>) -> Self {
        self.pdf_renderer = renderer;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn state_machine(&self) -> &CaseStateMachine {
        &self.state_machine
    }

    pub(crate) async fn load_case(&self, id: i64) -> Result<PatientCase> {
        self.store
            .get_case(id)
            .await?
            .ok_or_else(|| OculusError::NotFound(format!("病例不存在: {}", id)))
    }

    /// 校验并执行状态转换，`from == to` 时不做任何事。
    ///
    /// 持久化时带上期望的原状态；期间病例被并发修改则返回 `Ok(None)`。
    pub(crate) async fn try_transition(
        &self,
        case: &PatientCase,
        to: CaseStatus,
        actor: Option<i64>,
        comment: Option<String>,
        surgeon_id: Option<i64>,
    ) -> Result<Option<PatientCase>> {
        if case.status == to {
            debug!("Case {} already in {}, transition skipped", case.id, to);
            return Ok(Some(case.clone()));
        }
        self.state_machine.check(case.status, to)?;

        let transition = CaseTransition {
            case_id: case.id,
            from: case.status,
            to,
            actor,
            comment,
            surgeon_id,
        };
        let Some(updated) = self.store.transition_case(&transition).await? else {
            return Ok(None);
        };

        self.metrics.record_transition(to);
        info!("Case {} transitioned {} -> {}", case.id, case.status, to);
        self.notifier.case_status_changed(&updated).await;
        Ok(Some(updated))
    }

    /// 同 [`Self::try_transition`]，并发冲突视为无效转换
    pub(crate) async fn apply_transition(
        &self,
        case: &PatientCase,
        to: CaseStatus,
        actor: Option<i64>,
        comment: Option<String>,
        surgeon_id: Option<i64>,
    ) -> Result<PatientCase> {
        self.try_transition(case, to, actor, comment, surgeon_id)
            .await?
            .ok_or_else(|| OculusError::invalid_transition(case.status, to))
    }

    pub(crate) fn notifier(&self) -> &Arc<dyn PatientNotifier> {
        &self.notifier
    }

    pub(crate) fn pdf_renderer(&self) -> &Arc<dyn PdfRenderer> {
        &self.pdf_renderer
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::rbac::Caller;
    use oculus_core::models::{Eye, OperationType, UserRole};
    use oculus_database::{MemoryStore, NewUser};

    pub(crate) fn test_engine() -> (WorkflowEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let engine = WorkflowEngine::new(
            store.clone(),
            StorageManager::in_memory(),
            Metrics::new().unwrap(),
        );
        (engine, store)
    }

    /// 引擎加上三个已登记的工作人员
    pub(crate) struct Fixture {
        pub engine: WorkflowEngine,
        pub store: Arc<MemoryStore>,
        pub admin: Caller,
        pub doctor: Caller,
        pub surgeon: Caller,
    }

    async fn add_user(store: &MemoryStore, email: &str, role: UserRole) -> Caller {
        let user = store
            .insert_user(NewUser {
                email: email.to_string(),
                password_hash: "x".to_string(),
                first_name: "Иван".to_string(),
                last_name: "Петров".to_string(),
                middle_name: None,
                phone: None,
                role,
                district_id: Some(1),
            })
            .await
            .unwrap();
        Caller::staff(user.id, role)
    }

    pub(crate) async fn fixture() -> Fixture {
        let (engine, store) = test_engine();
        let admin = add_user(&store, "admin@oculus.local", UserRole::Admin).await;
        let doctor = add_user(&store, "doctor@oculus.local", UserRole::DistrictDoctor).await;
        let surgeon = add_user(&store, "surgeon@oculus.local", UserRole::Surgeon).await;
        Fixture {
            engine,
            store,
            admin,
            doctor,
            surgeon,
        }
    }

    pub(crate) fn intake(operation_type: OperationType) -> crate::lifecycle::NewCaseRequest {
        crate::lifecycle::NewCaseRequest {
            first_name: "Туяра".to_string(),
            last_name: "Алексеева".to_string(),
            middle_name: None,
            birth_date: None,
            phone: Some("+79140000000".to_string()),
            email: Some("tuyara@example.ru".to_string()),
            address: None,
            snils: None,
            oms_policy: None,
            diagnosis: Some("H25.1".to_string()),
            operation_type,
            eye: Eye::Od,
            district_id: Some(1),
            doctor_id: None,
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_same_status_transition_is_noop() {
        let f = fixture().await;
        let case = f
            .engine
            .create_case(&f.doctor, intake(OperationType::Phaco))
            .await
            .unwrap();
        let before = f.store.list_history(case.id).await.unwrap().len();

        let same = f
            .engine
            .apply_transition(&case, case.status, f.doctor.actor_id(), None, None)
            .await
            .unwrap();
        assert_eq!(same.status, case.status);
        assert_eq!(f.store.list_history(case.id).await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn test_stale_transition_is_rejected() {
        let f = fixture().await;
        let case = f
            .engine
            .create_case(&f.doctor, intake(OperationType::Phaco))
            .await
            .unwrap();
        assert_eq!(case.status, CaseStatus::Preparation);

        // 基于过期快照的并发取消
        let mut stale = case.clone();
        stale.status = CaseStatus::ReviewNeeded;
        let err = f
            .engine
            .apply_transition(&stale, CaseStatus::Approved, None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, OculusError::InvalidStateTransition { .. }));
        assert_eq!(f.engine.load_case(case.id).await.unwrap().status, CaseStatus::Preparation);
    }
}
