//! 外部登记系统与IOL计算端点

use crate::auth::AuthUser;
use crate::handlers::{ok, ApiJson, ApiPath, ApiResult};
use crate::state::AppState;
use axum::{extract::State, response::IntoResponse};
use oculus_core::models::UserRole;
use oculus_workflow::iol::{calculate, formula_by_name};
use oculus_workflow::IolInput;
use serde::Deserialize;

const STAFF: &[UserRole] = &[
    UserRole::Admin,
    UserRole::Surgeon,
    UserRole::DistrictDoctor,
    UserRole::CallCenter,
];

pub async fn list_registries(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
) -> ApiResult<impl IntoResponse> {
    caller.require_role(STAFF)?;
    Ok(ok(state.registries.list()))
}

/// 提交病例到指定登记系统，需要修改病例的权限
pub async fn submit_to_registry(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiPath((registry, case_id)): ApiPath<(String, i64)>,
) -> ApiResult<impl IntoResponse> {
    let detail = state.engine.get_case_detail(&caller, case_id).await?;
    caller.ensure_can_mutate(&detail.case)?;
    Ok(ok(state.registries.submit(&registry, &detail.case).await?))
}

#[derive(Debug, Deserialize)]
pub struct IolRequest {
    #[serde(flatten)]
    pub input: IolInput,
    pub formula: Option<String>,
}

pub async fn calculate_iol(
    AuthUser(caller): AuthUser,
    ApiJson(request): ApiJson<IolRequest>,
) -> ApiResult<impl IntoResponse> {
    caller.require_role(STAFF)?;
    let formula = formula_by_name(request.formula.as_deref())?;
    Ok(ok(calculate(formula.as_ref(), request.input)?))
}
