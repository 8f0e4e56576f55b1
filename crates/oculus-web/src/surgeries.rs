//! 手术预约端点

use crate::auth::AuthUser;
use crate::handlers::{created, ok, paged, ApiJson, ApiPath, ApiQuery, ApiResult, PageParams};
use crate::state::AppState;
use axum::{extract::State, response::IntoResponse};
use oculus_workflow::{ScheduleRequest, SurgeryPatch, SurgeryQuery};

pub async fn schedule_surgery(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiJson(request): ApiJson<ScheduleRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(created(state.engine.schedule(&caller, request).await?))
}

pub async fn list_surgeries(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiQuery(query): ApiQuery<SurgeryQuery>,
    ApiQuery(page): ApiQuery<PageParams>,
) -> ApiResult<impl IntoResponse> {
    Ok(paged(state.engine.list_surgeries(&caller, query, page.into()).await?))
}

pub async fn get_surgery(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.engine.get_surgery(&caller, id).await?))
}

pub async fn update_surgery(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(patch): ApiJson<SurgeryPatch>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.engine.update_surgery(&caller, id, patch).await?))
}
