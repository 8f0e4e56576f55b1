//! 检查清单端点

use crate::auth::AuthUser;
use crate::handlers::{ok, ApiJson, ApiPath, ApiResult};
use crate::state::AppState;
use axum::{extract::State, response::IntoResponse};
use oculus_workflow::{ChecklistPatch, ItemReview};

pub async fn list_checklist(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiPath(case_id): ApiPath<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.engine.list_checklist(&caller, case_id).await?))
}

pub async fn checklist_progress(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiPath(case_id): ApiPath<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.engine.checklist_progress(&caller, case_id).await?))
}

pub async fn update_item(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiPath(item_id): ApiPath<i64>,
    ApiJson(patch): ApiJson<ChecklistPatch>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.engine.update_item(&caller, item_id, patch).await?))
}

pub async fn review_item(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiPath(item_id): ApiPath<i64>,
    ApiJson(review): ApiJson<ItemReview>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.engine.review_item(&caller, item_id, review).await?))
}
