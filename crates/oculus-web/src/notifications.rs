//! 站内通知端点，只操作调用者自己的通知

use crate::auth::AuthUser;
use crate::handlers::{ok, paged, ApiPath, ApiQuery, ApiResult, PageParams};
use crate::state::AppState;
use axum::{extract::State, response::IntoResponse};
use serde_json::json;

pub async fn list_notifications(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiQuery(page): ApiQuery<PageParams>,
) -> ApiResult<impl IntoResponse> {
    Ok(paged(state.engine.list_notifications(&caller, page.into()).await?))
}

pub async fn mark_read(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<impl IntoResponse> {
    state.engine.mark_notification_read(&caller, id).await?;
    Ok(ok(json!({ "id": id, "is_read": true })))
}

pub async fn mark_all_read(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
) -> ApiResult<impl IntoResponse> {
    let updated = state.engine.mark_all_notifications_read(&caller).await?;
    Ok(ok(json!({ "updated": updated })))
}

pub async fn unread_count(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
) -> ApiResult<impl IntoResponse> {
    let count = state.engine.unread_notification_count(&caller).await?;
    Ok(ok(json!({ "count": count })))
}
