//! 审计中间件与审计查询
//!
//! 对认证后的变更请求（POST/PUT/PATCH/DELETE），在响应为2xx时记录
//! 操作者、动作、实体、实体id、请求体和客户端IP。入队失败不影响请求结果。

use crate::auth::AuthUser;
use crate::handlers::{paged, ApiQuery, ApiResult, PageParams};
use crate::state::AppState;
use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, OriginalUri, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use oculus_core::models::{AuditAction, UserRole};
use oculus_database::NewAuditEntry;
use oculus_workflow::Caller;
use serde::Deserialize;
use std::net::SocketAddr;
use tracing::warn;

/// 从路径中取实体名和实体id
///
/// `/api/v1/patients/12/status` → `("patients", Some(12))`
pub fn entity_from_path(path: &str) -> Option<(String, Option<i64>)> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let entity = segments.get(2)?;
    let entity_id = segments[3..].iter().find_map(|s| s.parse::<i64>().ok());
    Some((entity.to_string(), entity_id))
}

fn client_ip(headers: &HeaderMap, connect: Option<&ConnectInfo<SocketAddr>>) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| connect.map(|c| c.0.ip().to_string()))
}

pub async fn audit_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(action) = AuditAction::from_method(request.method().as_str()) else {
        return next.run(request).await;
    };
    let path = request
        .extensions()
        .get::<OriginalUri>()
        .map(|uri| uri.0.path().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let target = entity_from_path(&path).filter(|(entity, _)| entity != "auth");
    let caller = request.extensions().get::<Caller>().copied();
    let (Some((entity, entity_id)), Some(caller)) = (target, caller) else {
        return next.run(request).await;
    };
    let ip = client_ip(request.headers(), request.extensions().get::<ConnectInfo<SocketAddr>>());

    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Failed to buffer request body of {}: {}", path, e);
            return (
                axum::http::StatusCode::PAYLOAD_TOO_LARGE,
                axum::Json(serde_json::json!({ "success": false, "error": "请求体过大" })),
            )
                .into_response();
        }
    };
    let new_value = serde_json::from_slice::<serde_json::Value>(&bytes).ok();
    let response = next.run(Request::from_parts(parts, Body::from(bytes))).await;

    if response.status().is_success() {
        state.audit.log(NewAuditEntry {
            user_id: caller.actor_id(),
            action,
            entity,
            entity_id,
            old_value: None,
            new_value,
            ip,
        });
    }
    response
}

#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    pub entity: Option<String>,
}

/// 审计记录，新记录在前（仅管理员）
pub async fn list_audit(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiQuery(query): ApiQuery<AuditQuery>,
    ApiQuery(page): ApiQuery<PageParams>,
) -> ApiResult<impl IntoResponse> {
    caller.require_role(&[UserRole::Admin])?;
    let entries = state
        .engine
        .store()
        .list_audit(query.entity, page.into())
        .await?;
    Ok(paged(entries))
}
