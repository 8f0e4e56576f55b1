//! 病例（患者）端点

use crate::auth::AuthUser;
use crate::handlers::{created, ok, paged, ApiJson, ApiPath, ApiQuery, ApiResult, PageParams};
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap},
    response::IntoResponse,
};
use oculus_core::models::CaseStatus;
use oculus_database::CaseUpdate;
use oculus_workflow::{CaseQuery, MediaUpload, NewCaseRequest};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct StatusChangeRequest {
    pub status: CaseStatus,
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub file_name: String,
}

pub async fn create_patient(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiJson(request): ApiJson<NewCaseRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(created(state.engine.create_case(&caller, request).await?))
}

pub async fn list_patients(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiQuery(query): ApiQuery<CaseQuery>,
    ApiQuery(page): ApiQuery<PageParams>,
) -> ApiResult<impl IntoResponse> {
    Ok(paged(state.engine.list_cases(&caller, query, page.into()).await?))
}

pub async fn get_patient(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.engine.get_case_detail(&caller, id).await?))
}

pub async fn update_patient(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(update): ApiJson<CaseUpdate>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.engine.update_case(&caller, id, update).await?))
}

pub async fn delete_patient(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<impl IntoResponse> {
    state.engine.delete_case(&caller, id).await?;
    Ok(ok(serde_json::json!({ "id": id, "deleted": true })))
}

pub async fn change_status(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(request): ApiJson<StatusChangeRequest>,
) -> ApiResult<impl IntoResponse> {
    let case = state
        .engine
        .change_status(&caller, id, request.status, request.comment)
        .await?;
    Ok(ok(case))
}

pub async fn regenerate_access_code(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.engine.regenerate_access_code(&caller, id).await?))
}

pub async fn patient_history(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.engine.case_history(&caller, id).await?))
}

/// 公开状态视图，无需认证
pub async fn public_view(
    State(state): State<AppState>,
    ApiPath(code): ApiPath<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.engine.public_view(&code).await?))
}

/// 原始请求体上传，文件名取自 `?file_name=`
pub async fn upload_media(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiPath(id): ApiPath<i64>,
    ApiQuery(params): ApiQuery<UploadParams>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let upload = MediaUpload {
        file_name: params.file_name,
        content_type,
        data: body,
    };
    Ok(created(state.engine.upload_media(&caller, id, upload).await?))
}

pub async fn list_media(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.engine.list_media(&caller, id).await?))
}

/// 下载文件内容
pub async fn download_media(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<impl IntoResponse> {
    let (media, data) = state.engine.download_media(&caller, id).await?;
    let disposition = format!("attachment; filename=\"{}\"", media.file_name.replace('"', ""));
    Ok((
        [
            (header::CONTENT_TYPE, media.content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        data,
    ))
}

/// 病例摘要PDF
pub async fn summary_pdf(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<impl IntoResponse> {
    let pdf = state.engine.case_summary_pdf(&caller, id).await?;
    let disposition = format!("inline; filename=\"case-{}-summary.pdf\"", id);
    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        pdf,
    ))
}

/// 患者门户：令牌绑定的病例全貌
pub async fn portal_case(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.engine.portal_view(&caller).await?))
}
