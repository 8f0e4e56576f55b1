//! HTTP处理器公共部分：响应包装、错误映射、请求提取器和运维端点
//!
//! 所有响应统一为 `{success, data?, error?, meta?}`。

use crate::state::AppState;
use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, FromRequestParts, Path, Query, Request, State},
    http::{header, request::Parts, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use oculus_core::error::ErrorKind;
use oculus_core::query::{Page, Pagination};
use oculus_core::OculusError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::timeout::error::Elapsed;
use tower::BoxError;
use tracing::{error, warn};

/// 列表分页信息
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PageMeta {
    pub page: i64,
    pub limit: i64,
    pub total: i64,
    pub total_pages: i64,
}

/// 统一响应包装
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<PageMeta>,
}

pub fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data: Some(data),
        error: None,
        meta: None,
    })
}

pub fn created<T: Serialize>(data: T) -> (StatusCode, Json<ApiResponse<T>>) {
    (StatusCode::CREATED, ok(data))
}

pub fn paged<T: Serialize>(page: Page<T>) -> Json<ApiResponse<Vec<T>>> {
    let meta = PageMeta {
        page: page.pagination.page,
        limit: page.pagination.limit,
        total: page.total,
        total_pages: page.total_pages(),
    };
    Json(ApiResponse {
        success: true,
        data: Some(page.items),
        error: None,
        meta: Some(meta),
    })
}

/// 处理器错误，按错误类别映射HTTP状态码
#[derive(Debug)]
pub struct ApiError(pub OculusError);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<OculusError> for ApiError {
    fn from(e: OculusError) -> Self {
        Self(e)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::BadInput | ErrorKind::InvalidTransition | ErrorKind::NotReady => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::DependencyFailure => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.kind());
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.0.to_string()),
            meta: None,
        };
        (status, Json(body)).into_response()
    }
}

/// JSON请求体提取器，解析失败返回统一的400响应
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(json_rejection(rejection)),
        }
    }
}

fn json_rejection(rejection: JsonRejection) -> ApiError {
    OculusError::Validation(format!("请求体无效: {}", rejection.body_text())).into()
}

/// 查询参数提取器
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiQuery<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(Self(value)),
            Err(rejection) => Err(OculusError::Validation(format!(
                "查询参数无效: {}",
                rejection.body_text()
            ))
            .into()),
        }
    }
}

/// 路径参数提取器，非法id返回统一的400响应
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiPath<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for ApiPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Path::<T>::from_request_parts(parts, state).await {
            Ok(Path(value)) => Ok(Self(value)),
            Err(rejection) => Err(OculusError::Validation(format!(
                "路径参数无效: {}",
                rejection.body_text()
            ))
            .into()),
        }
    }
}

/// 分页参数 `page`、`limit`
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PageParams {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

impl From<PageParams> for Pagination {
    fn from(params: PageParams) -> Self {
        Pagination::new(params.page, params.limit)
    }
}

/// 请求超时与中间件错误的统一响应
pub async fn handle_timeout_error(err: BoxError) -> Response {
    let (status, message) = if err.is::<Elapsed>() {
        warn!("Request exceeded deadline");
        (StatusCode::REQUEST_TIMEOUT, "请求超时".to_string())
    } else {
        error!("Unhandled middleware error: {}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, format!("内部错误: {}", err))
    };
    let body = ApiResponse::<()> {
        success: false,
        data: None,
        error: Some(message),
        meta: None,
    };
    (status, Json(body)).into_response()
}

/// 按状态码类别计数HTTP请求
pub async fn metrics_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let response = next.run(request).await;
    state.metrics().record_http(response.status().as_u16());
    response
}

/// API根路径
pub async fn api_root() -> impl IntoResponse {
    ok(json!({
        "service": "Oculus pre-operative workflow API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "health": "/health",
            "metrics": "/metrics",
            "api": "/api/v1"
        }
    }))
}

/// 健康检查
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    ok(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "storage": state.engine.storage().backend(),
    }))
}

/// Prometheus文本格式指标
pub async fn metrics(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let body = state.metrics().render()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
