//! Web服务器

use crate::audit::{audit_middleware, list_audit};
use crate::auth::{
    auth_middleware, login_handler, logout_handler, me_handler, patient_login_handler, refresh_handler,
};
use crate::handlers::{api_root, handle_timeout_error, health, metrics, metrics_middleware};
use crate::state::AppState;
use crate::{checklist, integrations, notifications, patients, surgeries, users};
use axum::{
    error_handling::HandleErrorLayer,
    extract::DefaultBodyLimit,
    http::HeaderValue,
    middleware,
    routing::{get, patch, post},
    Router,
};
use oculus_admin::ServerConfig;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tower::{timeout::TimeoutLayer, ServiceBuilder};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

pub struct WebServer {
    addr: String,
    app: Router,
}

impl WebServer {
    pub fn new(state: AppState, config: &ServerConfig) -> Self {
        Self {
            addr: config.bind_address(),
            app: create_app(state, config),
        }
    }

    /// 运行直到取消，已接受的请求处理完再返回
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        info!("Starting web server on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| anyhow::anyhow!("Web server failed: {}", e))?;

        info!("Web server stopped");
        Ok(())
    }
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if config.cors_allowed_origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {}", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

pub fn create_app(state: AppState, config: &ServerConfig) -> Router {
    Router::new()
        .route("/", get(api_root))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .nest("/api/v1", api_routes(state.clone()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(config))
                .layer(HandleErrorLayer::new(handle_timeout_error))
                .layer(TimeoutLayer::new(config.request_timeout()))
                .layer(middleware::from_fn_with_state(state.clone(), metrics_middleware)),
        )
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .with_state(state)
}

/// API v1 路由
fn api_routes(state: AppState) -> Router<AppState> {
    let public = Router::new()
        .route("/", get(api_root))
        .route("/health", get(health))
        .route("/auth/login", post(login_handler))
        .route("/auth/refresh", post(refresh_handler))
        .route("/auth/patient-login", post(patient_login_handler))
        .route("/patients/public/:code", get(patients::public_view));

    let protected = Router::new()
        .route("/auth/logout", post(logout_handler))
        .route("/auth/me", get(me_handler))
        .route(
            "/patients",
            post(patients::create_patient).get(patients::list_patients),
        )
        .route(
            "/patients/:id",
            get(patients::get_patient)
                .patch(patients::update_patient)
                .delete(patients::delete_patient),
        )
        .route("/patients/:id/status", post(patients::change_status))
        .route("/patients/:id/access-code", post(patients::regenerate_access_code))
        .route("/patients/:id/history", get(patients::patient_history))
        .route("/patients/:id/summary.pdf", get(patients::summary_pdf))
        .route(
            "/patients/:id/media",
            post(patients::upload_media).get(patients::list_media),
        )
        .route("/media/:id", get(patients::download_media))
        .route("/portal/case", get(patients::portal_case))
        .route("/checklist/patient/:id", get(checklist::list_checklist))
        .route("/checklist/patient/:id/progress", get(checklist::checklist_progress))
        .route("/checklist/items/:id", patch(checklist::update_item))
        .route("/checklist/items/:id/review", post(checklist::review_item))
        .route(
            "/surgeries",
            post(surgeries::schedule_surgery).get(surgeries::list_surgeries),
        )
        .route(
            "/surgeries/:id",
            get(surgeries::get_surgery).patch(surgeries::update_surgery),
        )
        .route("/notifications", get(notifications::list_notifications))
        .route("/notifications/read-all", post(notifications::mark_all_read))
        .route("/notifications/unread-count", get(notifications::unread_count))
        .route("/notifications/:id/read", post(notifications::mark_read))
        .route("/users", post(users::create_user).get(users::list_users))
        .route("/users/:id", get(users::get_user).patch(users::update_user))
        .route("/audit", get(list_audit))
        .route("/integrations/registries", get(integrations::list_registries))
        .route(
            "/integrations/registries/:name/cases/:id",
            post(integrations::submit_to_registry),
        )
        .route("/iol/calculate", post(integrations::calculate_iol))
        // 后添加的层先执行：先认证，再审计
        .route_layer(middleware::from_fn_with_state(state.clone(), audit_middleware))
        .route_layer(middleware::from_fn_with_state(state, auth_middleware));

    public.merge(protected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthService;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Method, Request, StatusCode},
    };
    use oculus_admin::{audit_channel, AuthConfig, Metrics};
    use oculus_core::models::UserRole;
    use oculus_core::query::Pagination;
    use oculus_database::{MemoryStore, NewUser, Store};
    use oculus_integration::RegistryHub;
    use oculus_storage::StorageManager;
    use oculus_workflow::WorkflowEngine;
    use serde_json::{json, Value};
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct TestApp {
        app: Router,
        store: Arc<MemoryStore>,
        doctor: String,
        surgeon: String,
        admin: String,
    }

    async fn user(store: &MemoryStore, auth: &AuthService, email: &str, role: UserRole) -> i64 {
        store
            .insert_user(NewUser {
                email: email.to_string(),
                password_hash: auth.hash_password("password-123").unwrap(),
                first_name: "Айсен".into(),
                last_name: "Николаев".into(),
                middle_name: None,
                phone: None,
                role,
                district_id: Some(1),
            })
            .await
            .unwrap()
            .id
    }

    async fn test_app() -> TestApp {
        let store = Arc::new(MemoryStore::new());
        let metrics = Metrics::new().unwrap();
        let engine = WorkflowEngine::new(store.clone(), StorageManager::in_memory(), metrics.clone());
        let auth = Arc::new(AuthService::new(&AuthConfig::default(), store.clone()).with_bcrypt_cost(4));
        let (audit, persister) = audit_channel(64, store.clone(), metrics);
        tokio::spawn(persister.run());

        let doctor_id = user(&store, &auth, "doctor@oculus.local", UserRole::DistrictDoctor).await;
        let surgeon_id = user(&store, &auth, "surgeon@oculus.local", UserRole::Surgeon).await;
        let admin_id = user(&store, &auth, "admin@oculus.local", UserRole::Admin).await;
        let token = |id, role| auth.issue(id, role, None).unwrap().access_token;
        let doctor = token(doctor_id, UserRole::DistrictDoctor);
        let surgeon = token(surgeon_id, UserRole::Surgeon);
        let admin = token(admin_id, UserRole::Admin);

        let state = AppState {
            engine,
            auth,
            audit,
            registries: Arc::new(RegistryHub::from_config(&Default::default()).unwrap()),
            max_body_bytes: 1024 * 1024,
        };
        TestApp {
            app: create_app(state, &ServerConfig::default()),
            store,
            doctor,
            surgeon,
            admin,
        }
    }

    impl TestApp {
        async fn call(&self, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
            let mut builder = Request::builder().method(method).uri(uri);
            if let Some(token) = token {
                builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
            }
            let request = match body {
                Some(body) => builder
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };
            let response = self.app.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            (status, value)
        }

        async fn intake(&self, first_name: &str) -> Value {
            let (status, body) = self
                .call(
                    Method::POST,
                    "/api/v1/patients",
                    Some(&self.doctor),
                    Some(json!({
                        "first_name": first_name,
                        "last_name": "Алексеева",
                        "operation_type": "PHACOEMULSIFICATION",
                        "eye": "OD",
                        "district_id": 1
                    })),
                )
                .await;
            assert_eq!(status, StatusCode::CREATED, "{}", body);
            body["data"].clone()
        }

        /// 完成全部必填项，返回第一个必填项的id
        async fn complete_required(&self, case_id: i64) -> i64 {
            let (_, checklist) = self
                .call(Method::GET, &format!("/api/v1/checklist/patient/{}", case_id), Some(&self.doctor), None)
                .await;
            let required: Vec<i64> = checklist["data"]
                .as_array()
                .unwrap()
                .iter()
                .filter(|item| item["is_required"] == json!(true))
                .map(|item| item["id"].as_i64().unwrap())
                .collect();
            assert_eq!(required.len(), 11);
            for id in &required {
                let (status, body) = self
                    .call(
                        Method::PATCH,
                        &format!("/api/v1/checklist/items/{}", id),
                        Some(&self.doctor),
                        Some(json!({ "status": "COMPLETED", "result": "норма" })),
                    )
                    .await;
                assert_eq!(status, StatusCode::OK, "{}", body);
            }
            required[0]
        }
    }

    fn transitions(history: &Value) -> Vec<(Value, Value)> {
        history["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|h| (h["from_status"].clone(), h["to_status"].clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_intake_moves_case_to_preparation() {
        let t = test_app().await;
        let case = t.intake("Туяра").await;
        assert_eq!(case["status"], "PREPARATION");
        let code = case["access_code"].as_str().unwrap();
        assert_eq!(code.len(), 8);
        assert!(code.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        let id = case["id"].as_i64().unwrap();
        let (_, checklist) = t
            .call(Method::GET, &format!("/api/v1/checklist/patient/{}", id), Some(&t.doctor), None)
            .await;
        assert!(checklist["data"].as_array().unwrap().len() >= 14);

        let (_, history) = t
            .call(Method::GET, &format!("/api/v1/patients/{}/history", id), Some(&t.doctor), None)
            .await;
        assert_eq!(
            transitions(&history),
            vec![
                (Value::Null, json!("NEW")),
                (json!("NEW"), json!("PREPARATION")),
            ]
        );
    }

    #[tokio::test]
    async fn test_readiness_flip_and_scheduling() {
        let t = test_app().await;
        let case = t.intake("Туяра").await;
        let id = case["id"].as_i64().unwrap();
        let first_required = t.complete_required(id).await;

        let (_, detail) = t
            .call(Method::GET, &format!("/api/v1/patients/{}", id), Some(&t.doctor), None)
            .await;
        assert_eq!(detail["data"]["case"]["status"], "REVIEW_NEEDED");
        assert_eq!(detail["data"]["progress"]["ready"], true);
        let (_, history) = t
            .call(Method::GET, &format!("/api/v1/patients/{}/history", id), Some(&t.doctor), None)
            .await;
        let flips = transitions(&history)
            .into_iter()
            .filter(|(from, to)| from == "PREPARATION" && to == "REVIEW_NEEDED")
            .count();
        assert_eq!(flips, 1);

        // 驳回一个必填项后预约被拒绝
        let (status, _) = t
            .call(
                Method::POST,
                &format!("/api/v1/checklist/items/{}/review", first_required),
                Some(&t.surgeon),
                Some(json!({ "status": "REJECTED", "review_note": "повторить анализ" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let schedule = json!({ "patient_id": id, "scheduled_date": "2025-06-01" });
        let (status, body) = t
            .call(Method::POST, "/api/v1/surgeries", Some(&t.surgeon), Some(schedule.clone()))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        let (_, surgeries) = t.call(Method::GET, "/api/v1/surgeries", Some(&t.admin), None).await;
        assert_eq!(surgeries["meta"]["total"], 0);
        let (_, detail) = t
            .call(Method::GET, &format!("/api/v1/patients/{}", id), Some(&t.doctor), None)
            .await;
        assert_eq!(detail["data"]["case"]["status"], "REVIEW_NEEDED");

        // 确认该项并批准病例后预约成功
        let (status, _) = t
            .call(
                Method::POST,
                &format!("/api/v1/checklist/items/{}/review", first_required),
                Some(&t.surgeon),
                Some(json!({ "status": "COMPLETED" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = t
            .call(
                Method::POST,
                &format!("/api/v1/patients/{}/status", id),
                Some(&t.surgeon),
                Some(json!({ "status": "APPROVED", "comment": "годен" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);

        let (status, body) = t
            .call(Method::POST, "/api/v1/surgeries", Some(&t.surgeon), Some(schedule))
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        assert_eq!(body["data"]["status"], "SCHEDULED");
        let (_, detail) = t
            .call(Method::GET, &format!("/api/v1/patients/{}", id), Some(&t.doctor), None)
            .await;
        let case = &detail["data"]["case"];
        assert_eq!(case["status"], "SURGERY_SCHEDULED");
        assert_eq!(case["surgery_date"], "2025-06-01");
        assert!(case["surgeon_id"].is_i64());
    }

    #[tokio::test]
    async fn test_public_view_exposes_only_projection() {
        let t = test_app().await;
        let case = t.intake("Туяра").await;
        let code = case["access_code"].as_str().unwrap();

        let (status, body) = t
            .call(Method::GET, &format!("/api/v1/patients/public/{}", code), None, None)
            .await;
        assert_eq!(status, StatusCode::OK);
        let keys: BTreeSet<&str> = body["data"].as_object().unwrap().keys().map(String::as_str).collect();
        let expected: BTreeSet<&str> = [
            "access_code",
            "first_name",
            "last_name",
            "status",
            "surgery_date",
            "status_history",
        ]
        .into_iter()
        .collect();
        assert_eq!(keys, expected);

        let (status, _) = t
            .call(Method::GET, "/api/v1/patients/public/ffffffff", None, None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_surgeon_list_is_scoped() {
        let t = test_app().await;
        let ready = t.intake("Сардана").await;
        let ready_id = ready["id"].as_i64().unwrap();
        t.complete_required(ready_id).await;
        let preparing = t.intake("Туяра").await;

        let (status, body) = t.call(Method::GET, "/api/v1/patients", Some(&t.surgeon), None).await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<i64> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![ready_id]);
        assert!(!ids.contains(&preparing["id"].as_i64().unwrap()));

        let (_, body) = t.call(Method::GET, "/api/v1/patients", Some(&t.doctor), None).await;
        assert_eq!(body["meta"]["total"], 2);
    }

    #[tokio::test]
    async fn test_authentication_and_roles() {
        let t = test_app().await;
        let (status, body) = t.call(Method::GET, "/api/v1/patients", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);

        let (status, _) = t.call(Method::GET, "/api/v1/users", Some(&t.doctor), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = t
            .call(
                Method::POST,
                "/api/v1/auth/login",
                None,
                Some(json!({ "email": "admin@oculus.local", "password": "password-123" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let token = body["data"]["access_token"].as_str().unwrap().to_string();
        assert!(body["data"]["user"].get("password_hash").is_none());

        let (status, body) = t
            .call(
                Method::POST,
                "/api/v1/users",
                Some(&token),
                Some(json!({
                    "email": "doctor@oculus.local",
                    "password": "password-123",
                    "first_name": "Дубль",
                    "last_name": "Дублев",
                    "role": "DISTRICT_DOCTOR"
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT, "{}", body);
    }

    #[tokio::test]
    async fn test_patient_login_and_portal() {
        let t = test_app().await;
        let case = t.intake("Туяра").await;
        let code = case["access_code"].as_str().unwrap().to_uppercase();

        let (status, body) = t
            .call(Method::POST, "/api/v1/auth/patient-login", None, Some(json!({ "access_code": code })))
            .await;
        assert_eq!(status, StatusCode::OK);
        let token = body["data"]["access_token"].as_str().unwrap().to_string();

        let (status, body) = t.call(Method::GET, "/api/v1/portal/case", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["case"]["id"], case["id"]);

        let (status, _) = t.call(Method::GET, "/api/v1/surgeries", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = t.call(Method::GET, "/api/v1/audit", Some(&token), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = t
            .call(Method::POST, "/api/v1/auth/patient-login", None, Some(json!({ "access_code": "00000000" })))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_regenerated_code_revokes_patient_tokens() {
        let t = test_app().await;
        let case = t.intake("Туяра").await;
        let id = case["id"].as_i64().unwrap();
        let (_, body) = t
            .call(
                Method::POST,
                "/api/v1/auth/patient-login",
                None,
                Some(json!({ "access_code": case["access_code"] })),
            )
            .await;
        let access = body["data"]["access_token"].as_str().unwrap().to_string();
        let refresh = body["data"]["refresh_token"].as_str().unwrap().to_string();

        let (status, _) = t
            .call(Method::POST, &format!("/api/v1/patients/{}/access-code", id), Some(&t.doctor), None)
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = t.call(Method::GET, "/api/v1/portal/case", Some(&access), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        let (status, _) = t
            .call(Method::POST, "/api/v1/auth/refresh", None, Some(json!({ "refresh_token": refresh })))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_bad_path_and_page_use_envelope() {
        let t = test_app().await;
        let (status, body) = t.call(Method::GET, "/api/v1/patients/abc", Some(&t.doctor), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].is_string());

        t.intake("Туяра").await;
        let (status, body) = t
            .call(Method::GET, &format!("/api/v1/patients?page={}", i64::MAX), Some(&t.admin), None)
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["data"], json!([]));
        assert_eq!(body["meta"]["total"], 1);
    }

    #[tokio::test]
    async fn test_case_summary_pdf() {
        let t = test_app().await;
        let case = t.intake("Туяра").await;
        let request = Request::builder()
            .uri(format!("/api/v1/patients/{}/summary.pdf", case["id"]))
            .header(header::AUTHORIZATION, format!("Bearer {}", t.doctor))
            .body(Body::empty())
            .unwrap();
        let response = t.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/pdf");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(bytes.starts_with(b"%PDF-1.4"));

        let (status, _) = t
            .call(Method::GET, &format!("/api/v1/patients/{}/summary.pdf", case["id"]), Some(&t.surgeon), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_timeout_uses_envelope() {
        let app: Router = Router::new()
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    "late"
                }),
            )
            .layer(
                ServiceBuilder::new()
                    .layer(HandleErrorLayer::new(handle_timeout_error))
                    .layer(TimeoutLayer::new(std::time::Duration::from_millis(20))),
            );
        let response = app
            .oneshot(Request::builder().uri("/slow").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_mutations_are_audited() {
        let t = test_app().await;
        let case = t.intake("Туяра").await;

        let mut entries = Vec::new();
        for _ in 0..50 {
            entries = t.store.list_audit(Some("patients".into()), Pagination::default()).await.unwrap().items;
            if !entries.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].new_value.as_ref().unwrap()["first_name"], "Туяра");
        assert!(entries[0].user_id.is_some());
        assert!(case["id"].is_i64());

        // 失败的请求与登录请求不记录
        t.call(Method::POST, "/api/v1/auth/login", None, Some(json!({ "email": "x@y.z", "password": "nope" })))
            .await;
        let total = t.store.list_audit(None, Pagination::default()).await.unwrap().total;
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let t = test_app().await;
        let (status, body) = t.call(Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "healthy");

        let response = t
            .app
            .clone()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&text).contains("oculus_http_requests_total"));
    }
}
