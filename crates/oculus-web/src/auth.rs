//! 用户认证和授权
//!
//! 访问令牌与刷新令牌都是HS256签名的JWT，使用不同的密钥。
//! 职员令牌携带用户id，患者令牌携带访问码换取的病例id和访问码摘要，
//! 重新生成访问码后旧的患者令牌随即失效。
//! 每次请求都会重新读取用户，停用的账户立即失效。

use crate::handlers::{ok, ApiError, ApiJson, ApiResult};
use crate::state::AppState;
use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use oculus_admin::AuthConfig;
use oculus_core::models::{PatientCase, User, UserRole};
use oculus_core::{OculusError, Result};
use oculus_database::{NewUser, Store};
use oculus_workflow::{Caller, WorkflowEngine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};

/// 密码最短长度
pub const MIN_PASSWORD_LEN: usize = 8;

/// 令牌类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

/// JWT Claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: i64,
    pub role: UserRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_id: Option<i64>,
    /// 患者令牌签发时访问码的摘要
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_tag: Option<String>,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    pub exp: usize,
    pub iat: usize,
}

/// 令牌对
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    /// 访问令牌有效期（秒）
    pub expires_in: i64,
}

/// 登录请求
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    #[serde(flatten)]
    pub tokens: TokenPair,
    pub user: User,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct PatientLoginRequest {
    pub access_code: String,
}

#[derive(Debug, Serialize)]
pub struct PatientLoginResponse {
    #[serde(flatten)]
    pub tokens: TokenPair,
    pub case_id: i64,
}

/// 认证服务
pub struct AuthService {
    store: Arc<dyn Store>,
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
    bcrypt_cost: u32,
}

impl std::fmt::Debug for AuthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthService")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish_non_exhaustive()
    }
}

fn unauthenticated(message: &str) -> OculusError {
    OculusError::Unauthenticated(message.to_string())
}

/// 访问码摘要，令牌里不出现访问码本身
fn code_tag(access_code: &str) -> String {
    let digest = Sha256::digest(access_code.as_bytes());
    digest.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}

impl AuthService {
    pub fn new(config: &AuthConfig, store: Arc<dyn Store>) -> Self {
        Self {
            store,
            access_encoding: EncodingKey::from_secret(config.access_secret.as_bytes()),
            access_decoding: DecodingKey::from_secret(config.access_secret.as_bytes()),
            refresh_encoding: EncodingKey::from_secret(config.refresh_secret.as_bytes()),
            refresh_decoding: DecodingKey::from_secret(config.refresh_secret.as_bytes()),
            access_ttl: Duration::minutes(config.access_ttl_minutes),
            refresh_ttl: Duration::hours(config.refresh_ttl_hours),
            bcrypt_cost: config.bcrypt_cost,
        }
    }

    /// 覆盖配置中的bcrypt代价
    pub fn with_bcrypt_cost(mut self, cost: u32) -> Self {
        self.bcrypt_cost = cost;
        self
    }

    pub fn hash_password(&self, password: &str) -> Result<String> {
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(OculusError::Validation(format!(
                "密码长度不能少于 {} 个字符",
                MIN_PASSWORD_LEN
            )));
        }
        bcrypt::hash(password, self.bcrypt_cost)
            .map_err(|e| OculusError::Internal(format!("密码哈希失败: {}", e)))
    }

    fn sign(&self, claims: &Claims) -> Result<String> {
        let key = match claims.token_type {
            TokenType::Access => &self.access_encoding,
            TokenType::Refresh => &self.refresh_encoding,
        };
        encode(&Header::new(Algorithm::HS256), claims, key)
            .map_err(|e| OculusError::Internal(format!("令牌签名失败: {}", e)))
    }

    /// 签发职员令牌对
    pub fn issue(&self, user_id: i64, role: UserRole, case_id: Option<i64>) -> Result<TokenPair> {
        self.issue_with(user_id, role, case_id, None)
    }

    /// 签发绑定病例当前访问码的患者令牌对
    pub fn issue_patient(&self, case: &PatientCase) -> Result<TokenPair> {
        self.issue_with(0, UserRole::Patient, Some(case.id), Some(code_tag(&case.access_code)))
    }

    fn issue_with(
        &self,
        user_id: i64,
        role: UserRole,
        case_id: Option<i64>,
        code_tag: Option<String>,
    ) -> Result<TokenPair> {
        let now = Utc::now();
        let claims = |token_type, ttl: Duration| Claims {
            user_id,
            role,
            case_id,
            code_tag: code_tag.clone(),
            token_type,
            exp: (now + ttl).timestamp() as usize,
            iat: now.timestamp() as usize,
        };
        Ok(TokenPair {
            access_token: self.sign(&claims(TokenType::Access, self.access_ttl))?,
            refresh_token: self.sign(&claims(TokenType::Refresh, self.refresh_ttl))?,
            token_type: "Bearer",
            expires_in: self.access_ttl.num_seconds(),
        })
    }

    /// 校验签名、有效期和令牌类型
    pub fn decode(&self, token: &str, expected: TokenType) -> Result<Claims> {
        let key = match expected {
            TokenType::Access => &self.access_decoding,
            TokenType::Refresh => &self.refresh_decoding,
        };
        let claims = decode::<Claims>(token, key, &Validation::new(Algorithm::HS256))
            .map_err(|e| OculusError::Unauthenticated(format!("令牌无效: {}", e)))?
            .claims;
        if claims.token_type != expected {
            return Err(unauthenticated("令牌类型错误"));
        }
        Ok(claims)
    }

    /// 患者令牌对应的病例，访问码已更换时拒绝
    async fn patient_case(&self, claims: &Claims) -> Result<PatientCase> {
        let case_id = claims.case_id.ok_or_else(|| unauthenticated("令牌缺少病例"))?;
        let case = self
            .store
            .get_case(case_id)
            .await?
            .ok_or_else(|| unauthenticated("病例不存在"))?;
        if claims.code_tag.as_deref() != Some(code_tag(&case.access_code).as_str()) {
            return Err(unauthenticated("访问码已更换"));
        }
        Ok(case)
    }

    async fn active_user(&self, id: i64) -> Result<User> {
        match self.store.get_user(id).await? {
            Some(user) if user.is_active => Ok(user),
            Some(_) => Err(unauthenticated("账户已停用")),
            None => Err(unauthenticated("用户不存在")),
        }
    }

    pub async fn login(&self, request: LoginRequest) -> Result<LoginResponse> {
        let email = request.email.trim().to_ascii_lowercase();
        let user = self
            .store
            .get_user_by_email(&email)
            .await?
            .ok_or_else(|| unauthenticated("邮箱或密码错误"))?;
        if !bcrypt::verify(&request.password, &user.password_hash).unwrap_or(false) {
            return Err(unauthenticated("邮箱或密码错误"));
        }
        if !user.is_active {
            return Err(unauthenticated("账户已停用"));
        }

        let tokens = self.issue(user.id, user.role, None)?;
        self.store
            .set_refresh_token(user.id, Some(tokens.refresh_token.clone()))
            .await?;
        info!("User {} logged in as {}", user.id, user.role);
        Ok(LoginResponse { tokens, user })
    }

    /// 用刷新令牌换取新的令牌对；职员的刷新令牌只能使用一次
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let claims = self.decode(refresh_token, TokenType::Refresh)?;
        if claims.role == UserRole::Patient {
            let case = self.patient_case(&claims).await?;
            return self.issue_patient(&case);
        }

        let user = self.active_user(claims.user_id).await?;
        if user.refresh_token.as_deref() != Some(refresh_token) {
            return Err(unauthenticated("刷新令牌已失效"));
        }
        let tokens = self.issue(user.id, user.role, None)?;
        self.store
            .set_refresh_token(user.id, Some(tokens.refresh_token.clone()))
            .await?;
        Ok(tokens)
    }

    pub async fn logout(&self, caller: &Caller) -> Result<()> {
        if let Some(user_id) = caller.actor_id() {
            self.store.set_refresh_token(user_id, None).await?;
        }
        Ok(())
    }

    /// 访问码换取患者令牌
    pub async fn patient_login(&self, engine: &WorkflowEngine, access_code: &str) -> Result<PatientLoginResponse> {
        let case = engine.resolve_access_code(access_code).await.map_err(|e| match e {
            OculusError::NotFound(_) => unauthenticated("访问码无效"),
            other => other,
        })?;
        let tokens = self.issue_patient(&case)?;
        info!("Patient logged in for case {}", case.id);
        Ok(PatientLoginResponse {
            tokens,
            case_id: case.id,
        })
    }

    /// 把访问令牌解析为调用者身份
    pub async fn authenticate(&self, token: &str) -> Result<Caller> {
        let claims = self.decode(token, TokenType::Access)?;
        if claims.role == UserRole::Patient {
            let case = self.patient_case(&claims).await?;
            return Ok(Caller::patient(case.id));
        }
        let user = self.active_user(claims.user_id).await?;
        Ok(Caller::staff(user.id, user.role))
    }

    /// 用户表为空时按配置创建初始管理员
    pub async fn bootstrap_admin(&self, config: &AuthConfig) -> Result<Option<User>> {
        let (Some(email), Some(password)) = (
            config.bootstrap_admin_email.as_deref(),
            config.bootstrap_admin_password.as_deref(),
        ) else {
            return Ok(None);
        };
        if self.store.count_users().await? > 0 {
            return Ok(None);
        }
        let admin = self
            .store
            .insert_user(NewUser {
                email: email.trim().to_ascii_lowercase(),
                password_hash: self.hash_password(password)?,
                first_name: "Администратор".to_string(),
                last_name: "Системный".to_string(),
                middle_name: None,
                phone: None,
                role: UserRole::Admin,
                district_id: None,
            })
            .await?;
        info!("Bootstrap administrator {} created", admin.email);
        Ok(Some(admin))
    }
}

/// 认证中间件：校验Bearer令牌并把调用者身份放入请求扩展
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> std::result::Result<Response, ApiError> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .ok_or_else(|| unauthenticated("缺少访问令牌"))?;

    match state.auth.authenticate(&token).await {
        Ok(caller) => {
            request.extensions_mut().insert(caller);
            Ok(next.run(request).await)
        }
        Err(e) => {
            warn!("Rejected token for {}: {}", request.uri().path(), e);
            Err(e.into())
        }
    }
}

/// 已认证的调用者
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub Caller);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> std::result::Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Caller>()
            .copied()
            .map(AuthUser)
            .ok_or_else(|| unauthenticated("未认证").into())
    }
}

pub async fn login_handler(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<LoginRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.auth.login(request).await?))
}

pub async fn refresh_handler(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<RefreshRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.auth.refresh(&request.refresh_token).await?))
}

pub async fn logout_handler(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
) -> ApiResult<impl IntoResponse> {
    state.auth.logout(&caller).await?;
    Ok(ok(serde_json::json!({ "logged_out": true })))
}

pub async fn patient_login_handler(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<PatientLoginRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.auth.patient_login(&state.engine, &request.access_code).await?))
}

/// 当前用户；患者令牌只返回角色与病例id
pub async fn me_handler(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
) -> ApiResult<impl IntoResponse> {
    let body = match caller.actor_id() {
        Some(user_id) => serde_json::to_value(state.auth.active_user(user_id).await?)
            .map_err(OculusError::from)?,
        None => serde_json::json!({ "role": caller.role, "case_id": caller.case_id }),
    };
    Ok(ok(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use oculus_database::MemoryStore;

    fn service(store: Arc<MemoryStore>) -> AuthService {
        AuthService::new(&AuthConfig::default(), store).with_bcrypt_cost(4)
    }

    async fn insert_user(auth: &AuthService, store: &MemoryStore, email: &str, role: UserRole) -> User {
        store
            .insert_user(NewUser {
                email: email.to_string(),
                password_hash: auth.hash_password("correct horse").unwrap(),
                first_name: "Айаал".into(),
                last_name: "Иванов".into(),
                middle_name: None,
                phone: None,
                role,
                district_id: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_login_and_authenticate() {
        let store = Arc::new(MemoryStore::new());
        let auth = service(store.clone());
        let user = insert_user(&auth, &store, "doctor@oculus.local", UserRole::DistrictDoctor).await;

        let response = auth
            .login(LoginRequest {
                email: " Doctor@Oculus.local ".into(),
                password: "correct horse".into(),
            })
            .await
            .unwrap();
        let caller = auth.authenticate(&response.tokens.access_token).await.unwrap();
        assert_eq!(caller.user_id, user.id);
        assert_eq!(caller.role, UserRole::DistrictDoctor);

        // 刷新令牌不能当作访问令牌使用
        assert!(matches!(
            auth.authenticate(&response.tokens.refresh_token).await,
            Err(OculusError::Unauthenticated(_))
        ));

        let wrong = auth
            .login(LoginRequest {
                email: "doctor@oculus.local".into(),
                password: "wrong password".into(),
            })
            .await;
        assert!(matches!(wrong, Err(OculusError::Unauthenticated(_))));
    }

    #[tokio::test]
    async fn test_refresh_rotates_token() {
        let store = Arc::new(MemoryStore::new());
        let auth = service(store.clone());
        insert_user(&auth, &store, "surgeon@oculus.local", UserRole::Surgeon).await;

        let login = auth
            .login(LoginRequest {
                email: "surgeon@oculus.local".into(),
                password: "correct horse".into(),
            })
            .await
            .unwrap();
        // 同一秒内签发的令牌内容相同，换用一个新的令牌验证轮换
        store
            .set_refresh_token(login.user.id, Some("rotated".into()))
            .await
            .unwrap();
        assert!(matches!(
            auth.refresh(&login.tokens.refresh_token).await,
            Err(OculusError::Unauthenticated(_))
        ));

        let tokens = auth.issue(login.user.id, UserRole::Surgeon, None).unwrap();
        store
            .set_refresh_token(login.user.id, Some(tokens.refresh_token.clone()))
            .await
            .unwrap();
        let refreshed = auth.refresh(&tokens.refresh_token).await.unwrap();
        assert!(auth.authenticate(&refreshed.access_token).await.is_ok());
    }

    #[tokio::test]
    async fn test_tokens_signed_with_other_secret_are_rejected() {
        let store = Arc::new(MemoryStore::new());
        let auth = service(store.clone());
        let other = AuthService::new(
            &AuthConfig {
                access_secret: "another-access-secret".into(),
                ..AuthConfig::default()
            },
            store,
        );
        let tokens = other.issue(1, UserRole::Admin, None).unwrap();
        assert!(matches!(
            auth.decode(&tokens.access_token, TokenType::Access),
            Err(OculusError::Unauthenticated(_))
        ));
    }

    #[tokio::test]
    async fn test_bootstrap_admin_only_once() {
        let store = Arc::new(MemoryStore::new());
        let auth = service(store.clone());
        let config = AuthConfig {
            bootstrap_admin_email: Some("admin@oculus.local".into()),
            bootstrap_admin_password: Some("change-me-now".into()),
            ..AuthConfig::default()
        };
        let admin = auth.bootstrap_admin(&config).await.unwrap().unwrap();
        assert_eq!(admin.role, UserRole::Admin);
        assert!(auth.bootstrap_admin(&config).await.unwrap().is_none());
    }

    #[test]
    fn test_bcrypt_cost_from_config() {
        let config = AuthConfig {
            bcrypt_cost: 5,
            ..AuthConfig::default()
        };
        let auth = AuthService::new(&config, Arc::new(MemoryStore::new()));
        let hash = auth.hash_password("correct horse").unwrap();
        assert!(hash.starts_with("$2b$05$"), "{}", hash);
    }

    #[test]
    fn test_short_password_rejected() {
        let auth = service(Arc::new(MemoryStore::new()));
        assert!(matches!(auth.hash_password("short"), Err(OculusError::Validation(_))));
    }
}
