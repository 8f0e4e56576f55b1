//! 用户管理端点（仅管理员）

use crate::auth::AuthUser;
use crate::handlers::{created, ok, paged, ApiJson, ApiPath, ApiQuery, ApiResult, PageParams};
use crate::state::AppState;
use axum::{extract::State, response::IntoResponse};
use oculus_core::models::UserRole;
use oculus_core::query::UserFilter;
use oculus_core::utils::{normalize_optional, require_text};
use oculus_core::{OculusError, Result};
use oculus_database::{NewUser, UserUpdate};
use regex::Regex;
use serde::Deserialize;
use tracing::info;

const EMAIL_PATTERN: &str = r"^[^@\s]+@[^@\s]+\.[^@\s]+$";

pub fn validate_email(email: &str) -> Result<String> {
    let email = email.trim().to_ascii_lowercase();
    let regex = Regex::new(EMAIL_PATTERN)
        .map_err(|e| OculusError::Internal(format!("邮箱规则无效: {}", e)))?;
    if !regex.is_match(&email) {
        return Err(OculusError::Validation(format!("邮箱格式无效: {}", email)));
    }
    Ok(email)
}

fn staff_role(role: UserRole) -> Result<UserRole> {
    if role == UserRole::Patient {
        return Err(OculusError::Validation("患者不能作为系统用户".to_string()));
    }
    Ok(role)
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub middle_name: Option<String>,
    pub phone: Option<String>,
    pub role: UserRole,
    pub district_id: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateUserRequest {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub middle_name: Option<String>,
    pub phone: Option<String>,
    pub role: Option<UserRole>,
    pub district_id: Option<i64>,
    pub is_active: Option<bool>,
    pub password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UserQuery {
    pub role: Option<UserRole>,
    pub is_active: Option<bool>,
}

pub async fn create_user(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiJson(request): ApiJson<CreateUserRequest>,
) -> ApiResult<impl IntoResponse> {
    caller.require_role(&[UserRole::Admin])?;
    let new_user = NewUser {
        email: validate_email(&request.email)?,
        password_hash: state.auth.hash_password(&request.password)?,
        first_name: require_text("first_name", &request.first_name)?,
        last_name: require_text("last_name", &request.last_name)?,
        middle_name: normalize_optional(request.middle_name),
        phone: normalize_optional(request.phone),
        role: staff_role(request.role)?,
        district_id: request.district_id,
    };
    let user = state.engine.store().insert_user(new_user).await?;
    info!("User {} ({}) created by {}", user.id, user.role, caller.user_id);
    Ok(created(user))
}

pub async fn list_users(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiQuery(query): ApiQuery<UserQuery>,
    ApiQuery(page): ApiQuery<PageParams>,
) -> ApiResult<impl IntoResponse> {
    caller.require_role(&[UserRole::Admin])?;
    let filter = UserFilter {
        role: query.role,
        is_active: query.is_active,
    };
    Ok(paged(state.engine.store().list_users(&filter, page.into()).await?))
}

pub async fn get_user(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<impl IntoResponse> {
    caller.require_role(&[UserRole::Admin])?;
    let user = state
        .engine
        .store()
        .get_user(id)
        .await?
        .ok_or_else(|| OculusError::NotFound(format!("用户不存在: {}", id)))?;
    Ok(ok(user))
}

pub async fn update_user(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(request): ApiJson<UpdateUserRequest>,
) -> ApiResult<impl IntoResponse> {
    caller.require_role(&[UserRole::Admin])?;
    let update = UserUpdate {
        first_name: request
            .first_name
            .map(|v| require_text("first_name", &v))
            .transpose()?,
        last_name: request
            .last_name
            .map(|v| require_text("last_name", &v))
            .transpose()?,
        middle_name: request.middle_name,
        phone: request.phone,
        role: request.role.map(staff_role).transpose()?,
        district_id: request.district_id,
        is_active: request.is_active,
        password_hash: request
            .password
            .map(|p| state.auth.hash_password(&p))
            .transpose()?,
    };
    let user = state
        .engine
        .store()
        .update_user(id, &update)
        .await?
        .ok_or_else(|| OculusError::NotFound(format!("用户不存在: {}", id)))?;
    if update.is_active == Some(false) {
        state.engine.store().set_refresh_token(id, None).await?;
    }
    Ok(ok(user))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_email() {
        assert_eq!(validate_email(" Surgeon@Oculus.Local ").unwrap(), "surgeon@oculus.local");
        assert!(validate_email("no-at-sign").is_err());
        assert!(validate_email("two@@signs.ru").is_err());
        assert!(validate_email("a b@c.ru").is_err());
    }

    #[test]
    fn test_patient_role_rejected() {
        assert!(staff_role(UserRole::Patient).is_err());
        assert_eq!(staff_role(UserRole::CallCenter).unwrap(), UserRole::CallCenter);
    }
}
