//! Self-service account surface: registration, login, profile, API keys.

use argon2::password_hash::{SaltString, rand_core::OsRng};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::{
    Json,
    extract::{Path, State},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::actor::CreateApiKeyArgs;
use crate::db::{DbUser, NewUser, UsageWindow};
use crate::error::ProxyError;
use crate::quota::start_of_quota_day;
use crate::server::guards::auth::{SessionUser, generate_api_key};
use crate::server::router::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub user: UserView,
}

#[derive(Debug, Serialize)]
pub struct UserView {
    pub id: i64,
    pub username: String,
    pub is_admin: bool,
    pub is_active: bool,
    pub base_quota: i64,
    pub bonus_quota: i64,
    pub daily_quota: i64,
    pub created_at: DateTime<Utc>,
}

impl From<&DbUser> for UserView {
    fn from(user: &DbUser) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            is_admin: user.is_admin,
            is_active: user.is_active,
            base_quota: user.base_quota,
            bonus_quota: user.bonus_quota,
            daily_quota: user.effective_quota(),
            created_at: user.created_at,
        }
    }
}

pub fn hash_password(password: &str) -> Result<String, ProxyError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ProxyError::Internal(format!("password hash failed: {e}")))
}

fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<TokenResponse>, ProxyError> {
    let settings = state.settings.snapshot();
    if !settings.allow_registration {
        return Err(ProxyError::Forbidden("registration is closed".to_string()));
    }
    if settings.discord_only_registration || settings.discord_oauth_only {
        return Err(ProxyError::Forbidden(
            "registration is restricted to Discord".to_string(),
        ));
    }

    let username = body.username.trim().to_string();
    if username.is_empty() || body.password.len() < 6 {
        return Err(ProxyError::InvalidRequest(
            "username must be non-empty and password at least 6 characters".to_string(),
        ));
    }
    if state.db.get_user_by_username(&username).await?.is_some() {
        return Err(ProxyError::InvalidRequest("username already taken".to_string()));
    }

    let user = state
        .db
        .create_user(NewUser {
            username,
            password_hash: hash_password(&body.password)?,
            discord_id: None,
            is_admin: false,
            base_quota: settings.base_quota,
        })
        .await?;

    // Every fresh account starts with one usable key.
    state
        .db
        .create_api_key(CreateApiKeyArgs {
            user_id: user.id,
            name: "default".to_string(),
            secret: generate_api_key(),
        })
        .await?;

    let access_token = state.session.issue(&user)?;
    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer",
        user: UserView::from(&user),
    }))
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, ProxyError> {
    let Some(user) = state.db.get_user_by_username(body.username.trim()).await? else {
        return Err(ProxyError::Unauthenticated("invalid username or password"));
    };
    if !verify_password(&body.password, &user.password_hash) {
        return Err(ProxyError::Unauthenticated("invalid username or password"));
    }
    if !user.is_active {
        return Err(ProxyError::Forbidden("account is deactivated".to_string()));
    }

    let access_token = state.session.issue(&user)?;
    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer",
        user: UserView::from(&user),
    }))
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    #[serde(flatten)]
    pub user: UserView,
    pub today_usage: i64,
    pub credential_count: i64,
    pub public_credential_count: i64,
    pub has_public_credentials: bool,
}

pub async fn me(
    State(state): State<AppState>,
    SessionUser(user): SessionUser,
) -> Result<Json<MeResponse>, ProxyError> {
    let today_usage = state
        .db
        .count_usage(UsageWindow {
            user_id: user.id,
            since: start_of_quota_day(Utc::now()),
            success_only: true,
            group: None,
        })
        .await?;

    let credentials = state.db.list_credentials(Some(user.id)).await?;
    let credential_count = credentials.iter().filter(|c| c.is_active).count() as i64;
    let public_credential_count = credentials
        .iter()
        .filter(|c| c.is_active && c.is_public)
        .count() as i64;

    Ok(Json(MeResponse {
        user: UserView::from(&user),
        today_usage,
        credential_count,
        public_credential_count,
        has_public_credentials: public_credential_count > 0,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    #[serde(default = "default_key_name")]
    pub name: String,
}

fn default_key_name() -> String {
    "default".to_string()
}

#[derive(Debug, Serialize)]
pub struct ApiKeyView {
    pub id: i64,
    pub name: String,
    pub key: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

pub async fn list_api_keys(
    State(state): State<AppState>,
    SessionUser(user): SessionUser,
) -> Result<Json<Vec<ApiKeyView>>, ProxyError> {
    let keys = state.db.list_api_keys(user.id).await?;
    Ok(Json(
        keys.into_iter()
            .map(|k| ApiKeyView {
                id: k.id,
                name: k.name,
                key: k.secret,
                is_active: k.is_active,
                created_at: k.created_at,
                last_used_at: k.last_used_at,
            })
            .collect(),
    ))
}

pub async fn create_api_key(
    State(state): State<AppState>,
    SessionUser(user): SessionUser,
    Json(body): Json<CreateKeyRequest>,
) -> Result<Json<ApiKeyView>, ProxyError> {
    let key = state
        .db
        .create_api_key(CreateApiKeyArgs {
            user_id: user.id,
            name: body.name,
            secret: generate_api_key(),
        })
        .await?;

    Ok(Json(ApiKeyView {
        id: key.id,
        name: key.name,
        key: key.secret,
        is_active: key.is_active,
        created_at: key.created_at,
        last_used_at: key.last_used_at,
    }))
}

pub async fn delete_api_key(
    State(state): State<AppState>,
    SessionUser(user): SessionUser,
    Path(key_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ProxyError> {
    if !state.db.delete_api_key(user.id, key_id).await? {
        return Err(ProxyError::InvalidRequest("API key not found".to_string()));
    }
    Ok(Json(serde_json::json!({"deleted": true})))
}
