//! Request guards: API-key auth for the proxy surface, JWT sessions for the
//! management surface.

use axum::{
    extract::FromRequestParts,
    http::request::Parts,
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::db::DbUser;
use crate::error::ProxyError;
use crate::server::router::AppState;

/// Stable prefix on issued API keys, for secret-scanner detectability.
pub const API_KEY_PREFIX: &str = "cst-";

/// `cst-` + 192 random bits as hex.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 24];
    rand::rng().fill_bytes(&mut bytes);
    format!("{API_KEY_PREFIX}{}", hex::encode(bytes))
}

fn extract_header_token(headers: &axum::http::HeaderMap) -> Option<String> {
    for name in ["x-api-key", "x-goog-api-key"] {
        if let Some(k) = headers.get(name).and_then(|v| v.to_str().ok()) {
            return Some(k.to_string());
        }
    }
    headers
        .typed_get::<Authorization<Bearer>>()
        .map(|auth| auth.token().to_string())
}

fn extract_query_token(query: Option<&str>) -> Option<String> {
    query.and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(k, _)| k == "key")
            .map(|(_, v)| v.into_owned())
    })
}

fn bearer_token(parts: &Parts) -> Option<String> {
    extract_header_token(&parts.headers).or_else(|| extract_query_token(parts.uri.query()))
}

/// Proxy-surface caller, resolved from its opaque API key.
#[derive(Debug, Clone)]
pub struct ApiKeyUser {
    pub user: DbUser,
    pub api_key_id: i64,
}

impl FromRequestParts<AppState> for ApiKeyUser {
    type Rejection = ProxyError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(secret) = bearer_token(parts) else {
            return Err(ProxyError::Unauthenticated("missing API key"));
        };

        let Some((user, api_key_id)) = state.db.authenticate_api_key(&secret).await? else {
            return Err(ProxyError::Unauthenticated("invalid API key"));
        };

        if !user.is_active {
            return Err(ProxyError::Forbidden("account is deactivated".to_string()));
        }

        Ok(ApiKeyUser { user, api_key_id })
    }
}

/// Management-surface caller, resolved from a session JWT.
#[derive(Debug, Clone)]
pub struct SessionUser(pub DbUser);

impl FromRequestParts<AppState> for SessionUser {
    type Rejection = ProxyError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(token) = bearer_token(parts) else {
            return Err(ProxyError::Unauthenticated("missing session token"));
        };

        let claims = state
            .session
            .verify(&token)
            .ok_or(ProxyError::Unauthenticated("invalid session token"))?;

        let Some(user) = state.db.get_user(claims.uid).await? else {
            return Err(ProxyError::Unauthenticated("unknown user"));
        };
        if !user.is_active {
            return Err(ProxyError::Forbidden("account is deactivated".to_string()));
        }

        Ok(SessionUser(user))
    }
}

/// Session user that must additionally be an admin.
#[derive(Debug, Clone)]
pub struct AdminUser(pub DbUser);

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ProxyError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let SessionUser(user) = SessionUser::from_request_parts(parts, state).await?;
        if !user.is_admin {
            return Err(ProxyError::Forbidden("admin privileges required".to_string()));
        }
        Ok(AdminUser(user))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub uid: i64,
    pub exp: i64,
}

/// HS256 session token signer/verifier keyed off `basic.secret_key`.
pub struct SessionKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl SessionKeys {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl: Duration::days(7),
        }
    }

    pub fn issue(&self, user: &DbUser) -> Result<String, ProxyError> {
        let claims = SessionClaims {
            sub: user.username.clone(),
            uid: user.id,
            exp: (Utc::now() + self.ttl).timestamp(),
        };
        jsonwebtoken::encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| ProxyError::Internal(format!("session token encode failed: {e}")))
    }

    pub fn verify(&self, token: &str) -> Option<SessionClaims> {
        jsonwebtoken::decode::<SessionClaims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims)
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_keys_are_prefixed_and_long() {
        let key = generate_api_key();
        assert!(key.starts_with(API_KEY_PREFIX));
        assert_eq!(key.len(), API_KEY_PREFIX.len() + 48);
        assert_ne!(key, generate_api_key());
    }

    #[test]
    fn session_roundtrip_and_tamper_rejection() {
        let keys = SessionKeys::new("unit-secret");
        let user = DbUser {
            id: 9,
            username: "u".to_string(),
            password_hash: String::new(),
            discord_id: None,
            is_active: true,
            is_admin: false,
            base_quota: 100,
            bonus_quota: 0,
            created_at: Utc::now(),
        };

        let token = keys.issue(&user).unwrap();
        let claims = keys.verify(&token).unwrap();
        assert_eq!(claims.uid, 9);
        assert_eq!(claims.sub, "u");

        let other = SessionKeys::new("different-secret");
        assert!(other.verify(&token).is_none());
        assert!(keys.verify("garbage").is_none());
    }
}
