//! Admin config surface over the settings registry.

use axum::{Json, extract::State};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::{OVERRIDE_KEYS, Tunables};
use crate::error::ProxyError;
use crate::server::guards::auth::AdminUser;
use crate::server::router::AppState;

pub async fn get_config(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
) -> Json<Tunables> {
    Json((*state.settings.snapshot()).clone())
}

#[derive(Debug, Deserialize)]
pub struct SetConfigRequest {
    pub key: String,
    pub value: Value,
}

/// Validate, persist and apply one override. Accepts JSON scalars; they are
/// normalized to the registry's string encoding.
pub async fn set_config(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Json(body): Json<SetConfigRequest>,
) -> Result<Json<Value>, ProxyError> {
    let value = match &body.value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => {
            return Err(ProxyError::InvalidRequest(
                "config values must be strings, numbers or booleans".to_string(),
            ));
        }
    };

    state.settings.set(&body.key, &value).await?;
    Ok(Json(json!({"key": body.key, "value": value, "keys": OVERRIDE_KEYS})))
}
