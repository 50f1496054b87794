//! Credential management: upload (JSON and ZIP), listing, donation toggle,
//! verification, export, deletion and pool statistics.

use std::io::Read as _;

use axum::{
    Json,
    extract::{Multipart, Path, Query, State},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::crypto::CryptoVault;
use crate::db::actor::{
    BatchDeleteArgs, DeleteCredentialArgs, SetActiveArgs, TogglePublicArgs, VerificationArgs,
};
use crate::db::{DbCredential, DonationRewards, NewCredential, PoolStats};
use crate::error::ProxyError;
use crate::server::guards::auth::{AdminUser, SessionUser};
use crate::server::router::AppState;

/// Owner-facing credential view; token material never leaves the vault here.
#[derive(Debug, Serialize)]
pub struct CredentialView {
    pub id: i64,
    pub user_id: Option<i64>,
    pub display_name: String,
    pub project_id: String,
    pub email: Option<String>,
    pub credential_type: String,
    pub model_tier: String,
    pub account_type: String,
    pub is_public: bool,
    pub is_active: bool,
    pub total_requests: i64,
    pub failed_requests: i64,
    pub last_error: Option<String>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&DbCredential> for CredentialView {
    fn from(c: &DbCredential) -> Self {
        Self {
            id: c.id,
            user_id: c.user_id,
            display_name: c.display_name.clone(),
            project_id: c.project_id.clone(),
            email: c.email.clone(),
            credential_type: c.credential_type.clone(),
            model_tier: c.model_tier.clone(),
            account_type: c.account_type.clone(),
            is_public: c.is_public,
            is_active: c.is_active,
            total_requests: c.total_requests,
            failed_requests: c.failed_requests,
            last_error: c.last_error.clone(),
            last_used_at: c.last_used_at,
            created_at: c.created_at,
        }
    }
}

/// Upload payload: the Gemini CLI `oauth_creds.json` shape. Unknown keys are
/// ignored.
#[derive(Debug, Deserialize)]
pub struct CredentialUpload {
    pub refresh_token: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_public: bool,
}

fn build_new_credential(
    vault: &CryptoVault,
    owner: i64,
    force_donate: bool,
    upload: CredentialUpload,
) -> Result<NewCredential, ProxyError> {
    let refresh_token = upload.refresh_token.trim().to_string();
    if refresh_token.is_empty() {
        return Err(ProxyError::InvalidRequest("refresh_token is required".to_string()));
    }

    let email = upload.email.map(|e| e.trim().to_lowercase()).filter(|e| !e.is_empty());
    let display_name = upload
        .name
        .or_else(|| email.clone())
        .unwrap_or_else(|| "credential".to_string());

    Ok(NewCredential {
        owner_user_id: Some(owner),
        display_name,
        access_token_ct: upload.token.as_deref().map(|t| vault.encrypt(t)),
        refresh_token_sha: CryptoVault::fingerprint(&refresh_token),
        refresh_token_ct: vault.encrypt(&refresh_token),
        client_id_ct: upload.client_id.as_deref().map(|v| vault.encrypt(v)),
        client_secret_ct: upload.client_secret.as_deref().map(|v| vault.encrypt(v)),
        project_id: upload.project_id.unwrap_or_default(),
        credential_type: "oauth".to_string(),
        model_tier: "2.5".to_string(),
        email,
        is_public: force_donate || upload.is_public,
    })
}

#[derive(Debug, Serialize, Default)]
pub struct UploadSummary {
    pub imported: Vec<i64>,
    pub skipped: u64,
    pub invalid: u64,
}

/// `POST /api/credentials` — single JSON upload.
pub async fn import_json(
    State(state): State<AppState>,
    SessionUser(user): SessionUser,
    Json(upload): Json<CredentialUpload>,
) -> Result<Json<UploadSummary>, ProxyError> {
    let settings = state.settings.snapshot();
    let new = build_new_credential(&state.vault, user.id, settings.force_donate, upload)?;

    let mut summary = UploadSummary::default();
    match state
        .db
        .insert_credential(new, DonationRewards::from_settings(&settings))
        .await?
    {
        Some(id) => summary.imported.push(id),
        None => summary.skipped += 1,
    }
    Ok(Json(summary))
}

/// `POST /api/credentials/upload` — multipart upload of `.json` files or a
/// `.zip` archive of them. Duplicates (by refresh-token fingerprint or
/// email) are skipped, malformed entries are counted but do not abort the
/// batch.
pub async fn upload_archive(
    State(state): State<AppState>,
    SessionUser(user): SessionUser,
    mut multipart: Multipart,
) -> Result<Json<UploadSummary>, ProxyError> {
    let settings = state.settings.snapshot();
    let rewards = DonationRewards::from_settings(&settings);
    let mut summary = UploadSummary::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ProxyError::InvalidRequest(format!("invalid multipart body: {e}")))?
    {
        let file_name = field.file_name().unwrap_or("upload").to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| ProxyError::InvalidRequest(format!("failed to read upload: {e}")))?;

        let documents = if file_name.to_ascii_lowercase().ends_with(".zip") {
            match unpack_zip(&data) {
                Ok(docs) => docs,
                Err(err) => {
                    warn!(file = %file_name, error = %err, "rejected zip upload");
                    summary.invalid += 1;
                    continue;
                }
            }
        } else {
            vec![data.to_vec()]
        };

        for doc in documents {
            let Ok(upload) = serde_json::from_slice::<CredentialUpload>(&doc) else {
                summary.invalid += 1;
                continue;
            };
            let new = match build_new_credential(&state.vault, user.id, settings.force_donate, upload)
            {
                Ok(new) => new,
                Err(_) => {
                    summary.invalid += 1;
                    continue;
                }
            };
            match state.db.insert_credential(new, rewards).await? {
                Some(id) => summary.imported.push(id),
                None => summary.skipped += 1,
            }
        }
    }

    info!(
        imported = summary.imported.len(),
        skipped = summary.skipped,
        invalid = summary.invalid,
        "credential upload processed"
    );
    Ok(Json(summary))
}

fn unpack_zip(data: &[u8]) -> Result<Vec<Vec<u8>>, ProxyError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(data))
        .map_err(|e| ProxyError::InvalidRequest(format!("invalid zip archive: {e}")))?;

    let mut documents = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| ProxyError::InvalidRequest(format!("corrupt zip entry: {e}")))?;
        if !entry.name().to_ascii_lowercase().ends_with(".json") {
            continue;
        }
        let mut contents = Vec::new();
        entry
            .read_to_end(&mut contents)
            .map_err(|e| ProxyError::InvalidRequest(format!("corrupt zip entry: {e}")))?;
        documents.push(contents);
    }
    Ok(documents)
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub all: bool,
}

pub async fn list(
    State(state): State<AppState>,
    SessionUser(user): SessionUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<CredentialView>>, ProxyError> {
    let owner = if query.all && user.is_admin {
        None
    } else {
        Some(user.id)
    };
    let credentials = state.db.list_credentials(owner).await?;
    Ok(Json(credentials.iter().map(CredentialView::from).collect()))
}

#[derive(Debug, Deserialize)]
pub struct TogglePublicRequest {
    pub is_public: bool,
}

pub async fn toggle_public(
    State(state): State<AppState>,
    SessionUser(user): SessionUser,
    Path(credential_id): Path<i64>,
    Json(body): Json<TogglePublicRequest>,
) -> Result<Json<CredentialView>, ProxyError> {
    let settings = state.settings.snapshot();
    let owner = (!user.is_admin).then_some(user.id);

    let Some(cred) = state.db.get_credential(credential_id).await? else {
        return Err(ProxyError::InvalidRequest("credential not found".to_string()));
    };
    if owner.is_some() && cred.user_id != owner {
        return Err(ProxyError::InvalidRequest("credential not found".to_string()));
    }
    if !body.is_public && settings.lock_donate && cred.is_active && !user.is_admin {
        return Err(ProxyError::Forbidden(
            "donations are locked while the credential is active".to_string(),
        ));
    }

    let updated = state
        .db
        .set_credential_public(TogglePublicArgs {
            credential_id,
            owner,
            public: body.is_public,
            rewards: DonationRewards::from_settings(&settings),
        })
        .await?;

    Ok(Json(CredentialView::from(&updated)))
}

pub async fn remove(
    State(state): State<AppState>,
    SessionUser(user): SessionUser,
    Path(credential_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ProxyError> {
    let settings = state.settings.snapshot();
    let deleted = state
        .db
        .delete_credential(DeleteCredentialArgs {
            credential_id,
            owner: (!user.is_admin).then_some(user.id),
            rewards: DonationRewards::from_settings(&settings),
        })
        .await?;

    if !deleted {
        return Err(ProxyError::InvalidRequest("credential not found".to_string()));
    }
    Ok(Json(json!({"deleted": true})))
}

#[derive(Debug, Deserialize)]
pub struct SetActiveRequest {
    pub is_active: bool,
}

/// Admin enable/disable. Moves the owner's donation bonus with it so the
/// `bonus = Σ reward(public ∧ active)` invariant holds.
pub async fn set_active(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(credential_id): Path<i64>,
    Json(body): Json<SetActiveRequest>,
) -> Result<Json<serde_json::Value>, ProxyError> {
    let settings = state.settings.snapshot();
    state
        .db
        .set_credential_active(SetActiveArgs {
            credential_id,
            active: body.is_active,
            rewards: DonationRewards::from_settings(&settings),
        })
        .await?;
    Ok(Json(json!({"id": credential_id, "is_active": body.is_active})))
}

#[derive(Debug, Deserialize)]
pub struct BatchDeleteRequest {
    pub ids: Vec<i64>,
}

pub async fn batch_delete(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Json(body): Json<BatchDeleteRequest>,
) -> Result<Json<serde_json::Value>, ProxyError> {
    let settings = state.settings.snapshot();
    let deleted = state
        .db
        .delete_credentials_batch(BatchDeleteArgs {
            credential_ids: body.ids,
            rewards: DonationRewards::from_settings(&settings),
        })
        .await?;
    Ok(Json(json!({"deleted": deleted})))
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub is_valid: bool,
    pub model_tier: String,
    pub account_type: String,
    pub storage_gb: Option<f64>,
    pub error: Option<String>,
}

/// Probe the credential against Code Assist and Drive, then persist what was
/// learned (tier, account type, validity).
pub async fn verify(
    State(state): State<AppState>,
    SessionUser(user): SessionUser,
    Path(credential_id): Path<i64>,
) -> Result<Json<VerifyResponse>, ProxyError> {
    let settings = state.settings.snapshot();
    let rewards = DonationRewards::from_settings(&settings);

    let Some(cred) = state.db.get_credential(credential_id).await? else {
        return Err(ProxyError::InvalidRequest("credential not found".to_string()));
    };
    if !user.is_admin && cred.user_id != Some(user.id) {
        return Err(ProxyError::InvalidRequest("credential not found".to_string()));
    }

    let dispatcher = state.dispatcher();
    let outcome = match dispatcher.resolve_access_token(&cred).await {
        Ok(token) => state.verifier.verify(&token, &cred.project_id).await,
        Err(err) if err.is_auth_failure() => crate::pool::VerifyOutcome {
            is_valid: false,
            tier: cred.tier(),
            account_type: crate::pool::AccountType::Unknown,
            storage_gb: None,
            error: Some(err.failure_text()),
        },
        Err(err) => return Err(err),
    };

    state
        .db
        .apply_verification(VerificationArgs {
            credential_id,
            is_valid: outcome.is_valid,
            tier: outcome.tier,
            account_type: outcome.account_type.as_str().to_string(),
            error: outcome.error.clone(),
            rewards,
        })
        .await?;

    Ok(Json(VerifyResponse {
        is_valid: outcome.is_valid,
        model_tier: outcome.tier.as_str().to_string(),
        account_type: outcome.account_type.as_str().to_string(),
        storage_gb: outcome.storage_gb,
        error: outcome.error,
    }))
}

/// Export back to the Gemini CLI `oauth_creds.json` shape; the system OAuth
/// client is injected when the credential carries none of its own.
pub async fn export(
    State(state): State<AppState>,
    SessionUser(user): SessionUser,
    Path(credential_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ProxyError> {
    let Some(cred) = state.db.get_credential(credential_id).await? else {
        return Err(ProxyError::InvalidRequest("credential not found".to_string()));
    };
    if !user.is_admin && cred.user_id != Some(user.id) {
        return Err(ProxyError::InvalidRequest("credential not found".to_string()));
    }

    let refresh_token = state
        .vault
        .decrypt(&cred.refresh_token)
        .ok_or_else(|| ProxyError::Crypto("refresh token decrypt failed".to_string()))?;

    let client_id = cred
        .client_id
        .as_deref()
        .and_then(|ct| state.vault.decrypt(ct))
        .unwrap_or_else(|| state.google.client_id.clone());
    let client_secret = cred
        .client_secret
        .as_deref()
        .and_then(|ct| state.vault.decrypt(ct))
        .unwrap_or_else(|| state.google.client_secret.clone());

    let mut out = json!({
        "client_id": client_id,
        "client_secret": client_secret,
        "refresh_token": refresh_token,
        "type": "authorized_user",
    });
    if let Some(token) = cred.access_token.as_deref().and_then(|ct| state.vault.decrypt(ct)) {
        out["token"] = json!(token);
    }
    if !cred.project_id.is_empty() {
        out["project_id"] = json!(cred.project_id);
    }
    if let Some(email) = &cred.email {
        out["email"] = json!(email);
    }

    Ok(Json(out))
}

pub async fn stats(
    State(state): State<AppState>,
    SessionUser(_user): SessionUser,
) -> Result<Json<PoolStats>, ProxyError> {
    Ok(Json(state.db.pool_stats().await?))
}
