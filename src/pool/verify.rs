//! Credential verification probes.
//!
//! Validity and tier come from two Code Assist probes (a rate-limited 429
//! still proves access); the account type comes from the Drive storage
//! quota, with a behavioral fallback when the token has no Drive scope.

use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::model_catalog::{MODEL_FLASH_25, MODEL_PRO_30, ModelTier};

const GENERATE_URL: &str = "https://cloudcode-pa.googleapis.com/v1internal:generateContent";
const DRIVE_ABOUT_URL: &str = "https://www.googleapis.com/drive/v3/about?fields=storageQuota";

/// Pro accounts ship 2 TiB of Drive storage.
const PRO_STORAGE_BYTES: i64 = 2 * 1024 * 1024 * 1024 * 1024;

const FALLBACK_PROBES: usize = 3;
const FALLBACK_PROBE_GAP: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountType {
    Pro,
    Free,
    Unknown,
}

impl AccountType {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountType::Pro => "pro",
            AccountType::Free => "free",
            AccountType::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub is_valid: bool,
    pub tier: ModelTier,
    pub account_type: AccountType,
    pub storage_gb: Option<f64>,
    pub error: Option<String>,
}

pub struct CredentialVerifier {
    client: reqwest::Client,
}

impl CredentialVerifier {
    pub fn new(proxy: Option<url::Url>) -> Self {
        let mut builder = reqwest::Client::builder()
            .user_agent("castor-verify/1.0")
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15));
        if let Some(proxy_url) = proxy {
            let proxy = reqwest::Proxy::all(proxy_url.as_str())
                .expect("invalid proxy url for CredentialVerifier");
            builder = builder.proxy(proxy);
        }
        Self {
            client: builder.build().expect("failed to build verifier client"),
        }
    }

    pub async fn verify(&self, access_token: &str, project_id: &str) -> VerifyOutcome {
        // Probe 1: validity via the cheapest model.
        match self.probe(access_token, project_id, MODEL_FLASH_25).await {
            Ok(status) if status == StatusCode::OK || status == StatusCode::TOO_MANY_REQUESTS => {}
            Ok(status) => {
                return VerifyOutcome {
                    is_valid: false,
                    tier: ModelTier::Tier25,
                    account_type: AccountType::Unknown,
                    storage_gb: None,
                    error: Some(format!("validity probe returned {status}")),
                };
            }
            Err(err) => {
                return VerifyOutcome {
                    is_valid: false,
                    tier: ModelTier::Tier25,
                    account_type: AccountType::Unknown,
                    storage_gb: None,
                    error: Some(format!("validity probe failed: {err}")),
                };
            }
        }

        // Probe 2: tier. A 429 still proves the account has Gemini 3 access.
        let tier = match self.probe(access_token, project_id, MODEL_PRO_30).await {
            Ok(status) if status == StatusCode::OK || status == StatusCode::TOO_MANY_REQUESTS => {
                ModelTier::Tier30
            }
            Ok(_) | Err(_) => ModelTier::Tier25,
        };

        let (account_type, storage_gb) = self.detect_account_type(access_token, project_id).await;
        info!(
            tier = tier.as_str(),
            account_type = account_type.as_str(),
            ?storage_gb,
            "credential verified"
        );

        VerifyOutcome {
            is_valid: true,
            tier,
            account_type,
            storage_gb,
            error: None,
        }
    }

    async fn probe(
        &self,
        access_token: &str,
        project_id: &str,
        model: &str,
    ) -> Result<StatusCode, reqwest::Error> {
        let payload = json!({
            "model": model,
            "project": project_id,
            "request": {
                "contents": [{"role": "user", "parts": [{"text": "1"}]}],
                "generationConfig": {"maxOutputTokens": 1}
            }
        });

        let resp = self
            .client
            .post(GENERATE_URL)
            .bearer_auth(access_token)
            .json(&payload)
            .send()
            .await?;
        debug!(model, status = %resp.status(), "verification probe");
        Ok(resp.status())
    }

    async fn detect_account_type(
        &self,
        access_token: &str,
        project_id: &str,
    ) -> (AccountType, Option<f64>) {
        match self.drive_storage_limit(access_token).await {
            Ok(Some(limit)) => {
                let storage_gb = limit as f64 / (1024.0 * 1024.0 * 1024.0);
                let kind = if limit >= PRO_STORAGE_BYTES {
                    AccountType::Pro
                } else {
                    AccountType::Free
                };
                return (kind, Some(storage_gb));
            }
            Ok(None) => {
                debug!("Drive quota unavailable, falling back to behavioral probe");
            }
            Err(err) => {
                warn!(error = %err, "Drive quota request failed, falling back to behavioral probe");
            }
        }

        // Fallback: pro accounts survive consecutive unary calls without a
        // per-minute 429.
        for i in 0..FALLBACK_PROBES {
            match self.probe(access_token, project_id, MODEL_FLASH_25).await {
                Ok(StatusCode::OK) => {}
                Ok(StatusCode::TOO_MANY_REQUESTS) => return (AccountType::Free, None),
                Ok(_) | Err(_) => return (AccountType::Unknown, None),
            }
            if i + 1 < FALLBACK_PROBES {
                tokio::time::sleep(FALLBACK_PROBE_GAP).await;
            }
        }
        (AccountType::Pro, None)
    }

    /// `Ok(None)` when Drive is unauthorized for this token.
    async fn drive_storage_limit(&self, access_token: &str) -> Result<Option<i64>, reqwest::Error> {
        let resp = self
            .client
            .get(DRIVE_ABOUT_URL)
            .bearer_auth(access_token)
            .send()
            .await?;

        if resp.status() == StatusCode::FORBIDDEN || resp.status() == StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        let resp = resp.error_for_status()?;
        let body: Value = resp.json().await?;

        // Drive reports the limit as a decimal string.
        Ok(body
            .get("storageQuota")
            .and_then(|q| q.get("limit"))
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<i64>().ok())
            .filter(|limit| *limit > 0))
    }
}
