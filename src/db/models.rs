use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::config::Tunables;
use crate::model_catalog::{ModelGroup, ModelTier};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct DbUser {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub discord_id: Option<String>,
    pub is_active: bool,
    pub is_admin: bool,
    pub base_quota: i64,
    pub bonus_quota: i64,
    pub created_at: DateTime<Utc>,
}

impl DbUser {
    /// Daily request allowance: base plus donation bonus.
    pub fn effective_quota(&self) -> i64 {
        self.base_quota + self.bonus_quota
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct DbApiKey {
    pub id: i64,
    pub user_id: i64,
    pub secret: String,
    pub name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct DbCredential {
    pub id: i64,
    pub user_id: Option<i64>,
    pub display_name: String,
    pub access_token: Option<String>,
    pub refresh_token: String,
    pub refresh_token_sha: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub project_id: String,
    pub credential_type: String,
    pub model_tier: String,
    pub account_type: String,
    pub email: Option<String>,
    pub is_public: bool,
    pub is_active: bool,
    pub total_requests: i64,
    pub failed_requests: i64,
    pub last_error: Option<String>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_used_flash: Option<DateTime<Utc>>,
    pub last_used_pro: Option<DateTime<Utc>>,
    pub last_used_30: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DbCredential {
    pub fn tier(&self) -> ModelTier {
        ModelTier::from_str_lossy(&self.model_tier)
    }

    pub fn last_used_for(&self, group: ModelGroup) -> Option<DateTime<Utc>> {
        match group {
            ModelGroup::Flash => self.last_used_flash,
            ModelGroup::Pro => self.last_used_pro,
            ModelGroup::Three => self.last_used_30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct DbUsageLog {
    pub id: i64,
    pub user_id: i64,
    pub api_key_id: Option<i64>,
    pub credential_id: Option<i64>,
    pub model: String,
    pub endpoint: String,
    pub status_code: i64,
    pub latency_ms: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
    pub discord_id: Option<String>,
    pub is_admin: bool,
    pub base_quota: i64,
}

#[derive(Debug, Clone)]
pub struct NewCredential {
    pub owner_user_id: Option<i64>,
    pub display_name: String,
    pub access_token_ct: Option<String>,
    pub refresh_token_ct: String,
    pub refresh_token_sha: String,
    pub client_id_ct: Option<String>,
    pub client_secret_ct: Option<String>,
    pub project_id: String,
    pub credential_type: String,
    pub model_tier: String,
    pub email: Option<String>,
    pub is_public: bool,
}

#[derive(Debug, Clone)]
pub struct NewUsageLog {
    pub user_id: i64,
    pub api_key_id: Option<i64>,
    pub credential_id: Option<i64>,
    pub model: String,
    pub endpoint: String,
    pub status_code: u16,
    pub latency_ms: f64,
}

/// Donation reward amounts, snapshotted from the settings registry so the DB
/// actor stays configuration-free.
#[derive(Debug, Clone, Copy)]
pub struct DonationRewards {
    pub reward_25: i64,
    pub reward_30: i64,
}

impl DonationRewards {
    pub fn from_settings(settings: &Tunables) -> Self {
        Self {
            reward_25: settings.reward_25(),
            reward_30: settings.reward_30(),
        }
    }

    pub fn for_tier(&self, tier: ModelTier) -> i64 {
        match tier {
            ModelTier::Tier25 => self.reward_25,
            ModelTier::Tier30 => self.reward_30,
        }
    }
}

/// Everything the selection transaction needs to know about this request.
#[derive(Debug, Clone)]
pub struct SelectionRequest {
    pub user_id: i64,
    pub required_tier: ModelTier,
    pub group: ModelGroup,
    pub mode: crate::config::PoolMode,
    pub cooldown_secs: i64,
    pub exclude_ids: Vec<i64>,
}

/// Usage-log counting window for quota and rate checks.
#[derive(Debug, Clone)]
pub struct UsageWindow {
    pub user_id: i64,
    pub since: DateTime<Utc>,
    /// Count only rows with `status_code < 400` (daily quota) instead of
    /// every row (RPM window).
    pub success_only: bool,
    /// Restrict the count to one model group (no-credential caps).
    pub group: Option<ModelGroup>,
}

/// Aggregate pool statistics for the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize, Default, FromRow)]
pub struct PoolStats {
    pub total: i64,
    pub active: i64,
    pub public: i64,
    pub tier3: i64,
    pub total_requests: i64,
    pub failed_requests: i64,
}
