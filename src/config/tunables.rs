use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Pool sharing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PoolMode {
    /// Users may only select their own credentials.
    Private,
    /// Public tier-2.5 credentials are open to everyone; public tier-3
    /// credentials require owning an active tier-3 credential.
    Tier3Shared,
    /// Public credentials are open to anyone who donated an active public
    /// credential themselves.
    #[default]
    FullShared,
}

impl PoolMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PoolMode::Private => "private",
            PoolMode::Tier3Shared => "tier3_shared",
            PoolMode::FullShared => "full_shared",
        }
    }
}

impl fmt::Display for PoolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoolMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(PoolMode::Private),
            "tier3_shared" => Ok(PoolMode::Tier3Shared),
            "full_shared" => Ok(PoolMode::FullShared),
            other => Err(format!("unknown pool mode: {other}")),
        }
    }
}

/// Runtime-tunable settings. Defaults come from `config.toml`; admin
/// mutations are layered on top through [`super::SettingsRegistry`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Tunables {
    /// Requests per minute for users without an active public credential.
    #[serde(default = "default_base_rpm")]
    pub base_rpm: i64,

    /// Requests per minute for donors.
    #[serde(default = "default_contributor_rpm")]
    pub contributor_rpm: i64,

    /// Extra credential rotations after a retryable upstream failure.
    #[serde(default = "default_error_retry_count")]
    pub error_retry_count: u32,

    /// Per-credential cooldown seconds by model group.
    #[serde(default = "default_cd_flash")]
    pub cd_flash: i64,
    #[serde(default = "default_cd_pro")]
    pub cd_pro: i64,
    #[serde(default = "default_cd_30")]
    pub cd_30: i64,

    /// Per-credential daily budgets; these also define donation rewards.
    #[serde(default = "default_quota_flash")]
    pub quota_flash: i64,
    #[serde(default = "default_quota_25pro")]
    pub quota_25pro: i64,
    #[serde(default = "default_quota_30pro")]
    pub quota_30pro: i64,

    /// Daily caps for users without any active credential, by model group.
    /// Zero disables the cap.
    #[serde(default = "default_no_cred_quota_flash")]
    pub no_cred_quota_flash: i64,
    #[serde(default = "default_no_cred_quota_25pro")]
    pub no_cred_quota_25pro: i64,
    #[serde(default)]
    pub no_cred_quota_30pro: i64,

    /// Base daily quota granted to new users.
    #[serde(default = "default_base_quota")]
    pub base_quota: i64,

    #[serde(default)]
    pub credential_pool_mode: PoolMode,

    /// Uploads are forced public.
    #[serde(default)]
    pub force_donate: bool,

    /// Owners cannot un-donate an active credential.
    #[serde(default)]
    pub lock_donate: bool,

    #[serde(default = "default_true")]
    pub allow_registration: bool,

    #[serde(default)]
    pub discord_only_registration: bool,

    #[serde(default)]
    pub discord_oauth_only: bool,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            base_rpm: default_base_rpm(),
            contributor_rpm: default_contributor_rpm(),
            error_retry_count: default_error_retry_count(),
            cd_flash: default_cd_flash(),
            cd_pro: default_cd_pro(),
            cd_30: default_cd_30(),
            quota_flash: default_quota_flash(),
            quota_25pro: default_quota_25pro(),
            quota_30pro: default_quota_30pro(),
            no_cred_quota_flash: default_no_cred_quota_flash(),
            no_cred_quota_25pro: default_no_cred_quota_25pro(),
            no_cred_quota_30pro: 0,
            base_quota: default_base_quota(),
            credential_pool_mode: PoolMode::default(),
            force_donate: false,
            lock_donate: false,
            allow_registration: true,
            discord_only_registration: false,
            discord_oauth_only: false,
        }
    }
}

impl Tunables {
    /// Donation reward for a tier-2.5 credential.
    pub fn reward_25(&self) -> i64 {
        self.quota_flash + self.quota_25pro
    }

    /// Donation reward for a tier-3 credential.
    pub fn reward_30(&self) -> i64 {
        self.quota_flash + self.quota_25pro + self.quota_30pro
    }
}

fn default_base_rpm() -> i64 {
    5
}
fn default_contributor_rpm() -> i64 {
    10
}
fn default_error_retry_count() -> u32 {
    3
}
fn default_cd_flash() -> i64 {
    10
}
fn default_cd_pro() -> i64 {
    30
}
fn default_cd_30() -> i64 {
    120
}
fn default_quota_flash() -> i64 {
    100
}
fn default_quota_25pro() -> i64 {
    50
}
fn default_quota_30pro() -> i64 {
    50
}
fn default_no_cred_quota_flash() -> i64 {
    10
}
fn default_no_cred_quota_25pro() -> i64 {
    5
}
fn default_base_quota() -> i64 {
    100
}
fn default_true() -> bool {
    true
}
