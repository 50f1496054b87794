use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use super::tunables::{PoolMode, Tunables};
use crate::db::DbActorHandle;
use crate::error::ProxyError;

/// Keys that may be overridden at runtime and persisted to `system_config`.
/// Anything else in the table is ignored on load and rejected on write.
pub const OVERRIDE_KEYS: &[&str] = &[
    "base_rpm",
    "contributor_rpm",
    "error_retry_count",
    "cd_flash",
    "cd_pro",
    "cd_30",
    "quota_flash",
    "quota_25pro",
    "quota_30pro",
    "no_cred_quota_flash",
    "no_cred_quota_25pro",
    "no_cred_quota_30pro",
    "base_quota",
    "credential_pool_mode",
    "force_donate",
    "lock_donate",
    "allow_registration",
    "discord_only_registration",
    "discord_oauth_only",
];

/// Live view of the runtime tunables.
///
/// Readers take a cheap `Arc` snapshot once per request; writers go through
/// [`SettingsRegistry::set`], which persists to the database and swaps the
/// snapshot atomically.
pub struct SettingsRegistry {
    current: RwLock<Arc<Tunables>>,
    db: DbActorHandle,
}

impl SettingsRegistry {
    pub fn new(seed: Tunables, db: DbActorHandle) -> Self {
        Self {
            current: RwLock::new(Arc::new(seed)),
            db,
        }
    }

    pub fn snapshot(&self) -> Arc<Tunables> {
        self.current.read().expect("settings lock poisoned").clone()
    }

    /// Merge persisted overrides on top of the seed. Unknown keys and
    /// unparsable values are skipped with a warning.
    pub async fn load_overrides(&self) -> Result<usize, ProxyError> {
        let rows = self.db.load_config_overrides().await?;
        let mut next = (*self.snapshot()).clone();
        let mut applied = 0usize;

        for (key, value) in rows {
            if !OVERRIDE_KEYS.contains(&key.as_str()) {
                continue;
            }
            match apply_kv(&mut next, &key, &value) {
                Ok(()) => {
                    info!(key = %key, value = %value, "config override loaded");
                    applied += 1;
                }
                Err(err) => warn!(key = %key, value = %value, error = %err, "config override skipped"),
            }
        }

        *self.current.write().expect("settings lock poisoned") = Arc::new(next);
        Ok(applied)
    }

    /// Validate, persist and apply a single override.
    pub async fn set(&self, key: &str, value: &str) -> Result<(), ProxyError> {
        if !OVERRIDE_KEYS.contains(&key) {
            return Err(ProxyError::InvalidRequest(format!(
                "unknown config key: {key}"
            )));
        }

        let mut next = (*self.snapshot()).clone();
        apply_kv(&mut next, key, value).map_err(ProxyError::InvalidRequest)?;

        self.db.save_config_override(key, value).await?;
        *self.current.write().expect("settings lock poisoned") = Arc::new(next);
        info!(key = %key, value = %value, "config override saved");
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| format!("invalid value for {key}: {value}"))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(format!("invalid value for {key}: {value}")),
    }
}

fn apply_kv(t: &mut Tunables, key: &str, value: &str) -> Result<(), String> {
    match key {
        "base_rpm" => t.base_rpm = parse(key, value)?,
        "contributor_rpm" => t.contributor_rpm = parse(key, value)?,
        "error_retry_count" => t.error_retry_count = parse(key, value)?,
        "cd_flash" => t.cd_flash = parse(key, value)?,
        "cd_pro" => t.cd_pro = parse(key, value)?,
        "cd_30" => t.cd_30 = parse(key, value)?,
        "quota_flash" => t.quota_flash = parse(key, value)?,
        "quota_25pro" => t.quota_25pro = parse(key, value)?,
        "quota_30pro" => t.quota_30pro = parse(key, value)?,
        "no_cred_quota_flash" => t.no_cred_quota_flash = parse(key, value)?,
        "no_cred_quota_25pro" => t.no_cred_quota_25pro = parse(key, value)?,
        "no_cred_quota_30pro" => t.no_cred_quota_30pro = parse(key, value)?,
        "base_quota" => t.base_quota = parse(key, value)?,
        "credential_pool_mode" => {
            t.credential_pool_mode = value.trim().parse::<PoolMode>()?;
        }
        "force_donate" => t.force_donate = parse_bool(key, value)?,
        "lock_donate" => t.lock_donate = parse_bool(key, value)?,
        "allow_registration" => t.allow_registration = parse_bool(key, value)?,
        "discord_only_registration" => t.discord_only_registration = parse_bool(key, value)?,
        "discord_oauth_only" => t.discord_oauth_only = parse_bool(key, value)?,
        other => return Err(format!("unknown config key: {other}")),
    }
    Ok(())
}
