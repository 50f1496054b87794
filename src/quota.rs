//! Daily quota and per-minute rate enforcement.
//!
//! Both windows are derived from the append-only usage log, never from
//! mutable counters; the daily window starts at 07:00 UTC (15:00 Beijing).

use chrono::{DateTime, Duration, Timelike, Utc};

use crate::config::Tunables;
use crate::db::{DbActorHandle, DbUser, UsageWindow};
use crate::error::ProxyError;
use crate::model_catalog::{ModelGroup, ModelRoute};

/// Hour (UTC) at which the daily quota window rolls over.
pub const ROLLOVER_HOUR_UTC: u32 = 7;

/// Start of the current quota day for `now`: today's 07:00 UTC if already
/// past it, otherwise yesterday's.
pub fn start_of_quota_day(now: DateTime<Utc>) -> DateTime<Utc> {
    let rollover = now
        .with_hour(ROLLOVER_HOUR_UTC)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .expect("07:00:00 exists on every UTC day");

    if now >= rollover {
        rollover
    } else {
        rollover - Duration::days(1)
    }
}

fn no_cred_cap(group: ModelGroup, settings: &Tunables) -> i64 {
    match group {
        ModelGroup::Flash => settings.no_cred_quota_flash,
        ModelGroup::Pro => settings.no_cred_quota_25pro,
        ModelGroup::Three => settings.no_cred_quota_30pro,
    }
}

/// Enforce the daily quota for one request. Owners of at least one active
/// credential get their full `base + bonus` allowance; everyone else runs
/// against the per-group no-credential caps (zero disables a cap).
pub async fn check_daily_quota(
    db: &DbActorHandle,
    settings: &Tunables,
    user: &DbUser,
    route: &ModelRoute,
) -> Result<(), ProxyError> {
    let since = start_of_quota_day(Utc::now());

    if db.has_active_credential(user.id).await? {
        let used = db
            .count_usage(UsageWindow {
                user_id: user.id,
                since,
                success_only: true,
                group: None,
            })
            .await?;
        if used >= user.effective_quota() {
            return Err(ProxyError::QuotaExceeded(format!(
                "daily quota of {} requests reached; resets at {:02}:00 UTC",
                user.effective_quota(),
                ROLLOVER_HOUR_UTC
            )));
        }
        return Ok(());
    }

    let group = route.group();
    let cap = no_cred_cap(group, settings);
    if cap <= 0 {
        return Ok(());
    }

    let used = db
        .count_usage(UsageWindow {
            user_id: user.id,
            since,
            success_only: true,
            group: Some(group),
        })
        .await?;
    if used >= cap {
        return Err(ProxyError::QuotaExceeded(format!(
            "daily cap of {cap} requests for {} models reached (no active credential)",
            group.as_str()
        )));
    }
    Ok(())
}

/// Enforce the trailing-minute rate. Donors get the contributor rate,
/// admins are exempt. Counts every log row, denied requests included.
pub async fn check_rate_limit(
    db: &DbActorHandle,
    settings: &Tunables,
    user: &DbUser,
) -> Result<(), ProxyError> {
    if user.is_admin {
        return Ok(());
    }

    let has_public = db.has_active_public_credential(user.id).await?;
    let max_rpm = if has_public {
        settings.contributor_rpm
    } else {
        settings.base_rpm
    };

    let current = db
        .count_usage(UsageWindow {
            user_id: user.id,
            since: Utc::now() - Duration::seconds(60),
            success_only: false,
            group: None,
        })
        .await?;

    if current >= max_rpm {
        let hint = if has_public {
            String::new()
        } else {
            format!(" (donate a credential to raise it to {}/min)", settings.contributor_rpm)
        };
        return Err(ProxyError::QuotaExceeded(format!(
            "rate limit of {max_rpm} requests/min reached{hint}"
        )));
    }
    Ok(())
}
