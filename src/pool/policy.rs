use chrono::{DateTime, Duration, Utc};

use crate::config::{PoolMode, Tunables};
use crate::db::models::{DbCredential, SelectionRequest};
use crate::model_catalog::{ModelGroup, ModelTier};

/// Error-text markers that permanently disable a credential. The upstream
/// codes 401/403 arrive embedded in the recorded failure text;
/// `invalid_grant` comes from the token endpoint.
const AUTH_FAILURE_MARKERS: &[&str] = &["401", "403", "PERMISSION_DENIED", "invalid_grant"];

pub fn is_auth_failure_text(error: &str) -> bool {
    AUTH_FAILURE_MARKERS.iter().any(|m| error.contains(m))
}

pub fn cooldown_secs(group: ModelGroup, settings: &Tunables) -> i64 {
    match group {
        ModelGroup::Flash => settings.cd_flash,
        ModelGroup::Pro => settings.cd_pro,
        ModelGroup::Three => settings.cd_30,
    }
}

/// A credential is cooling down for a group while the gap since its last
/// selection in that group is below the configured threshold. Stamps are
/// written on selection, not completion, so in-flight requests count.
pub fn in_cooldown(
    cred: &DbCredential,
    group: ModelGroup,
    cd_secs: i64,
    now: DateTime<Utc>,
) -> bool {
    if cd_secs <= 0 {
        return false;
    }
    match cred.last_used_for(group) {
        Some(last_used) => now < last_used + Duration::seconds(cd_secs),
        None => false,
    }
}

/// Whether `cred` may serve this request at all (validity, tier, sharing
/// mode). Cooldown is handled separately because it degrades gracefully.
pub fn admissible(
    cred: &DbCredential,
    req: &SelectionRequest,
    user_has_tier3: bool,
    user_has_public: bool,
) -> bool {
    // The SQL filter already dropped inactive and project-less rows.
    if req.exclude_ids.contains(&cred.id) {
        return false;
    }
    if cred.credential_type == "oauth" && cred.refresh_token.is_empty() {
        return false;
    }
    if !req.required_tier.accepts(cred.tier()) {
        return false;
    }

    let owned = cred.user_id == Some(req.user_id);
    match req.mode {
        PoolMode::Private => owned,
        PoolMode::Tier3Shared => {
            if req.required_tier == ModelTier::Tier30 {
                // The public tier-3 pool is only for users who brought one.
                owned || (cred.is_public && user_has_tier3)
            } else {
                owned || cred.is_public
            }
        }
        PoolMode::FullShared => owned || (cred.is_public && user_has_public),
    }
}

/// Pick from admissible candidates already ordered least-recently-used
/// first. Prefer the first credential outside its cooldown window; when all
/// are cooling down, fall back to the least-recently-used one anyway and let
/// the caller absorb a possible upstream 429.
pub fn pick<'a>(
    candidates: &[&'a DbCredential],
    group: ModelGroup,
    cd_secs: i64,
    now: DateTime<Utc>,
) -> Option<&'a DbCredential> {
    candidates
        .iter()
        .find(|cred| !in_cooldown(cred, group, cd_secs, now))
        .or_else(|| candidates.first())
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(id: i64, owner: Option<i64>, tier: &str, public: bool) -> DbCredential {
        DbCredential {
            id,
            user_id: owner,
            display_name: format!("cred-{id}"),
            access_token: None,
            refresh_token: "ct".to_string(),
            refresh_token_sha: format!("sha-{id}"),
            client_id: None,
            client_secret: None,
            project_id: "proj".to_string(),
            credential_type: "oauth".to_string(),
            model_tier: tier.to_string(),
            account_type: "unknown".to_string(),
            email: None,
            is_public: public,
            is_active: true,
            total_requests: 0,
            failed_requests: 0,
            last_error: None,
            last_used_at: None,
            last_used_flash: None,
            last_used_pro: None,
            last_used_30: None,
            created_at: Utc::now(),
        }
    }

    fn request(user_id: i64, tier: ModelTier, mode: PoolMode) -> SelectionRequest {
        SelectionRequest {
            user_id,
            required_tier: tier,
            group: ModelGroup::Flash,
            mode,
            cooldown_secs: 0,
            exclude_ids: Vec::new(),
        }
    }

    #[test]
    fn private_mode_sees_own_credentials_only() {
        let own = credential(1, Some(7), "2.5", false);
        let foreign = credential(2, Some(8), "2.5", true);
        let req = request(7, ModelTier::Tier25, PoolMode::Private);

        assert!(admissible(&own, &req, false, false));
        assert!(!admissible(&foreign, &req, false, false));
    }

    #[test]
    fn tier3_shared_gates_public_tier3_pool() {
        let public_t3 = credential(1, Some(8), "3", true);
        let req = request(7, ModelTier::Tier30, PoolMode::Tier3Shared);

        assert!(!admissible(&public_t3, &req, false, false));
        assert!(admissible(&public_t3, &req, true, false));

        // Tier-2.5 requests reach the public pool unconditionally.
        let req25 = request(7, ModelTier::Tier25, PoolMode::Tier3Shared);
        assert!(admissible(&public_t3, &req25, false, false));
    }

    #[test]
    fn full_shared_requires_own_donation() {
        let public = credential(1, Some(8), "2.5", true);
        let req = request(7, ModelTier::Tier25, PoolMode::FullShared);

        assert!(!admissible(&public, &req, false, false));
        assert!(admissible(&public, &req, false, true));
    }

    #[test]
    fn tier_mismatch_never_admissible() {
        let t25 = credential(1, Some(7), "2.5", false);
        let req = request(7, ModelTier::Tier30, PoolMode::Private);
        assert!(!admissible(&t25, &req, true, true));
    }

    #[test]
    fn tier25_request_accepts_tier3_credential() {
        let t3 = credential(1, Some(7), "3", false);
        let req = request(7, ModelTier::Tier25, PoolMode::Private);
        assert!(admissible(&t3, &req, false, false));
    }

    #[test]
    fn excluded_ids_skipped() {
        let cred = credential(1, Some(7), "2.5", false);
        let mut req = request(7, ModelTier::Tier25, PoolMode::Private);
        req.exclude_ids = vec![1];
        assert!(!admissible(&cred, &req, false, false));
    }

    #[test]
    fn oauth_without_refresh_token_not_selectable() {
        let mut cred = credential(1, Some(7), "2.5", false);
        cred.refresh_token = String::new();
        let req = request(7, ModelTier::Tier25, PoolMode::Private);
        assert!(!admissible(&cred, &req, false, false));
    }

    #[test]
    fn cooldown_window_respected() {
        let now = Utc::now();
        let mut cred = credential(1, Some(7), "2.5", false);
        assert!(!in_cooldown(&cred, ModelGroup::Flash, 10, now));

        cred.last_used_flash = Some(now - Duration::seconds(5));
        assert!(in_cooldown(&cred, ModelGroup::Flash, 10, now));
        assert!(!in_cooldown(&cred, ModelGroup::Flash, 10, now + Duration::seconds(6)));

        // Groups are independent.
        assert!(!in_cooldown(&cred, ModelGroup::Pro, 10, now));
        // cd 0 disables the window entirely.
        assert!(!in_cooldown(&cred, ModelGroup::Flash, 0, now));
    }

    #[test]
    fn pick_prefers_first_outside_cooldown_then_degrades() {
        let now = Utc::now();
        let mut a = credential(1, Some(7), "2.5", false);
        let mut b = credential(2, Some(7), "2.5", false);
        a.last_used_flash = Some(now - Duration::seconds(1));
        b.last_used_flash = Some(now - Duration::seconds(30));

        let picked = pick(&[&a, &b], ModelGroup::Flash, 10, now).unwrap();
        assert_eq!(picked.id, 2);

        // Everyone cooling down: degrade to the LRU head of the list.
        b.last_used_flash = Some(now - Duration::seconds(2));
        let picked = pick(&[&a, &b], ModelGroup::Flash, 10, now).unwrap();
        assert_eq!(picked.id, 1);

        assert!(pick(&[], ModelGroup::Flash, 10, now).is_none());
    }

    #[test]
    fn auth_failure_markers_match() {
        assert!(is_auth_failure_text("401 UNAUTHENTICATED"));
        assert!(is_auth_failure_text("status 403: PERMISSION_DENIED"));
        assert!(is_auth_failure_text("OAuth2 server response error: invalid_grant"));
        assert!(!is_auth_failure_text("503 overloaded"));
    }
}
