use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::SystemTime;

use castor::config::Tunables;
use castor::db::actor::{SetActiveArgs, TogglePublicArgs, VerificationArgs};
use castor::db::{DbActorHandle, DonationRewards, NewCredential, NewUser, NewUsageLog};
use castor::error::ProxyError;
use castor::model_catalog::{ModelRoute, ModelTier};
use castor::quota;
use tokio::fs;

async fn spawn_temp_db() -> (DbActorHandle, std::path::PathBuf) {
    let tmp_dir = std::env::temp_dir();
    let mut hasher = DefaultHasher::new();
    SystemTime::now().hash(&mut hasher);
    std::thread::current().id().hash(&mut hasher);
    let db_path = tmp_dir.join(format!("castor_quota_{:016x}.sqlite", hasher.finish()));
    let database_url = format!("sqlite:{}", db_path.to_str().unwrap());
    (castor::db::spawn(&database_url).await, db_path)
}

async fn cleanup(db_path: std::path::PathBuf) {
    let wal = std::path::PathBuf::from(format!("{}-wal", db_path.to_string_lossy()));
    let shm = std::path::PathBuf::from(format!("{}-shm", db_path.to_string_lossy()));
    let _ = fs::remove_file(&wal).await;
    let _ = fs::remove_file(&shm).await;
    let _ = fs::remove_file(&db_path).await;
}

fn rewards() -> DonationRewards {
    DonationRewards {
        reward_25: 150,
        reward_30: 200,
    }
}

async fn seed_user(db: &DbActorHandle, name: &str, base_quota: i64, admin: bool) -> i64 {
    db.create_user(NewUser {
        username: name.to_string(),
        password_hash: "hash".to_string(),
        discord_id: None,
        is_admin: admin,
        base_quota,
    })
    .await
    .unwrap()
    .id
}

async fn seed_credential(db: &DbActorHandle, owner: i64, sha: &str, tier: &str, public: bool) -> i64 {
    db.insert_credential(
        NewCredential {
            owner_user_id: Some(owner),
            display_name: format!("cred-{sha}"),
            access_token_ct: None,
            refresh_token_ct: format!("ct-{sha}"),
            refresh_token_sha: sha.to_string(),
            client_id_ct: None,
            client_secret_ct: None,
            project_id: "project-1".to_string(),
            credential_type: "oauth".to_string(),
            model_tier: tier.to_string(),
            email: None,
            is_public: public,
        },
        rewards(),
    )
    .await
    .unwrap()
    .expect("seed credential must insert")
}

async fn log_request(db: &DbActorHandle, user: i64, model: &str, status: u16) {
    db.record_usage(NewUsageLog {
        user_id: user,
        api_key_id: None,
        credential_id: None,
        model: model.to_string(),
        endpoint: "/v1/chat/completions".to_string(),
        status_code: status,
        latency_ms: 5.0,
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn donation_toggle_is_idempotent_on_bonus() {
    let (db, db_path) = spawn_temp_db().await;
    let user = seed_user(&db, "donor", 100, false).await;
    let cred = seed_credential(&db, user, "priv", "3", false).await;

    assert_eq!(db.get_user(user).await.unwrap().unwrap().bonus_quota, 0);

    for _round in 0..2 {
        let toggled = db
            .set_credential_public(TogglePublicArgs {
                credential_id: cred,
                owner: Some(user),
                public: true,
                rewards: rewards(),
            })
            .await
            .unwrap();
        assert!(toggled.is_public);
        assert_eq!(db.get_user(user).await.unwrap().unwrap().bonus_quota, 200);

        // Toggling to the current state is a no-op.
        db.set_credential_public(TogglePublicArgs {
            credential_id: cred,
            owner: Some(user),
            public: true,
            rewards: rewards(),
        })
        .await
        .unwrap();
        assert_eq!(db.get_user(user).await.unwrap().unwrap().bonus_quota, 200);

        db.set_credential_public(TogglePublicArgs {
            credential_id: cred,
            owner: Some(user),
            public: false,
            rewards: rewards(),
        })
        .await
        .unwrap();
        assert_eq!(db.get_user(user).await.unwrap().unwrap().bonus_quota, 0);
    }

    cleanup(db_path).await;
}

#[tokio::test]
async fn admin_disable_and_enable_move_the_bonus() {
    let (db, db_path) = spawn_temp_db().await;
    let user = seed_user(&db, "donor2", 100, false).await;
    let cred = seed_credential(&db, user, "pub", "2.5", true).await;
    assert_eq!(db.get_user(user).await.unwrap().unwrap().bonus_quota, 150);

    db.set_credential_active(SetActiveArgs {
        credential_id: cred,
        active: false,
        rewards: rewards(),
    })
    .await
    .unwrap();
    assert_eq!(db.get_user(user).await.unwrap().unwrap().bonus_quota, 0);

    // Un-donating a disabled credential must not claw back a second time.
    db.set_credential_public(TogglePublicArgs {
        credential_id: cred,
        owner: Some(user),
        public: false,
        rewards: rewards(),
    })
    .await
    .unwrap();
    assert_eq!(db.get_user(user).await.unwrap().unwrap().bonus_quota, 0);

    cleanup(db_path).await;
}

#[tokio::test]
async fn verification_reprices_donated_tier_upgrade() {
    let (db, db_path) = spawn_temp_db().await;
    let user = seed_user(&db, "upgrader", 100, false).await;
    let cred = seed_credential(&db, user, "pub", "2.5", true).await;
    assert_eq!(db.get_user(user).await.unwrap().unwrap().bonus_quota, 150);

    db.apply_verification(VerificationArgs {
        credential_id: cred,
        is_valid: true,
        tier: ModelTier::Tier30,
        account_type: "pro".to_string(),
        error: None,
        rewards: rewards(),
    })
    .await
    .unwrap();

    let row = db.get_credential(cred).await.unwrap().unwrap();
    assert_eq!(row.model_tier, "3");
    assert_eq!(row.account_type, "pro");
    assert_eq!(db.get_user(user).await.unwrap().unwrap().bonus_quota, 200);

    // A failed verification disables and claws back.
    db.apply_verification(VerificationArgs {
        credential_id: cred,
        is_valid: false,
        tier: ModelTier::Tier30,
        account_type: "unknown".to_string(),
        error: Some("validity probe returned 400".to_string()),
        rewards: rewards(),
    })
    .await
    .unwrap();
    let row = db.get_credential(cred).await.unwrap().unwrap();
    assert!(!row.is_active);
    assert_eq!(db.get_user(user).await.unwrap().unwrap().bonus_quota, 0);

    cleanup(db_path).await;
}

#[tokio::test]
async fn daily_quota_blocks_credentialed_user_at_limit() {
    let (db, db_path) = spawn_temp_db().await;
    let settings = Tunables::default();
    let user_id = seed_user(&db, "quota", 2, false).await;
    seed_credential(&db, user_id, "own", "2.5", false).await;
    let user = db.get_user(user_id).await.unwrap().unwrap();
    let route = ModelRoute::parse("gemini-2.5-flash");

    quota::check_daily_quota(&db, &settings, &user, &route).await.unwrap();

    log_request(&db, user_id, "gemini-2.5-flash", 200).await;
    // Denied attempts do not consume daily quota.
    log_request(&db, user_id, "gemini-2.5-flash", 429).await;
    quota::check_daily_quota(&db, &settings, &user, &route).await.unwrap();

    log_request(&db, user_id, "gemini-2.5-flash", 200).await;
    let err = quota::check_daily_quota(&db, &settings, &user, &route)
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::QuotaExceeded(_)));

    cleanup(db_path).await;
}

#[tokio::test]
async fn no_credential_caps_apply_per_group() {
    let (db, db_path) = spawn_temp_db().await;
    let mut settings = Tunables::default();
    settings.no_cred_quota_flash = 2;
    settings.no_cred_quota_25pro = 1;
    settings.no_cred_quota_30pro = 0; // zero disables the cap

    let user_id = seed_user(&db, "nocred", 100, false).await;
    let user = db.get_user(user_id).await.unwrap().unwrap();

    log_request(&db, user_id, "gemini-2.5-flash", 200).await;
    log_request(&db, user_id, "gemini-2.5-flash", 200).await;
    log_request(&db, user_id, "gemini-2.5-pro", 200).await;

    let flash = ModelRoute::parse("gemini-2.5-flash");
    let pro = ModelRoute::parse("gemini-2.5-pro");
    let three = ModelRoute::parse("gemini-3-pro-preview");

    assert!(matches!(
        quota::check_daily_quota(&db, &settings, &user, &flash).await,
        Err(ProxyError::QuotaExceeded(_))
    ));
    assert!(matches!(
        quota::check_daily_quota(&db, &settings, &user, &pro).await,
        Err(ProxyError::QuotaExceeded(_))
    ));
    // Disabled cap never blocks.
    quota::check_daily_quota(&db, &settings, &user, &three).await.unwrap();

    cleanup(db_path).await;
}

#[tokio::test]
async fn rate_limit_counts_every_attempt_and_exempts_admins() {
    let (db, db_path) = spawn_temp_db().await;
    let settings = Tunables::default(); // base 5/min, contributor 10/min

    let user_id = seed_user(&db, "ratelimited", 100, false).await;
    let user = db.get_user(user_id).await.unwrap().unwrap();

    for _ in 0..4 {
        log_request(&db, user_id, "gemini-2.5-flash", 200).await;
    }
    // Failures count toward the window too.
    log_request(&db, user_id, "gemini-2.5-flash", 503).await;

    let err = quota::check_rate_limit(&db, &settings, &user).await.unwrap_err();
    assert!(matches!(err, ProxyError::QuotaExceeded(_)));

    // Donors get the contributor rate.
    seed_credential(&db, user_id, "donated", "2.5", true).await;
    quota::check_rate_limit(&db, &settings, &user).await.unwrap();

    // Admins bypass the limiter entirely.
    let admin_id = seed_user(&db, "admin", 100, true).await;
    let admin = db.get_user(admin_id).await.unwrap().unwrap();
    for _ in 0..20 {
        log_request(&db, admin_id, "gemini-2.5-flash", 200).await;
    }
    quota::check_rate_limit(&db, &settings, &admin).await.unwrap();

    cleanup(db_path).await;
}
