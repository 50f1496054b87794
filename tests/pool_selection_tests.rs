use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::SystemTime;

use castor::config::PoolMode;
use castor::db::actor::FailureArgs;
use castor::db::{DbActorHandle, DonationRewards, NewCredential, NewUser, SelectionRequest};
use castor::model_catalog::{ModelGroup, ModelTier};
use tokio::fs;

async fn spawn_temp_db() -> (DbActorHandle, std::path::PathBuf) {
    let tmp_dir = std::env::temp_dir();
    let mut hasher = DefaultHasher::new();
    SystemTime::now().hash(&mut hasher);
    std::thread::current().id().hash(&mut hasher);
    let db_path = tmp_dir.join(format!("castor_pool_{:016x}.sqlite", hasher.finish()));
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

async fn seed_user(db: &DbActorHandle, name: &str) -> i64 {
    db.create_user(NewUser {
        username: name.to_string(),
        password_hash: "hash".to_string(),
        discord_id: None,
        is_admin: false,
        base_quota: 100,
    })
    .await
    .unwrap()
    .id
}

async fn seed_credential(
    db: &DbActorHandle,
    owner: i64,
    sha: &str,
    tier: &str,
    public: bool,
) -> i64 {
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
            email: Some(format!("{sha}@example.com")),
            is_public: public,
        },
        rewards(),
    )
    .await
    .unwrap()
    .expect("seed credential must insert")
}

fn request(user_id: i64, tier: ModelTier, group: ModelGroup, mode: PoolMode) -> SelectionRequest {
    SelectionRequest {
        user_id,
        required_tier: tier,
        group,
        mode,
        cooldown_secs: 0,
        exclude_ids: Vec::new(),
    }
}

#[tokio::test]
async fn selection_rotates_least_recently_used() {
    let (db, db_path) = spawn_temp_db().await;
    let user = seed_user(&db, "alice").await;
    let a = seed_credential(&db, user, "a", "2.5", false).await;
    let b = seed_credential(&db, user, "b", "2.5", false).await;

    let req = || request(user, ModelTier::Tier25, ModelGroup::Flash, PoolMode::Private);

    // Never-used credentials go first, by id.
    let first = db.select_credential(req()).await.unwrap().unwrap();
    assert_eq!(first.id, a);
    assert_eq!(first.total_requests, 1);
    assert!(first.last_used_flash.is_some());

    let second = db.select_credential(req()).await.unwrap().unwrap();
    assert_eq!(second.id, b);

    // Round robin comes back to the first.
    let third = db.select_credential(req()).await.unwrap().unwrap();
    assert_eq!(third.id, a);
    assert_eq!(third.total_requests, 2);

    cleanup(db_path).await;
}

#[tokio::test]
async fn tier_gate_and_exclusions() {
    let (db, db_path) = spawn_temp_db().await;
    let user = seed_user(&db, "bob").await;
    let t25 = seed_credential(&db, user, "t25", "2.5", false).await;
    let t3 = seed_credential(&db, user, "t3", "3", false).await;

    // Tier-3 request never falls back to a 2.5 credential.
    let picked = db
        .select_credential(request(user, ModelTier::Tier30, ModelGroup::Three, PoolMode::Private))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(picked.id, t3);

    let mut req = request(user, ModelTier::Tier30, ModelGroup::Three, PoolMode::Private);
    req.exclude_ids = vec![t3];
    assert!(db.select_credential(req).await.unwrap().is_none());

    // Tier-2.5 requests may ride a tier-3 credential (upward only).
    let mut req = request(user, ModelTier::Tier25, ModelGroup::Flash, PoolMode::Private);
    req.exclude_ids = vec![t25];
    let picked = db.select_credential(req).await.unwrap().unwrap();
    assert_eq!(picked.id, t3);

    cleanup(db_path).await;
}

#[tokio::test]
async fn sharing_modes_control_foreign_credentials() {
    let (db, db_path) = spawn_temp_db().await;
    let donor = seed_user(&db, "donor").await;
    let taker = seed_user(&db, "taker").await;
    seed_credential(&db, donor, "pub25", "2.5", true).await;
    seed_credential(&db, donor, "pub30", "3", true).await;

    // Private: nothing foreign.
    assert!(
        db.select_credential(request(taker, ModelTier::Tier25, ModelGroup::Flash, PoolMode::Private))
            .await
            .unwrap()
            .is_none()
    );

    // Full-shared potluck: no own donation, no pool access.
    assert!(
        db.select_credential(request(taker, ModelTier::Tier25, ModelGroup::Flash, PoolMode::FullShared))
            .await
            .unwrap()
            .is_none()
    );

    // Tier3-shared: public 2.5 pool is open to everyone...
    let picked = db
        .select_credential(request(taker, ModelTier::Tier25, ModelGroup::Flash, PoolMode::Tier3Shared))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(picked.user_id, Some(donor));

    // ...but the public tier-3 pool requires an own tier-3 credential.
    assert!(
        db.select_credential(request(taker, ModelTier::Tier30, ModelGroup::Three, PoolMode::Tier3Shared))
            .await
            .unwrap()
            .is_none()
    );
    seed_credential(&db, taker, "own30", "3", false).await;
    assert!(
        db.select_credential(request(taker, ModelTier::Tier30, ModelGroup::Three, PoolMode::Tier3Shared))
            .await
            .unwrap()
            .is_some()
    );

    // Potluck entry: donate one, use all.
    let own_public = seed_credential(&db, taker, "own25pub", "2.5", true).await;
    let picked = db
        .select_credential(request(taker, ModelTier::Tier25, ModelGroup::Flash, PoolMode::FullShared))
        .await
        .unwrap();
    assert!(picked.is_some());

    // Scope checks used by the model listing.
    assert!(db.has_tier3_in_scope(taker, PoolMode::Private).await.unwrap());
    assert!(db.has_active_public_credential(taker).await.unwrap());
    let _ = own_public;

    cleanup(db_path).await;
}

#[tokio::test]
async fn cooldown_prefers_rested_credentials_then_degrades() {
    let (db, db_path) = spawn_temp_db().await;
    let user = seed_user(&db, "cd").await;
    let a = seed_credential(&db, user, "cd-a", "2.5", false).await;
    let b = seed_credential(&db, user, "cd-b", "2.5", false).await;

    let mut req = request(user, ModelTier::Tier25, ModelGroup::Flash, PoolMode::Private);
    req.cooldown_secs = 3600;

    let first = db.select_credential(req.clone()).await.unwrap().unwrap();
    assert_eq!(first.id, a);

    // A is now cooling down for flash; B is rested.
    let second = db.select_credential(req.clone()).await.unwrap().unwrap();
    assert_eq!(second.id, b);

    // Everyone cooling down: degrade to the least-recently-used anyway.
    let third = db.select_credential(req.clone()).await.unwrap().unwrap();
    assert_eq!(third.id, a);

    // Cooldown is scoped per group: the pro group is untouched.
    let mut pro_req = request(user, ModelTier::Tier25, ModelGroup::Pro, PoolMode::Private);
    pro_req.cooldown_secs = 3600;
    let picked = db.select_credential(pro_req).await.unwrap().unwrap();
    assert!(picked.last_used_pro.is_some());

    cleanup(db_path).await;
}

#[tokio::test]
async fn auth_failures_disable_and_claw_back() {
    let (db, db_path) = spawn_temp_db().await;
    let user = seed_user(&db, "victim").await;
    let cred = seed_credential(&db, user, "pub", "3", true).await;

    let bonus = db.get_user(user).await.unwrap().unwrap().bonus_quota;
    assert_eq!(bonus, 200);

    // A retryable upstream error only counts the failure.
    db.record_failure(FailureArgs {
        credential_id: cred,
        error: "503 overloaded".to_string(),
        rewards: rewards(),
    })
    .await
    .unwrap();
    let row = db.get_credential(cred).await.unwrap().unwrap();
    assert!(row.is_active);
    assert_eq!(row.failed_requests, 1);
    assert_eq!(row.last_error.as_deref(), Some("503 overloaded"));

    // An auth failure disables the credential and reverses the donation.
    db.record_failure(FailureArgs {
        credential_id: cred,
        error: "403 PERMISSION_DENIED".to_string(),
        rewards: rewards(),
    })
    .await
    .unwrap();
    let row = db.get_credential(cred).await.unwrap().unwrap();
    assert!(!row.is_active);
    assert_eq!(row.failed_requests, 2);
    assert_eq!(db.get_user(user).await.unwrap().unwrap().bonus_quota, 0);

    // Disabled credentials drop out of selection entirely.
    assert!(
        db.select_credential(request(user, ModelTier::Tier25, ModelGroup::Flash, PoolMode::Private))
            .await
            .unwrap()
            .is_none()
    );

    // A second auth failure must not claw back twice.
    db.record_failure(FailureArgs {
        credential_id: cred,
        error: "401 invalid".to_string(),
        rewards: rewards(),
    })
    .await
    .unwrap();
    assert_eq!(db.get_user(user).await.unwrap().unwrap().bonus_quota, 0);

    cleanup(db_path).await;
}
