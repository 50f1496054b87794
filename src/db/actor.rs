//! The single database writer.
//!
//! Every query in the crate goes through this ractor actor. Messages are
//! processed one at a time, so the credential-selection transaction (LRU
//! scan + `last_used_*` stamp) can never race another selection — the
//! serialized-actor equivalent of `SELECT ... FOR UPDATE SKIP LOCKED`.

use crate::config::PoolMode;
use crate::db::models::{
    DbApiKey, DbCredential, DbUser, DonationRewards, NewCredential, NewUsageLog, NewUser,
    PoolStats, SelectionRequest, UsageWindow,
};
use crate::db::schema::SQLITE_INIT;
use crate::error::ProxyError;
use crate::model_catalog::{ModelGroup, ModelTier};
use crate::pool::policy;
use chrono::Utc;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::{str::FromStr, time::Duration};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CreateApiKeyArgs {
    pub user_id: i64,
    pub name: String,
    pub secret: String,
}

#[derive(Debug, Clone)]
pub struct ApiKeyRef {
    pub user_id: i64,
    pub key_id: i64,
}

#[derive(Debug, Clone)]
pub struct InsertCredentialArgs {
    pub new: NewCredential,
    pub rewards: DonationRewards,
}

#[derive(Debug, Clone)]
pub struct TogglePublicArgs {
    pub credential_id: i64,
    /// `Some` restricts the mutation to this owner; `None` is the admin path.
    pub owner: Option<i64>,
    pub public: bool,
    pub rewards: DonationRewards,
}

#[derive(Debug, Clone)]
pub struct SetActiveArgs {
    pub credential_id: i64,
    pub active: bool,
    pub rewards: DonationRewards,
}

#[derive(Debug, Clone)]
pub struct DeleteCredentialArgs {
    pub credential_id: i64,
    pub owner: Option<i64>,
    pub rewards: DonationRewards,
}

#[derive(Debug, Clone)]
pub struct BatchDeleteArgs {
    pub credential_ids: Vec<i64>,
    pub rewards: DonationRewards,
}

#[derive(Debug, Clone)]
pub struct FailureArgs {
    pub credential_id: i64,
    pub error: String,
    pub rewards: DonationRewards,
}

#[derive(Debug, Clone)]
pub struct TokenUpdateArgs {
    pub credential_id: i64,
    pub access_token_ct: String,
}

#[derive(Debug, Clone)]
pub struct VerificationArgs {
    pub credential_id: i64,
    pub is_valid: bool,
    pub tier: ModelTier,
    pub account_type: String,
    pub error: Option<String>,
    pub rewards: DonationRewards,
}

#[derive(Debug, Clone)]
pub struct ScopeArgs {
    pub user_id: i64,
    pub mode: PoolMode,
}

/// Public messages handled by the database actor.
#[derive(Debug)]
pub enum DbActorMessage {
    CreateUser(NewUser, RpcReplyPort<Result<DbUser, ProxyError>>),
    GetUserByUsername(String, RpcReplyPort<Result<Option<DbUser>, ProxyError>>),
    GetUser(i64, RpcReplyPort<Result<Option<DbUser>, ProxyError>>),
    CountUsers(RpcReplyPort<Result<i64, ProxyError>>),
    /// Resolve an API key secret into its active user; touches the key's
    /// `last_used_at`. Returns `(user, api_key_id)`.
    AuthenticateApiKey(String, RpcReplyPort<Result<Option<(DbUser, i64)>, ProxyError>>),

    ListApiKeys(i64, RpcReplyPort<Result<Vec<DbApiKey>, ProxyError>>),
    CreateApiKey(CreateApiKeyArgs, RpcReplyPort<Result<DbApiKey, ProxyError>>),
    DeleteApiKey(ApiKeyRef, RpcReplyPort<Result<bool, ProxyError>>),

    /// Insert a credential; `Ok(None)` means the upload was a duplicate.
    InsertCredential(InsertCredentialArgs, RpcReplyPort<Result<Option<i64>, ProxyError>>),
    /// List credentials, optionally restricted to one owner.
    ListCredentials(Option<i64>, RpcReplyPort<Result<Vec<DbCredential>, ProxyError>>),
    GetCredential(i64, RpcReplyPort<Result<Option<DbCredential>, ProxyError>>),
    SetCredentialPublic(TogglePublicArgs, RpcReplyPort<Result<DbCredential, ProxyError>>),
    SetCredentialActive(SetActiveArgs, RpcReplyPort<Result<(), ProxyError>>),
    DeleteCredential(DeleteCredentialArgs, RpcReplyPort<Result<bool, ProxyError>>),
    DeleteCredentialsBatch(BatchDeleteArgs, RpcReplyPort<Result<u64, ProxyError>>),
    /// The pool-selection transaction.
    SelectCredential(SelectionRequest, RpcReplyPort<Result<Option<DbCredential>, ProxyError>>),
    /// Record a failed attempt; auth failures disable the credential and
    /// claw back the owner's donation bonus.
    RecordFailure(FailureArgs, RpcReplyPort<Result<(), ProxyError>>),
    UpdateAccessToken(TokenUpdateArgs, RpcReplyPort<Result<(), ProxyError>>),
    ApplyVerification(VerificationArgs, RpcReplyPort<Result<(), ProxyError>>),
    PoolStats(RpcReplyPort<Result<PoolStats, ProxyError>>),

    HasActiveCredential(i64, RpcReplyPort<Result<bool, ProxyError>>),
    HasActivePublicCredential(i64, RpcReplyPort<Result<bool, ProxyError>>),
    /// Whether any tier-3 credential is reachable for this user under the
    /// given sharing mode (drives the tier-3 entries of model listings).
    HasTier3InScope(ScopeArgs, RpcReplyPort<Result<bool, ProxyError>>),

    RecordUsage(NewUsageLog, RpcReplyPort<Result<(), ProxyError>>),
    CountUsage(UsageWindow, RpcReplyPort<Result<i64, ProxyError>>),

    LoadConfigOverrides(RpcReplyPort<Result<Vec<(String, String)>, ProxyError>>),
    SaveConfigOverride((String, String), RpcReplyPort<Result<(), ProxyError>>),
}

/// Handle for interacting with the database actor.
#[derive(Clone)]
pub struct DbActorHandle {
    actor: ActorRef<DbActorMessage>,
}

macro_rules! rpc {
    ($self:ident, $variant:ident) => {
        ractor::call!($self.actor, DbActorMessage::$variant)
            .map_err(|e| ProxyError::Ractor(format!(concat!(stringify!($variant), " RPC failed: {}"), e)))?
    };
    ($self:ident, $variant:ident, $arg:expr) => {
        ractor::call!($self.actor, DbActorMessage::$variant, $arg)
            .map_err(|e| ProxyError::Ractor(format!(concat!(stringify!($variant), " RPC failed: {}"), e)))?
    };
}

impl DbActorHandle {
    pub async fn create_user(&self, new: NewUser) -> Result<DbUser, ProxyError> {
        rpc!(self, CreateUser, new)
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<DbUser>, ProxyError> {
        rpc!(self, GetUserByUsername, username.to_string())
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<DbUser>, ProxyError> {
        rpc!(self, GetUser, id)
    }

    pub async fn count_users(&self) -> Result<i64, ProxyError> {
        rpc!(self, CountUsers)
    }

    pub async fn authenticate_api_key(
        &self,
        secret: &str,
    ) -> Result<Option<(DbUser, i64)>, ProxyError> {
        rpc!(self, AuthenticateApiKey, secret.to_string())
    }

    pub async fn list_api_keys(&self, user_id: i64) -> Result<Vec<DbApiKey>, ProxyError> {
        rpc!(self, ListApiKeys, user_id)
    }

    pub async fn create_api_key(&self, args: CreateApiKeyArgs) -> Result<DbApiKey, ProxyError> {
        rpc!(self, CreateApiKey, args)
    }

    pub async fn delete_api_key(&self, user_id: i64, key_id: i64) -> Result<bool, ProxyError> {
        rpc!(self, DeleteApiKey, ApiKeyRef { user_id, key_id })
    }

    pub async fn insert_credential(
        &self,
        new: NewCredential,
        rewards: DonationRewards,
    ) -> Result<Option<i64>, ProxyError> {
        rpc!(self, InsertCredential, InsertCredentialArgs { new, rewards })
    }

    pub async fn list_credentials(
        &self,
        owner: Option<i64>,
    ) -> Result<Vec<DbCredential>, ProxyError> {
        rpc!(self, ListCredentials, owner)
    }

    pub async fn get_credential(&self, id: i64) -> Result<Option<DbCredential>, ProxyError> {
        rpc!(self, GetCredential, id)
    }

    pub async fn set_credential_public(
        &self,
        args: TogglePublicArgs,
    ) -> Result<DbCredential, ProxyError> {
        rpc!(self, SetCredentialPublic, args)
    }

    pub async fn set_credential_active(&self, args: SetActiveArgs) -> Result<(), ProxyError> {
        rpc!(self, SetCredentialActive, args)
    }

    pub async fn delete_credential(&self, args: DeleteCredentialArgs) -> Result<bool, ProxyError> {
        rpc!(self, DeleteCredential, args)
    }

    pub async fn delete_credentials_batch(&self, args: BatchDeleteArgs) -> Result<u64, ProxyError> {
        rpc!(self, DeleteCredentialsBatch, args)
    }

    pub async fn select_credential(
        &self,
        request: SelectionRequest,
    ) -> Result<Option<DbCredential>, ProxyError> {
        rpc!(self, SelectCredential, request)
    }

    pub async fn record_failure(&self, args: FailureArgs) -> Result<(), ProxyError> {
        rpc!(self, RecordFailure, args)
    }

    pub async fn update_access_token(&self, args: TokenUpdateArgs) -> Result<(), ProxyError> {
        rpc!(self, UpdateAccessToken, args)
    }

    pub async fn apply_verification(&self, args: VerificationArgs) -> Result<(), ProxyError> {
        rpc!(self, ApplyVerification, args)
    }

    pub async fn pool_stats(&self) -> Result<PoolStats, ProxyError> {
        rpc!(self, PoolStats)
    }

    pub async fn has_active_credential(&self, user_id: i64) -> Result<bool, ProxyError> {
        rpc!(self, HasActiveCredential, user_id)
    }

    pub async fn has_active_public_credential(&self, user_id: i64) -> Result<bool, ProxyError> {
        rpc!(self, HasActivePublicCredential, user_id)
    }

    pub async fn has_tier3_in_scope(&self, user_id: i64, mode: PoolMode) -> Result<bool, ProxyError> {
        rpc!(self, HasTier3InScope, ScopeArgs { user_id, mode })
    }

    pub async fn record_usage(&self, log: NewUsageLog) -> Result<(), ProxyError> {
        rpc!(self, RecordUsage, log)
    }

    pub async fn count_usage(&self, window: UsageWindow) -> Result<i64, ProxyError> {
        rpc!(self, CountUsage, window)
    }

    pub async fn load_config_overrides(&self) -> Result<Vec<(String, String)>, ProxyError> {
        rpc!(self, LoadConfigOverrides)
    }

    pub async fn save_config_override(&self, key: &str, value: &str) -> Result<(), ProxyError> {
        rpc!(self, SaveConfigOverride, (key.to_string(), value.to_string()))
    }
}

struct DbActorState {
    pool: SqlitePool,
}

struct DbActor;

#[ractor::async_trait]
impl Actor for DbActor {
    type Msg = DbActorMessage;
    type State = DbActorState;
    type Arguments = String;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        database_url: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let connect_opts = SqliteConnectOptions::from_str(database_url.as_str())
            .map_err(|e| ActorProcessingErr::from(format!("invalid database url: {e}")))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5))
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .connect_with(connect_opts)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("db connect failed: {e}")))?;

        apply_schema(&pool)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("db schema init failed: {e}")))?;

        info!("DbActor initialized");
        Ok(DbActorState { pool })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let pool = &state.pool;
        match message {
            DbActorMessage::CreateUser(new, reply) => {
                let _ = reply.send(self.create_user(pool, new).await);
            }
            DbActorMessage::GetUserByUsername(username, reply) => {
                let res = sqlx::query_as::<_, DbUser>("SELECT * FROM users WHERE username = ?")
                    .bind(username)
                    .fetch_optional(pool)
                    .await
                    .map_err(ProxyError::from);
                let _ = reply.send(res);
            }
            DbActorMessage::GetUser(id, reply) => {
                let res = sqlx::query_as::<_, DbUser>("SELECT * FROM users WHERE id = ?")
                    .bind(id)
                    .fetch_optional(pool)
                    .await
                    .map_err(ProxyError::from);
                let _ = reply.send(res);
            }
            DbActorMessage::CountUsers(reply) => {
                let res = sqlx::query_scalar::<_, i64>("SELECT COUNT(id) FROM users")
                    .fetch_one(pool)
                    .await
                    .map_err(ProxyError::from);
                let _ = reply.send(res);
            }
            DbActorMessage::AuthenticateApiKey(secret, reply) => {
                let _ = reply.send(self.authenticate_api_key(pool, secret).await);
            }
            DbActorMessage::ListApiKeys(user_id, reply) => {
                let res = sqlx::query_as::<_, DbApiKey>(
                    "SELECT * FROM api_keys WHERE user_id = ? ORDER BY created_at DESC",
                )
                .bind(user_id)
                .fetch_all(pool)
                .await
                .map_err(ProxyError::from);
                let _ = reply.send(res);
            }
            DbActorMessage::CreateApiKey(args, reply) => {
                let _ = reply.send(self.create_api_key(pool, args).await);
            }
            DbActorMessage::DeleteApiKey(key_ref, reply) => {
                let res = sqlx::query("DELETE FROM api_keys WHERE id = ? AND user_id = ?")
                    .bind(key_ref.key_id)
                    .bind(key_ref.user_id)
                    .execute(pool)
                    .await
                    .map(|r| r.rows_affected() > 0)
                    .map_err(ProxyError::from);
                let _ = reply.send(res);
            }
            DbActorMessage::InsertCredential(args, reply) => {
                let _ = reply.send(self.insert_credential(pool, args).await);
            }
            DbActorMessage::ListCredentials(owner, reply) => {
                let res = match owner {
                    Some(user_id) => {
                        sqlx::query_as::<_, DbCredential>(
                            "SELECT * FROM credentials WHERE user_id = ? ORDER BY created_at DESC",
                        )
                        .bind(user_id)
                        .fetch_all(pool)
                        .await
                    }
                    None => {
                        sqlx::query_as::<_, DbCredential>(
                            "SELECT * FROM credentials ORDER BY created_at DESC",
                        )
                        .fetch_all(pool)
                        .await
                    }
                }
                .map_err(ProxyError::from);
                let _ = reply.send(res);
            }
            DbActorMessage::GetCredential(id, reply) => {
                let res = sqlx::query_as::<_, DbCredential>("SELECT * FROM credentials WHERE id = ?")
                    .bind(id)
                    .fetch_optional(pool)
                    .await
                    .map_err(ProxyError::from);
                let _ = reply.send(res);
            }
            DbActorMessage::SetCredentialPublic(args, reply) => {
                let _ = reply.send(self.set_credential_public(pool, args).await);
            }
            DbActorMessage::SetCredentialActive(args, reply) => {
                let _ = reply.send(self.set_credential_active(pool, args).await);
            }
            DbActorMessage::DeleteCredential(args, reply) => {
                let _ = reply.send(self.delete_credential(pool, args).await);
            }
            DbActorMessage::DeleteCredentialsBatch(args, reply) => {
                let _ = reply.send(self.delete_credentials_batch(pool, args).await);
            }
            DbActorMessage::SelectCredential(request, reply) => {
                let _ = reply.send(self.select_credential(pool, request).await);
            }
            DbActorMessage::RecordFailure(args, reply) => {
                let _ = reply.send(self.record_failure(pool, args).await);
            }
            DbActorMessage::UpdateAccessToken(args, reply) => {
                let res = sqlx::query("UPDATE credentials SET access_token = ? WHERE id = ?")
                    .bind(args.access_token_ct)
                    .bind(args.credential_id)
                    .execute(pool)
                    .await
                    .map(|_| ())
                    .map_err(ProxyError::from);
                let _ = reply.send(res);
            }
            DbActorMessage::ApplyVerification(args, reply) => {
                let _ = reply.send(self.apply_verification(pool, args).await);
            }
            DbActorMessage::PoolStats(reply) => {
                let res = sqlx::query_as::<_, PoolStats>(
                    r#"
                SELECT
                    COUNT(id) AS total,
                    COALESCE(SUM(is_active), 0) AS active,
                    COALESCE(SUM(CASE WHEN is_public = 1 AND is_active = 1 THEN 1 ELSE 0 END), 0) AS public,
                    COALESCE(SUM(CASE WHEN model_tier = '3' AND is_active = 1 THEN 1 ELSE 0 END), 0) AS tier3,
                    COALESCE(SUM(total_requests), 0) AS total_requests,
                    COALESCE(SUM(failed_requests), 0) AS failed_requests
                FROM credentials
                "#,
                )
                .fetch_one(pool)
                .await
                .map_err(ProxyError::from);
                let _ = reply.send(res);
            }
            DbActorMessage::HasActiveCredential(user_id, reply) => {
                let res = sqlx::query_scalar::<_, bool>(
                    "SELECT EXISTS(SELECT 1 FROM credentials WHERE user_id = ? AND is_active = 1)",
                )
                .bind(user_id)
                .fetch_one(pool)
                .await
                .map_err(ProxyError::from);
                let _ = reply.send(res);
            }
            DbActorMessage::HasActivePublicCredential(user_id, reply) => {
                let res = sqlx::query_scalar::<_, bool>(
                    "SELECT EXISTS(SELECT 1 FROM credentials WHERE user_id = ? AND is_public = 1 AND is_active = 1)",
                )
                .bind(user_id)
                .fetch_one(pool)
                .await
                .map_err(ProxyError::from);
                let _ = reply.send(res);
            }
            DbActorMessage::HasTier3InScope(args, reply) => {
                let _ = reply.send(self.has_tier3_in_scope(pool, args).await);
            }
            DbActorMessage::RecordUsage(log, reply) => {
                let res = sqlx::query(
                    r#"
                INSERT INTO usage_logs (user_id, api_key_id, credential_id, model, endpoint, status_code, latency_ms, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
                )
                .bind(log.user_id)
                .bind(log.api_key_id)
                .bind(log.credential_id)
                .bind(log.model)
                .bind(log.endpoint)
                .bind(i64::from(log.status_code))
                .bind(log.latency_ms)
                .bind(Utc::now())
                .execute(pool)
                .await
                .map(|_| ())
                .map_err(ProxyError::from);
                let _ = reply.send(res);
            }
            DbActorMessage::CountUsage(window, reply) => {
                let _ = reply.send(self.count_usage(pool, window).await);
            }
            DbActorMessage::LoadConfigOverrides(reply) => {
                let res = sqlx::query_as::<_, (String, String)>(
                    "SELECT key, value FROM system_config ORDER BY key",
                )
                .fetch_all(pool)
                .await
                .map_err(ProxyError::from);
                let _ = reply.send(res);
            }
            DbActorMessage::SaveConfigOverride((key, value), reply) => {
                let res = sqlx::query(
                    r#"
                INSERT INTO system_config (key, value, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
                "#,
                )
                .bind(key)
                .bind(value)
                .bind(Utc::now())
                .execute(pool)
                .await
                .map(|_| ())
                .map_err(ProxyError::from);
                let _ = reply.send(res);
            }
        }
        Ok(())
    }
}

impl DbActor {
    async fn create_user(&self, pool: &SqlitePool, new: NewUser) -> Result<DbUser, ProxyError> {
        let now = Utc::now();
        let user = sqlx::query_as::<_, DbUser>(
            r#"
        INSERT INTO users (username, password_hash, discord_id, is_active, is_admin, base_quota, bonus_quota, created_at)
        VALUES (?, ?, ?, 1, ?, ?, 0, ?)
        RETURNING *
        "#,
        )
        .bind(new.username)
        .bind(new.password_hash)
        .bind(new.discord_id)
        .bind(new.is_admin)
        .bind(new.base_quota)
        .bind(now)
        .fetch_one(pool)
        .await?;

        Ok(user)
    }

    async fn authenticate_api_key(
        &self,
        pool: &SqlitePool,
        secret: String,
    ) -> Result<Option<(DbUser, i64)>, ProxyError> {
        let Some(key) = sqlx::query_as::<_, DbApiKey>(
            "SELECT * FROM api_keys WHERE secret = ? AND is_active = 1",
        )
        .bind(secret)
        .fetch_optional(pool)
        .await?
        else {
            return Ok(None);
        };

        let Some(user) = sqlx::query_as::<_, DbUser>("SELECT * FROM users WHERE id = ?")
            .bind(key.user_id)
            .fetch_optional(pool)
            .await?
        else {
            return Ok(None);
        };

        sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(key.id)
            .execute(pool)
            .await?;

        Ok(Some((user, key.id)))
    }

    async fn create_api_key(
        &self,
        pool: &SqlitePool,
        args: CreateApiKeyArgs,
    ) -> Result<DbApiKey, ProxyError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(id) FROM api_keys WHERE user_id = ?")
            .bind(args.user_id)
            .fetch_one(pool)
            .await?;
        if count >= 5 {
            return Err(ProxyError::InvalidRequest(
                "at most 5 API keys per user".to_string(),
            ));
        }

        let key = sqlx::query_as::<_, DbApiKey>(
            r#"
        INSERT INTO api_keys (user_id, secret, name, is_active, created_at)
        VALUES (?, ?, ?, 1, ?)
        RETURNING *
        "#,
        )
        .bind(args.user_id)
        .bind(args.secret)
        .bind(args.name)
        .bind(Utc::now())
        .fetch_one(pool)
        .await?;

        Ok(key)
    }

    async fn insert_credential(
        &self,
        pool: &SqlitePool,
        args: InsertCredentialArgs,
    ) -> Result<Option<i64>, ProxyError> {
        let InsertCredentialArgs { new, rewards } = args;
        let mut tx = pool.begin().await?;

        let duplicate: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM credentials WHERE refresh_token_sha = ? OR (email IS NOT NULL AND email = ?))",
        )
        .bind(&new.refresh_token_sha)
        .bind(&new.email)
        .fetch_one(&mut *tx)
        .await?;
        if duplicate {
            return Ok(None);
        }

        let id: i64 = sqlx::query_scalar(
            r#"
        INSERT INTO credentials (
            user_id, display_name, access_token, refresh_token, refresh_token_sha,
            client_id, client_secret, project_id, credential_type, model_tier,
            account_type, email, is_public, is_active, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'unknown', ?, ?, 1, ?)
        RETURNING id
        "#,
        )
        .bind(new.owner_user_id)
        .bind(&new.display_name)
        .bind(&new.access_token_ct)
        .bind(&new.refresh_token_ct)
        .bind(&new.refresh_token_sha)
        .bind(&new.client_id_ct)
        .bind(&new.client_secret_ct)
        .bind(&new.project_id)
        .bind(&new.credential_type)
        .bind(&new.model_tier)
        .bind(&new.email)
        .bind(new.is_public)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        if new.is_public && let Some(owner) = new.owner_user_id {
            let reward = rewards.for_tier(ModelTier::from_str_lossy(&new.model_tier));
            adjust_bonus(&mut tx, owner, reward).await?;
            info!(credential_id = id, owner, reward, "donation reward credited on upload");
        }

        tx.commit().await?;
        Ok(Some(id))
    }

    async fn select_credential(
        &self,
        pool: &SqlitePool,
        request: SelectionRequest,
    ) -> Result<Option<DbCredential>, ProxyError> {
        let mut tx = pool.begin().await?;

        // LRU order; NULL last_used_at sorts first in SQLite ASC, id breaks ties.
        let rows = sqlx::query_as::<_, DbCredential>(
            r#"
        SELECT * FROM credentials
        WHERE is_active = 1 AND project_id != ''
        ORDER BY last_used_at ASC, id ASC
        "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        let user_has_tier3 = rows
            .iter()
            .any(|c| c.user_id == Some(request.user_id) && c.tier() == ModelTier::Tier30);
        let user_has_public = rows
            .iter()
            .any(|c| c.user_id == Some(request.user_id) && c.is_public);

        let candidates: Vec<&DbCredential> = rows
            .iter()
            .filter(|cred| policy::admissible(cred, &request, user_has_tier3, user_has_public))
            .collect();

        let now = Utc::now();
        let Some(chosen) = policy::pick(&candidates, request.group, request.cooldown_secs, now)
        else {
            return Ok(None);
        };

        let stamp_column = match request.group {
            ModelGroup::Flash => "last_used_flash",
            ModelGroup::Pro => "last_used_pro",
            ModelGroup::Three => "last_used_30",
        };
        let sql = format!(
            "UPDATE credentials SET last_used_at = ?, {stamp_column} = ?, total_requests = total_requests + 1 WHERE id = ? RETURNING *"
        );
        let updated = sqlx::query_as::<_, DbCredential>(&sql)
            .bind(now)
            .bind(now)
            .bind(chosen.id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(updated))
    }

    async fn record_failure(
        &self,
        pool: &SqlitePool,
        args: FailureArgs,
    ) -> Result<(), ProxyError> {
        let mut tx = pool.begin().await?;

        sqlx::query(
            "UPDATE credentials SET failed_requests = failed_requests + 1, last_error = ? WHERE id = ?",
        )
        .bind(&args.error)
        .bind(args.credential_id)
        .execute(&mut *tx)
        .await?;

        if policy::is_auth_failure_text(&args.error) {
            let cred = sqlx::query_as::<_, DbCredential>("SELECT * FROM credentials WHERE id = ?")
                .bind(args.credential_id)
                .fetch_optional(&mut *tx)
                .await?;

            if let Some(cred) = cred
                && cred.is_active
            {
                sqlx::query("UPDATE credentials SET is_active = 0 WHERE id = ?")
                    .bind(cred.id)
                    .execute(&mut *tx)
                    .await?;

                if cred.is_public && let Some(owner) = cred.user_id {
                    let deduct = args.rewards.for_tier(cred.tier());
                    adjust_bonus(&mut tx, owner, -deduct).await?;
                    warn!(
                        credential_id = cred.id,
                        owner, deduct, "credential auto-disabled, donation bonus clawed back"
                    );
                } else {
                    warn!(credential_id = cred.id, "credential auto-disabled on auth failure");
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn set_credential_public(
        &self,
        pool: &SqlitePool,
        args: TogglePublicArgs,
    ) -> Result<DbCredential, ProxyError> {
        let mut tx = pool.begin().await?;

        let cred = fetch_owned(&mut tx, args.credential_id, args.owner).await?;

        if cred.is_public == args.public {
            return Ok(cred);
        }
        if args.public && !cred.is_active {
            return Err(ProxyError::InvalidRequest(
                "an inactive credential cannot be donated".to_string(),
            ));
        }

        // Bonus follows public ∧ active: the reward of a dead credential was
        // already clawed back when it got disabled.
        if cred.is_active && let Some(owner) = cred.user_id {
            let reward = args.rewards.for_tier(cred.tier());
            let delta = if args.public { reward } else { -reward };
            adjust_bonus(&mut tx, owner, delta).await?;
            info!(credential_id = cred.id, owner, delta, "donation bonus adjusted on toggle");
        }

        let updated = sqlx::query_as::<_, DbCredential>(
            "UPDATE credentials SET is_public = ? WHERE id = ? RETURNING *",
        )
        .bind(args.public)
        .bind(cred.id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn set_credential_active(
        &self,
        pool: &SqlitePool,
        args: SetActiveArgs,
    ) -> Result<(), ProxyError> {
        let mut tx = pool.begin().await?;

        let cred = fetch_owned(&mut tx, args.credential_id, None).await?;
        if cred.is_active == args.active {
            return Ok(());
        }

        if cred.is_public && let Some(owner) = cred.user_id {
            let reward = args.rewards.for_tier(cred.tier());
            let delta = if args.active { reward } else { -reward };
            adjust_bonus(&mut tx, owner, delta).await?;
        }

        sqlx::query("UPDATE credentials SET is_active = ?, last_error = NULL WHERE id = ?")
            .bind(args.active)
            .bind(cred.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_credential(
        &self,
        pool: &SqlitePool,
        args: DeleteCredentialArgs,
    ) -> Result<bool, ProxyError> {
        let mut tx = pool.begin().await?;
        let deleted = delete_one(&mut tx, args.credential_id, args.owner, args.rewards).await?;
        tx.commit().await?;
        Ok(deleted)
    }

    async fn delete_credentials_batch(
        &self,
        pool: &SqlitePool,
        args: BatchDeleteArgs,
    ) -> Result<u64, ProxyError> {
        let mut tx = pool.begin().await?;
        let mut deleted = 0u64;
        for id in args.credential_ids {
            if delete_one(&mut tx, id, None, args.rewards).await? {
                deleted += 1;
            }
        }
        tx.commit().await?;
        Ok(deleted)
    }

    async fn apply_verification(
        &self,
        pool: &SqlitePool,
        args: VerificationArgs,
    ) -> Result<(), ProxyError> {
        let mut tx = pool.begin().await?;
        let cred = fetch_owned(&mut tx, args.credential_id, None).await?;

        if args.is_valid {
            // A tier upgrade on an already-donated credential re-prices its
            // reward; adjust by the difference to keep the bonus invariant.
            if cred.is_public
                && cred.is_active
                && let Some(owner) = cred.user_id
            {
                let delta = args.rewards.for_tier(args.tier) - args.rewards.for_tier(cred.tier());
                if delta != 0 {
                    adjust_bonus(&mut tx, owner, delta).await?;
                    info!(credential_id = cred.id, owner, delta, "donation bonus re-priced after verification");
                }
            }

            sqlx::query(
                "UPDATE credentials SET model_tier = ?, account_type = ?, last_error = ? WHERE id = ?",
            )
            .bind(args.tier.as_str())
            .bind(&args.account_type)
            .bind(&args.error)
            .bind(cred.id)
            .execute(&mut *tx)
            .await?;
        } else {
            if cred.is_active
                && cred.is_public
                && let Some(owner) = cred.user_id
            {
                adjust_bonus(&mut tx, owner, -args.rewards.for_tier(cred.tier())).await?;
            }
            sqlx::query(
                "UPDATE credentials SET is_active = 0, account_type = ?, last_error = ? WHERE id = ?",
            )
            .bind(&args.account_type)
            .bind(args.error.as_deref().unwrap_or("verification failed"))
            .bind(cred.id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn has_tier3_in_scope(
        &self,
        pool: &SqlitePool,
        args: ScopeArgs,
    ) -> Result<bool, ProxyError> {
        let own: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM credentials WHERE user_id = ? AND model_tier = '3' AND is_active = 1)",
        )
        .bind(args.user_id)
        .fetch_one(pool)
        .await?;
        if own {
            return Ok(true);
        }

        let may_use_public = match args.mode {
            PoolMode::Private => false,
            // Without an own tier-3 credential the public tier-3 pool stays
            // closed in tier3_shared mode.
            PoolMode::Tier3Shared => false,
            PoolMode::FullShared => {
                sqlx::query_scalar::<_, bool>(
                    "SELECT EXISTS(SELECT 1 FROM credentials WHERE user_id = ? AND is_public = 1 AND is_active = 1)",
                )
                .bind(args.user_id)
                .fetch_one(pool)
                .await?
            }
        };
        if !may_use_public {
            return Ok(false);
        }

        let public_tier3: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM credentials WHERE is_public = 1 AND model_tier = '3' AND is_active = 1)",
        )
        .fetch_one(pool)
        .await?;
        Ok(public_tier3)
    }

    async fn count_usage(
        &self,
        pool: &SqlitePool,
        window: UsageWindow,
    ) -> Result<i64, ProxyError> {
        let mut sql =
            String::from("SELECT COUNT(id) FROM usage_logs WHERE user_id = ? AND created_at >= ?");
        if window.success_only {
            sql.push_str(" AND status_code < 400");
        }
        match window.group {
            Some(ModelGroup::Three) => sql.push_str(" AND model LIKE '%gemini-3-%'"),
            Some(ModelGroup::Pro) => {
                sql.push_str(" AND model LIKE '%pro%' AND model NOT LIKE '%gemini-3-%'");
            }
            Some(ModelGroup::Flash) => {
                sql.push_str(" AND model NOT LIKE '%pro%' AND model NOT LIKE '%gemini-3-%'");
            }
            None => {}
        }

        let count: i64 = sqlx::query_scalar(&sql)
            .bind(window.user_id)
            .bind(window.since)
            .fetch_one(pool)
            .await?;
        Ok(count)
    }
}

async fn fetch_owned(
    tx: &mut Transaction<'_, Sqlite>,
    credential_id: i64,
    owner: Option<i64>,
) -> Result<DbCredential, ProxyError> {
    let cred = sqlx::query_as::<_, DbCredential>("SELECT * FROM credentials WHERE id = ?")
        .bind(credential_id)
        .fetch_optional(&mut **tx)
        .await?;

    match cred {
        Some(cred) if owner.is_none() || cred.user_id == owner => Ok(cred),
        _ => Err(ProxyError::InvalidRequest("credential not found".to_string())),
    }
}

async fn delete_one(
    tx: &mut Transaction<'_, Sqlite>,
    credential_id: i64,
    owner: Option<i64>,
    rewards: DonationRewards,
) -> Result<bool, ProxyError> {
    let cred = match fetch_owned(tx, credential_id, owner).await {
        Ok(cred) => cred,
        Err(ProxyError::InvalidRequest(_)) => return Ok(false),
        Err(err) => return Err(err),
    };

    if cred.is_public
        && cred.is_active
        && let Some(owner_id) = cred.user_id
    {
        adjust_bonus(tx, owner_id, -rewards.for_tier(cred.tier())).await?;
        info!(credential_id = cred.id, owner = owner_id, "donation bonus clawed back on delete");
    }

    sqlx::query("DELETE FROM credentials WHERE id = ?")
        .bind(cred.id)
        .execute(&mut **tx)
        .await?;
    Ok(true)
}

/// `bonus_quota` never drops below zero.
async fn adjust_bonus(
    tx: &mut Transaction<'_, Sqlite>,
    user_id: i64,
    delta: i64,
) -> Result<(), ProxyError> {
    sqlx::query("UPDATE users SET bonus_quota = MAX(0, bonus_quota + ?) WHERE id = ?")
        .bind(delta)
        .bind(user_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Spawn the database actor and return a cloneable handle. Anonymous so
/// several instances can coexist in one process (tests).
pub async fn spawn(database_url: &str) -> DbActorHandle {
    let (actor, _jh) = ractor::Actor::spawn(None, DbActor, database_url.to_string())
        .await
        .expect("failed to spawn DbActor");

    DbActorHandle { actor }
}

async fn apply_schema(pool: &SqlitePool) -> Result<(), ProxyError> {
    for stmt in SQLITE_INIT.split(';') {
        let s = stmt.trim();
        if s.is_empty() {
            continue;
        }
        sqlx::query(s).execute(pool).await?;
    }
    Ok(())
}
