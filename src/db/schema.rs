//! SQL DDL for initializing the database schema.
//! SQLite-first design; can be adapted for other RDBMS.

/// SQLite schema:
/// - `users` — accounts, base/bonus daily quotas
/// - `api_keys` — opaque inbound secrets, at most 5 per user (enforced in code)
/// - `credentials` — the pool; token material is vault ciphertext, dedup runs
///   on the plaintext SHA-256 fingerprint column
/// - `usage_logs` — append-only; quota and rate windows derive from `created_at`
/// - `system_config` — persisted overrides for the settings registry
pub const SQLITE_INIT: &str = r#"
-- ---------------------------------------------------------------------------
-- Users
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY NOT NULL,
    username TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    discord_id TEXT NULL UNIQUE,
    is_active INTEGER NOT NULL DEFAULT 1,
    is_admin INTEGER NOT NULL DEFAULT 0,
    base_quota INTEGER NOT NULL DEFAULT 100,
    bonus_quota INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL -- RFC3339
);

-- ---------------------------------------------------------------------------
-- API keys (inbound auth)
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS api_keys (
    id INTEGER PRIMARY KEY NOT NULL,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    secret TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL DEFAULT 'default',
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL, -- RFC3339
    last_used_at TEXT NULL -- RFC3339
);

CREATE INDEX IF NOT EXISTS idx_api_keys_user ON api_keys(user_id);

-- ---------------------------------------------------------------------------
-- Credential pool
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS credentials (
    id INTEGER PRIMARY KEY NOT NULL,
    user_id INTEGER NULL REFERENCES users(id) ON DELETE SET NULL,
    display_name TEXT NOT NULL,
    access_token TEXT NULL,          -- vault ciphertext
    refresh_token TEXT NOT NULL,     -- vault ciphertext
    refresh_token_sha TEXT NOT NULL UNIQUE, -- plaintext SHA-256, dedup key
    client_id TEXT NULL,             -- vault ciphertext
    client_secret TEXT NULL,         -- vault ciphertext
    project_id TEXT NOT NULL DEFAULT '',
    credential_type TEXT NOT NULL DEFAULT 'oauth', -- 'oauth' | 'api_key'
    model_tier TEXT NOT NULL DEFAULT '2.5',        -- '2.5' | '3'
    account_type TEXT NOT NULL DEFAULT 'unknown',  -- 'pro' | 'free' | 'unknown'
    email TEXT NULL UNIQUE,
    is_public INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    total_requests INTEGER NOT NULL DEFAULT 0,
    failed_requests INTEGER NOT NULL DEFAULT 0,
    last_error TEXT NULL,
    last_used_at TEXT NULL,    -- RFC3339, round-robin ordering key
    last_used_flash TEXT NULL, -- RFC3339, per-group cooldown stamps
    last_used_pro TEXT NULL,
    last_used_30 TEXT NULL,
    created_at TEXT NOT NULL -- RFC3339
);

CREATE INDEX IF NOT EXISTS idx_credentials_active ON credentials(is_active);
CREATE INDEX IF NOT EXISTS idx_credentials_owner ON credentials(user_id);

-- ---------------------------------------------------------------------------
-- Usage log (append-only)
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS usage_logs (
    id INTEGER PRIMARY KEY NOT NULL,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    api_key_id INTEGER NULL,
    credential_id INTEGER NULL,
    model TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    status_code INTEGER NOT NULL,
    latency_ms REAL NOT NULL,
    created_at TEXT NOT NULL -- RFC3339
);

CREATE INDEX IF NOT EXISTS idx_usage_logs_user_time ON usage_logs(user_id, created_at);

-- ---------------------------------------------------------------------------
-- Persisted config overrides
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS system_config (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL -- RFC3339
);
"#;
