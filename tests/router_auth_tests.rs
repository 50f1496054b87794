use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::SystemTime;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use castor::config::{Config, SettingsRegistry};
use castor::db::actor::CreateApiKeyArgs;
use castor::db::NewUser;
use castor::server::router::{AppState, castor_router};
use tokio::fs;
use tower::ServiceExt;

async fn test_state() -> (AppState, std::path::PathBuf) {
    let tmp_dir = std::env::temp_dir();
    let mut hasher = DefaultHasher::new();
    SystemTime::now().hash(&mut hasher);
    std::thread::current().id().hash(&mut hasher);
    let db_path = tmp_dir.join(format!("castor_router_{:016x}.sqlite", hasher.finish()));
    let database_url = format!("sqlite:{}", db_path.to_str().unwrap());

    let db = castor::db::spawn(&database_url).await;

    let mut cfg = Config::default();
    cfg.basic.secret_key = "router-test-secret".to_string();
    let settings = Arc::new(SettingsRegistry::new(cfg.tunables.clone(), db.clone()));

    (AppState::new(&cfg, db, settings), db_path)
}

async fn cleanup(db_path: std::path::PathBuf) {
    let wal = std::path::PathBuf::from(format!("{}-wal", db_path.to_string_lossy()));
    let shm = std::path::PathBuf::from(format!("{}-shm", db_path.to_string_lossy()));
    let _ = fs::remove_file(&wal).await;
    let _ = fs::remove_file(&shm).await;
    let _ = fs::remove_file(&db_path).await;
}

#[tokio::test]
async fn models_requires_api_key() {
    let (state, db_path) = test_state().await;
    let app = castor_router(state);

    let resp = app
        .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    cleanup(db_path).await;
}

#[tokio::test]
async fn models_lists_combinations_for_valid_key() {
    let (state, db_path) = test_state().await;
    let db = state.db.clone();
    let app = castor_router(state);

    let user = db
        .create_user(NewUser {
            username: "router-user".to_string(),
            password_hash: "hash".to_string(),
            discord_id: None,
            is_admin: false,
            base_quota: 100,
        })
        .await
        .unwrap();
    db.create_api_key(CreateApiKeyArgs {
        user_id: user.id,
        name: "default".to_string(),
        secret: "cst-router-test-key".to_string(),
    })
    .await
    .unwrap();

    let resp = app
        .clone()
        .oneshot(
            Request::get("/v1/models")
                .header("authorization", "Bearer cst-router-test-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
    let list: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let ids: Vec<&str> = list["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m["id"].as_str())
        .collect();

    // No tier-3 credential in scope: only the 2.5 families, every decoration.
    assert!(ids.contains(&"gemini-2.5-flash"));
    assert!(ids.contains(&"假流式/gemini-2.5-pro-nothinking-search"));
    assert!(!ids.iter().any(|id| id.contains("gemini-3-")));

    // The x-api-key header works too.
    let resp = app
        .oneshot(
            Request::get("/models")
                .header("x-api-key", "cst-router-test-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    cleanup(db_path).await;
}

#[tokio::test]
async fn chat_without_pool_returns_service_unavailable() {
    let (state, db_path) = test_state().await;
    let db = state.db.clone();
    let app = castor_router(state);

    let user = db
        .create_user(NewUser {
            username: "empty-pool".to_string(),
            password_hash: "hash".to_string(),
            discord_id: None,
            is_admin: false,
            base_quota: 100,
        })
        .await
        .unwrap();
    db.create_api_key(CreateApiKeyArgs {
        user_id: user.id,
        name: "default".to_string(),
        secret: "cst-empty-pool-key".to_string(),
    })
    .await
    .unwrap();

    let body = serde_json::json!({
        "model": "gemini-2.5-flash",
        "messages": [{"role": "user", "content": "hi"}]
    });
    let resp = app
        .oneshot(
            Request::post("/v1/chat/completions")
                .header("authorization", "Bearer cst-empty-pool-key")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    cleanup(db_path).await;
}
