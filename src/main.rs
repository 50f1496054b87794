use std::net::SocketAddr;
use std::sync::Arc;

use mimalloc::MiMalloc;
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use castor::config::{Config, SettingsRegistry};
use castor::db::NewUser;
use castor::server::router::{AppState, castor_router};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The server binary requires a real config file with a non-empty secret_key.
    let cfg = Config::from_toml();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.basic.loglevel.clone()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(false),
        )
        .init();

    let db = castor::db::spawn(cfg.basic.database_url.as_str()).await;

    let settings = Arc::new(SettingsRegistry::new(cfg.tunables.clone(), db.clone()));
    let applied = settings.load_overrides().await?;
    info!(overrides = applied, "settings registry initialized");

    bootstrap_admin(&db, &cfg).await?;

    let state = AppState::new(&cfg, db, settings);
    let app = castor_router(state);

    let addr = SocketAddr::from((cfg.basic.listen_addr, cfg.basic.listen_port));
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Server has shut down gracefully.");
    Ok(())
}

/// Create the configured admin account on a fresh database.
async fn bootstrap_admin(
    db: &castor::db::DbActorHandle,
    cfg: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    if db.count_users().await? > 0 {
        return Ok(());
    }
    if cfg.basic.admin_password.trim().is_empty() {
        warn!("empty users table and no basic.admin_password set; skipping admin bootstrap");
        return Ok(());
    }

    let user = db
        .create_user(NewUser {
            username: cfg.basic.admin_username.clone(),
            password_hash: castor::server::routes::account::hash_password(
                &cfg.basic.admin_password,
            )?,
            discord_id: None,
            is_admin: true,
            base_quota: cfg.tunables.base_quota,
        })
        .await?;
    info!(username = %user.username, "bootstrap admin account created");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { /* ... */ },
        _ = terminate => { /* ... */ },
    }
}
