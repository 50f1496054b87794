use std::sync::Arc;
use std::time::Instant;

use axum::{
    Router,
    extract::Request,
    http::{HeaderName, StatusCode, Version, header::USER_AGENT},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post, put},
};
use base64::Engine as _;
use rand::RngCore;
use reqwest::header::HeaderValue;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::config::{Config, GoogleDefaults, OpenaiPassthroughConfig, SettingsRegistry};
use crate::crypto::CryptoVault;
use crate::db::DbActorHandle;
use crate::dispatch::Dispatcher;
use crate::google_oauth::GoogleOauthService;
use crate::pool::CredentialVerifier;
use crate::server::guards::auth::SessionKeys;
use crate::server::routes::{account, admin, credentials, gemini, openai, openai_proxy};
use crate::upstream::UpstreamClient;

const MAX_REQUEST_ID_LEN: usize = 128;
const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

fn generate_request_id() -> String {
    // 96 bits => 16 chars base64url (no padding).
    let mut bytes = [0u8; 12];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn format_http_version(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2",
        Version::HTTP_3 => "HTTP/3",
        _ => "HTTP/?",
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: DbActorHandle,
    pub settings: Arc<SettingsRegistry>,
    pub vault: Arc<CryptoVault>,
    pub oauth: Arc<GoogleOauthService>,
    pub upstream: Arc<UpstreamClient>,
    pub verifier: Arc<CredentialVerifier>,
    pub google: GoogleDefaults,
    pub openai: OpenaiPassthroughConfig,
    pub session: Arc<SessionKeys>,
    /// Client for the raw OpenAI passthrough.
    pub passthrough_client: reqwest::Client,
}

impl AppState {
    pub fn new(cfg: &Config, db: DbActorHandle, settings: Arc<SettingsRegistry>) -> Self {
        let proxy = cfg.basic.proxy.clone();
        let passthrough_client = reqwest::Client::builder()
            .user_agent("castor/1.0")
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("failed to build passthrough client");

        Self {
            db,
            settings,
            vault: Arc::new(CryptoVault::new(&cfg.basic.secret_key)),
            oauth: Arc::new(GoogleOauthService::new(proxy.clone())),
            upstream: Arc::new(UpstreamClient::new(proxy.clone())),
            verifier: Arc::new(CredentialVerifier::new(proxy)),
            google: cfg.google.clone(),
            openai: cfg.openai.clone(),
            session: Arc::new(SessionKeys::new(&cfg.basic.secret_key)),
            passthrough_client,
        }
    }

    /// Per-request dispatcher over a fresh settings snapshot.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            db: self.db.clone(),
            settings: self.settings.snapshot(),
            vault: self.vault.clone(),
            oauth: self.oauth.clone(),
            upstream: self.upstream.clone(),
            google_client_id: self.google.client_id.clone(),
            google_client_secret: self.google.client_secret.clone(),
        }
    }
}

async fn not_found_handler() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn access_log(req: Request, next: Next) -> Response {
    // Capture request metadata before moving `req` into the handler stack.
    let method = req.method().clone();
    let uri = req.uri().clone();
    let version = req.version();

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= MAX_REQUEST_ID_LEN)
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);

    let user_agent = req
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let start = Instant::now();
    let mut resp = next.run(req).await;

    // Always reflect `x-request-id` for easier correlation, even if the client didn't send one.
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        resp.headers_mut().insert(X_REQUEST_ID, value);
    }

    let status = resp.status();
    let latency_ms = start.elapsed().as_millis() as u64;
    let path = uri.path();
    let protocol = format_http_version(version);

    // Note: for SSE/streaming responses, `latency_ms` is time-to-first-byte (handler return),
    // not the full stream duration.
    if status.is_server_error() {
        error!(
            "| {:>3} | {} | {:^7} | {:<8} | {} | {}ms | {}",
            status.as_u16(),
            request_id,
            method.as_str(),
            protocol,
            path,
            latency_ms,
            user_agent
        );
    } else if status.is_client_error() {
        warn!(
            "| {:>3} | {} | {:^7} | {:<8} | {} | {}ms | {}",
            status.as_u16(),
            request_id,
            method.as_str(),
            protocol,
            path,
            latency_ms,
            user_agent
        );
    } else {
        info!(
            "| {:>3} | {} | {:^7} | {:<8} | {} | {}ms | {}",
            status.as_u16(),
            request_id,
            method.as_str(),
            protocol,
            path,
            latency_ms,
            user_agent
        );
    }

    resp
}

pub fn castor_router(state: AppState) -> Router {
    let inference = Router::new()
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/chat/completions", post(openai::chat_completions))
        .route("/v1/models", get(openai::list_models))
        .route("/models", get(openai::list_models))
        .route("/v1beta/models", get(gemini::list_models))
        .route("/v1beta/models/{*model_and_rpc}", post(gemini::generate));

    let account = Router::new()
        .route("/api/auth/register", post(account::register))
        .route("/api/auth/login", post(account::login))
        .route("/api/auth/me", get(account::me))
        .route(
            "/api/auth/api-keys",
            get(account::list_api_keys).post(account::create_api_key),
        )
        .route("/api/auth/api-keys/{id}", delete(account::delete_api_key));

    let credentials = Router::new()
        .route(
            "/api/credentials",
            get(credentials::list).post(credentials::import_json),
        )
        .route("/api/credentials/upload", post(credentials::upload_archive))
        .route("/api/credentials/stats", get(credentials::stats))
        .route("/api/credentials/batch-delete", post(credentials::batch_delete))
        .route("/api/credentials/{id}", delete(credentials::remove))
        .route("/api/credentials/{id}/public", put(credentials::toggle_public))
        .route("/api/credentials/{id}/active", put(credentials::set_active))
        .route("/api/credentials/{id}/verify", post(credentials::verify))
        .route("/api/credentials/{id}/export", get(credentials::export));

    let admin = Router::new().route(
        "/api/admin/config",
        get(admin::get_config).put(admin::set_config),
    );

    let mut app = Router::new()
        .merge(inference)
        .merge(account)
        .merge(credentials)
        .merge(admin);

    if state.openai.enabled() {
        app = app.route("/openai/{*path}", axum::routing::any(openai_proxy::passthrough));
    }

    app.fallback(not_found_handler)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(access_log))
}
