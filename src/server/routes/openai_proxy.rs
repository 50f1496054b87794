//! Raw OpenAI reverse proxy (optional feature, active only when
//! `openai.api_key` is configured). Requests are forwarded verbatim with
//! the configured upstream key; responses stream back.

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::StatusCode,
    response::Response,
};
use tracing::debug;

use crate::error::ProxyError;
use crate::server::guards::auth::ApiKeyUser;
use crate::server::router::AppState;

pub async fn passthrough(
    State(state): State<AppState>,
    _caller: ApiKeyUser,
    Path(path): Path<String>,
    request: Request,
) -> Result<Response, ProxyError> {
    let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes())
        .map_err(|_| ProxyError::InvalidRequest("unsupported method".to_string()))?;

    let mut url = format!("{}/{}", state.openai.api_base.trim_end_matches('/'), path);
    if let Some(query) = request.uri().query() {
        url.push('?');
        url.push_str(query);
    }

    let content_type = request
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);

    let body = axum::body::to_bytes(request.into_body(), 16 * 1024 * 1024)
        .await
        .map_err(|e| ProxyError::InvalidRequest(format!("failed to read request body: {e}")))?;

    debug!(%url, "forwarding to OpenAI upstream");
    let mut upstream = state
        .passthrough_client
        .request(method, &url)
        .bearer_auth(&state.openai.api_key)
        .body(body);
    if let Some(content_type) = content_type {
        upstream = upstream.header(reqwest::header::CONTENT_TYPE, content_type);
    }

    let resp = upstream.send().await?;

    let status =
        StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    for (name, value) in resp.headers() {
        if matches!(
            name.as_str(),
            "content-type" | "cache-control" | "content-encoding"
        ) {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
    }

    builder
        .body(Body::from_stream(resp.bytes_stream()))
        .map_err(|e| ProxyError::Internal(format!("failed to build response: {e}")))
}
