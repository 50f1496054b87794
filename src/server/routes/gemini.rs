//! Gemini v1beta surface: native pass-through with translation from the
//! Code Assist envelope.

use std::convert::Infallible;

use axum::{
    Json,
    extract::{Path, State},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use castor_schema::gemini::{GeminiGenerateContentRequest, GeminiModelList};
use futures::StreamExt;
use serde_json::{Value, json};
use tracing::debug;

use crate::dispatch::{FrameStream, RequestMeta};
use crate::utils::logging::with_pretty_json_debug;
use crate::error::ProxyError;
use crate::model_catalog::{ModelRoute, expanded_model_list};
use crate::quota;
use crate::server::guards::auth::ApiKeyUser;
use crate::server::router::AppState;

pub async fn list_models(
    State(state): State<AppState>,
    caller: ApiKeyUser,
) -> Result<Json<GeminiModelList>, ProxyError> {
    let settings = state.settings.snapshot();
    let include_tier3 = state
        .db
        .has_tier3_in_scope(caller.user.id, settings.credential_pool_mode)
        .await?;

    Ok(Json(GeminiModelList::from_model_names(expanded_model_list(
        include_tier3,
    ))))
}

/// `POST /v1beta/models/{model}:generateContent` and
/// `POST /v1beta/models/{model}:streamGenerateContent`.
pub async fn generate(
    State(state): State<AppState>,
    caller: ApiKeyUser,
    Path(model_and_rpc): Path<String>,
    Json(body): Json<Value>,
) -> Result<Response, ProxyError> {
    let Some((model_raw, rpc)) = model_and_rpc.rsplit_once(':') else {
        return Err(ProxyError::InvalidRequest(
            "expected {model}:generateContent or {model}:streamGenerateContent".to_string(),
        ));
    };
    let stream = match rpc {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            return Err(ProxyError::InvalidRequest(format!("unsupported rpc: {other}")));
        }
    };

    let mut request: GeminiGenerateContentRequest = serde_json::from_value(body)
        .map_err(|e| ProxyError::InvalidRequest(format!("invalid generateContent request: {e}")))?;

    let route = ModelRoute::parse(model_raw);
    with_pretty_json_debug(&request, |pretty_body| {
        debug!(
            req.model = %route.requested,
            req.stream = stream,
            body = %pretty_body,
            "normalized generateContent request"
        );
    });
    let dispatcher = state.dispatcher();
    let meta = RequestMeta {
        user: caller.user.clone(),
        api_key_id: Some(caller.api_key_id),
        endpoint: format!("/v1beta/models/{model_raw}:{rpc}"),
    };

    if let Err(err) =
        quota::check_daily_quota(&state.db, &dispatcher.settings, &caller.user, &route).await
    {
        dispatcher.log_denied(&meta, &route, 429).await;
        return Err(err);
    }
    if let Err(err) = quota::check_rate_limit(&state.db, &dispatcher.settings, &caller.user).await {
        dispatcher.log_denied(&meta, &route, 429).await;
        return Err(err);
    }

    route.apply_virtual_suffixes(&mut request);

    if stream {
        let frames = dispatcher.dispatch_stream(&meta, &route, &request).await?;
        Ok(frame_sse_response(frames).into_response())
    } else {
        let resp = dispatcher.dispatch_unary(&meta, &route, &request).await?;
        Ok(Json(resp).into_response())
    }
}

/// Emit Gemini frames as SSE; failures after the first byte end the stream
/// with a `data: {"error": ...}` frame.
fn frame_sse_response(frames: FrameStream) -> impl IntoResponse {
    let events = frames.map(|item| {
        let event = match item {
            Ok(frame) => Event::default()
                .json_data(&frame)
                .unwrap_or_else(|_| Event::default().data("{}")),
            Err(err) => Event::default()
                .json_data(&json!({"error": {"message": err.to_string(), "status": "UNAVAILABLE"}}))
                .unwrap_or_else(|_| Event::default().data("{\"error\":\"stream failed\"}")),
        };
        Ok::<_, Infallible>(event)
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}
