//! OpenAI-compatible surface: chat completions and the static model list.

use std::convert::Infallible;

use axum::{
    Json,
    extract::State,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use castor_schema::openai::{ChatCompletion, ChatCompletionChunk, ChatCompletionRequest, OpenaiModelList};
use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::dispatch::{FrameStream, RequestMeta};
use crate::error::ProxyError;
use crate::model_catalog::{ModelRoute, expanded_model_list};
use crate::quota;
use crate::server::guards::auth::ApiKeyUser;
use crate::server::router::AppState;

const ENDPOINT: &str = "/v1/chat/completions";

pub async fn chat_completions(
    State(state): State<AppState>,
    caller: ApiKeyUser,
    Json(body): Json<Value>,
) -> Result<Response, ProxyError> {
    let request: ChatCompletionRequest = serde_json::from_value(body)
        .map_err(|e| ProxyError::InvalidRequest(format!("invalid chat request: {e}")))?;
    if request.messages.is_empty() {
        return Err(ProxyError::InvalidRequest("messages must not be empty".to_string()));
    }

    let route = ModelRoute::parse(&request.model);
    let dispatcher = state.dispatcher();
    let meta = RequestMeta {
        user: caller.user.clone(),
        api_key_id: Some(caller.api_key_id),
        endpoint: ENDPOINT.to_string(),
    };

    // Denied requests still hit the usage log so the rate window sees them.
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

    let mut gemini_request = request.to_gemini();
    route.apply_virtual_suffixes(&mut gemini_request);

    let completion_id = format!("chatcmpl-{}", Uuid::new_v4().simple());
    let created = Utc::now().timestamp();

    if request.stream {
        let frames = dispatcher.dispatch_stream(&meta, &route, &gemini_request).await?;
        Ok(chunk_sse_response(frames, completion_id, created, route.requested.clone()).into_response())
    } else {
        let resp = dispatcher.dispatch_unary(&meta, &route, &gemini_request).await?;
        let completion =
            ChatCompletion::from_gemini(completion_id, created, route.requested.clone(), &resp);
        Ok(Json(completion).into_response())
    }
}

/// Translate Gemini frames into `chat.completion.chunk` SSE, closing with
/// `data: [DONE]`. A mid-stream failure becomes a final error frame instead
/// of a reset connection.
fn chunk_sse_response(
    frames: FrameStream,
    completion_id: String,
    created: i64,
    model: String,
) -> impl IntoResponse {
    let mut first = true;
    let events = frames
        .map(move |item| {
            let event = match item {
                Ok(frame) => {
                    let chunk = ChatCompletionChunk::from_gemini(
                        completion_id.clone(),
                        created,
                        model.clone(),
                        &frame,
                        first,
                    );
                    first = false;
                    Event::default()
                        .json_data(&chunk)
                        .unwrap_or_else(|_| Event::default().data("{}"))
                }
                Err(err) => Event::default()
                    .json_data(&json!({"error": err.to_string()}))
                    .unwrap_or_else(|_| Event::default().data("{\"error\":\"stream failed\"}")),
            };
            Ok::<_, Infallible>(event)
        })
        .chain(stream::once(async {
            Ok::<_, Infallible>(Event::default().data("[DONE]"))
        }));

    Sse::new(events).keep_alive(KeepAlive::default())
}

pub async fn list_models(
    State(state): State<AppState>,
    caller: ApiKeyUser,
) -> Result<Json<OpenaiModelList>, ProxyError> {
    let settings = state.settings.snapshot();
    let include_tier3 = state
        .db
        .has_tier3_in_scope(caller.user.id, settings.credential_pool_mode)
        .await?;

    Ok(Json(OpenaiModelList::from_model_names(
        expanded_model_list(include_tier3),
        "google",
    )))
}
