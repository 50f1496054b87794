//! The dispatch loop.
//!
//! One inbound inference request turns into up to `1 + error_retry_count`
//! upstream attempts, each on a different credential. Every attempt that
//! reaches upstream writes a usage-log row (success or failure) so quota
//! and rate windows stay faithful; failures feed back into the pool, where
//! auth errors disable the credential and claw back its donation bonus.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use castor_schema::codeassist::{CodeAssistEnvelope, CodeAssistResponseBody};
use castor_schema::gemini::{Candidate, Content, GeminiGenerateContentRequest, GeminiResponseBody};
use futures::stream::BoxStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::config::{PoolMode, Tunables};
use crate::crypto::CryptoVault;
use crate::db::actor::{FailureArgs, TokenUpdateArgs};
use crate::db::{
    DbActorHandle, DbCredential, DbUser, DonationRewards, NewUsageLog, SelectionRequest,
};
use crate::error::{IsRetryable, ProxyError};
use crate::google_oauth::{GoogleOauthService, RefreshGrant};
use crate::model_catalog::{ModelRoute, ModelTier, StreamMode};
use crate::pool::policy;
use crate::upstream::UpstreamClient;

/// Per-frame idle deadline for upstream SSE.
const STREAM_IDLE_SECS: u64 = 120;

/// Character budget of one synthetic SSE chunk in fake-stream mode.
const FAKE_STREAM_CHUNK_CHARS: usize = 256;

pub type FrameStream = BoxStream<'static, Result<GeminiResponseBody, ProxyError>>;

/// Identity and accounting context of the inbound request.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub user: DbUser,
    pub api_key_id: Option<i64>,
    pub endpoint: String,
}

/// Per-request dispatcher, built from the shared app state plus a settings
/// snapshot taken at the start of the request.
pub struct Dispatcher {
    pub db: DbActorHandle,
    pub settings: Arc<Tunables>,
    pub vault: Arc<CryptoVault>,
    pub oauth: Arc<GoogleOauthService>,
    pub upstream: Arc<UpstreamClient>,
    pub google_client_id: String,
    pub google_client_secret: String,
}

impl Dispatcher {
    /// Unary dispatch: rotate credentials until one answers.
    pub async fn dispatch_unary(
        &self,
        meta: &RequestMeta,
        route: &ModelRoute,
        request: &GeminiGenerateContentRequest,
    ) -> Result<GeminiResponseBody, ProxyError> {
        let mut tried: Vec<i64> = Vec::new();
        let mut last_error: Option<ProxyError> = None;

        for attempt in 0..=self.settings.error_retry_count {
            let Some(cred) = self.select(meta, route, &tried).await? else {
                break;
            };
            tried.push(cred.id);

            let token = match self.resolve_access_token(&cred).await {
                Ok(token) => token,
                Err(err) => {
                    self.report_failure(&cred, &err).await;
                    last_error = Some(err);
                    continue;
                }
            };

            let started = Instant::now();
            let envelope = CodeAssistEnvelope::new(
                route.upstream_model.clone(),
                cred.project_id.clone(),
                request.clone(),
            );

            match self.upstream.unary(&token, &envelope).await {
                Ok(resp) => {
                    info!(credential_id = cred.id, model = %route.requested, attempt, "unary dispatch ok");
                    self.log_attempt(meta, route, Some(cred.id), 200, started).await;
                    return Ok(resp);
                }
                Err(err) => {
                    self.report_failure(&cred, &err).await;
                    self.log_attempt(meta, route, Some(cred.id), err.upstream_status_code(), started)
                        .await;
                    if err.is_retryable() {
                        warn!(
                            credential_id = cred.id,
                            attempt,
                            error = %err,
                            "upstream attempt failed, rotating credential"
                        );
                        last_error = Some(err);
                        continue;
                    }
                    return Err(err);
                }
            }
        }

        Err(self.exhausted_error(meta, route, &tried, last_error).await)
    }

    /// Streaming dispatch; the returned frames are already in the public
    /// Gemini shape and the route's stream mode has been applied.
    pub async fn dispatch_stream(
        &self,
        meta: &RequestMeta,
        route: &ModelRoute,
        request: &GeminiGenerateContentRequest,
    ) -> Result<FrameStream, ProxyError> {
        match route.mode {
            StreamMode::FakeStream => {
                let resp = self.dispatch_unary(meta, route, request).await?;
                Ok(chunk_into_frames(resp))
            }
            StreamMode::AntiTruncation => self.dispatch_buffered(meta, route, request).await,
            StreamMode::PassThrough => {
                let (cred, upstream_resp, started) =
                    self.open_with_rotation(meta, route, request).await?;
                self.log_attempt(meta, route, Some(cred.id), 200, started).await;
                Ok(decode_frames(upstream_resp))
            }
        }
    }

    /// Record a request that was denied before dispatch (quota, rate). The
    /// denial still lands in the usage log so the rate window sees it.
    pub async fn log_denied(&self, meta: &RequestMeta, route: &ModelRoute, status: u16) {
        self.log_attempt(meta, route, None, status, Instant::now()).await;
    }

    /// Anti-truncation mode: pull the whole upstream stream into memory and
    /// re-emit only once it finished cleanly; a mid-stream failure can still
    /// fail over to another credential because nothing has been forwarded.
    async fn dispatch_buffered(
        &self,
        meta: &RequestMeta,
        route: &ModelRoute,
        request: &GeminiGenerateContentRequest,
    ) -> Result<FrameStream, ProxyError> {
        let mut tried: Vec<i64> = Vec::new();
        let mut last_error: Option<ProxyError> = None;

        for _attempt in 0..=self.settings.error_retry_count {
            let Some(cred) = self.select(meta, route, &tried).await? else {
                break;
            };
            tried.push(cred.id);

            let token = match self.resolve_access_token(&cred).await {
                Ok(token) => token,
                Err(err) => {
                    self.report_failure(&cred, &err).await;
                    last_error = Some(err);
                    continue;
                }
            };

            let started = Instant::now();
            let envelope = CodeAssistEnvelope::new(
                route.upstream_model.clone(),
                cred.project_id.clone(),
                request.clone(),
            );

            let outcome = match self.upstream.open_stream(&token, &envelope).await {
                Ok(resp) => collect_frames(resp).await,
                Err(err) => Err(err),
            };

            match outcome {
                Ok(frames) => {
                    self.log_attempt(meta, route, Some(cred.id), 200, started).await;
                    let stream = tokio_stream::iter(frames.into_iter().map(Ok));
                    return Ok(Box::pin(stream));
                }
                Err(err) => {
                    self.report_failure(&cred, &err).await;
                    self.log_attempt(meta, route, Some(cred.id), err.upstream_status_code(), started)
                        .await;
                    if err.is_retryable() {
                        last_error = Some(err);
                        continue;
                    }
                    return Err(err);
                }
            }
        }

        Err(self.exhausted_error(meta, route, &tried, last_error).await)
    }

    /// Rotate credentials until a stream opens. Used by pass-through mode,
    /// where failover is only possible before the first forwarded byte.
    async fn open_with_rotation(
        &self,
        meta: &RequestMeta,
        route: &ModelRoute,
        request: &GeminiGenerateContentRequest,
    ) -> Result<(DbCredential, reqwest::Response, Instant), ProxyError> {
        let mut tried: Vec<i64> = Vec::new();
        let mut last_error: Option<ProxyError> = None;

        for _attempt in 0..=self.settings.error_retry_count {
            let Some(cred) = self.select(meta, route, &tried).await? else {
                break;
            };
            tried.push(cred.id);

            let token = match self.resolve_access_token(&cred).await {
                Ok(token) => token,
                Err(err) => {
                    self.report_failure(&cred, &err).await;
                    last_error = Some(err);
                    continue;
                }
            };

            let started = Instant::now();
            let envelope = CodeAssistEnvelope::new(
                route.upstream_model.clone(),
                cred.project_id.clone(),
                request.clone(),
            );

            match self.upstream.open_stream(&token, &envelope).await {
                Ok(resp) => return Ok((cred, resp, started)),
                Err(err) => {
                    self.report_failure(&cred, &err).await;
                    self.log_attempt(meta, route, Some(cred.id), err.upstream_status_code(), started)
                        .await;
                    if err.is_retryable() {
                        last_error = Some(err);
                        continue;
                    }
                    return Err(err);
                }
            }
        }

        Err(self.exhausted_error(meta, route, &tried, last_error).await)
    }

    async fn select(
        &self,
        meta: &RequestMeta,
        route: &ModelRoute,
        tried: &[i64],
    ) -> Result<Option<DbCredential>, ProxyError> {
        self.db
            .select_credential(SelectionRequest {
                user_id: meta.user.id,
                required_tier: route.required_tier(),
                group: route.group(),
                mode: self.settings.credential_pool_mode,
                cooldown_secs: policy::cooldown_secs(route.group(), &self.settings),
                exclude_ids: tried.to_vec(),
            })
            .await
    }

    /// Resolve a usable bearer token. OAuth credentials are refreshed on
    /// every selection; the fresh token is re-encrypted and written back
    /// before use. Plain API keys decrypt directly.
    pub async fn resolve_access_token(&self, cred: &DbCredential) -> Result<String, ProxyError> {
        if cred.credential_type != "oauth" {
            return cred
                .access_token
                .as_deref()
                .and_then(|ct| self.vault.decrypt(ct))
                .ok_or_else(|| ProxyError::Crypto("api key material decrypt failed".to_string()));
        }

        let refresh_token = self
            .vault
            .decrypt(&cred.refresh_token)
            .ok_or_else(|| ProxyError::Crypto("refresh token decrypt failed".to_string()))?;

        let own_client_id = cred.client_id.as_deref().and_then(|ct| self.vault.decrypt(ct));
        let own_client_secret = cred
            .client_secret
            .as_deref()
            .and_then(|ct| self.vault.decrypt(ct));

        // The credential's own OAuth client wins; the system default covers
        // the rest.
        let (client_id, client_secret) = match (own_client_id, own_client_secret) {
            (Some(id), Some(secret)) => (id, secret),
            _ => (
                self.google_client_id.clone(),
                self.google_client_secret.clone(),
            ),
        };

        let fresh = self
            .oauth
            .refresh(&RefreshGrant {
                refresh_token,
                client_id,
                client_secret,
            })
            .await?;

        self.db
            .update_access_token(TokenUpdateArgs {
                credential_id: cred.id,
                access_token_ct: self.vault.encrypt(&fresh.access_token),
            })
            .await?;

        Ok(fresh.access_token)
    }

    async fn report_failure(&self, cred: &DbCredential, err: &ProxyError) {
        let args = FailureArgs {
            credential_id: cred.id,
            error: err.failure_text(),
            rewards: DonationRewards::from_settings(&self.settings),
        };
        if let Err(db_err) = self.db.record_failure(args).await {
            warn!(credential_id = cred.id, error = %db_err, "failed to record credential failure");
        }
    }

    async fn log_attempt(
        &self,
        meta: &RequestMeta,
        route: &ModelRoute,
        credential_id: Option<i64>,
        status_code: u16,
        started: Instant,
    ) {
        let log = NewUsageLog {
            user_id: meta.user.id,
            api_key_id: meta.api_key_id,
            credential_id,
            model: route.requested.clone(),
            endpoint: meta.endpoint.clone(),
            status_code,
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
        };
        if let Err(err) = self.db.record_usage(log).await {
            warn!(error = %err, "failed to write usage log");
        }
    }

    /// Why did the loop end without a response? Preserve the last upstream
    /// error when there was one; otherwise explain what the policy blocked.
    async fn exhausted_error(
        &self,
        meta: &RequestMeta,
        route: &ModelRoute,
        tried: &[i64],
        last_error: Option<ProxyError>,
    ) -> ProxyError {
        if let Some(err) = last_error {
            return ProxyError::NoCredentialAvailable(format!(
                "all credentials failed after {} attempt(s); last error: {}",
                tried.len(),
                err
            ));
        }

        if route.required_tier() == ModelTier::Tier30 {
            return ProxyError::NoCredentialAvailable(
                "no Gemini 3 tier credential is available; this model requires one".to_string(),
            );
        }

        let has_public = self
            .db
            .has_active_public_credential(meta.user.id)
            .await
            .unwrap_or(false);
        if self.settings.credential_pool_mode == PoolMode::FullShared && !has_public {
            return ProxyError::NoCredentialAvailable(
                "you have no usable credential; upload one, or donate to join the shared pool"
                    .to_string(),
            );
        }

        ProxyError::NoCredentialAvailable("no credential available right now, retry later".to_string())
    }
}

/// Decode an upstream SSE response into public Gemini frames with an idle
/// timeout. Invalid frames are skipped, protocol failures end the stream
/// with an error item.
pub fn decode_frames(resp: reqwest::Response) -> FrameStream {
    use eventsource_stream::Eventsource;

    let stream = resp
        .bytes_stream()
        .eventsource()
        .timeout(std::time::Duration::from_secs(STREAM_IDLE_SECS))
        .map(|item| match item {
            Ok(Ok(event)) => Ok(Some(event.data)),
            Ok(Err(e)) => Err(ProxyError::StreamProtocol(e.to_string())),
            Err(_elapsed) => Err(ProxyError::StreamProtocol(format!(
                "stream idle timeout ({STREAM_IDLE_SECS}s)"
            ))),
        })
        .filter_map(|item| match item {
            Ok(Some(data)) => {
                if data.is_empty() {
                    return None;
                }
                match serde_json::from_str::<CodeAssistResponseBody>(&data) {
                    Ok(frame) => Some(Ok(frame.into())),
                    Err(_) => {
                        warn!("skipping invalid SSE JSON data: {:.50}...", data);
                        None
                    }
                }
            }
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        });

    Box::pin(stream)
}

/// Drain a stream response fully (anti-truncation buffering).
async fn collect_frames(resp: reqwest::Response) -> Result<Vec<GeminiResponseBody>, ProxyError> {
    let mut frames = Vec::new();
    let mut stream = decode_frames(resp);
    while let Some(frame) = stream.next().await {
        frames.push(frame?);
    }
    Ok(frames)
}

/// Slice a unary response into synthetic stream frames (fake-stream mode).
/// Metadata and the finish reason ride on the final frame. Responses
/// without plain text (e.g. function calls) pass through as one frame.
fn chunk_into_frames(resp: GeminiResponseBody) -> FrameStream {
    let text = resp.first_candidate_text();
    if text.is_empty() {
        return Box::pin(tokio_stream::iter(vec![Ok(resp)]));
    }

    let chunks = split_utf8_chunks(&text, FAKE_STREAM_CHUNK_CHARS);
    let finish_reason = resp
        .candidates
        .first()
        .and_then(|c| c.finish_reason.clone());

    let last = chunks.len() - 1;
    let frames: Vec<Result<GeminiResponseBody, ProxyError>> = chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let is_last = i == last;
            Ok(GeminiResponseBody {
                candidates: vec![Candidate {
                    content: Some(Content::text(Some("model".to_string()), chunk)),
                    index: Some(0),
                    finish_reason: is_last.then(|| {
                        finish_reason.clone().unwrap_or_else(|| "STOP".to_string())
                    }),
                    extra: BTreeMap::new(),
                }],
                prompt_feedback: None,
                usage_metadata: is_last.then(|| resp.usage_metadata.clone()).flatten(),
                model_version: is_last.then(|| resp.model_version.clone()).flatten(),
                response_id: resp.response_id.clone(),
                extra: BTreeMap::new(),
            })
        })
        .collect();

    Box::pin(tokio_stream::iter(frames))
}

fn split_utf8_chunks(text: &str, chunk_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0usize;
    for ch in text.chars() {
        current.push(ch);
        count += 1;
        if count >= chunk_chars {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chunking_respects_multibyte_boundaries() {
        let text = "号".repeat(300);
        let chunks = split_utf8_chunks(&text, 256);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 256);
        assert_eq!(chunks[1].chars().count(), 44);
        assert_eq!(chunks.concat(), text);
    }

    #[tokio::test]
    async fn fake_stream_frames_carry_finish_on_last() {
        let resp: GeminiResponseBody = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "a".repeat(300)}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"totalTokenCount": 9}
        }))
        .unwrap();

        let mut stream = chunk_into_frames(resp);
        let mut frames = Vec::new();
        while let Some(frame) = stream.next().await {
            frames.push(frame.unwrap());
        }

        assert_eq!(frames.len(), 2);
        assert!(frames[0].candidates[0].finish_reason.is_none());
        assert!(frames[0].usage_metadata.is_none());
        assert_eq!(frames[1].candidates[0].finish_reason.as_deref(), Some("STOP"));
        assert!(frames[1].usage_metadata.is_some());

        let total: String = frames.iter().map(GeminiResponseBody::first_candidate_text).collect();
        assert_eq!(total.len(), 300);
    }

    #[tokio::test]
    async fn textless_response_passes_through_whole() {
        let resp: GeminiResponseBody = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"functionCall": {"name": "f", "args": {}}}]},
                "finishReason": "STOP"
            }]
        }))
        .unwrap();

        let mut stream = chunk_into_frames(resp);
        let frame = stream.next().await.unwrap().unwrap();
        assert!(frame.candidates[0].content.as_ref().unwrap().parts[0]
            .function_call
            .is_some());
        assert!(stream.next().await.is_none());
    }
}
