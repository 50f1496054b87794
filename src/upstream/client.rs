use std::time::Duration;

use backon::ExponentialBuilder;
use castor_schema::codeassist::{CodeAssistEnvelope, CodeAssistResponseBody};
use castor_schema::gemini::GeminiResponseBody;
use tracing::debug;

use super::api::CodeAssistApi;
use crate::error::ProxyError;

pub struct UpstreamClient {
    client: reqwest::Client,
    retry_policy: ExponentialBuilder,
}

impl UpstreamClient {
    pub fn new(proxy: Option<url::Url>) -> Self {
        let mut builder = reqwest::Client::builder()
            .user_agent("castor/1.0")
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .http2_adaptive_window(true);

        if let Some(proxy_url) = proxy {
            let proxy = reqwest::Proxy::all(proxy_url.as_str())
                .expect("invalid proxy url for UpstreamClient");
            builder = builder.proxy(proxy);
        }

        let client = builder.build().expect("failed to build upstream client");
        let retry_policy = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(300))
            .with_max_times(2)
            .with_jitter();

        Self {
            client,
            retry_policy,
        }
    }

    /// One unary `generateContent` call, unwrapped to the public shape.
    pub async fn unary(
        &self,
        token: &str,
        envelope: &CodeAssistEnvelope,
    ) -> Result<GeminiResponseBody, ProxyError> {
        let resp =
            CodeAssistApi::try_post(self.client.clone(), token, false, self.retry_policy, envelope)
                .await?;

        if !resp.status().is_success() {
            return Err(classify(resp).await);
        }

        let body = resp.json::<CodeAssistResponseBody>().await?;
        Ok(body.into())
    }

    /// Open a `streamGenerateContent?alt=sse` response. The caller owns the
    /// SSE decode; dropping the response cancels the upstream request.
    pub async fn open_stream(
        &self,
        token: &str,
        envelope: &CodeAssistEnvelope,
    ) -> Result<reqwest::Response, ProxyError> {
        let resp =
            CodeAssistApi::try_post(self.client.clone(), token, true, self.retry_policy, envelope)
                .await?;

        if !resp.status().is_success() {
            return Err(classify(resp).await);
        }

        debug!(status = %resp.status(), "upstream stream opened");
        Ok(resp)
    }
}

async fn classify(resp: reqwest::Response) -> ProxyError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    ProxyError::Upstream { status, body }
}
