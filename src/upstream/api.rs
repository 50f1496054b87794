use backon::{ExponentialBuilder, Retryable};
use std::time::Duration;
use tracing::warn;

pub struct CodeAssistApi;

const GENERATE_URL: &str = "https://cloudcode-pa.googleapis.com/v1internal:generateContent";
const STREAM_URL: &str =
    "https://cloudcode-pa.googleapis.com/v1internal:streamGenerateContent?alt=sse";

/// Hard deadline for a unary upstream call; streams get a per-frame idle
/// timeout downstream instead.
pub(super) const UNARY_DEADLINE: Duration = Duration::from_secs(120);

impl CodeAssistApi {
    /// POST the envelope; transport errors (DNS, connect, reset) are retried
    /// with the supplied policy, HTTP error statuses are returned to the
    /// caller for classification and credential rotation.
    pub async fn try_post<T>(
        client: reqwest::Client,
        token: impl AsRef<str>,
        stream: bool,
        retry_policy: ExponentialBuilder,
        body: &T,
    ) -> Result<reqwest::Response, reqwest::Error>
    where
        T: serde::Serialize,
    {
        let url = if stream { STREAM_URL } else { GENERATE_URL };

        (|| async {
            let mut request = client.post(url).bearer_auth(token.as_ref()).json(body);
            if !stream {
                request = request.timeout(UNARY_DEADLINE);
            }
            request.send().await
        })
        .retry(retry_policy)
        .notify(|err, dur: Duration| {
            warn!("Code Assist transport error (will retry in {:?}): {}", dur, err);
        })
        .await
    }
}
