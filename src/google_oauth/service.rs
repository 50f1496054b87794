//! The OAuth refresher.
//!
//! Each pool selection trades the credential's refresh token for a fresh
//! access token; nothing is cached across requests. The token endpoint is
//! shielded by a small governor rate limit so a burst of selections cannot
//! hammer Google, and transient transport errors are retried with backon.
//! A structured server response (`invalid_grant` et al.) is permanent and
//! surfaces as [`OauthError::ServerResponse`].

use super::endpoints::{GoogleOauthEndpoints, GoogleTokenResponse};
use crate::error::{IsRetryable, OauthError};
use crate::utils::jwt::decode_jwt_claims;
use backon::{ExponentialBuilder, Retryable};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use oauth2::TokenResponse;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

const OAUTH_TPS: u32 = 5;

/// Decrypted material needed for one refresh-token grant.
#[derive(Debug, Clone)]
pub struct RefreshGrant {
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: String,
}

/// Result of a successful refresh.
#[derive(Debug, Clone)]
pub struct FreshToken {
    pub access_token: String,
    pub expires_in: Option<Duration>,
    /// Pulled from the id_token claims when Google includes one.
    pub email: Option<String>,
}

/// Service layer to compose Google OAuth operations.
pub struct GoogleOauthService {
    client: reqwest::Client,
    retry_policy: ExponentialBuilder,
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl GoogleOauthService {
    /// Create a new service with a preconfigured HTTP client.
    pub fn new(proxy: Option<url::Url>) -> Self {
        let mut builder = reqwest::Client::builder()
            .user_agent("castor-oauth/1.0".to_string())
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15));
        if let Some(proxy_url) = proxy {
            let proxy = reqwest::Proxy::all(proxy_url.as_str())
                .expect("invalid proxy url for GoogleOauthService");
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .expect("FATAL: initialize GoogleOauthService HTTP client failed");

        let retry_policy = ExponentialBuilder::default()
            .with_min_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(2);

        let limiter = Arc::new(RateLimiter::direct(
            Quota::per_second(NonZeroU32::new(OAUTH_TPS).unwrap())
                .allow_burst(NonZeroU32::new(OAUTH_TPS * 2).unwrap()),
        ));

        Self {
            client,
            retry_policy,
            limiter,
        }
    }

    /// Trade a refresh token for a short-lived access token.
    pub async fn refresh(&self, grant: &RefreshGrant) -> Result<FreshToken, OauthError> {
        self.limiter.until_ready().await;

        let response: GoogleTokenResponse = (|| async {
            GoogleOauthEndpoints::refresh_access_token(
                &grant.refresh_token,
                &grant.client_id,
                &grant.client_secret,
                self.client.clone(),
            )
            .await
        })
        .retry(self.retry_policy)
        .when(|e: &OauthError| e.is_retryable())
        .notify(|err, dur: Duration| {
            error!(
                "Google Oauth2 retrying error {} with sleeping {:?}",
                err.to_string(),
                dur
            );
        })
        .await?;

        let email = response
            .extra_fields()
            .id_token
            .as_deref()
            .and_then(decode_jwt_claims)
            .and_then(|claims| {
                claims
                    .get("email")
                    .and_then(|e| e.as_str())
                    .map(ToString::to_string)
            });

        Ok(FreshToken {
            access_token: response.access_token().secret().clone(),
            expires_in: response.expires_in(),
            email,
        })
    }
}
