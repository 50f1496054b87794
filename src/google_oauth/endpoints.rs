use crate::error::OauthError;

use oauth2::{
    AuthUrl, Client as OAuth2Client, ClientId, ClientSecret, EndpointNotSet, EndpointSet,
    ExtraTokenFields, RefreshToken, StandardRevocableToken, StandardTokenResponse, TokenUrl,
    basic::{
        BasicErrorResponse, BasicRevocationErrorResponse, BasicTokenIntrospectionResponse,
        BasicTokenType,
    },
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub(super) const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub(super) const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Stateless Google OAuth endpoints.
pub(super) struct GoogleOauthEndpoints;

impl GoogleOauthEndpoints {
    /// Standard refresh-token grant against Google's token endpoint.
    pub(super) async fn refresh_access_token(
        refresh_token: &str,
        client_id: &str,
        client_secret: &str,
        http_client: reqwest::Client,
    ) -> Result<GoogleTokenResponse, OauthError> {
        let client = build_oauth2_client(client_id, client_secret)?;
        let token_result: GoogleTokenResponse = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&http_client)
            .await?;
        debug!("access token refreshed successfully");
        Ok(token_result)
    }
}

/// Build the Google OAuth2 client for a given client id/secret pair.
fn build_oauth2_client(
    client_id: &str,
    client_secret: &str,
) -> Result<GoogleOauth2Client, OauthError> {
    let client = OAuth2Client::new(ClientId::new(client_id.to_string()))
        .set_client_secret(ClientSecret::new(client_secret.to_string()))
        .set_auth_uri(AuthUrl::new(GOOGLE_AUTH_URL.to_string()).map_err(|e| {
            OauthError::Other {
                message: format!("invalid auth url: {e}"),
            }
        })?)
        .set_token_uri(TokenUrl::new(GOOGLE_TOKEN_URI.to_string()).map_err(|e| {
            OauthError::Other {
                message: format!("invalid token url: {e}"),
            }
        })?);
    Ok(client)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub(super) struct GoogleTokenField {
    #[serde(rename = "id_token")]
    pub id_token: Option<String>,
}
impl ExtraTokenFields for GoogleTokenField {}

pub(super) type GoogleTokenResponse = StandardTokenResponse<GoogleTokenField, BasicTokenType>;

pub(super) type GoogleOauth2Client = OAuth2Client<
    BasicErrorResponse,
    GoogleTokenResponse,
    BasicTokenIntrospectionResponse,
    StandardRevocableToken,
    BasicRevocationErrorResponse,
    EndpointSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointSet,
>;
