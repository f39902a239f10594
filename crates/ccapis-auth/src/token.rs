//! Token endpoint abstraction and its HTTP implementation
//!
//! Two interactions exist against the credential's token URL:
//! 1. Authorization code exchange (initial flow completion)
//! 2. Token refresh (driven by the `TokenManager`)
//!
//! Both POST form bodies with different grant types. The trait keeps the
//! manager testable against a mock endpoint; it uses boxed futures so it can
//! live behind `Arc<dyn TokenEndpoint>`.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::oauth::OAuthConfig;

/// Response from the token endpoint for both exchange and refresh.
///
/// `expires_in` is a delta in seconds from the response time. The caller
/// converts it to an absolute epoch timestamp when persisting the set.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

pub(crate) fn default_token_type() -> String {
    "Bearer".into()
}

/// Abstraction over the token-exchange HTTP endpoint.
pub trait TokenEndpoint: Send + Sync {
    /// Exchange an authorization code for tokens (initial OAuth flow).
    fn exchange<'a>(
        &'a self,
        oauth: &'a OAuthConfig,
        code: &'a str,
        verifier: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenResponse>> + Send + 'a>>;

    /// Refresh an access token using a refresh token.
    fn refresh<'a>(
        &'a self,
        oauth: &'a OAuthConfig,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenResponse>> + Send + 'a>>;
}

/// `TokenEndpoint` implementation posting to the credential's token URL.
#[derive(Clone)]
pub struct HttpTokenEndpoint {
    client: reqwest::Client,
}

impl HttpTokenEndpoint {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl TokenEndpoint for HttpTokenEndpoint {
    fn exchange<'a>(
        &'a self,
        oauth: &'a OAuthConfig,
        code: &'a str,
        verifier: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenResponse>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&oauth.token_url)
                .form(&[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("code_verifier", verifier),
                    ("client_id", &oauth.client_id),
                    ("redirect_uri", &oauth.redirect_url),
                ])
                .send()
                .await
                .map_err(|e| Error::Http(format!("token exchange request failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| String::from("<no body>"));
                return Err(Error::TokenExchange(format!(
                    "token endpoint returned {status}: {body}"
                )));
            }

            response
                .json::<TokenResponse>()
                .await
                .map_err(|e| Error::TokenParse(format!("invalid token response: {e}")))
        })
    }

    fn refresh<'a>(
        &'a self,
        oauth: &'a OAuthConfig,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenResponse>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&oauth.token_url)
                .form(&[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                    ("client_id", &oauth.client_id),
                ])
                .send()
                .await
                .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| String::from("<no body>"));

                // 401/403 means the refresh token is revoked or invalid
                if status.as_u16() == 401 || status.as_u16() == 403 {
                    return Err(Error::InvalidGrant(format!("{status}: {body}")));
                }

                return Err(Error::TokenExchange(format!(
                    "token refresh returned {status}: {body}"
                )));
            }

            response
                .json::<TokenResponse>()
                .await
                .map_err(|e| Error::TokenParse(format!("invalid refresh response: {e}")))
        })
    }
}
