//! Per-account OAuth endpoint configuration
//!
//! Each OAuth credential carries its own client id and endpoint triple so that
//! accounts against different deployments can coexist in one registry. The
//! defaults match the public Claude subscription client.

/// OAuth scopes requested during authorization.
pub const SCOPES: &str = "user:profile user:inference";

const DEFAULT_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
const DEFAULT_AUTHORIZE_URL: &str = "https://claude.ai/oauth/authorize";
const DEFAULT_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const DEFAULT_REDIRECT_URL: &str = "https://console.anthropic.com/oauth/code/callback";

/// Client id plus the endpoint triple for one OAuth credential.
///
/// None of these values are secrets — they identify the public client
/// application. The secrets (access/refresh tokens) live in the token store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthConfig {
    pub client_id: String,
    pub authorize_url: String,
    pub token_url: String,
    pub redirect_url: String,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.into(),
            authorize_url: DEFAULT_AUTHORIZE_URL.into(),
            token_url: DEFAULT_TOKEN_URL.into(),
            redirect_url: DEFAULT_REDIRECT_URL.into(),
        }
    }
}
