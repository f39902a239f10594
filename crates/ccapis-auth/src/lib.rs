//! OAuth authentication for the ccapis multi-account client
//!
//! Provides PKCE flow generation, the token endpoint abstraction, per-account
//! token persistence, and the `TokenManager` that guarantees at-most-one
//! concurrent refresh per account. This crate is a standalone library with no
//! dependency on the pool — it can be tested and used independently.
//!
//! Token lifecycle:
//! 1. Caller generates `pkce::generate_verifier()` + `pkce::compute_challenge()`
//! 2. User authorizes via `pkce::build_authorization_url()`
//! 3. `TokenManager::exchange_code()` completes the flow and persists the set
//! 4. `TokenManager::valid_access_token()` serves cached tokens, refreshing
//!    through a shared flight when the access token is near expiry
//! 5. `TokenManager::logout()` destroys the set (cache and disk)

pub mod error;
pub mod manager;
pub mod oauth;
pub mod pkce;
pub mod store;
pub mod token;

pub use error::{Error, Result};
pub use manager::TokenManager;
pub use oauth::OAuthConfig;
pub use pkce::{build_authorization_url, compute_challenge, generate_state, generate_verifier};
pub use store::{OAuthTokenSet, TokenStore, unix_now_secs};
pub use token::{HttpTokenEndpoint, TokenEndpoint, TokenResponse};
