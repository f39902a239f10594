//! Credential model and the shared live snapshot
//!
//! Two kinds of credentials coexist in one registry: browser-style session
//! keys and OAuth clients. Both carry the same identity, tier, and feature
//! flags; `id` uniqueness is global across kinds.

use std::sync::Arc;

use ccapis_auth::OAuthConfig;
use common::Secret;
use tokio::sync::RwLock;

use crate::config::CircuitBreakerConfig;

/// Authentication material, one variant per credential kind.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthMaterial {
    /// Browser-style session cookie authentication
    Session {
        session_key: Secret<String>,
        user_agent: Option<String>,
    },
    /// OAuth 2.0 (PKCE) bearer-token authentication
    OAuth { oauth: OAuthConfig },
}

/// One account against the upstream service.
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub id: String,
    pub base_url: String,
    pub auth: AuthMaterial,
    pub tier: u32,
    pub active: bool,
    pub track_usage: bool,
    pub ping: bool,
}

impl Credential {
    /// Session-key credential with default tier and flags.
    pub fn session(
        id: impl Into<String>,
        base_url: impl Into<String>,
        session_key: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            auth: AuthMaterial::Session {
                session_key: Secret::new(session_key.into()),
                user_agent: None,
            },
            tier: 1,
            active: true,
            track_usage: true,
            ping: false,
        }
    }

    /// OAuth credential with default tier and flags.
    pub fn oauth(
        id: impl Into<String>,
        base_url: impl Into<String>,
        oauth: OAuthConfig,
    ) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            auth: AuthMaterial::OAuth { oauth },
            tier: 1,
            active: true,
            track_usage: true,
            ping: false,
        }
    }

    pub fn is_oauth(&self) -> bool {
        matches!(self.auth, AuthMaterial::OAuth { .. })
    }
}

/// Immutable view of the credentials file at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialsSnapshot {
    pub credentials: Vec<Credential>,
    pub breaker: CircuitBreakerConfig,
}

impl CredentialsSnapshot {
    /// All ids in document order.
    pub fn ids(&self) -> Vec<String> {
        self.credentials.iter().map(|c| c.id.clone()).collect()
    }

    /// Credentials eligible for rotation (the `active` flag).
    pub fn active_credentials(&self) -> Vec<Credential> {
        self.credentials
            .iter()
            .filter(|c| c.active)
            .cloned()
            .collect()
    }

    pub fn find(&self, id: &str) -> Option<&Credential> {
        self.credentials.iter().find(|c| c.id == id)
    }
}

/// Atomically swappable credentials snapshot.
///
/// Readers clone the `Arc` and keep a consistent view for as long as they
/// need it; the watcher swaps in a whole new snapshot on reload, so a torn
/// read is impossible.
pub struct SharedCredentials {
    current: RwLock<Arc<CredentialsSnapshot>>,
}

impl SharedCredentials {
    pub fn new(snapshot: CredentialsSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// The live snapshot.
    pub async fn current(&self) -> Arc<CredentialsSnapshot> {
        self.current.read().await.clone()
    }

    /// Swap in a new snapshot, returning the previous one.
    pub async fn replace(&self, snapshot: CredentialsSnapshot) -> Arc<CredentialsSnapshot> {
        let mut guard = self.current.write().await;
        std::mem::replace(&mut *guard, Arc::new(snapshot))
    }
}
