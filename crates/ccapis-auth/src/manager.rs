//! Token cache and single-flight refresh
//!
//! `TokenManager` owns the in-memory token cache and the per-account refresh
//! flights. At most one refresh is ever in flight per account: the first
//! caller spawns the refresh as a detached task and every caller (including
//! the initiator) awaits the shared result through a watch channel. A caller
//! dropping its future therefore never cancels the refresh itself. A failed
//! flight is deregistered before its result is broadcast, so the next caller
//! starts a fresh attempt.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::oauth::OAuthConfig;
use crate::store::{OAuthTokenSet, TokenStore, unix_now_secs};
use crate::token::TokenEndpoint;

/// Refresh when the access token expires within this many seconds.
const REFRESH_LEAD_SECS: u64 = 60;

/// Outcome of one refresh flight, cloneable so every waiter gets a copy.
type FlightResult = std::result::Result<OAuthTokenSet, String>;

/// Per-account token cache with single-flight refresh.
///
/// Cheap to clone; all clones share the same cache, store, and flights.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: TokenStore,
    endpoint: Arc<dyn TokenEndpoint>,
    cache: RwLock<HashMap<String, OAuthTokenSet>>,
    flights: Mutex<HashMap<String, watch::Receiver<Option<FlightResult>>>>,
}

impl TokenManager {
    /// Create a manager persisting token sets under `dir`.
    pub fn new(dir: PathBuf, endpoint: Arc<dyn TokenEndpoint>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: TokenStore::new(dir),
                endpoint,
                cache: RwLock::new(HashMap::new()),
                flights: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Manager over the standard `oauth-tokens` directory under the user's
    /// home.
    pub fn with_default_dir(endpoint: Arc<dyn TokenEndpoint>) -> Self {
        Self::new(common::token_dir(), endpoint)
    }

    /// Return a currently valid access token for `id`, refreshing if the
    /// stored token expires within the refresh lead.
    ///
    /// Errors with `NoTokens` when the account has never completed the
    /// authorization flow.
    pub async fn valid_access_token(&self, id: &str, oauth: &OAuthConfig) -> Result<String> {
        let set = self
            .lookup(id)
            .await?
            .ok_or_else(|| Error::NoTokens(id.to_string()))?;

        if !set.expires_within(unix_now_secs(), REFRESH_LEAD_SECS) {
            return Ok(set.access_token);
        }

        debug!(account_id = %id, "access token near expiry, refreshing");
        let refreshed = self.refresh_shared(id, oauth, set.refresh_token).await?;
        Ok(refreshed.access_token)
    }

    /// Complete the authorization flow: exchange the code and persist the
    /// resulting token set.
    pub async fn exchange_code(
        &self,
        id: &str,
        oauth: &OAuthConfig,
        code: &str,
        verifier: &str,
    ) -> Result<OAuthTokenSet> {
        let response = self.inner.endpoint.exchange(oauth, code, verifier).await?;
        let set = OAuthTokenSet::from_response(&response, unix_now_secs());
        self.inner.store.save(id, &set).await?;
        self.inner
            .cache
            .write()
            .await
            .insert(id.to_string(), set.clone());
        info!(account_id = %id, "authorization code exchanged");
        Ok(set)
    }

    /// Destroy the token set for `id`, both cached and on disk.
    pub async fn logout(&self, id: &str) -> Result<()> {
        self.inner.cache.write().await.remove(id);
        self.inner.store.remove(id).await?;
        info!(account_id = %id, "logged out");
        Ok(())
    }

    /// Cache lookup with disk fallback.
    async fn lookup(&self, id: &str) -> Result<Option<OAuthTokenSet>> {
        if let Some(set) = self.inner.cache.read().await.get(id) {
            return Ok(Some(set.clone()));
        }
        let Some(set) = self.inner.store.load(id).await? else {
            return Ok(None);
        };
        self.inner
            .cache
            .write()
            .await
            .insert(id.to_string(), set.clone());
        Ok(Some(set))
    }

    /// Join the in-flight refresh for `id`, or start one.
    async fn refresh_shared(
        &self,
        id: &str,
        oauth: &OAuthConfig,
        refresh_token: String,
    ) -> Result<OAuthTokenSet> {
        let mut rx = {
            let mut flights = self.inner.flights.lock().await;
            match flights.get(id) {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    flights.insert(id.to_string(), rx.clone());
                    let inner = Arc::clone(&self.inner);
                    let id = id.to_string();
                    let oauth = oauth.clone();
                    tokio::spawn(async move {
                        let result = run_refresh(&inner, &id, &oauth, &refresh_token).await;
                        inner.flights.lock().await.remove(&id);
                        let _ = tx.send(Some(result));
                    });
                    rx
                }
            }
        };

        let flight = rx
            .wait_for(|result| result.is_some())
            .await
            .map_err(|_| Error::RefreshFailed("refresh task ended without a result".into()))?
            .clone()
            .unwrap_or_else(|| Err("refresh produced no result".into()));

        flight.map_err(Error::RefreshFailed)
    }
}

/// Run one refresh against the endpoint, persisting on success.
async fn run_refresh(
    inner: &Inner,
    id: &str,
    oauth: &OAuthConfig,
    refresh_token: &str,
) -> FlightResult {
    match inner.endpoint.refresh(oauth, refresh_token).await {
        Ok(response) => {
            let set = OAuthTokenSet::from_response(&response, unix_now_secs());
            if let Err(e) = inner.store.save(id, &set).await {
                warn!(account_id = %id, error = %e, "failed to persist refreshed tokens");
            }
            inner
                .cache
                .write()
                .await
                .insert(id.to_string(), set.clone());
            info!(account_id = %id, "token refresh succeeded");
            Ok(set)
        }
        Err(e) => {
            warn!(account_id = %id, error = %e, "token refresh failed");
            Err(e.to_string())
        }
    }
}
