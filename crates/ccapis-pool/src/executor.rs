//! Operation executor: fail-fast, bind auth, run once, record the outcome
//!
//! The executor runs a caller-supplied operation against one account and is
//! transport-agnostic: the operation receives a bound `AuthContext` and
//! returns its own response or a `TransportError`. An operation is never
//! re-executed on another account — request bodies may be non-idempotent, so
//! retrying is the caller's decision. Cancelling a caller simply drops the
//! operation future; recorded health only changes when the operation itself
//! returns.

use std::future::Future;
use std::sync::Arc;

use common::Secret;
use tracing::debug;

use crate::classify::{self, FailureKind, Outcome};
use crate::credentials::{AuthMaterial, Credential, SharedCredentials};
use crate::error::{Error, Result, TransportError};
use crate::monitor::HealthMonitor;
use crate::refresh::UsageRefresher;
use ccapis_auth::TokenManager;

/// Authentication bound to one operation run.
#[derive(Debug, Clone)]
pub enum AuthContext {
    /// Browser-style cookie authentication
    Session {
        session_key: Secret<String>,
        user_agent: Option<String>,
    },
    /// OAuth bearer token, cached or freshly refreshed
    Bearer { access_token: String },
}

impl AuthContext {
    /// `Authorization` header value for bearer auth, `None` for cookie auth.
    pub fn authorization_header(&self) -> Option<String> {
        match self {
            AuthContext::Bearer { access_token } => Some(format!("Bearer {access_token}")),
            AuthContext::Session { .. } => None,
        }
    }

    /// `Cookie` header value for session auth, `None` for bearer auth.
    pub fn cookie_header(&self) -> Option<String> {
        match self {
            AuthContext::Session { session_key, .. } => {
                Some(format!("sessionKey={}", session_key.expose()))
            }
            AuthContext::Bearer { .. } => None,
        }
    }
}

/// Runs operations against chosen accounts and feeds outcomes back into the
/// health monitor.
pub struct Executor {
    credentials: Arc<SharedCredentials>,
    monitor: Arc<HealthMonitor>,
    refresher: Arc<UsageRefresher>,
    tokens: TokenManager,
}

impl Executor {
    pub fn new(
        credentials: Arc<SharedCredentials>,
        monitor: Arc<HealthMonitor>,
        refresher: Arc<UsageRefresher>,
        tokens: TokenManager,
    ) -> Self {
        Self {
            credentials,
            monitor,
            refresher,
            tokens,
        }
    }

    pub fn credentials(&self) -> &Arc<SharedCredentials> {
        &self.credentials
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn refresher(&self) -> &Arc<UsageRefresher> {
        &self.refresher
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    /// Run `op` against an explicit credential.
    ///
    /// Fails fast with `AccountUnavailable` when the account's breaker is
    /// open, resolves authentication (refreshing OAuth tokens as needed),
    /// runs the operation exactly once, and records the classified outcome.
    pub async fn execute<T, F, Fut>(&self, credential: &Credential, op: F) -> Result<T>
    where
        F: FnOnce(AuthContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, TransportError>>,
    {
        if !self.monitor.is_available(&credential.id).await {
            return Err(Error::AccountUnavailable {
                id: credential.id.clone(),
                summary: self.monitor.health_summary().await,
            });
        }

        let auth = match self.auth_context(credential).await {
            Ok(auth) => auth,
            Err(e) => {
                // Auth failures are not transport outcomes; they count as a
                // generic failure against the account
                self.monitor
                    .record_failure(&credential.id, FailureKind::Generic)
                    .await;
                return Err(e);
            }
        };

        let result = op(auth).await;
        match classify::classify_outcome(&result) {
            Outcome::Success => self.monitor.record_success(&credential.id).await,
            Outcome::Failure(kind) => self.monitor.record_failure(&credential.id, kind).await,
        }
        result.map_err(Error::Transport)
    }

    /// Run `op` against the best available account.
    ///
    /// Stale usage is refreshed for every candidate first, then the monitor
    /// picks the best account. The operation is not re-run on another
    /// account; whether to retry after a failure is the caller's decision.
    pub async fn execute_with_rotation<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(Credential, AuthContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, TransportError>>,
    {
        let snapshot = self.credentials.current().await;
        let candidates = snapshot.active_credentials();

        for candidate in &candidates {
            if let Err(e) = self.refresher.refresh_if_stale(candidate).await {
                debug!(account_id = %candidate.id, error = %e, "pre-selection usage refresh failed");
            }
        }

        let chosen = self
            .monitor
            .select_best_account(&candidates)
            .await
            .ok_or(Error::NoAvailableAccount)?;

        let bound = chosen.clone();
        self.execute(&chosen, move |auth| op(bound, auth)).await
    }

    /// Resolve the authentication context for one credential.
    async fn auth_context(&self, credential: &Credential) -> Result<AuthContext> {
        match &credential.auth {
            AuthMaterial::Session {
                session_key,
                user_agent,
            } => Ok(AuthContext::Session {
                session_key: session_key.clone(),
                user_agent: user_agent.clone(),
            }),
            AuthMaterial::OAuth { oauth } => {
                let access_token = self
                    .tokens
                    .valid_access_token(&credential.id, oauth)
                    .await
                    .map_err(|e| Error::AuthFailed {
                        id: credential.id.clone(),
                        cause: e.to_string(),
                    })?;
                Ok(AuthContext::Bearer { access_token })
            }
        }
    }
}
