//! Default `UsageFetcher` over the upstream HTTP API
//!
//! Resolves the credential's organization once (`GET /api/organizations`,
//! first organization, cached per credential id) and then pulls
//! `GET /api/organizations/{org}/usage`. Session credentials authenticate
//! with the session cookie and optional user-agent override, OAuth
//! credentials with a bearer token resolved through the token manager.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::credentials::{AuthMaterial, Credential};
use crate::error::TransportError;
use crate::usage::{UsageData, UsageFetcher};
use ccapis_auth::TokenManager;

#[derive(Debug, Deserialize)]
struct Organization {
    uuid: String,
}

/// Usage fetcher backed by reqwest.
pub struct HttpUsageFetcher {
    client: reqwest::Client,
    tokens: TokenManager,
    org_ids: RwLock<HashMap<String, String>>,
}

impl HttpUsageFetcher {
    pub fn new(client: reqwest::Client, tokens: TokenManager) -> Self {
        Self {
            client,
            tokens,
            org_ids: RwLock::new(HashMap::new()),
        }
    }

    /// Build an authenticated GET for this credential.
    async fn request(
        &self,
        credential: &Credential,
        url: String,
    ) -> Result<reqwest::RequestBuilder, TransportError> {
        let mut request = self.client.get(url);
        match &credential.auth {
            AuthMaterial::Session {
                session_key,
                user_agent,
            } => {
                request = request.header(
                    reqwest::header::COOKIE,
                    session_cookie(session_key.expose()),
                );
                if let Some(user_agent) = user_agent {
                    request = request.header(reqwest::header::USER_AGENT, user_agent.as_str());
                }
            }
            AuthMaterial::OAuth { oauth } => {
                let token = self
                    .tokens
                    .valid_access_token(&credential.id, oauth)
                    .await
                    .map_err(|e| TransportError::from_message(e.to_string()))?;
                request = request.header(
                    reqwest::header::AUTHORIZATION,
                    format!("Bearer {token}"),
                );
            }
        }
        Ok(request)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        credential: &Credential,
        url: String,
    ) -> Result<T, TransportError> {
        let response = self
            .request(credential, url)
            .await?
            .send()
            .await
            .map_err(|e| TransportError::from_message(format!("usage request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(TransportError::from_status(status.as_u16(), body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| TransportError::from_message(format!("invalid usage payload: {e}")))
    }

    /// The credential's organization uuid, resolved once and cached.
    async fn organization_id(&self, credential: &Credential) -> Result<String, TransportError> {
        if let Some(org) = self.org_ids.read().await.get(&credential.id) {
            return Ok(org.clone());
        }

        let organizations: Vec<Organization> = self
            .get_json(credential, format!("{}/api/organizations", credential.base_url))
            .await?;
        let org = organizations
            .into_iter()
            .next()
            .map(|o| o.uuid)
            .ok_or_else(|| TransportError::from_message("account has no organizations"))?;

        debug!(account_id = %credential.id, organization = %org, "resolved organization");
        self.org_ids
            .write()
            .await
            .insert(credential.id.clone(), org.clone());
        Ok(org)
    }

    async fn fetch_usage(&self, credential: &Credential) -> Result<UsageData, TransportError> {
        let org = self.organization_id(credential).await?;
        self.get_json(
            credential,
            format!("{}/api/organizations/{org}/usage", credential.base_url),
        )
        .await
    }
}

impl UsageFetcher for HttpUsageFetcher {
    fn fetch<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> Pin<Box<dyn Future<Output = Result<UsageData, TransportError>> + Send + 'a>> {
        Box::pin(self.fetch_usage(credential))
    }
}

fn session_cookie(session_key: &str) -> String {
    format!("sessionKey={session_key}")
}
