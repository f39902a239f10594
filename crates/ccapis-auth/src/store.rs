//! On-disk persistence for OAuth token sets
//!
//! One JSON file per account id under the token directory, named
//! `<id>.tokens.json`. Writes are atomic (temp file + rename) and 0600 on
//! unix since the files hold live tokens. The store performs no caching;
//! the `TokenManager` layers its in-memory cache on top.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::token::{TokenResponse, default_token_type};

/// A persisted OAuth token set for one account.
///
/// `expires_at` is an absolute epoch-seconds timestamp computed from
/// `expires_in` at storage time; `expires_in` is kept alongside it for
/// on-disk compatibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthTokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Absolute expiry as epoch seconds
    #[serde(rename = "expiresAt")]
    pub expires_at: u64,
}

impl OAuthTokenSet {
    /// Build a set from a token endpoint response received at `now_secs`.
    pub fn from_response(response: &TokenResponse, now_secs: u64) -> Self {
        Self {
            access_token: response.access_token.clone(),
            refresh_token: response.refresh_token.clone(),
            expires_in: response.expires_in,
            token_type: response.token_type.clone(),
            expires_at: now_secs + response.expires_in,
        }
    }

    /// Whether the access token expires within `lead_secs` of `now_secs`.
    pub fn expires_within(&self, now_secs: u64, lead_secs: u64) -> bool {
        now_secs >= self.expires_at.saturating_sub(lead_secs)
    }
}

/// Current wall-clock time as epoch seconds.
pub fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// File-per-account token persistence.
#[derive(Debug, Clone)]
pub struct TokenStore {
    dir: PathBuf,
}

impl TokenStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.tokens.json"))
    }

    /// Load the token set for `id`, or `None` if nothing is stored.
    pub async fn load(&self, id: &str) -> Result<Option<OAuthTokenSet>> {
        let path = self.path_for(id);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(format!("reading {}: {e}", path.display()))),
        };
        let set = serde_json::from_str(&contents)
            .map_err(|e| Error::TokenParse(format!("parsing {}: {e}", path.display())))?;
        Ok(Some(set))
    }

    /// Persist the token set for `id` atomically.
    pub async fn save(&self, id: &str, set: &OAuthTokenSet) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::Io(format!("creating {}: {e}", self.dir.display())))?;
        write_atomic(&self.path_for(id), set).await?;
        debug!(account_id = %id, "persisted token set");
        Ok(())
    }

    /// Remove the token set for `id`. Missing files are not an error.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let path = self.path_for(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(account_id = %id, "removed token set");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(format!("removing {}: {e}", path.display()))),
        }
    }
}

/// Write a token set to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Permissions are 0600 (owner read/write only) on unix.
async fn write_atomic(path: &Path, set: &OAuthTokenSet) -> Result<()> {
    let json = serde_json::to_string_pretty(set)
        .map_err(|e| Error::TokenParse(format!("serializing token set: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("token path has no parent directory".into()))?;
    let tmp_path = dir.join(format!(".tokens.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp token file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting token file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp token file: {e}")))?;
    Ok(())
}
