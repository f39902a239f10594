//! Credentials document: XML load, save, and validation
//!
//! The document root holds zero-or-one `CircuitBreakerConfig` element and
//! zero-or-more `Credential` / `OauthCredential` elements, everything in
//! attributes. Unknown elements and attributes are ignored; `active`
//! defaults to true; duplicate ids across both kinds are rejected.
//!
//! `%NAME%` placeholders inside URL attributes expand from the process
//! environment at load time; unset names stay literal.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use ccapis_auth::OAuthConfig;
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use tracing::{debug, info};

use crate::config::CircuitBreakerConfig;
use crate::credentials::{AuthMaterial, Credential, CredentialsSnapshot};
use crate::error::{Error, Result};

/// Parsed credentials file.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialsDocument {
    pub credentials: Vec<Credential>,
    pub breaker: Option<CircuitBreakerConfig>,
}

impl CredentialsDocument {
    /// The standard document location under the user's home directory.
    pub fn default_path() -> std::path::PathBuf {
        common::credentials_file()
    }

    /// Parse and validate an XML document.
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut credentials: Vec<Credential> = Vec::new();
        let mut breaker = None;
        loop {
            let event = reader.read_event().map_err(|e| {
                Error::CredentialParse(format!(
                    "XML error at byte {}: {e}",
                    reader.buffer_position()
                ))
            })?;
            match event {
                Event::Start(e) | Event::Empty(e) => match e.name().as_ref() {
                    b"Credential" => credentials.push(parse_session_credential(&e)?),
                    b"OauthCredential" => credentials.push(parse_oauth_credential(&e)?),
                    b"CircuitBreakerConfig" => breaker = Some(parse_breaker(&e)?),
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }

        let mut seen = HashSet::new();
        for credential in &credentials {
            if !seen.insert(credential.id.as_str()) {
                return Err(Error::CredentialParse(format!(
                    "duplicate credential id: {}",
                    credential.id
                )));
            }
        }

        Ok(Self {
            credentials,
            breaker,
        })
    }

    /// Render the document as indented XML.
    pub fn to_xml(&self) -> Result<String> {
        let io_err = |e| Error::Io(format!("writing XML: {e}"));

        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(io_err)?;
        writer
            .write_event(Event::Start(BytesStart::new("Credentials")))
            .map_err(io_err)?;

        if let Some(breaker) = &self.breaker {
            let mut element = BytesStart::new("CircuitBreakerConfig");
            element.push_attribute(("failureThreshold", breaker.failure_threshold.to_string().as_str()));
            element.push_attribute((
                "rateLimitCooldownMinutes",
                (breaker.rate_limit_cooldown.as_secs() / 60).to_string().as_str(),
            ));
            element.push_attribute((
                "genericErrorCooldownMinutes",
                (breaker.generic_error_cooldown.as_secs() / 60).to_string().as_str(),
            ));
            element.push_attribute((
                "halfOpenRetryCount",
                breaker.half_open_retry_count.to_string().as_str(),
            ));
            element.push_attribute((
                "recheckUsageBeforeSelectionMinutes",
                (breaker.recheck_usage_before_selection.as_secs() / 60)
                    .to_string()
                    .as_str(),
            ));
            element.push_attribute(("enabled", if breaker.enabled { "true" } else { "false" }));
            writer.write_event(Event::Empty(element)).map_err(io_err)?;
        }

        for credential in &self.credentials {
            let mut element = match &credential.auth {
                AuthMaterial::Session {
                    session_key,
                    user_agent,
                } => {
                    let mut element = BytesStart::new("Credential");
                    element.push_attribute(("id", credential.id.as_str()));
                    element.push_attribute(("baseUrl", credential.base_url.as_str()));
                    element.push_attribute(("sessionKey", session_key.expose().as_str()));
                    if let Some(user_agent) = user_agent {
                        element.push_attribute(("userAgent", user_agent.as_str()));
                    }
                    element
                }
                AuthMaterial::OAuth { oauth } => {
                    let mut element = BytesStart::new("OauthCredential");
                    element.push_attribute(("id", credential.id.as_str()));
                    element.push_attribute(("baseUrl", credential.base_url.as_str()));
                    element.push_attribute(("clientId", oauth.client_id.as_str()));
                    element.push_attribute(("authorizeUrl", oauth.authorize_url.as_str()));
                    element.push_attribute(("tokenUrl", oauth.token_url.as_str()));
                    element.push_attribute(("redirectUrl", oauth.redirect_url.as_str()));
                    element
                }
            };
            element.push_attribute(("tier", credential.tier.to_string().as_str()));
            element.push_attribute(("active", if credential.active { "true" } else { "false" }));
            element.push_attribute((
                "trackUsage",
                if credential.track_usage { "true" } else { "false" },
            ));
            element.push_attribute(("ping", if credential.ping { "true" } else { "false" }));
            writer.write_event(Event::Empty(element)).map_err(io_err)?;
        }

        writer
            .write_event(Event::End(BytesEnd::new("Credentials")))
            .map_err(io_err)?;

        String::from_utf8(writer.into_inner())
            .map_err(|e| Error::Io(format!("XML output was not UTF-8: {e}")))
    }

    /// Load and parse the document at `path`.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Io(format!("reading {}: {e}", path.display())))?;
        let document = Self::parse(&contents)?;
        info!(
            path = %path.display(),
            credentials = document.credentials.len(),
            "loaded credentials document"
        );
        Ok(document)
    }

    /// Persist the document atomically with 0600 permissions.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let xml = self.to_xml()?;
        let dir = path
            .parent()
            .ok_or_else(|| Error::Io("credentials path has no parent directory".into()))?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::Io(format!("creating {}: {e}", dir.display())))?;

        let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));
        tokio::fs::write(&tmp_path, xml.as_bytes())
            .await
            .map_err(|e| Error::Io(format!("writing temp credentials file: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&tmp_path, perms)
                .await
                .map_err(|e| Error::Io(format!("setting credentials permissions: {e}")))?;
        }

        tokio::fs::rename(&tmp_path, path)
            .await
            .map_err(|e| Error::Io(format!("renaming temp credentials file: {e}")))?;
        debug!(path = %path.display(), "persisted credentials document");
        Ok(())
    }

    /// Snapshot for the live registry; a missing breaker element means the
    /// process-wide defaults.
    pub fn snapshot(&self) -> CredentialsSnapshot {
        CredentialsSnapshot {
            credentials: self.credentials.clone(),
            breaker: self.breaker.clone().unwrap_or_default(),
        }
    }
}

/// Collect an element's attributes into a map, ignoring none.
fn attr_map(element: &BytesStart) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for attr in element.attributes() {
        let attr = attr.map_err(|e| Error::CredentialParse(format!("bad attribute: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| Error::CredentialParse(format!("bad attribute value: {e}")))?
            .into_owned();
        map.insert(key, value);
    }
    Ok(map)
}

fn require(attrs: &HashMap<String, String>, element: &str, key: &str) -> Result<String> {
    attrs
        .get(key)
        .cloned()
        .ok_or_else(|| Error::CredentialParse(format!("{element} is missing required attribute {key}")))
}

fn parse_bool(element: &str, key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(Error::CredentialParse(format!(
            "{element} attribute {key} has non-boolean value {other:?}"
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(element: &str, key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        Error::CredentialParse(format!(
            "{element} attribute {key} has non-numeric value {value:?}"
        ))
    })
}

/// Shared tier/flag attributes for both credential kinds.
fn apply_common(
    credential: &mut Credential,
    attrs: &HashMap<String, String>,
    element: &str,
) -> Result<()> {
    if let Some(tier) = attrs.get("tier") {
        credential.tier = parse_number(element, "tier", tier)?;
    }
    if let Some(active) = attrs.get("active") {
        credential.active = parse_bool(element, "active", active)?;
    }
    if let Some(track_usage) = attrs.get("trackUsage") {
        credential.track_usage = parse_bool(element, "trackUsage", track_usage)?;
    }
    if let Some(ping) = attrs.get("ping") {
        credential.ping = parse_bool(element, "ping", ping)?;
    }
    Ok(())
}

fn parse_session_credential(element: &BytesStart) -> Result<Credential> {
    let attrs = attr_map(element)?;
    let id = require(&attrs, "Credential", "id")?;
    let base_url = expand_env(&require(&attrs, "Credential", "baseUrl")?);
    let session_key = require(&attrs, "Credential", "sessionKey")?;

    let mut credential = Credential::session(id, base_url, session_key);
    if let Some(user_agent) = attrs.get("userAgent") {
        if let AuthMaterial::Session { user_agent: ua, .. } = &mut credential.auth {
            *ua = Some(user_agent.clone());
        }
    }
    apply_common(&mut credential, &attrs, "Credential")?;
    Ok(credential)
}

fn parse_oauth_credential(element: &BytesStart) -> Result<Credential> {
    let attrs = attr_map(element)?;
    let id = require(&attrs, "OauthCredential", "id")?;
    let base_url = expand_env(&require(&attrs, "OauthCredential", "baseUrl")?);

    let mut oauth = OAuthConfig::default();
    if let Some(client_id) = attrs.get("clientId") {
        oauth.client_id = client_id.clone();
    }
    if let Some(authorize_url) = attrs.get("authorizeUrl") {
        oauth.authorize_url = expand_env(authorize_url);
    }
    if let Some(token_url) = attrs.get("tokenUrl") {
        oauth.token_url = expand_env(token_url);
    }
    if let Some(redirect_url) = attrs.get("redirectUrl") {
        oauth.redirect_url = expand_env(redirect_url);
    }

    let mut credential = Credential::oauth(id, base_url, oauth);
    apply_common(&mut credential, &attrs, "OauthCredential")?;
    Ok(credential)
}

fn parse_breaker(element: &BytesStart) -> Result<CircuitBreakerConfig> {
    let attrs = attr_map(element)?;
    let element = "CircuitBreakerConfig";
    let mut config = CircuitBreakerConfig::default();

    if let Some(value) = attrs.get("failureThreshold") {
        config.failure_threshold = parse_number(element, "failureThreshold", value)?;
    }
    // Cooldowns are clamped to one minute: an open circuit must cool down
    // until strictly after the instant it opened
    if let Some(value) = attrs.get("rateLimitCooldownMinutes") {
        let minutes: u64 = parse_number(element, "rateLimitCooldownMinutes", value)?;
        config.rate_limit_cooldown = std::time::Duration::from_secs(minutes.max(1) * 60);
    }
    if let Some(value) = attrs.get("genericErrorCooldownMinutes") {
        let minutes: u64 = parse_number(element, "genericErrorCooldownMinutes", value)?;
        config.generic_error_cooldown = std::time::Duration::from_secs(minutes.max(1) * 60);
    }
    if let Some(value) = attrs.get("halfOpenRetryCount") {
        config.half_open_retry_count = parse_number(element, "halfOpenRetryCount", value)?;
    }
    if let Some(value) = attrs.get("recheckUsageBeforeSelectionMinutes") {
        let minutes: u64 = parse_number(element, "recheckUsageBeforeSelectionMinutes", value)?;
        config.recheck_usage_before_selection = std::time::Duration::from_secs(minutes * 60);
    }
    if let Some(value) = attrs.get("enabled") {
        config.enabled = parse_bool(element, "enabled", value)?;
    }
    Ok(config)
}

/// Expand `%NAME%` placeholders from the process environment.
///
/// Unset names and lone `%` characters stay literal.
fn expand_env(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('%') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(expanded) => out.push_str(&expanded),
                    Err(_) => {
                        out.push('%');
                        out.push_str(name);
                        out.push('%');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push('%');
                rest = after;
                break;
            }
        }
    }
    out.push_str(rest);
    out
}
