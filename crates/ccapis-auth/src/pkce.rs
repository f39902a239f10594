//! PKCE (Proof Key for Code Exchange) per RFC 7636
//!
//! Generates the code verifier and S256 challenge used during the OAuth
//! authorization flow. The verifier is held by the client and sent during
//! token exchange; the challenge goes into the authorization URL so the
//! server can verify both requests came from the same party.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};

use crate::oauth::{OAuthConfig, SCOPES};

/// Random bytes behind the verifier. RFC 7636 §4.1 caps the verifier at
/// 128 characters; 96 bytes of entropy encode to exactly that cap
/// (96 * 4 / 3 = 128 base64 characters, no padding).
const VERIFIER_ENTROPY_BYTES: usize = 96;

/// Random bytes behind the CSRF `state` value.
const STATE_ENTROPY_BYTES: usize = 32;

/// Generate a cryptographically random PKCE code verifier.
///
/// The output is a 128-character base64url string, the longest verifier
/// RFC 7636 permits.
pub fn generate_verifier() -> String {
    random_token(VERIFIER_ENTROPY_BYTES)
}

/// Compute the S256 code challenge from a verifier.
///
/// `challenge = BASE64URL(SHA256(ASCII(verifier)))` per RFC 7636 §4.2.
pub fn compute_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Generate an opaque `state` value for CSRF protection.
pub fn generate_state() -> String {
    random_token(STATE_ENTROPY_BYTES)
}

fn random_token(entropy_bytes: usize) -> String {
    let mut bytes = vec![0u8; entropy_bytes];
    rand::rng().fill(bytes.as_mut_slice());
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Build the full authorization URL against the credential's endpoints.
///
/// The authorization server returns `state` unchanged in the callback.
pub fn build_authorization_url(oauth: &OAuthConfig, state: &str, challenge: &str) -> String {
    format!(
        "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&code_challenge={}&code_challenge_method=S256&state={}",
        oauth.authorize_url,
        oauth.client_id,
        urlencoded(&oauth.redirect_url),
        urlencoded(SCOPES),
        challenge,
        state,
    )
}

/// Percent-encode a query parameter value.
///
/// Everything outside RFC 3986's unreserved set is escaped, so credential
/// endpoint URLs and scope lists survive as parameter values regardless of
/// what characters they carry.
fn urlencoded(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            other => {
                out.push('%');
                out.push_str(&format!("{other:02X}"));
            }
        }
    }
    out
}
