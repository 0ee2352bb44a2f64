//! PKCE authorization-code flow support (SPEC_FULL.md §6 "OAuth"): a
//! TTL-pruned in-memory state map keyed by the PKCE `state` parameter, the
//! fixed Google OAuth client id/secret/scope, and authorize-URL
//! construction. The code/state extractor additionally accepts a manually
//! pasted raw authorization code alongside the full browser-redirect URL.

use crate::error::OAuthError;
use base64::Engine;
use rand::RngCore;
use std::collections::HashMap;
use time::OffsetDateTime;
use tokio::sync::RwLock;

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const CLIENT_ID: &str = "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
pub const CLIENT_SECRET: &str = "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";
const OAUTH_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform https://www.googleapis.com/auth/userinfo.email https://www.googleapis.com/auth/userinfo.profile";
const STATE_TTL_SECS: i64 = 600;
const MIN_RAW_CODE_LEN: usize = 10;

#[derive(Clone, Debug)]
struct PendingAuthorization {
    redirect_uri: String,
    created_at: OffsetDateTime,
}

/// Extracted from either a pasted redirect URL or a raw authorization code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedCode {
    pub code: String,
    pub state: Option<String>,
}

/// Tracks in-flight authorization attempts by the `state` value embedded in
/// the authorize URL, so a later callback can recover the redirect URI it
/// was started with. Entries older than [`STATE_TTL_SECS`] are pruned
/// lazily on each access.
pub struct OAuthStateStore {
    pending: RwLock<HashMap<String, PendingAuthorization>>,
}

impl Default for OAuthStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OAuthStateStore {
    pub fn new() -> Self {
        Self { pending: RwLock::new(HashMap::new()) }
    }

    /// Begins an authorization attempt, returning the full URL to redirect
    /// the user's browser to.
    pub async fn begin(&self, redirect_uri: impl Into<String>, now: OffsetDateTime) -> String {
        let redirect_uri = redirect_uri.into();
        let state = generate_state();
        self.prune(now).await;
        self.pending.write().await.insert(state.clone(), PendingAuthorization { redirect_uri: redirect_uri.clone(), created_at: now });
        build_authorize_url(&redirect_uri, &state)
    }

    /// Looks up the redirect URI a `state` value was started with, removing
    /// the entry (an authorization attempt completes at most once).
    pub async fn take_redirect_uri(&self, state: &str) -> Option<String> {
        self.pending.write().await.remove(state).map(|pending| pending.redirect_uri)
    }

    async fn prune(&self, now: OffsetDateTime) {
        self.pending.write().await.retain(|_, pending| (now - pending.created_at).whole_seconds() < STATE_TTL_SECS);
    }
}

fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn build_authorize_url(redirect_uri: &str, state: &str) -> String {
    format!(
        "{AUTH_URL}?client_id={CLIENT_ID}&redirect_uri={redirect}&response_type=code&scope={scope}&access_type=offline&prompt=consent&state={state}",
        redirect = urlencoding::encode(redirect_uri),
        scope = urlencoding::encode(OAUTH_SCOPE),
    )
}

/// Parses whatever the user pasted into the manual-completion form: either
/// the full redirect URL, or the raw authorization code on its own
/// (SPEC_FULL.md §6, §8 scenario "URL code extraction").
///
/// Rules: trim whitespace; if the trimmed input looks like a URL (contains
/// `"://"`), parse its query string, rejecting an `error` parameter or a
/// missing `code`; otherwise treat it as a raw code, rejecting anything
/// shorter than [`MIN_RAW_CODE_LEN`] characters. Extracted values are
/// percent-decoded.
pub fn extract_code(input: &str) -> Result<ExtractedCode, OAuthError> {
    let trimmed = input.trim();

    if trimmed.contains("://") {
        let query = trimmed.split_once('?').map(|(_, q)| q).unwrap_or("");
        let params = parse_query_string(query);

        if let Some(error) = params.get("error") {
            return Err(OAuthError::ProviderError(error.clone()));
        }
        let code = params.get("code").ok_or(OAuthError::MissingCode)?.clone();
        let state = params.get("state").cloned();
        return Ok(ExtractedCode { code, state });
    }

    if trimmed.len() < MIN_RAW_CODE_LEN {
        return Err(OAuthError::TooShort);
    }
    Ok(ExtractedCode { code: trimmed.to_string(), state: None })
}

fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let decode = |s: &str| urlencoding::decode(s).map(|cow| cow.into_owned()).unwrap_or_else(|_| s.to_string());
            Some((decode(key), decode(value)))
        })
        .collect()
}

/// Extracts the email address from an OAuth `id_token` (a JWT) without
/// verifying its signature — the token is freshly minted by Google's own
/// token endpoint in the same request, so there is nothing to verify
/// against.
pub fn extract_email_from_id_token(id_token: &str) -> Option<String> {
    let payload_segment = id_token.split('.').nth(1)?;
    let payload_bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(payload_segment).ok()?;
    let payload: serde_json::Value = serde_json::from_slice(&payload_bytes).ok()?;
    payload.get("email")?.as_str().map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_code_and_state_from_callback_url() {
        let extracted = extract_code("http://localhost:51121/oauth-callback?code=4/0AQSTg123&state=abc123").unwrap();
        assert_eq!(extracted, ExtractedCode { code: "4/0AQSTg123".to_string(), state: Some("abc123".to_string()) });
    }

    #[test]
    fn extracts_raw_code_with_whitespace_trimmed() {
        let extracted = extract_code("  4/0AQSTgQGcode123  \n").unwrap();
        assert_eq!(extracted, ExtractedCode { code: "4/0AQSTgQGcode123".to_string(), state: None });
    }

    #[test]
    fn url_with_error_param_fails() {
        let err = extract_code("http://localhost:51121/?error=access_denied").unwrap_err();
        assert!(matches!(err, OAuthError::ProviderError(ref e) if e == "access_denied"));
    }

    #[test]
    fn short_raw_input_fails() {
        let err = extract_code("abc").unwrap_err();
        assert!(matches!(err, OAuthError::TooShort));
    }

    #[tokio::test]
    async fn state_round_trips_and_is_removed_after_use() {
        let store = OAuthStateStore::new();
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let url = store.begin("http://localhost:51121/oauth-callback", now).await;
        assert!(url.starts_with(AUTH_URL));
        let state = url.split("state=").nth(1).unwrap().to_string();
        let redirect_uri = store.take_redirect_uri(&state).await;
        assert_eq!(redirect_uri.as_deref(), Some("http://localhost:51121/oauth-callback"));
        assert!(store.take_redirect_uri(&state).await.is_none());
    }
}
