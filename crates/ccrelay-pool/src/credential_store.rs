//! Per-account token and project-id acquisition (SPEC_FULL.md §4.F). A
//! per-account single-flight lock means concurrent callers on the same
//! account coalesce onto one in-flight refresh instead of each issuing a
//! redundant upstream token exchange (SPEC_FULL.md §5).

use crate::account::{Account, CredentialSource};
use crate::error::CredentialError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::Mutex;

const DEFAULT_TOKEN_TTL_SECS: i64 = 1800;
const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const OAUTH_CLIENT_ID: &str = "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
const OAUTH_CLIENT_SECRET: &str = "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";
const DEFAULT_PROJECT_ID: &str = "default-cloud-code-project";

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: OffsetDateTime,
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    grant_type: &'a str,
    refresh_token: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

#[derive(Serialize)]
struct AuthorizationCodeTokenRequest<'a> {
    code: &'a str,
    client_id: &'a str,
    client_secret: &'a str,
    redirect_uri: &'a str,
    grant_type: &'a str,
}

#[derive(Deserialize)]
struct AuthorizationCodeTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    id_token: Option<String>,
}

/// Tokens obtained by redeeming a freshly completed authorization-code
/// exchange, as opposed to the cached bearer token [`CredentialStore::access_token`]
/// hands out for an already-onboarded account.
pub struct ExchangedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub email: Option<String>,
}

/// Caches bearer tokens and project ids per account email, exchanging OAuth
/// refresh tokens and discovering project ids against the upstream mirrors
/// on demand.
pub struct CredentialStore {
    http: wreq::Client,
    tokens: Mutex<HashMap<String, CachedToken>>,
    project_ids: Mutex<HashMap<String, String>>,
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    token_ttl: time::Duration,
}

impl CredentialStore {
    pub fn new(http: wreq::Client) -> Self {
        Self {
            http,
            tokens: Mutex::new(HashMap::new()),
            project_ids: Mutex::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
            token_ttl: time::Duration::seconds(DEFAULT_TOKEN_TTL_SECS),
        }
    }

    pub fn with_token_ttl(mut self, ttl: time::Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Returns a usable bearer token for this account, refreshing if needed.
    pub async fn access_token(&self, account: &Account, now: OffsetDateTime) -> Result<String, CredentialError> {
        match &account.credential {
            CredentialSource::Manual { api_key } => Ok(api_key.clone()),
            CredentialSource::DatabaseScraped { database_path } => self.read_database_token(database_path).await,
            CredentialSource::Oauth { refresh_token } => self.oauth_access_token(&account.email, refresh_token, now).await,
        }
    }

    async fn oauth_access_token(&self, email: &str, refresh_token: &str, now: OffsetDateTime) -> Result<String, CredentialError> {
        if let Some(token) = self.cached_token(email, now).await {
            return Ok(token);
        }

        let lock = self.refresh_lock_for(email).await;
        let _guard = lock.lock().await;

        // Re-check: another caller may have refreshed while we waited on
        // the per-account lock, so this was a single-flighted wait, not a
        // second exchange.
        if let Some(token) = self.cached_token(email, now).await {
            return Ok(token);
        }

        let access_token = self.exchange_refresh_token(refresh_token).await?;
        self.tokens.lock().await.insert(
            email.to_string(),
            CachedToken { access_token: access_token.clone(), expires_at: now + self.token_ttl },
        );
        Ok(access_token)
    }

    async fn cached_token(&self, email: &str, now: OffsetDateTime) -> Option<String> {
        let guard = self.tokens.lock().await;
        let cached = guard.get(email)?;
        (cached.expires_at > now).then(|| cached.access_token.clone())
    }

    async fn refresh_lock_for(&self, email: &str) -> Arc<Mutex<()>> {
        self.refresh_locks.lock().await.entry(email.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<String, CredentialError> {
        let body = TokenRequest {
            client_id: OAUTH_CLIENT_ID,
            client_secret: OAUTH_CLIENT_SECRET,
            grant_type: "refresh_token",
            refresh_token,
        };
        let response = self
            .http
            .post(OAUTH_TOKEN_URL)
            .form(&body)
            .send()
            .await
            .map_err(|err| CredentialError::TokenExchangeFailed(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if status == http::StatusCode::BAD_REQUEST && text.contains("invalid_grant") {
                return Err(CredentialError::InvalidGrant);
            }
            return Err(CredentialError::TokenExchangeFailed(format!("{status}: {text}")));
        }

        let payload: TokenResponse = response.json().await.map_err(|err| CredentialError::TokenExchangeFailed(err.to_string()))?;
        payload.access_token.ok_or_else(|| CredentialError::TokenExchangeFailed("response missing access_token".to_string()))
    }

    async fn read_database_token(&self, database_path: &str) -> Result<String, CredentialError> {
        tokio::fs::read_to_string(database_path)
            .await
            .map(|contents| contents.trim().to_string())
            .map_err(|err| CredentialError::DatabaseUnreadable(err.to_string()))
    }

    /// Redeems a PKCE authorization code for a refresh token, completing
    /// onboarding of a new account (SPEC_FULL.md §6 "OAuth").
    pub async fn exchange_authorization_code(&self, code: &str, redirect_uri: &str) -> Result<ExchangedTokens, CredentialError> {
        let body = AuthorizationCodeTokenRequest {
            code,
            client_id: OAUTH_CLIENT_ID,
            client_secret: OAUTH_CLIENT_SECRET,
            redirect_uri,
            grant_type: "authorization_code",
        };
        let response = self
            .http
            .post(OAUTH_TOKEN_URL)
            .form(&body)
            .send()
            .await
            .map_err(|err| CredentialError::TokenExchangeFailed(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CredentialError::TokenExchangeFailed(format!("{status}: {text}")));
        }

        let payload: AuthorizationCodeTokenResponse = response.json().await.map_err(|err| CredentialError::TokenExchangeFailed(err.to_string()))?;
        let refresh_token = payload
            .refresh_token
            .ok_or_else(|| CredentialError::TokenExchangeFailed("response missing refresh_token (re-consent required)".to_string()))?;
        let email = payload.id_token.as_deref().and_then(crate::oauth::extract_email_from_id_token);
        Ok(ExchangedTokens { access_token: payload.access_token, refresh_token, email })
    }

    /// Drops the cached bearer token, forcing the next call to re-acquire
    /// it. Called after an upstream 401.
    pub async fn invalidate_token(&self, email: &str) {
        self.tokens.lock().await.remove(email);
    }

    /// Resolves a project id: the account's stored value, else the cache,
    /// else `loadCodeAssist` against the given mirror, else the constant
    /// fallback. Successful discovery is cached indefinitely.
    pub async fn project_id(&self, account: &Account, access_token: &str, mirror_base: &str) -> String {
        if let Some(stored) = &account.project_id {
            return stored.clone();
        }
        if let Some(cached) = self.project_ids.lock().await.get(&account.email).cloned() {
            return cached;
        }
        let discovered = self.load_code_assist_project_id(access_token, mirror_base).await;
        let project_id = discovered.unwrap_or_else(|| DEFAULT_PROJECT_ID.to_string());
        self.project_ids.lock().await.insert(account.email.clone(), project_id.clone());
        project_id
    }

    async fn load_code_assist_project_id(&self, access_token: &str, mirror_base: &str) -> Option<String> {
        let url = format!("{mirror_base}/v1internal:loadCodeAssist");
        let response = self.http.post(&url).bearer_auth(access_token).json(&serde_json::json!({})).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let value: serde_json::Value = response.json().await.ok()?;
        let project = value.get("cloudaicompanionProject")?;
        project
            .as_str()
            .map(|s| s.to_string())
            .or_else(|| project.get("id").and_then(|id| id.as_str()).map(|s| s.to_string()))
    }

    /// Drops the cached project id, forcing re-discovery on next use.
    pub async fn invalidate_project_id(&self, email: &str) {
        self.project_ids.lock().await.remove(email);
    }

    /// Drops every cached bearer token and project id, as served by
    /// `POST /refresh-token`.
    pub async fn clear_all(&self) {
        self.tokens.lock().await.clear();
        self.project_ids.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::CredentialSource;

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    #[tokio::test]
    async fn manual_credential_returns_stored_key_without_network() {
        let store = CredentialStore::new(wreq::Client::new());
        let account = Account::new("a@example.com", CredentialSource::Manual { api_key: "sk-static".into() }, now(), 100, 10.0);
        let token = store.access_token(&account, now()).await.unwrap();
        assert_eq!(token, "sk-static");
    }

    #[tokio::test]
    async fn cached_oauth_token_is_reused_until_expiry() {
        let store = CredentialStore::new(wreq::Client::new());
        store.tokens.lock().await.insert(
            "a@example.com".to_string(),
            CachedToken { access_token: "cached-token".to_string(), expires_at: now() + time::Duration::minutes(5) },
        );
        let account = Account::new("a@example.com", CredentialSource::Oauth { refresh_token: "rt".into() }, now(), 100, 10.0);
        let token = store.access_token(&account, now()).await.unwrap();
        assert_eq!(token, "cached-token");
    }

    #[tokio::test]
    async fn stored_project_id_short_circuits_discovery() {
        let store = CredentialStore::new(wreq::Client::new());
        let mut account = Account::new("a@example.com", CredentialSource::Manual { api_key: "k".into() }, now(), 100, 10.0);
        account.project_id = Some("my-project".to_string());
        let project_id = store.project_id(&account, "token", "https://example.invalid").await;
        assert_eq!(project_id, "my-project");
    }

    #[tokio::test]
    async fn invalidate_token_forces_recached_lookup() {
        let store = CredentialStore::new(wreq::Client::new());
        store.tokens.lock().await.insert(
            "a@example.com".to_string(),
            CachedToken { access_token: "stale".to_string(), expires_at: now() + time::Duration::minutes(5) },
        );
        store.invalidate_token("a@example.com").await;
        assert!(store.cached_token("a@example.com", now()).await.is_none());
    }
}
