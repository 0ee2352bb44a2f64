use ccrelay_common::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("refresh token rejected by the OAuth endpoint (invalid_grant)")]
    InvalidGrant,
    #[error("token exchange failed: {0}")]
    TokenExchangeFailed(String),
    #[error("could not determine a project id for this account")]
    ProjectIdUnavailable,
    #[error("database-scraped credential source is unreadable: {0}")]
    DatabaseUnreadable(String),
}

impl CredentialError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CredentialError::InvalidGrant => ErrorKind::AuthInvalid,
            CredentialError::TokenExchangeFailed(_) => ErrorKind::Transient,
            CredentialError::ProjectIdUnavailable => ErrorKind::Transient,
            CredentialError::DatabaseUnreadable(_) => ErrorKind::Unknown,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("upstream returned an OAuth error: {0}")]
    ProviderError(String),
    #[error("authorization code missing")]
    MissingCode,
    #[error("raw authorization code is too short to be valid")]
    TooShort,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("failed to read pool file {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("failed to write pool file {path}: {source}")]
    Write { path: String, source: std::io::Error },
    #[error("pool file {path} is not valid JSON: {source}")]
    Decode { path: String, source: serde_json::Error },
}
