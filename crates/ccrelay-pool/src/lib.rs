//! Multi-account selection, per-model rate-limit tracking, OAuth credential
//! lifecycle, and atomic pool persistence (SPEC_FULL.md §3, §4.F, §4.G).

pub mod account;
pub mod credential_store;
pub mod error;
pub mod oauth;
pub mod persistence;
pub mod pool;

pub use account::{Account, CredentialSource, ModelRateLimitState, TokenBucket};
pub use credential_store::{CredentialStore, ExchangedTokens};
pub use error::{CredentialError, OAuthError, PersistenceError};
pub use oauth::{ExtractedCode, OAuthStateStore};
pub use persistence::{PersistedPool, PoolStore};
pub use pool::{AccountPool, PoolError};
