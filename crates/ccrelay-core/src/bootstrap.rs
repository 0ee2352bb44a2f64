//! Wires [`GlobalConfig`] and a loaded account list into a running
//! [`ProxyEngine`] (SPEC_FULL.md §6 startup sequence).

use crate::engine::ProxyEngine;
use crate::upstream_client::{UpstreamClient, UpstreamClientConfig};
use ccrelay_common::GlobalConfig;
use ccrelay_pool::{Account, AccountPool, CredentialStore, PoolStore};
use ccrelay_transform::SignatureCache;
use std::sync::Arc;
use time::OffsetDateTime;

/// Bounded by account count in practice; large enough that no realistic
/// thinking conversation evicts its own signature mid-turn.
const SIGNATURE_CACHE_CAPACITY: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("failed to load persisted account pool: {0}")]
    PoolLoad(#[from] ccrelay_pool::PersistenceError),
    #[error("failed to build the upstream HTTP client: {0}")]
    Client(#[from] wreq::Error),
}

/// Builds a [`ProxyEngine`] from the merged runtime config, loading any
/// previously persisted accounts from `config.pool_file`.
pub fn build_engine(config: &GlobalConfig) -> Result<ProxyEngine, BootstrapError> {
    build_engine_with_accounts(config, None)
}

/// As [`build_engine`], but overrides the persisted account list — used by
/// `POST /accounts/reload` and by tests that seed accounts directly.
pub fn build_engine_with_accounts(config: &GlobalConfig, accounts_override: Option<Vec<Account>>) -> Result<ProxyEngine, BootstrapError> {
    let now = OffsetDateTime::now_utc();
    let pool_store = Arc::new(PoolStore::new(config.pool_file.clone()));

    let accounts = match accounts_override {
        Some(accounts) => accounts,
        None => pool_store.load_or_default()?.accounts,
    };

    let pool = Arc::new(AccountPool::new(
        accounts,
        config.account_selection_strategy,
        config.hybrid,
        config.rate_limit_dedup_window_ms,
        config.max_consecutive_failures,
        config.extended_cooldown_ms,
        config.default_cooldown_ms,
        now,
    ));

    let client_config = UpstreamClientConfig { proxy: config.proxy.clone(), ..UpstreamClientConfig::default() };
    let client = Arc::new(UpstreamClient::new(client_config)?);
    let credentials = Arc::new(CredentialStore::new(client.http().clone()));
    let signatures = Arc::new(SignatureCache::new(SIGNATURE_CACHE_CAPACITY));

    Ok(ProxyEngine::new(pool, pool_store, credentials, client, signatures, config.max_retries, config.max_wait_before_error_ms))
}
