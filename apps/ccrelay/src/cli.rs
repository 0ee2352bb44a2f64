//! CLI/ENV argument parsing and merge-into-[`GlobalConfig`] (SPEC_FULL.md
//! §6 "Configuration"): every field is `#[arg(long, env = "...")]`, which
//! gives CLI precedence over ENV for free, merged over the patch's own
//! built-in defaults.

use ccrelay_common::{AccountSelectionStrategy, GlobalConfig, GlobalConfigPatch};
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "ccrelay", version, about = "Anthropic-Messages-API-compatible proxy for a Cloud Code style upstream")]
pub struct CliArgs {
    /// Bind host.
    #[arg(long, env = "CCRELAY_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "CCRELAY_PORT")]
    pub port: Option<u16>,

    /// Path to the persisted account pool JSON document.
    #[arg(long, env = "CCRELAY_POOL_FILE")]
    pub pool_file: Option<PathBuf>,

    /// Optional outbound proxy for upstream requests.
    #[arg(long, env = "CCRELAY_PROXY")]
    pub proxy: Option<String>,

    /// Redact sensitive fields in logged request/response bodies.
    #[arg(long, env = "CCRELAY_EVENT_REDACT_SENSITIVE")]
    pub event_redact_sensitive: Option<bool>,

    #[arg(long, env = "CCRELAY_MAX_RETRIES")]
    pub max_retries: Option<u32>,

    #[arg(long, env = "CCRELAY_DEFAULT_COOLDOWN_MS")]
    pub default_cooldown_ms: Option<u64>,

    #[arg(long, env = "CCRELAY_MAX_WAIT_BEFORE_ERROR_MS")]
    pub max_wait_before_error_ms: Option<u64>,

    #[arg(long, env = "CCRELAY_MAX_ACCOUNTS")]
    pub max_accounts: Option<usize>,

    #[arg(long, env = "CCRELAY_RATE_LIMIT_DEDUP_WINDOW_MS")]
    pub rate_limit_dedup_window_ms: Option<u64>,

    #[arg(long, env = "CCRELAY_MAX_CONSECUTIVE_FAILURES")]
    pub max_consecutive_failures: Option<u32>,

    #[arg(long, env = "CCRELAY_EXTENDED_COOLDOWN_MS")]
    pub extended_cooldown_ms: Option<u64>,

    /// One of `sticky`, `round-robin`, `hybrid`.
    #[arg(long, env = "CCRELAY_ACCOUNT_SELECTION_STRATEGY")]
    pub account_selection_strategy: Option<String>,
}

impl CliArgs {
    /// Merges this invocation's CLI/ENV values over the patch's own
    /// defaults and finalises into a validated [`GlobalConfig`].
    pub fn into_config(self) -> anyhow::Result<GlobalConfig> {
        let account_selection_strategy = self
            .account_selection_strategy
            .as_deref()
            .map(parse_strategy)
            .transpose()?;

        let patch = GlobalConfigPatch {
            host: self.host,
            port: self.port,
            pool_file: self.pool_file,
            proxy: self.proxy,
            event_redact_sensitive: self.event_redact_sensitive,
            max_retries: self.max_retries,
            default_cooldown_ms: self.default_cooldown_ms,
            max_wait_before_error_ms: self.max_wait_before_error_ms,
            max_accounts: self.max_accounts,
            rate_limit_dedup_window_ms: self.rate_limit_dedup_window_ms,
            max_consecutive_failures: self.max_consecutive_failures,
            extended_cooldown_ms: self.extended_cooldown_ms,
            account_selection_strategy,
        };
        Ok(patch.into_config()?)
    }
}

fn parse_strategy(raw: &str) -> anyhow::Result<AccountSelectionStrategy> {
    match raw {
        "sticky" => Ok(AccountSelectionStrategy::Sticky),
        "round-robin" => Ok(AccountSelectionStrategy::RoundRobin),
        "hybrid" => Ok(AccountSelectionStrategy::Hybrid),
        other => Err(anyhow::anyhow!("invalid account selection strategy: {other} (expected sticky, round-robin, or hybrid)")),
    }
}
