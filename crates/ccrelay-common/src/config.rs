use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config field: {0}")]
    MissingField(&'static str),
    #[error("config field {field} out of range: {value} (expected {expected})")]
    OutOfRange {
        field: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Account selection strategy, per SPEC_FULL.md §4.G.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccountSelectionStrategy {
    Sticky,
    RoundRobin,
    Hybrid,
}

impl Default for AccountSelectionStrategy {
    fn default() -> Self {
        AccountSelectionStrategy::Hybrid
    }
}

/// Hybrid-strategy scoring parameters (SPEC_FULL.md §4.G / §6).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HybridScoringConfig {
    pub initial_score: i32,
    pub reward_on_success: i32,
    pub penalty_rate_limit: i32,
    pub penalty_other_failure: i32,
    pub passive_recovery_per_hour: i32,
    pub min_usable: i32,
    pub max_score: i32,
    pub tokens_per_minute: f64,
    pub max_tokens: f64,
    /// Weight applied to bucket tokens when computing `healthScore + bucketTokens * w`.
    pub token_weight: f64,
    /// How close (in score) the sticky account must be to the top scorer to still be preferred.
    pub sticky_margin: f64,
}

impl Default for HybridScoringConfig {
    fn default() -> Self {
        Self {
            initial_score: 100,
            reward_on_success: 1,
            penalty_rate_limit: -10,
            penalty_other_failure: -20,
            passive_recovery_per_hour: 2,
            min_usable: 10,
            max_score: 100,
            tokens_per_minute: 1.0,
            max_tokens: 10.0,
            token_weight: 1.0,
            sticky_margin: 5.0,
        }
    }
}

/// Final, merged configuration used by the running process.
///
/// Merge order: CLI > ENV > persisted pool file, then held behind an
/// `ArcSwap` so `POST /accounts/reload` can hot-swap it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Path to the single persisted pool JSON document (SPEC_FULL.md §6).
    pub pool_file: PathBuf,
    pub proxy: Option<String>,
    pub event_redact_sensitive: bool,

    pub max_retries: u32,
    pub default_cooldown_ms: u64,
    pub max_wait_before_error_ms: u64,
    pub max_accounts: usize,
    pub rate_limit_dedup_window_ms: u64,
    pub max_consecutive_failures: u32,
    pub extended_cooldown_ms: u64,
    pub account_selection_strategy: AccountSelectionStrategy,
    pub hybrid: HybridScoringConfig,
}

impl GlobalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("max_retries", self.max_retries as u64, 0, 20)?;
        check_range(
            "default_cooldown_ms",
            self.default_cooldown_ms,
            0,
            10 * 60_000,
        )?;
        check_range(
            "max_wait_before_error_ms",
            self.max_wait_before_error_ms,
            1,
            30 * 60_000,
        )?;
        check_range("max_accounts", self.max_accounts as u64, 1, 100)?;
        check_range(
            "rate_limit_dedup_window_ms",
            self.rate_limit_dedup_window_ms,
            1,
            30_000,
        )?;
        check_range(
            "max_consecutive_failures",
            self.max_consecutive_failures as u64,
            1,
            10,
        )?;
        check_range(
            "extended_cooldown_ms",
            self.extended_cooldown_ms,
            10_000,
            5 * 60_000,
        )?;
        Ok(())
    }
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            value: value.to_string(),
            expected: "within the documented range",
        });
    }
    Ok(())
}

/// Partial configuration used while merging CLI/ENV/persisted layers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub pool_file: Option<PathBuf>,
    pub proxy: Option<String>,
    pub event_redact_sensitive: Option<bool>,
    pub max_retries: Option<u32>,
    pub default_cooldown_ms: Option<u64>,
    pub max_wait_before_error_ms: Option<u64>,
    pub max_accounts: Option<usize>,
    pub rate_limit_dedup_window_ms: Option<u64>,
    pub max_consecutive_failures: Option<u32>,
    pub extended_cooldown_ms: Option<u64>,
    pub account_selection_strategy: Option<AccountSelectionStrategy>,
}

impl GlobalConfigPatch {
    /// Overlay `other` on top of `self`: any field `other` sets wins.
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field;
                }
            };
        }
        take!(host);
        take!(port);
        take!(pool_file);
        take!(proxy);
        take!(event_redact_sensitive);
        take!(max_retries);
        take!(default_cooldown_ms);
        take!(max_wait_before_error_ms);
        take!(max_accounts);
        take!(rate_limit_dedup_window_ms);
        take!(max_consecutive_failures);
        take!(extended_cooldown_ms);
        take!(account_selection_strategy);
    }

    pub fn into_config(self) -> Result<GlobalConfig, ConfigError> {
        let config = GlobalConfig {
            host: self.host.unwrap_or_else(|| "127.0.0.1".to_string()),
            port: self.port.unwrap_or(8731),
            pool_file: self
                .pool_file
                .ok_or(ConfigError::MissingField("pool_file"))?,
            proxy: self.proxy,
            event_redact_sensitive: self.event_redact_sensitive.unwrap_or(true),
            max_retries: self.max_retries.unwrap_or(3),
            default_cooldown_ms: self.default_cooldown_ms.unwrap_or(60_000),
            max_wait_before_error_ms: self.max_wait_before_error_ms.unwrap_or(120_000),
            max_accounts: self.max_accounts.unwrap_or(25),
            rate_limit_dedup_window_ms: self.rate_limit_dedup_window_ms.unwrap_or(5_000),
            max_consecutive_failures: self.max_consecutive_failures.unwrap_or(3),
            extended_cooldown_ms: self.extended_cooldown_ms.unwrap_or(5 * 60_000),
            account_selection_strategy: self.account_selection_strategy.unwrap_or_default(),
            hybrid: HybridScoringConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            pool_file: Some(value.pool_file),
            proxy: value.proxy,
            event_redact_sensitive: Some(value.event_redact_sensitive),
            max_retries: Some(value.max_retries),
            default_cooldown_ms: Some(value.default_cooldown_ms),
            max_wait_before_error_ms: Some(value.max_wait_before_error_ms),
            max_accounts: Some(value.max_accounts),
            rate_limit_dedup_window_ms: Some(value.rate_limit_dedup_window_ms),
            max_consecutive_failures: Some(value.max_consecutive_failures),
            extended_cooldown_ms: Some(value.extended_cooldown_ms),
            account_selection_strategy: Some(value.account_selection_strategy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_overlay_prefers_later_values() {
        let mut base = GlobalConfigPatch {
            host: Some("0.0.0.0".into()),
            port: Some(1),
            ..Default::default()
        };
        let overlay = GlobalConfigPatch {
            port: Some(2),
            ..Default::default()
        };
        base.overlay(overlay);
        assert_eq!(base.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(base.port, Some(2));
    }

    #[test]
    fn into_config_requires_pool_file() {
        let patch = GlobalConfigPatch::default();
        assert!(matches!(
            patch.into_config(),
            Err(ConfigError::MissingField("pool_file"))
        ));
    }

    #[test]
    fn validate_rejects_out_of_range_max_retries() {
        let mut config = GlobalConfigPatch {
            pool_file: Some("/tmp/pool.json".into()),
            ..Default::default()
        }
        .into_config()
        .unwrap();
        config.max_retries = 21;
        assert!(config.validate().is_err());
    }
}
