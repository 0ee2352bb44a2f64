//! Account pool: selection strategies, rate-limit marking, health scoring,
//! and the dedup/extended-cooldown policy (SPEC_FULL.md §4.G). Uses a
//! copy-on-write `ArcSwap<PoolState>` mutated via `rcu` so reads never block
//! on a writer, with sticky / round-robin / hybrid selection strategies over
//! per-model rate-limit state.

use arc_swap::ArcSwap;
use ccrelay_common::{AccountSelectionStrategy, HybridScoringConfig};
use std::collections::HashMap;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

use crate::account::{Account, ModelRateLimitState};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no accounts configured")]
    Empty,
    #[error("no account available for model {model}")]
    NoneAvailable { model: String },
}

#[derive(Debug, Clone)]
pub struct PoolState {
    pub accounts: Vec<Account>,
    pub cursor: usize,
    /// Session fingerprint → account email.
    pub sticky: HashMap<String, String>,
    /// (email, model) → last time a rate-limit mark was applied, for the dedup window.
    dedup: HashMap<(String, String), OffsetDateTime>,
}

impl PoolState {
    pub fn new(accounts: Vec<Account>) -> Self {
        let cursor = if accounts.is_empty() { 0 } else { 0 };
        Self { accounts, cursor, sticky: HashMap::new(), dedup: HashMap::new() }
    }

    /// Clamps the cursor into `[0, N)` and drops expired rate-limit entries,
    /// as required on load (SPEC_FULL.md §4.G persistence).
    fn normalize(&mut self, now: OffsetDateTime) {
        if self.accounts.is_empty() {
            self.cursor = 0;
        } else {
            self.cursor %= self.accounts.len();
        }
        for account in &mut self.accounts {
            account.clear_expired_rate_limits(now);
        }
    }
}

pub struct AccountPool {
    state: ArcSwap<PoolState>,
    strategy: AccountSelectionStrategy,
    hybrid: HybridScoringConfig,
    dedup_window: Duration,
    max_consecutive_failures: u32,
    extended_cooldown: Duration,
    default_cooldown: Duration,
}

impl AccountPool {
    pub fn new(
        accounts: Vec<Account>,
        strategy: AccountSelectionStrategy,
        hybrid: HybridScoringConfig,
        dedup_window_ms: u64,
        max_consecutive_failures: u32,
        extended_cooldown_ms: u64,
        default_cooldown_ms: u64,
        now: OffsetDateTime,
    ) -> Self {
        let mut state = PoolState::new(accounts);
        state.normalize(now);
        Self {
            state: ArcSwap::new(Arc::new(state)),
            strategy,
            hybrid,
            dedup_window: Duration::milliseconds(dedup_window_ms as i64),
            max_consecutive_failures,
            extended_cooldown: Duration::milliseconds(extended_cooldown_ms as i64),
            default_cooldown: Duration::milliseconds(default_cooldown_ms as i64),
        }
    }

    pub fn snapshot(&self) -> Arc<PoolState> {
        self.state.load_full()
    }

    /// Replaces the whole account list, e.g. on `POST /accounts/reload`
    /// (SPEC_FULL.md §4.G). Resets sticky routing: a fingerprint mapping
    /// that pointed at a removed or disabled account is simply dropped
    /// rather than migrated.
    pub fn reload(&self, accounts: Vec<Account>, now: OffsetDateTime) {
        let mut state = PoolState::new(accounts);
        state.normalize(now);
        self.state.store(Arc::new(state));
    }

    /// Drops rate-limit entries whose `reset_at` has passed (SPEC_FULL.md
    /// §4.H step 1, run once per inbound client request).
    pub fn reset_expired(&self, now: OffsetDateTime) {
        self.state.rcu(|current| {
            let mut next = (**current).clone();
            for account in &mut next.accounts {
                account.clear_expired_rate_limits(now);
            }
            Arc::new(next)
        });
    }

    pub fn account_count(&self) -> usize {
        self.state.load().accounts.len()
    }

    /// Selects an account for `model`, honoring the configured strategy.
    pub fn select(&self, model: &str, session_fingerprint: Option<&str>, now: OffsetDateTime) -> Result<String, PoolError> {
        let snapshot = self.state.load();
        if snapshot.accounts.is_empty() {
            return Err(PoolError::Empty);
        }

        let chosen = match self.strategy {
            AccountSelectionStrategy::Sticky => self.select_sticky(&snapshot, model, session_fingerprint, now),
            AccountSelectionStrategy::RoundRobin => self.select_round_robin(&snapshot, model, now),
            AccountSelectionStrategy::Hybrid => self.select_hybrid(&snapshot, model, session_fingerprint, now),
        };

        let Some(email) = chosen else {
            return Err(PoolError::NoneAvailable { model: model.to_string() });
        };

        self.state.rcu(|current| {
            let mut next = (**current).clone();
            if let Some(account) = next.accounts.iter_mut().find(|a| a.email == email) {
                account.last_used_at = Some(now);
            }
            if let Some(fingerprint) = session_fingerprint {
                next.sticky.insert(fingerprint.to_string(), email.clone());
            }
            Arc::new(next)
        });

        Ok(email)
    }

    fn select_sticky(&self, snapshot: &PoolState, model: &str, fingerprint: Option<&str>, now: OffsetDateTime) -> Option<String> {
        if let Some(fingerprint) = fingerprint
            && let Some(email) = snapshot.sticky.get(fingerprint)
            && let Some(account) = snapshot.accounts.iter().find(|a| &a.email == email)
            && account.is_available_for_model(model, now)
        {
            return Some(account.email.clone());
        }
        snapshot.accounts.iter().find(|a| a.is_available_for_model(model, now)).map(|a| a.email.clone())
    }

    fn select_round_robin(&self, snapshot: &PoolState, model: &str, now: OffsetDateTime) -> Option<String> {
        let n = snapshot.accounts.len();
        for offset in 0..n {
            let index = (snapshot.cursor + offset) % n;
            if snapshot.accounts[index].is_available_for_model(model, now) {
                let email = snapshot.accounts[index].email.clone();
                let next_cursor = (index + 1) % n;
                self.state.rcu(|current| {
                    let mut next = (**current).clone();
                    next.cursor = next_cursor;
                    Arc::new(next)
                });
                return Some(email);
            }
        }
        None
    }

    fn select_hybrid(&self, snapshot: &PoolState, model: &str, fingerprint: Option<&str>, now: OffsetDateTime) -> Option<String> {
        let mut scored: Vec<(&Account, f64)> = snapshot
            .accounts
            .iter()
            .filter(|a| a.is_available_for_model(model, now))
            .map(|a| (a, self.score(a)))
            .collect();

        if scored.is_empty() {
            return None;
        }

        // Below-min_usable accounts are skipped unless *all* available ones are below it.
        let any_usable = scored.iter().any(|(_, score)| *score >= self.hybrid.min_usable as f64);
        if any_usable {
            scored.retain(|(_, score)| *score >= self.hybrid.min_usable as f64);
        }

        let top = scored.iter().cloned().max_by(|a, b| a.1.total_cmp(&b.1))?;

        let sticky_email = fingerprint.and_then(|f| snapshot.sticky.get(f));
        let chosen_email = if let Some(sticky_email) = sticky_email
            && let Some((sticky_account, sticky_score)) = scored.iter().find(|(a, _)| &a.email == sticky_email)
            && top.1 - sticky_score <= self.hybrid.sticky_margin
        {
            sticky_account.email.clone()
        } else {
            top.0.email.clone()
        };

        self.state.rcu(|current| {
            let mut next = (**current).clone();
            if let Some(account) = next.accounts.iter_mut().find(|a| a.email == chosen_email) {
                account.bucket.refill(self.hybrid.tokens_per_minute, self.hybrid.max_tokens, now);
                account.bucket.try_take_one();
            }
            Arc::new(next)
        });

        Some(chosen_email)
    }

    fn score(&self, account: &Account) -> f64 {
        account.health_score as f64 + account.bucket.tokens * self.hybrid.token_weight
    }

    /// `markRateLimited`: applies the dedup window, then either the parsed
    /// reset or the default cooldown, escalating to the extended cooldown
    /// after `maxConsecutiveFailures` within the window (SPEC_FULL.md §4.G).
    pub fn mark_rate_limited(&self, email: &str, model: &str, reset_ms: Option<u64>, now: OffsetDateTime) {
        self.state.rcu(|current| {
            let mut next = (**current).clone();
            let key = (email.to_string(), model.to_string());

            if let Some(last_mark) = next.dedup.get(&key)
                && now - *last_mark < self.dedup_window
            {
                return Arc::new(next);
            }

            let Some(account) = next.accounts.iter_mut().find(|a| a.email == email) else {
                return Arc::new(next);
            };

            account.consecutive_failures += 1;
            let cooldown = if account.consecutive_failures >= self.max_consecutive_failures {
                self.extended_cooldown
            } else {
                reset_ms.map(|ms| Duration::milliseconds(ms as i64)).unwrap_or(self.default_cooldown)
            };

            account.rate_limits.insert(
                model.to_string(),
                ModelRateLimitState { rate_limited: true, reset_at: now + cooldown, last_rate_limit_at: now },
            );
            account.adjust_health(self.hybrid.penalty_rate_limit, self.hybrid.max_score);
            next.dedup.insert(key, now);
            Arc::new(next)
        });
    }

    pub fn mark_success(&self, email: &str, now: OffsetDateTime) {
        self.state.rcu(|current| {
            let mut next = (**current).clone();
            if let Some(account) = next.accounts.iter_mut().find(|a| a.email == email) {
                account.consecutive_failures = 0;
                account.adjust_health(self.hybrid.reward_on_success, self.hybrid.max_score);
                account.apply_passive_recovery(self.hybrid.passive_recovery_per_hour, self.hybrid.max_score, now);
            }
            Arc::new(next)
        });
    }

    pub fn mark_other_failure(&self, email: &str, now: OffsetDateTime) {
        self.state.rcu(|current| {
            let mut next = (**current).clone();
            if let Some(account) = next.accounts.iter_mut().find(|a| a.email == email) {
                account.adjust_health(self.hybrid.penalty_other_failure, self.hybrid.max_score);
            }
            Arc::new(next)
        });
    }

    pub fn mark_invalid(&self, email: &str, reason: impl Into<String>) {
        let reason = reason.into();
        self.state.rcu(|current| {
            let mut next = (**current).clone();
            if let Some(account) = next.accounts.iter_mut().find(|a| a.email == email) {
                account.invalid_reason = Some(reason.clone());
            }
            Arc::new(next)
        });
    }

    /// Applies passive per-hour health recovery to every account. Intended
    /// to be called from a periodic background tick.
    pub fn tick_passive_recovery(&self, now: OffsetDateTime) {
        self.state.rcu(|current| {
            let mut next = (**current).clone();
            for account in &mut next.accounts {
                account.apply_passive_recovery(self.hybrid.passive_recovery_per_hour, self.hybrid.max_score, now);
            }
            Arc::new(next)
        });
    }

    /// The all-rate-limited policy: smallest positive `reset_at - now`
    /// across all enabled, non-invalid accounts' `(account, model)` state.
    /// `None` means at least one account is actually available.
    pub fn min_wait_for_model(&self, model: &str, now: OffsetDateTime) -> Option<(OffsetDateTime, Duration)> {
        let snapshot = self.state.load();
        snapshot
            .accounts
            .iter()
            .filter(|a| a.enabled && !a.is_invalid())
            .filter_map(|a| a.rate_limits.get(model))
            .filter(|state| state.reset_at > now)
            .map(|state| (state.reset_at, state.reset_at - now))
            .min_by_key(|(_, wait)| *wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::CredentialSource;

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    fn account(email: &str) -> Account {
        Account::new(email, CredentialSource::Manual { api_key: "k".into() }, now(), 100, 10.0)
    }

    fn pool(strategy: AccountSelectionStrategy, accounts: Vec<Account>) -> AccountPool {
        AccountPool::new(accounts, strategy, HybridScoringConfig::default(), 5_000, 3, 300_000, 60_000, now())
    }

    #[test]
    fn round_robin_advances_past_unavailable_accounts() {
        let p = pool(AccountSelectionStrategy::RoundRobin, vec![account("a"), account("b"), account("c")]);
        p.mark_rate_limited("a", "gemini-2", Some(60_000), now());
        let first = p.select("gemini-2", None, now()).unwrap();
        assert_eq!(first, "b");
        let second = p.select("gemini-2", None, now()).unwrap();
        assert_eq!(second, "c");
    }

    #[test]
    fn sticky_prefers_last_account_for_fingerprint() {
        let p = pool(AccountSelectionStrategy::Sticky, vec![account("a"), account("b")]);
        let first = p.select("gemini-2", Some("fp1"), now()).unwrap();
        assert_eq!(first, "a");
        let second = p.select("gemini-2", Some("fp1"), now()).unwrap();
        assert_eq!(second, "a");
    }

    #[test]
    fn dedup_window_suppresses_repeated_marks() {
        let p = pool(AccountSelectionStrategy::RoundRobin, vec![account("a")]);
        p.mark_rate_limited("a", "gemini-2", Some(10_000), now());
        p.mark_rate_limited("a", "gemini-2", Some(999_000), now() + Duration::seconds(1));
        let snapshot = p.snapshot();
        let state = snapshot.accounts[0].rate_limits.get("gemini-2").unwrap();
        assert_eq!(state.reset_at, now() + Duration::milliseconds(10_000));
    }

    #[test]
    fn extended_cooldown_after_max_consecutive_failures() {
        let p = pool(AccountSelectionStrategy::RoundRobin, vec![account("a")]);
        let base = now();
        for i in 0..3 {
            p.mark_rate_limited("a", "gemini-2", Some(1_000), base + Duration::seconds(10 * i));
        }
        let snapshot = p.snapshot();
        let state = snapshot.accounts[0].rate_limits.get("gemini-2").unwrap();
        let applied_at = base + Duration::seconds(20);
        assert_eq!(state.reset_at, applied_at + Duration::milliseconds(300_000));
    }

    #[test]
    fn min_wait_for_model_finds_smallest_positive_reset() {
        let p = pool(AccountSelectionStrategy::RoundRobin, vec![account("a"), account("b")]);
        p.mark_rate_limited("a", "gemini-2", Some(120_000), now());
        p.mark_rate_limited("b", "gemini-2", Some(30_000), now() + Duration::seconds(20));
        let (_, wait) = p.min_wait_for_model("gemini-2", now() + Duration::seconds(21)).unwrap();
        assert_eq!(wait, Duration::milliseconds(29_000));
    }

    #[test]
    fn no_accounts_available_returns_error() {
        let p = pool(AccountSelectionStrategy::RoundRobin, vec![account("a")]);
        p.mark_rate_limited("a", "gemini-2", Some(60_000), now());
        assert!(matches!(p.select("gemini-2", None, now()), Err(PoolError::NoneAvailable { .. })));
    }
}
