//! The `Account` and `ModelRateLimitState` entities (SPEC_FULL.md §3): a
//! concrete id/enabled/health-score/token-bucket/per-model-rate-limit-map
//! entity rather than a generic credential wrapper.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialSource {
    Oauth { refresh_token: String },
    Manual { api_key: String },
    DatabaseScraped { database_path: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelRateLimitState {
    pub rate_limited: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub reset_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_rate_limit_at: OffsetDateTime,
}

impl ModelRateLimitState {
    /// A past `reset_at` deterministically means the pair is available again.
    pub fn is_active(&self, now: OffsetDateTime) -> bool {
        self.rate_limited && self.reset_at > now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBucket {
    pub tokens: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_refill: OffsetDateTime,
}

impl TokenBucket {
    pub fn new(tokens: f64, now: OffsetDateTime) -> Self {
        Self { tokens, last_refill: now }
    }

    /// Refills at `tokens_per_minute`, clamped to `max_tokens`, then returns
    /// the post-refill level without consuming anything.
    pub fn refill(&mut self, tokens_per_minute: f64, max_tokens: f64, now: OffsetDateTime) {
        let elapsed_minutes = (now - self.last_refill).as_seconds_f64() / 60.0;
        if elapsed_minutes <= 0.0 {
            return;
        }
        self.tokens = (self.tokens + elapsed_minutes * tokens_per_minute).min(max_tokens);
        self.last_refill = now;
    }

    pub fn try_take_one(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub email: String,
    pub credential: CredentialSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub added_at: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none", with = "time::serde::rfc3339::option", default)]
    pub last_used_at: Option<OffsetDateTime>,
    pub rate_limits: HashMap<String, ModelRateLimitState>,
    pub health_score: i32,
    pub bucket: TokenBucket,
    pub consecutive_failures: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub last_health_update: OffsetDateTime,
}

impl Account {
    pub fn new(email: impl Into<String>, credential: CredentialSource, now: OffsetDateTime, initial_score: i32, bucket_capacity: f64) -> Self {
        Self {
            email: email.into(),
            credential,
            project_id: None,
            enabled: true,
            invalid_reason: None,
            added_at: now,
            last_used_at: None,
            rate_limits: HashMap::new(),
            health_score: initial_score,
            bucket: TokenBucket::new(bucket_capacity, now),
            consecutive_failures: 0,
            last_health_update: now,
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid_reason.is_some()
    }

    /// +1 on success, -10 on rate-limit, -20 on other failure, passive
    /// recovery of `per_hour` applied for elapsed time, clamped to
    /// `[0, max_score]` (SPEC_FULL.md §4.G hybrid scoring).
    pub fn apply_passive_recovery(&mut self, per_hour: i32, max_score: i32, now: OffsetDateTime) {
        let elapsed_hours = (now - self.last_health_update).as_seconds_f64() / 3600.0;
        if elapsed_hours <= 0.0 {
            return;
        }
        let recovered = (elapsed_hours * per_hour as f64).floor() as i32;
        self.health_score = (self.health_score + recovered).clamp(0, max_score);
        self.last_health_update = now;
    }

    pub fn adjust_health(&mut self, delta: i32, max_score: i32) {
        self.health_score = (self.health_score + delta).clamp(0, max_score);
    }

    /// Available for model `M` iff enabled, not invalid, and `(email, M)`'s
    /// rate-limit state is absent or expired (SPEC_FULL.md §4.G).
    pub fn is_available_for_model(&self, model: &str, now: OffsetDateTime) -> bool {
        if !self.enabled || self.is_invalid() {
            return false;
        }
        match self.rate_limits.get(model) {
            None => true,
            Some(state) => !state.is_active(now),
        }
    }

    /// Clears any rate-limit entries whose `reset_at` has already passed.
    pub fn clear_expired_rate_limits(&mut self, now: OffsetDateTime) {
        self.rate_limits.retain(|_, state| state.is_active(now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    #[test]
    fn account_unavailable_for_model_while_rate_limited() {
        let mut account = Account::new("a@example.com", CredentialSource::Manual { api_key: "k".into() }, now(), 100, 10.0);
        account.rate_limits.insert(
            "gemini-2".to_string(),
            ModelRateLimitState { rate_limited: true, reset_at: now() + time::Duration::seconds(60), last_rate_limit_at: now() },
        );
        assert!(!account.is_available_for_model("gemini-2", now()));
        assert!(account.is_available_for_model("other-model", now()));
    }

    #[test]
    fn past_reset_at_makes_pair_available_on_next_read() {
        let mut account = Account::new("a@example.com", CredentialSource::Manual { api_key: "k".into() }, now(), 100, 10.0);
        account.rate_limits.insert(
            "gemini-2".to_string(),
            ModelRateLimitState { rate_limited: true, reset_at: now() - time::Duration::seconds(1), last_rate_limit_at: now() - time::Duration::seconds(120) },
        );
        assert!(account.is_available_for_model("gemini-2", now()));
    }

    #[test]
    fn token_bucket_refills_and_clamps() {
        let mut bucket = TokenBucket::new(0.0, now());
        bucket.refill(60.0, 10.0, now() + time::Duration::minutes(1));
        assert_eq!(bucket.tokens, 10.0);
    }
}
