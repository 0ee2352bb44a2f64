//! The retry/failover attempt loop (SPEC_FULL.md §4.H) and the two public
//! entry points, unary and streaming, that drive it: pick credential → build
//! request → send → classify failure → retry-same / next-mirror /
//! next-account, narrowed to this proxy's single fixed upstream shape with
//! its own headers and base URL.

use crate::error::{classify_status, EngineError};
use crate::upstream_client::UpstreamClient;
use bytes::Bytes;
use ccrelay_common::ErrorKind;
use ccrelay_pool::{AccountPool, CredentialError, CredentialStore, PersistedPool, PoolError, PoolStore};
use ccrelay_protocol::claude::{CreateMessageRequest, CreateMessageResponse, StreamEvent, ThinkingMode};
use ccrelay_protocol::gemini::{Candidate, Content, ContentRole, GenerateContentRequestBody, GenerateContentResponse, UpstreamRequestEnvelope};
use ccrelay_protocol::sse::SseParser;
use ccrelay_transform::{model_family, ratelimit, request::translate_request, response::translate_response, stream::StreamTranslator, ModelFamily, SignatureCache};
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

pub const DEFAULT_MIRRORS: &[&str] = &["https://cloudcode-pa.googleapis.com", "https://daily-cloudcode-pa.sandbox.googleapis.com"];
const SERVICE_USER_AGENT: &str = "ccrelay/0.1 (compatible; cloud-code-proxy)";
const THINKING_BETA_HEADER: &str = "anthropic-beta";
const THINKING_BETA_VALUE: &str = "interleaved-thinking-2025-05-14";

pub struct ProxyEngine {
    pool: Arc<AccountPool>,
    pool_store: Arc<PoolStore>,
    credentials: Arc<CredentialStore>,
    client: Arc<UpstreamClient>,
    signatures: Arc<SignatureCache>,
    mirrors: Vec<String>,
    max_retries: u32,
    max_wait_before_error_ms: u64,
}

enum UpstreamOutcome {
    Unary(GenerateContentResponse),
    Stream(tokio::sync::mpsc::Receiver<Bytes>),
}

impl ProxyEngine {
    pub fn new(
        pool: Arc<AccountPool>,
        pool_store: Arc<PoolStore>,
        credentials: Arc<CredentialStore>,
        client: Arc<UpstreamClient>,
        signatures: Arc<SignatureCache>,
        max_retries: u32,
        max_wait_before_error_ms: u64,
    ) -> Self {
        Self {
            pool,
            pool_store,
            credentials,
            client,
            signatures,
            mirrors: DEFAULT_MIRRORS.iter().map(|s| s.to_string()).collect(),
            max_retries,
            max_wait_before_error_ms,
        }
    }

    pub fn with_mirrors(mut self, mirrors: Vec<String>) -> Self {
        self.mirrors = mirrors;
        self
    }

    /// Exposed for the HTTP layer's `GET /health` and `GET /account-limits`
    /// read endpoints, which report on pool state without driving a request.
    pub fn pool(&self) -> &Arc<AccountPool> {
        &self.pool
    }

    /// Exposed for `POST /refresh-token` (drops cached bearer tokens) and
    /// for onboarding a freshly authorized account during the OAuth callback.
    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// Exposed for `POST /accounts/reload`, which reloads the on-disk pool
    /// file into a running engine without restarting the process.
    pub async fn reload_accounts(&self) -> Result<(), ccrelay_pool::PersistenceError> {
        let persisted = self.pool_store.load_or_default()?;
        self.pool.reload(persisted.accounts, OffsetDateTime::now_utc());
        Ok(())
    }

    /// Adds a newly onboarded account to the running pool and persists it,
    /// as completed by the OAuth callback handler.
    pub async fn add_account(&self, account: ccrelay_pool::Account) {
        let mut accounts = self.pool.snapshot().accounts.clone();
        accounts.retain(|existing| existing.email != account.email);
        accounts.push(account);
        self.pool.reload(accounts, OffsetDateTime::now_utc());
        self.persist().await;
    }

    /// Persists the current pool state; exposed so the HTTP layer can force
    /// a write after an out-of-band mutation (e.g. disabling an account).
    pub async fn persist_pool(&self) {
        self.persist().await;
    }

    /// Unary request/response, as served by `POST /v1/messages` with
    /// `stream` absent or `false`. Thinking-enabled requests are always
    /// sent over the streaming transport upstream and accumulated here
    /// before returning (SPEC_FULL.md §4.H step 8).
    pub async fn generate(&self, request: &CreateMessageRequest, session_fingerprint: Option<&str>) -> Result<CreateMessageResponse, EngineError> {
        let thinking_enabled = is_thinking_enabled(request);
        let add_thinking_beta = thinking_enabled && model_family(&request.model) == ModelFamily::Claude;
        let gemini_body = translate_request(request, &self.signatures);
        let outcome = self.run_attempts(&request.model, session_fingerprint, &gemini_body, thinking_enabled, add_thinking_beta).await?;

        let response = match outcome {
            UpstreamOutcome::Unary(response) => response,
            UpstreamOutcome::Stream(mut chunks) => {
                let mut parser = SseParser::new();
                let mut collected = Vec::new();
                while let Some(chunk) = chunks.recv().await {
                    for event in parser.push_bytes(&chunk) {
                        if let Ok(parsed) = serde_json::from_str::<GenerateContentResponse>(&event.data) {
                            collected.push(parsed);
                        }
                    }
                }
                merge_gemini_chunks(collected)
            }
        };

        let id = format!("msg_{}", Uuid::new_v4().simple());
        Ok(translate_response(&response, id, request.model.clone(), &self.signatures))
    }

    /// Streaming request/response, as served by `POST /v1/messages` with
    /// `stream: true`. Returns a channel of already-translated Anthropic
    /// events; the HTTP layer is responsible for SSE-framing them.
    pub async fn generate_stream(&self, request: &CreateMessageRequest, session_fingerprint: Option<&str>) -> Result<tokio::sync::mpsc::Receiver<StreamEvent>, EngineError> {
        let add_thinking_beta = is_thinking_enabled(request) && model_family(&request.model) == ModelFamily::Claude;
        let gemini_body = translate_request(request, &self.signatures);
        let outcome = self.run_attempts(&request.model, session_fingerprint, &gemini_body, true, add_thinking_beta).await?;

        let mut raw_chunks = match outcome {
            UpstreamOutcome::Stream(chunks) => chunks,
            UpstreamOutcome::Unary(response) => {
                let (tx, rx) = tokio::sync::mpsc::channel(1);
                let _ = tx.send(Bytes::from(serde_json::to_vec(&response).unwrap_or_default())).await;
                rx
            }
        };

        let (tx, rx) = tokio::sync::mpsc::channel::<StreamEvent>(32);
        let id = format!("msg_{}", Uuid::new_v4().simple());
        let model = request.model.clone();
        let signatures = self.signatures.clone();
        tokio::spawn(async move {
            let mut parser = SseParser::new();
            let mut translator = StreamTranslator::new(id, model, &signatures);
            while let Some(chunk) = raw_chunks.recv().await {
                for event in parser.push_bytes(&chunk) {
                    if let Ok(parsed) = serde_json::from_str::<GenerateContentResponse>(&event.data) {
                        for out in translator.push(&parsed) {
                            if tx.send(out).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            for out in translator.finish() {
                if tx.send(out).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn run_attempts(
        &self,
        model: &str,
        session_fingerprint: Option<&str>,
        gemini_body: &GenerateContentRequestBody,
        use_stream_transport: bool,
        add_thinking_beta: bool,
    ) -> Result<UpstreamOutcome, EngineError> {
        let now = OffsetDateTime::now_utc();
        self.pool.reset_expired(now);

        let max_attempts = self.max_retries.max(self.pool.account_count() as u32 + 1).max(1);

        for _attempt in 0..max_attempts {
            let now = OffsetDateTime::now_utc();
            let email = match self.pool.select(model, session_fingerprint, now) {
                Ok(email) => email,
                Err(PoolError::Empty) => return Err(EngineError::new(ErrorKind::Capacity, "no accounts configured")),
                Err(PoolError::NoneAvailable { model }) => {
                    match self.pool.min_wait_for_model(&model, now) {
                        Some((reset_at, wait)) => {
                            self.wait_for_rate_limit_reset(&model, reset_at, wait.whole_milliseconds() as i64).await?;
                            continue;
                        }
                        None => return Err(EngineError::new(ErrorKind::Capacity, format!("no account available for model {model}"))),
                    }
                }
            };

            let account = self.pool.snapshot().accounts.iter().find(|a| a.email == email).cloned();
            let Some(account) = account else { continue };

            let access_token = match self.credentials.access_token(&account, now).await {
                Ok(token) => token,
                Err(CredentialError::InvalidGrant) => {
                    self.pool.mark_invalid(&email, "refresh token rejected (invalid_grant)");
                    self.persist().await;
                    continue;
                }
                Err(err) => {
                    self.pool.mark_other_failure(&email, now);
                    tracing::warn!(%email, error = %err, "credential acquisition failed");
                    continue;
                }
            };

            let mut min_reset_ms: Option<u64> = None;
            let mut all_mirrors_rate_limited = true;
            let mut saw_transient = false;

            for mirror in &self.mirrors {
                let project_id = self.credentials.project_id(&account, &access_token, mirror).await;
                let request_id = format!("agent-{}", Uuid::new_v4());
                let envelope = UpstreamRequestEnvelope {
                    project: project_id,
                    model: model.to_string(),
                    request: gemini_body.clone(),
                    user_agent: SERVICE_USER_AGENT.to_string(),
                    request_id,
                };
                let body = serde_json::to_value(&envelope).expect("envelope is always serialisable");

                let mut headers = vec![("Authorization".to_string(), format!("Bearer {access_token}")), ("Content-Type".to_string(), "application/json".to_string())];
                if add_thinking_beta {
                    headers.push((THINKING_BETA_HEADER.to_string(), THINKING_BETA_VALUE.to_string()));
                }
                let header_refs: Vec<(&str, String)> = headers.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();

                let (status, response_headers, error_body, result) = if use_stream_transport {
                    let url = format!("{mirror}/v1internal:streamGenerateContent?alt=sse");
                    match self.client.post_json_stream(&url, &header_refs, &body).await {
                        Ok(mut response) => {
                            if (200..300).contains(&response.status) {
                                (response.status, response.headers, None, Ok(UpstreamOutcome::Stream(response.chunks)))
                            } else {
                                let first_chunk = response.chunks.recv().await;
                                let error_body = first_chunk.and_then(|chunk| serde_json::from_slice::<serde_json::Value>(&chunk).ok());
                                (response.status, response.headers, error_body, Ok(UpstreamOutcome::Stream(response.chunks)))
                            }
                        }
                        Err(err) => {
                            tracing::warn!(%mirror, error = %err, "upstream transport failure");
                            saw_transient = true;
                            all_mirrors_rate_limited = false;
                            continue;
                        }
                    }
                } else {
                    let url = format!("{mirror}/v1internal:generateContent");
                    match self.client.post_json_unary(&url, &header_refs, &body).await {
                        Ok(response) => {
                            if (200..300).contains(&response.status) {
                                let parsed = serde_json::from_slice::<GenerateContentResponse>(&response.body).unwrap_or_default();
                                (response.status, response.headers, None, Ok(UpstreamOutcome::Unary(parsed)))
                            } else {
                                let error_body = serde_json::from_slice::<serde_json::Value>(&response.body).ok();
                                (response.status, response.headers, error_body, Ok(UpstreamOutcome::Unary(GenerateContentResponse::default())))
                            }
                        }
                        Err(err) => {
                            tracing::warn!(%mirror, error = %err, "upstream transport failure");
                            saw_transient = true;
                            all_mirrors_rate_limited = false;
                            continue;
                        }
                    }
                };

                if (200..300).contains(&status) {
                    self.pool.mark_success(&email, now);
                    self.persist().await;
                    return result;
                }

                if status == 401 {
                    self.credentials.invalidate_token(&email).await;
                    self.credentials.invalidate_project_id(&email).await;
                    all_mirrors_rate_limited = false;
                    continue;
                }

                if status == 429 {
                    let reset_ms = ratelimit::parse_reset_ms(&response_headers, error_body.as_ref());
                    min_reset_ms = Some(min_reset_ms.map_or(reset_ms.unwrap_or(0), |current| current.min(reset_ms.unwrap_or(current))));
                    continue;
                }

                all_mirrors_rate_limited = false;
                let kind = classify_status(status);
                if matches!(kind, ErrorKind::BadRequest | ErrorKind::Permission) {
                    return Err(EngineError::new(kind, format!("upstream returned {status}")));
                }
                saw_transient = true;
            }

            if all_mirrors_rate_limited && min_reset_ms.is_some() {
                self.pool.mark_rate_limited(&email, model, min_reset_ms, now);
                self.persist().await;
                continue;
            }
            if saw_transient {
                self.pool.mark_other_failure(&email, now);
                self.persist().await;
            }
        }

        Err(EngineError::new(ErrorKind::Transient, "all mirrors and accounts failed"))
    }

    /// With more than one account, or a wait too long to hold the client
    /// connection open for, fail fast with the reset time attached. With a
    /// single enabled account and a short-enough wait, sleep until reset so
    /// the caller in `run_attempts` can loop back and retry that same
    /// now-unblocked account (SPEC_FULL.md §4.G "single account, sleepable
    /// cooldown → succeeds after wait").
    async fn wait_for_rate_limit_reset(&self, model: &str, reset_at: OffsetDateTime, reset_in_ms: i64) -> Result<(), EngineError> {
        if reset_in_ms as u64 > self.max_wait_before_error_ms {
            return Err(EngineError::with_reset(ErrorKind::Capacity, format!("every account is rate-limited for model {model}"), reset_at));
        }
        if self.pool.account_count() > 1 {
            return Err(EngineError::with_reset(ErrorKind::Capacity, format!("every account is rate-limited for model {model}"), reset_at));
        }
        tokio::time::sleep(std::time::Duration::from_millis(reset_in_ms.max(0) as u64)).await;
        Ok(())
    }

    async fn persist(&self) {
        let snapshot = self.pool.snapshot();
        let persisted = PersistedPool { accounts: snapshot.accounts.clone(), cursor: snapshot.cursor };
        if let Err(err) = self.pool_store.save(&persisted) {
            tracing::error!(error = %err, "failed to persist account pool");
        }
    }
}

fn is_thinking_enabled(request: &CreateMessageRequest) -> bool {
    matches!(request.thinking.as_ref().map(|t| t.r#type), Some(ThinkingMode::Enabled))
}

fn merge_gemini_chunks(chunks: Vec<GenerateContentResponse>) -> GenerateContentResponse {
    let mut parts = Vec::new();
    let mut finish_reason = None;
    let mut usage = None;
    let mut model_version = None;

    for chunk in chunks {
        if let Some(candidate) = chunk.candidates.into_iter().next() {
            parts.extend(candidate.content.parts);
            if candidate.finish_reason.is_some() {
                finish_reason = candidate.finish_reason;
            }
        }
        if chunk.usage_metadata.is_some() {
            usage = chunk.usage_metadata;
        }
        if chunk.model_version.is_some() {
            model_version = chunk.model_version;
        }
    }

    GenerateContentResponse {
        candidates: vec![Candidate { content: Content { parts, role: Some(ContentRole::Model) }, finish_reason, index: Some(0) }],
        usage_metadata: usage,
        model_version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccrelay_protocol::gemini::{FinishReason, Part, UsageMetadata};

    #[test]
    fn merges_streamed_parts_into_one_candidate_keeping_last_usage() {
        let chunk_a = GenerateContentResponse {
            candidates: vec![Candidate { content: Content { parts: vec![Part::text("hel")], role: Some(ContentRole::Model) }, finish_reason: None, index: Some(0) }],
            usage_metadata: Some(UsageMetadata { candidates_token_count: Some(1), ..Default::default() }),
            model_version: None,
        };
        let chunk_b = GenerateContentResponse {
            candidates: vec![Candidate { content: Content { parts: vec![Part::text("lo")], role: Some(ContentRole::Model) }, finish_reason: Some(FinishReason::Stop), index: Some(0) }],
            usage_metadata: Some(UsageMetadata { candidates_token_count: Some(2), ..Default::default() }),
            model_version: None,
        };
        let merged = merge_gemini_chunks(vec![chunk_a, chunk_b]);
        assert_eq!(merged.candidates.len(), 1);
        assert_eq!(merged.candidates[0].content.parts.len(), 2);
        assert_eq!(merged.candidates[0].finish_reason, Some(FinishReason::Stop));
        assert_eq!(merged.usage_metadata.unwrap().candidates_token_count, Some(2));
    }
}
