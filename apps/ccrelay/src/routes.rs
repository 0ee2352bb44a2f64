//! Axum route table and handlers (SPEC_FULL.md §6 "HTTP surface"): a
//! `Clone`-able `State<AppState>` handle, a uniform extract → call engine →
//! render shape per handler, and hop-by-hop-free SSE responses. There is no
//! per-request provider dispatch and no downstream API-key gate — this
//! proxy front-ends exactly one fixed protocol family behind one account
//! pool, so neither auth middleware nor a body-capture telemetry layer has
//! any work to do here.

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ccrelay_core::{EngineError, ProxyEngine};
use ccrelay_pool::{Account, CredentialSource, OAuthStateStore};
use ccrelay_protocol::claude::{CreateMessageRequest, ErrorBody, ErrorEvent, Message, MessageContent, Role, StreamEvent};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::convert::Infallible;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

const DEFAULT_OAUTH_REDIRECT_URI: &str = "http://localhost:51121/oauth-callback";
const HYBRID_INITIAL_SCORE: i32 = 100;
const HYBRID_BUCKET_CAPACITY: f64 = 10.0;

/// The list of Anthropic-compatible model ids this proxy accepts, each
/// tagged with the upstream model family it is translated for.
const MAPPED_MODELS: &[(&str, &str)] = &[
    ("claude-opus-4-1-20250805", "claude"),
    ("claude-sonnet-4-5-20250929", "claude"),
    ("claude-3-7-sonnet-20250219", "claude"),
    ("gemini-2.5-pro", "gemini"),
    ("gemini-2.5-flash", "gemini"),
];

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ProxyEngine>,
    pub oauth: Arc<OAuthStateStore>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(create_message))
        .route("/v1/models", get(list_models))
        .route("/health", get(health))
        .route("/account-limits", get(account_limits))
        .route("/refresh-token", post(refresh_token))
        .route("/accounts/reload", post(reload_accounts))
        .route("/oauth/start", get(oauth_start))
        .route("/oauth/callback", get(oauth_callback))
        .route("/oauth/complete", post(oauth_complete))
        .with_state(state)
}

// --- POST /v1/messages ----------------------------------------------------

async fn create_message(State(state): State<AppState>, Json(request): Json<CreateMessageRequest>) -> Response {
    let fingerprint = session_fingerprint(&request);
    if request.stream == Some(true) {
        return stream_message(&state, &request, fingerprint.as_deref()).await;
    }

    match state.engine.generate(&request, fingerprint.as_deref()).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => engine_error_response(err),
    }
}

async fn stream_message(state: &AppState, request: &CreateMessageRequest, fingerprint: Option<&str>) -> Response {
    let rx = match state.engine.generate_stream(request, fingerprint).await {
        Ok(rx) => rx,
        Err(err) => return engine_error_response(err),
    };

    let events = ReceiverStream::new(rx).map(|event| Ok::<Event, Infallible>(to_sse_event(&event)));
    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}

fn to_sse_event(event: &StreamEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.event_name()).data(data)
}

/// SPEC_FULL.md's "session fingerprint": a stable hash of the conversation's
/// first user message, used for sticky account routing.
fn session_fingerprint(request: &CreateMessageRequest) -> Option<String> {
    let first_user_text = request.messages.iter().find(|m| m.role == Role::User).map(first_text_of)?;
    let mut hasher = Sha256::new();
    hasher.update(first_user_text.as_bytes());
    Some(format!("{:x}", hasher.finalize()))
}

fn first_text_of(message: &Message) -> String {
    match &message.content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .filter_map(|block| match block {
                ccrelay_protocol::claude::ContentBlock::Text { text } => Some(text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn engine_error_response(err: EngineError) -> Response {
    let mut message = err.message.clone();
    if let Some(reset_at) = err.reset_at {
        message = format!("{message} (resets at {reset_at})");
    }
    let status = axum::http::StatusCode::from_u16(err.kind.client_status()).unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    let body = ErrorEvent { error: ErrorBody { r#type: err.kind.client_error_type().to_string(), message } };
    (status, Json(body)).into_response()
}

// --- GET /v1/models --------------------------------------------------------

#[derive(Serialize)]
struct ModelEntry {
    id: String,
    family: String,
}

#[derive(Serialize)]
struct ModelsResponse {
    models: Vec<ModelEntry>,
}

async fn list_models() -> Json<ModelsResponse> {
    let models = MAPPED_MODELS.iter().map(|(id, family)| ModelEntry { id: id.to_string(), family: family.to_string() }).collect();
    Json(ModelsResponse { models })
}

// --- GET /health ------------------------------------------------------------

#[derive(Serialize)]
struct AccountHealth {
    email: String,
    enabled: bool,
    invalid_reason: Option<String>,
    health_score: i32,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    account_count: usize,
    accounts: Vec<AccountHealth>,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let snapshot = state.engine.pool().snapshot();
    let accounts = snapshot
        .accounts
        .iter()
        .map(|account| AccountHealth {
            email: account.email.clone(),
            enabled: account.enabled,
            invalid_reason: account.invalid_reason.clone(),
            health_score: account.health_score,
        })
        .collect();
    Json(HealthResponse { status: "ok", account_count: snapshot.accounts.len(), accounts })
}

// --- GET /account-limits ----------------------------------------------------

#[derive(Deserialize)]
struct AccountLimitsQuery {
    #[serde(default, rename = "includeHistory")]
    include_history: bool,
}

#[derive(Serialize)]
struct ModelLimitEntry {
    model: String,
    rate_limited: bool,
    #[serde(with = "time::serde::rfc3339")]
    reset_at: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none", with = "time::serde::rfc3339::option", default)]
    last_rate_limit_at: Option<OffsetDateTime>,
}

#[derive(Serialize)]
struct AccountLimits {
    email: String,
    enabled: bool,
    models: Vec<ModelLimitEntry>,
}

#[derive(Serialize)]
struct AccountLimitsResponse {
    accounts: Vec<AccountLimits>,
}

async fn account_limits(State(state): State<AppState>, Query(query): Query<AccountLimitsQuery>) -> Json<AccountLimitsResponse> {
    let snapshot = state.engine.pool().snapshot();
    let accounts = snapshot
        .accounts
        .iter()
        .map(|account| AccountLimits {
            email: account.email.clone(),
            enabled: account.enabled,
            models: account
                .rate_limits
                .iter()
                .map(|(model, limit)| ModelLimitEntry {
                    model: model.clone(),
                    rate_limited: limit.rate_limited,
                    reset_at: limit.reset_at,
                    last_rate_limit_at: query.include_history.then_some(limit.last_rate_limit_at),
                })
                .collect(),
        })
        .collect();
    Json(AccountLimitsResponse { accounts })
}

// --- POST /refresh-token ----------------------------------------------------

async fn refresh_token(State(state): State<AppState>) -> impl IntoResponse {
    state.engine.credentials().clear_all().await;
    axum::http::StatusCode::NO_CONTENT
}

// --- POST /accounts/reload ---------------------------------------------------

async fn reload_accounts(State(state): State<AppState>) -> Response {
    match state.engine.reload_accounts().await {
        Ok(()) => axum::http::StatusCode::NO_CONTENT.into_response(),
        Err(err) => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

// --- OAuth ------------------------------------------------------------------

#[derive(Deserialize)]
struct OAuthStartQuery {
    redirect_uri: Option<String>,
}

#[derive(Serialize)]
struct OAuthStartResponse {
    auth_url: String,
}

async fn oauth_start(State(state): State<AppState>, Query(query): Query<OAuthStartQuery>) -> Json<OAuthStartResponse> {
    let redirect_uri = query.redirect_uri.unwrap_or_else(|| DEFAULT_OAUTH_REDIRECT_URI.to_string());
    let auth_url = state.oauth.begin(redirect_uri, OffsetDateTime::now_utc()).await;
    Json(OAuthStartResponse { auth_url })
}

#[derive(Deserialize)]
struct OAuthCallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn oauth_callback(State(state): State<AppState>, Query(query): Query<OAuthCallbackQuery>) -> Response {
    if let Some(error) = query.error {
        return (axum::http::StatusCode::BAD_REQUEST, format!("oauth error: {error}")).into_response();
    }
    let Some(code) = query.code else {
        return (axum::http::StatusCode::BAD_REQUEST, "missing code").into_response();
    };
    let redirect_uri = match &query.state {
        Some(state_value) => state.oauth.take_redirect_uri(state_value).await.unwrap_or_else(|| DEFAULT_OAUTH_REDIRECT_URI.to_string()),
        None => DEFAULT_OAUTH_REDIRECT_URI.to_string(),
    };
    complete_onboarding(&state, &code, &redirect_uri).await
}

#[derive(Deserialize)]
struct OAuthCompleteRequest {
    /// Either the full redirect URL or a raw pasted authorization code
    /// (SPEC_FULL.md §6 "OAuth" manual completion mode).
    input: String,
    #[serde(default)]
    redirect_uri: Option<String>,
}

async fn oauth_complete(State(state): State<AppState>, Json(body): Json<OAuthCompleteRequest>) -> Response {
    let extracted = match ccrelay_pool::oauth::extract_code(&body.input) {
        Ok(extracted) => extracted,
        Err(err) => return (axum::http::StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };
    let redirect_uri = match extracted.state.as_deref() {
        Some(state_value) => state.oauth.take_redirect_uri(state_value).await,
        None => None,
    }
    .or(body.redirect_uri)
    .unwrap_or_else(|| DEFAULT_OAUTH_REDIRECT_URI.to_string());
    complete_onboarding(&state, &extracted.code, &redirect_uri).await
}

async fn complete_onboarding(state: &AppState, code: &str, redirect_uri: &str) -> Response {
    let tokens = match state.engine.credentials().exchange_authorization_code(code, redirect_uri).await {
        Ok(tokens) => tokens,
        Err(err) => return (axum::http::StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };

    let now = OffsetDateTime::now_utc();
    let email = tokens.email.unwrap_or_else(|| format!("unknown-{}", uuid::Uuid::new_v4()));
    let mut account = Account::new(email, CredentialSource::Oauth { refresh_token: tokens.refresh_token }, now, HYBRID_INITIAL_SCORE, HYBRID_BUCKET_CAPACITY);

    let primary_mirror = ccrelay_core::DEFAULT_MIRRORS[0];
    let project_id = state.engine.credentials().project_id(&account, &tokens.access_token, primary_mirror).await;
    account.project_id = Some(project_id);

    let email = account.email.clone();
    state.engine.add_account(account).await;
    Json(serde_json::json!({"email": email})).into_response()
}
