//! A thin `wreq`-based HTTP client for the two upstream shapes this proxy
//! ever sends: a unary JSON POST and a streaming SSE POST (SPEC_FULL.md
//! §4.H). `resp.bytes_stream()` is forwarded into a bounded channel with an
//! idle timeout; this talks to exactly one upstream shape rather than a
//! generic provider-pluggable transport.

use bytes::Bytes;
use futures_util::StreamExt;
use http::HeaderMap;
use std::time::Duration;
use wreq::{Client, Proxy};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("upstream request failed: {0}")]
    Failed(String),
}

pub struct UnaryResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub struct StreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub chunks: tokio::sync::mpsc::Receiver<Bytes>,
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(86400),
            stream_idle_timeout: Duration::from_secs(30),
        }
    }
}

pub struct UpstreamClient {
    http: Client,
    stream_idle_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, wreq::Error> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .read_timeout(config.stream_idle_timeout);
        if let Some(proxy) = config.proxy.as_deref().filter(|p| !p.trim().is_empty()) {
            builder = builder.proxy(Proxy::all(proxy)?);
        }
        Ok(Self { http: builder.build()?, stream_idle_timeout: config.stream_idle_timeout })
    }

    /// Exposes the underlying client so the credential store can reuse its
    /// connection pool for OAuth and `loadCodeAssist` calls.
    pub fn http(&self) -> &Client {
        &self.http
    }

    pub async fn post_json_unary(&self, url: &str, headers: &[(&str, String)], body: &serde_json::Value) -> Result<UnaryResponse, TransportError> {
        let mut request = self.http.post(url).json(body);
        for (name, value) in headers {
            request = request.header(*name, value);
        }
        let response = request.send().await.map_err(map_error)?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(map_error)?;
        Ok(UnaryResponse { status, headers, body })
    }

    pub async fn post_json_stream(&self, url: &str, headers: &[(&str, String)], body: &serde_json::Value) -> Result<StreamResponse, TransportError> {
        let mut request = self.http.post(url).json(body);
        for (name, value) in headers {
            request = request.header(*name, value);
        }
        let response = request.send().await.map_err(map_error)?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();

        if !(200..300).contains(&status) {
            let body = response.bytes().await.map_err(map_error)?;
            let (tx, rx) = tokio::sync::mpsc::channel(1);
            let _ = tx.send(body).await;
            return Ok(StreamResponse { status, headers, chunks: rx });
        }

        let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);
        let idle_timeout = self.stream_idle_timeout;
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            loop {
                let next = match tokio::time::timeout(idle_timeout, stream.next()).await {
                    Ok(next) => next,
                    Err(_) => break,
                };
                let Some(item) = next else { break };
                let Ok(chunk) = item else { break };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });
        Ok(StreamResponse { status, headers, chunks: rx })
    }
}

fn map_error(err: wreq::Error) -> TransportError {
    TransportError::Failed(err.to_string())
}
