use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::error::Result;
use crate::http::latency::LatencyStats;

/// Query string as ordered key/value pairs. Keys may repeat (`slug=a&slug=b`).
pub type Query = [(&'static str, String)];

/// Status code plus decoded JSON body.
///
/// Non-2xx responses whose body is not JSON carry `Value::Null`.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
}

impl HttpResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status == 429
    }

    /// 408 Request Timeout from the server side.
    pub fn is_timeout(&self) -> bool {
        self.status == 408
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("request failed: {0}")]
    Request(String),

    #[error("response body is not valid JSON: {0}")]
    Decode(String),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Request(e.to_string())
        }
    }
}

/// Blocking-style request/response primitive every fetcher talks through.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str, query: &Query) -> std::result::Result<HttpResponse, TransportError>;

    async fn post_json(
        &self,
        url: &str,
        body: &Value,
    ) -> std::result::Result<HttpResponse, TransportError>;
}

/// `reqwest`-backed transport with a fixed per-call timeout.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    latency: Arc<LatencyStats>,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            latency: Arc::new(LatencyStats::new()),
        })
    }

    pub fn latency(&self) -> Arc<LatencyStats> {
        Arc::clone(&self.latency)
    }

    async fn finish(
        &self,
        started: Instant,
        response: reqwest::Response,
    ) -> std::result::Result<HttpResponse, TransportError> {
        let status = response.status().as_u16();
        let bytes = response.bytes().await?;
        self.latency.record(started.elapsed());

        let body = match serde_json::from_slice::<Value>(&bytes) {
            Ok(v) => v,
            Err(e) if (200..300).contains(&status) => {
                return Err(TransportError::Decode(e.to_string()));
            }
            Err(_) => Value::Null,
        };
        Ok(HttpResponse { status, body })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str, query: &Query) -> std::result::Result<HttpResponse, TransportError> {
        let started = Instant::now();
        let response = self.client.get(url).query(query).send().await?;
        let resp = self.finish(started, response).await?;
        debug!(url, status = resp.status, "GET");
        Ok(resp)
    }

    async fn post_json(
        &self,
        url: &str,
        body: &Value,
    ) -> std::result::Result<HttpResponse, TransportError> {
        let started = Instant::now();
        let response = self
            .client
            .post(url)
            .header("Accept", "application/json")
            .json(body)
            .send()
            .await?;
        let resp = self.finish(started, response).await?;
        debug!(url, status = resp.status, "POST");
        Ok(resp)
    }
}
