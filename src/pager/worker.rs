use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::backoff::{pause, BackoffPolicy, Pacing};
use crate::config;
use crate::http::Transport;
use crate::pager::window::{PageWindow, WindowAccumulator};

/// What one page request produced.
#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome<T> {
    Records(Vec<T>),
    /// 429. The only retryable outcome.
    RateLimited,
    /// Any other status, transport error or malformed body.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchPageResult<T> {
    pub offset: u64,
    pub retry_count: u32,
    pub outcome: PageOutcome<T>,
}

impl<T> FetchPageResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, PageOutcome::Records(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.outcome, PageOutcome::RateLimited)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagerSettings {
    pub page_size: usize,
    pub policy: BackoffPolicy,
    pub pacing: Pacing,
}

impl Default for PagerSettings {
    fn default() -> Self {
        Self {
            page_size: config::pager::PAGE_SIZE,
            policy: BackoffPolicy::offset_pager(),
            pacing: Pacing::offset_pager(),
        }
    }
}

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Reached the end of its bounded window.
    WindowFilled,
    /// Empty page, or a short page on an unbounded window.
    EndOfData,
    /// Still rate limited after the retry budget.
    RetriesExhausted,
    /// Non-retryable status, transport error or malformed body.
    Failed,
}

impl StopReason {
    pub fn is_clean(self) -> bool {
        matches!(self, StopReason::WindowFilled | StopReason::EndOfData)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerReport<T> {
    pub window: PageWindow,
    pub records: Vec<T>,
    pub pages: usize,
    pub stop: StopReason,
    pub error: Option<String>,
}

/// Fetch one page. Does not sleep; the caller owns the retry loop.
pub async fn fetch_page<T: DeserializeOwned>(
    transport: &dyn Transport,
    url: &str,
    user: &str,
    offset: u64,
    limit: usize,
    retry_count: u32,
) -> FetchPageResult<T> {
    let query = [
        ("limit", limit.to_string()),
        ("offset", offset.to_string()),
        ("user", user.to_string()),
    ];
    let outcome = match transport.get(url, &query).await {
        Ok(resp) if resp.is_success() => parse_page(resp.body),
        Ok(resp) if resp.is_rate_limited() => PageOutcome::RateLimited,
        Ok(resp) => PageOutcome::Failed(format!("HTTP {}", resp.status)),
        Err(e) => PageOutcome::Failed(e.to_string()),
    };
    FetchPageResult {
        offset,
        retry_count,
        outcome,
    }
}

fn parse_page<T: DeserializeOwned>(body: Value) -> PageOutcome<T> {
    match body {
        Value::Array(_) => match serde_json::from_value::<Vec<T>>(body) {
            Ok(records) => PageOutcome::Records(records),
            Err(e) => PageOutcome::Failed(format!("malformed record: {e}")),
        },
        Value::Null => PageOutcome::Records(Vec::new()),
        other => PageOutcome::Failed(format!("expected a JSON array, got {}", kind(&other))),
    }
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Sequentially page through one window.
///
/// Failures never propagate: the report carries whatever was accumulated plus the stop reason.
pub async fn run_worker<T: DeserializeOwned>(
    transport: Arc<dyn Transport>,
    url: String,
    user: String,
    window: PageWindow,
    settings: PagerSettings,
) -> WorkerReport<T> {
    let id = window.worker_id;
    pause(settings.pacing.initial_stagger(id)).await;

    let mut acc = WindowAccumulator::new(window);
    let mut pages = 0usize;
    let mut error = None;

    let stop = loop {
        if acc.is_full() {
            break StopReason::WindowFilled;
        }
        let limit = acc.next_limit(settings.page_size);

        let mut retry = 0u32;
        let page = loop {
            let result = fetch_page::<T>(transport.as_ref(), &url, &user, acc.offset(), limit, retry).await;
            if result.is_retryable() && settings.policy.allows_retry(retry) {
                let delay = settings.policy.delay(retry, id);
                debug!(worker = id, offset = result.offset, retry, ?delay, "rate limited, backing off");
                pause(delay).await;
                retry += 1;
                continue;
            }
            break result;
        };

        match page.outcome {
            PageOutcome::Records(records) if records.is_empty() => break StopReason::EndOfData,
            PageOutcome::Records(records) => {
                let returned = records.len();
                acc.append_and_clamp(records);
                pages += 1;
                if !window.is_bounded() && returned < limit {
                    break StopReason::EndOfData;
                }
            }
            PageOutcome::RateLimited => break StopReason::RetriesExhausted,
            PageOutcome::Failed(e) => {
                debug!(worker = id, offset = page.offset, error = %e, "page failed, stopping worker");
                error = Some(e);
                break StopReason::Failed;
            }
        }

        if acc.is_full() {
            break StopReason::WindowFilled;
        }
        pause(settings.pacing.between_pages(id)).await;
    };

    WorkerReport {
        window,
        records: acc.into_records(),
        pages,
        stop,
        error,
    }
}
