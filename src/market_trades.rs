//! Gated market fetcher: every trade for every market, under one shared concurrency gate.
//!
//! Each single-page request holds a gate permit for its whole life, including rate-limit sleeps,
//! so a throttled market slows the entire fetch down. Market-level fan-out is bounded separately.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::backoff::{pause, BackoffPolicy};
use crate::config::{self, Config};
use crate::http::{Transport, TransportError};
use crate::progress::Progress;
use crate::types::Trade;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketFetchSettings {
    pub page_size: usize,
    pub page_delay: Duration,
    /// Gate capacity: simultaneous outbound requests across all markets.
    pub gate_capacity: usize,
    /// Market-level tasks in flight.
    pub workers: usize,
    pub policy: BackoffPolicy,
    pub taker_only: bool,
}

impl Default for MarketFetchSettings {
    fn default() -> Self {
        Self {
            page_size: config::market_trades::PAGE_SIZE,
            page_delay: Duration::from_millis(config::market_trades::PAGE_DELAY_MS),
            gate_capacity: config::market_trades::SIMULTANEOUS_REQUESTS,
            workers: config::market_trades::MARKET_WORKERS,
            policy: BackoffPolicy::market_page(),
            taker_only: false,
        }
    }
}

impl MarketFetchSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            gate_capacity: cfg.simultaneous_requests,
            workers: cfg.market_workers,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageFailure {
    /// Still 429/408 (or timing out) after the inner retry budget.
    RetriesExhausted,
    Fatal(String),
}

impl std::fmt::Display for PageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PageFailure::RetriesExhausted => write!(f, "rate limited after all retries"),
            PageFailure::Fatal(e) => write!(f, "{e}"),
        }
    }
}

/// Result of one complete market fetch.
#[derive(Debug, Clone)]
pub struct MarketFetch {
    pub market_id: String,
    pub trades: Vec<Trade>,
    pub success: bool,
    pub error: Option<PageFailure>,
}

#[derive(Debug, Clone, Default)]
pub struct TradeCollection {
    pub trades: Vec<Trade>,
    /// Markets still failing after the retry pass.
    pub failed_markets: Vec<String>,
    /// Markets that failed the first pass.
    pub retried_markets: usize,
}

pub struct MarketTradeFetcher {
    transport: Arc<dyn Transport>,
    url: String,
    user: String,
    settings: MarketFetchSettings,
    progress: Progress,
}

impl MarketTradeFetcher {
    pub fn new(transport: Arc<dyn Transport>, url: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            transport,
            url: url.into(),
            user: user.into(),
            settings: MarketFetchSettings::default(),
            progress: Progress::disabled(),
        }
    }

    pub fn with_settings(mut self, settings: MarketFetchSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    /// Fetch every trade for every market, then retry the failed markets once.
    ///
    /// One gate is created per call and shared by both passes.
    pub async fn fetch_all(&self, market_ids: &[String]) -> TradeCollection {
        let started = Instant::now();
        let mut seen = HashSet::new();
        let markets: Vec<String> = market_ids
            .iter()
            .filter(|m| !m.is_empty() && seen.insert(m.as_str()))
            .cloned()
            .collect();
        let gate = Semaphore::new(self.settings.gate_capacity.max(1));

        let (mut trades, failed) = self.run_pass(&gate, markets).await;
        let retried_markets = failed.len();

        let failed_markets = if failed.is_empty() {
            failed
        } else {
            info!(markets = failed.len(), "Retrying markets that failed");
            let (retried, still_failed) = self.run_pass(&gate, failed).await;
            trades.extend(retried);
            still_failed
        };

        if failed_markets.is_empty() {
            info!(
                trades = trades.len(),
                retried = retried_markets,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Trade fetch complete"
            );
        } else {
            warn!(
                trades = trades.len(),
                failed = failed_markets.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Trade fetch complete with permanently failed markets: {:?}",
                failed_markets
            );
        }

        TradeCollection {
            trades,
            failed_markets,
            retried_markets,
        }
    }

    /// One pass over `markets` on the bounded pool. Returns (trades, failed market ids).
    pub async fn run_pass(&self, gate: &Semaphore, markets: Vec<String>) -> (Vec<Trade>, Vec<String>) {
        let total = markets.len();
        let mut trades = Vec::new();
        let mut failed = Vec::new();
        let mut done = 0usize;

        let mut results = stream::iter(markets)
            .map(|market_id| self.fetch_market(gate, market_id))
            .buffer_unordered(self.settings.workers.max(1));

        while let Some(fetch) = results.next().await {
            done += 1;
            if fetch.success {
                debug!(market = %fetch.market_id, trades = fetch.trades.len(), "[{done}/{total}] market done");
                trades.extend(fetch.trades);
            } else {
                warn!(
                    market = %fetch.market_id,
                    error = %fetch.error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                    "[{done}/{total}] market failed, marked for retry"
                );
                failed.push(fetch.market_id);
            }
            self.progress.publish(format!("Fetching trades ({done}/{total} markets)"));
        }

        (trades, failed)
    }

    /// All pages of one market. Any failed page fails the market.
    pub async fn fetch_market(&self, gate: &Semaphore, market_id: String) -> MarketFetch {
        let page_size = self.settings.page_size;
        let mut trades = Vec::new();
        let mut offset = 0usize;

        loop {
            let page = match self.fetch_page(gate, &market_id, offset).await {
                Ok(page) => page,
                Err(e) => {
                    return MarketFetch {
                        market_id,
                        trades,
                        success: false,
                        error: Some(e),
                    };
                }
            };
            let returned = page.len();
            trades.extend(page);
            if returned < page_size {
                break;
            }
            offset += returned;
            pause(self.settings.page_delay).await;
        }

        MarketFetch {
            market_id,
            trades,
            success: true,
            error: None,
        }
    }

    /// One page under the gate. The permit is held across inner retries and dropped on every exit.
    pub async fn fetch_page(&self, gate: &Semaphore, market_id: &str, offset: usize) -> Result<Vec<Trade>, PageFailure> {
        let _permit = gate
            .acquire()
            .await
            .map_err(|_| PageFailure::Fatal("concurrency gate closed".to_string()))?;

        let query = [
            ("limit", self.settings.page_size.to_string()),
            ("offset", offset.to_string()),
            ("user", self.user.clone()),
            ("market", market_id.to_string()),
            ("takerOnly", self.settings.taker_only.to_string()),
        ];

        let mut retry = 0u32;
        loop {
            let transient = match self.transport.get(&self.url, &query).await {
                Ok(resp) if resp.is_success() => return parse_trades(resp.body, market_id),
                Ok(resp) if resp.is_rate_limited() || resp.is_timeout() => format!("HTTP {}", resp.status),
                Ok(resp) => return Err(PageFailure::Fatal(format!("HTTP {}", resp.status))),
                Err(TransportError::Timeout) => "client timeout".to_string(),
                Err(e) => return Err(PageFailure::Fatal(e.to_string())),
            };

            if !self.settings.policy.allows_retry(retry) {
                return Err(PageFailure::RetriesExhausted);
            }
            retry += 1;
            let delay = self.settings.policy.delay(retry, 0);
            warn!(
                market = %market_id,
                offset,
                retry,
                max_retries = self.settings.policy.max_retries,
                "{transient}, waiting {:.1}s",
                delay.as_secs_f64()
            );
            pause(delay).await;
        }
    }
}

/// The endpoint returns a bare array, or occasionally `{"trades": [...]}`.
fn parse_trades(body: Value, market_id: &str) -> Result<Vec<Trade>, PageFailure> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("trades") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        Value::Null => Vec::new(),
        _ => return Err(PageFailure::Fatal("unexpected trades payload".to_string())),
    };

    items
        .into_iter()
        .map(|item| {
            serde_json::from_value::<Trade>(item)
                .map(|mut trade| {
                    trade.market_id = market_id.to_string();
                    trade
                })
                .map_err(|e| PageFailure::Fatal(format!("malformed trade: {e}")))
        })
        .collect()
}
