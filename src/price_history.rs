//! Reference (closing) price at match start, from the CLOB price history.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use tracing::{debug, info};

use crate::backoff::{pause, BackoffPolicy};
use crate::config::{self, Config};
use crate::http::{Transport, TransportError};
use crate::types::PriceEntry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceSettings {
    /// Seconds before match start that still count.
    pub lookback_secs: i64,
    /// Minutes per history point.
    pub fidelity: u32,
    pub workers: usize,
    /// Courtesy delay before each lookup.
    pub request_delay: Duration,
    pub policy: BackoffPolicy,
}

impl Default for PriceSettings {
    fn default() -> Self {
        Self {
            lookback_secs: config::price_history::LOOKBACK_SECS,
            fidelity: config::price_history::FIDELITY,
            workers: config::price_history::WORKERS,
            request_delay: Duration::from_millis(config::price_history::REQUEST_DELAY_MS),
            policy: BackoffPolicy::price_history(),
        }
    }
}

impl PriceSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            workers: cfg.price_workers,
            ..Self::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    history: Vec<PriceEntry>,
}

/// Last entry with `match_ts - lookback <= t <= match_ts`. Never an entry after match start.
pub fn select_reference_price(history: &[PriceEntry], match_ts: i64, lookback_secs: i64) -> Option<PriceEntry> {
    let earliest = match_ts.saturating_sub(lookback_secs);
    history
        .iter()
        .filter(|e| e.t >= earliest && e.t <= match_ts)
        .max_by_key(|e| e.t)
        .copied()
}

pub struct PriceHistoryClient {
    transport: Arc<dyn Transport>,
    url: String,
    settings: PriceSettings,
}

impl PriceHistoryClient {
    pub fn new(transport: Arc<dyn Transport>, url: impl Into<String>) -> Self {
        Self {
            transport,
            url: url.into(),
            settings: PriceSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: PriceSettings) -> Self {
        self.settings = settings;
        self
    }

    /// `None` on a non-retryable status, a malformed body, or retries exhausted.
    pub async fn fetch_history(&self, token_id: &str, start_ts: i64, end_ts: i64) -> Option<Vec<PriceEntry>> {
        let query = [
            ("market", token_id.to_string()),
            ("startTs", start_ts.to_string()),
            ("endTs", end_ts.to_string()),
            ("fidelity", self.settings.fidelity.to_string()),
        ];
        let policy = &self.settings.policy;
        let mut retry = 0u32;

        loop {
            match self.transport.get(&self.url, &query).await {
                Ok(resp) if resp.is_success() => {
                    return match serde_json::from_value::<HistoryResponse>(resp.body) {
                        Ok(h) => Some(h.history),
                        Err(e) => {
                            debug!(token_id, error = %e, "unreadable price history");
                            None
                        }
                    };
                }
                Ok(resp) if resp.is_rate_limited() || resp.is_timeout() => {}
                Err(TransportError::Timeout) => {}
                Ok(resp) => {
                    debug!(token_id, status = resp.status, "price history request rejected");
                    return None;
                }
                Err(e) => {
                    debug!(token_id, error = %e, "price history request failed");
                    return None;
                }
            }

            if !policy.allows_retry(retry) {
                debug!(token_id, retry, "price history still throttled, giving up");
                return None;
            }
            pause(policy.delay(retry, 1)).await;
            retry += 1;
        }
    }

    /// Price at or just before `match_ts`, looking back `lookback_secs`.
    pub async fn closing_price(&self, token_id: &str, match_ts: i64) -> Option<f64> {
        let lookback = self.settings.lookback_secs;
        let history = self
            .fetch_history(token_id, match_ts.saturating_sub(lookback), match_ts)
            .await?;
        select_reference_price(&history, match_ts, lookback).map(|e| e.p)
    }

    /// Resolve many `(token id, match start)` pairs, each distinct pair once, on a bounded pool.
    pub async fn closing_prices(&self, requests: &[(String, i64)]) -> HashMap<(String, i64), Option<f64>> {
        let mut seen = HashSet::new();
        let unique: Vec<(String, i64)> = requests
            .iter()
            .filter(|(token, _)| !token.is_empty())
            .filter(|r| seen.insert((*r).clone()))
            .cloned()
            .collect();
        let total = unique.len();

        let prices: HashMap<(String, i64), Option<f64>> = stream::iter(unique)
            .map(|(token, ts)| async move {
                pause(self.settings.request_delay).await;
                let price = self.closing_price(&token, ts).await;
                ((token, ts), price)
            })
            .buffer_unordered(self.settings.workers.max(1))
            .collect()
            .await;

        let found = prices.values().filter(|p| p.is_some()).count();
        info!(lookups = total, found, missing = total - found, "Closing prices resolved");
        prices
    }
}
