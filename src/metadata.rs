use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::config;
use crate::http::Transport;
use crate::progress::Progress;
use crate::types::{value_as_f64, MarketMeta};

/// Gamma market metadata by slug, and the data API's lifetime trade count.
pub struct MetadataClient {
    transport: Arc<dyn Transport>,
    markets_url: String,
    traded_url: String,
    batch_size: usize,
    progress: Progress,
}

impl MetadataClient {
    pub fn new(transport: Arc<dyn Transport>, markets_url: impl Into<String>, traded_url: impl Into<String>) -> Self {
        Self {
            transport,
            markets_url: markets_url.into(),
            traded_url: traded_url.into(),
            batch_size: config::metadata::SLUGS_PER_REQUEST,
            progress: Progress::disabled(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    /// Metadata for every distinct non-empty slug. Slugs the API did not return, or whose batch
    /// failed, map to an empty `MarketMeta`.
    pub async fn fetch_markets(&self, slugs: &[String]) -> HashMap<String, MarketMeta> {
        let mut seen = HashSet::new();
        let unique: Vec<&String> = slugs
            .iter()
            .filter(|s| !s.is_empty() && seen.insert(s.as_str()))
            .collect();
        let total_batches = unique.len().div_ceil(self.batch_size);

        let mut out = HashMap::with_capacity(unique.len());
        let mut failed_batches = 0usize;
        for (i, batch) in unique.chunks(self.batch_size).enumerate() {
            self.progress
                .publish(format!("Fetching market info ({}/{total_batches})", i + 1));

            let mut query: Vec<(&'static str, String)> = batch.iter().map(|s| ("slug", s.to_string())).collect();
            query.push(("include_tag", "true".to_string()));
            query.push(("limit", batch.len().to_string()));

            let mut found = match self.transport.get(&self.markets_url, &query).await {
                Ok(resp) if resp.is_success() => parse_markets(&resp.body),
                Ok(resp) => {
                    warn!(batch = i + 1, status = resp.status, "Market info request rejected");
                    failed_batches += 1;
                    HashMap::new()
                }
                Err(e) => {
                    warn!(batch = i + 1, "Error trying to fetch market info: {e}");
                    failed_batches += 1;
                    HashMap::new()
                }
            };
            for slug in batch {
                let meta = found.remove(slug.as_str()).unwrap_or_default();
                out.insert(slug.to_string(), meta);
            }
        }

        info!(slugs = out.len(), batches = total_batches, failed_batches, "Market info collected");
        out
    }

    /// Lifetime number of markets traded. `None` on any failure.
    pub async fn traded_count(&self, user: &str) -> Option<u64> {
        let query = [("user", user.to_string())];
        match self.transport.get(&self.traded_url, &query).await {
            Ok(resp) if resp.is_success() => resp.body.get("traded").and_then(|t| {
                t.as_u64()
                    .or_else(|| t.as_str().and_then(|s| s.trim().parse().ok()))
            }),
            Ok(resp) => {
                warn!(status = resp.status, "Trade count request rejected");
                None
            }
            Err(e) => {
                warn!("Trade count request failed: {e}");
                None
            }
        }
    }
}

fn parse_markets(body: &Value) -> HashMap<String, MarketMeta> {
    let Some(markets) = body.as_array() else {
        return HashMap::new();
    };
    markets
        .iter()
        .filter_map(|m| {
            let slug = m.get("slug").and_then(|s| s.as_str())?;
            let tags = m
                .get("tags")
                .and_then(|t| t.as_array())
                .map(|tags| {
                    tags.iter()
                        .filter_map(|tag| tag.get("label").and_then(|l| l.as_str()))
                        .filter(|l| !l.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let start_time = m
                .get("gameStartTime")
                .and_then(|s| s.as_str())
                .map(|s| s.to_string());
            let volume = m.get("volume").and_then(value_as_f64);
            Some((slug.to_string(), MarketMeta { tags, start_time, volume }))
        })
        .collect()
}
