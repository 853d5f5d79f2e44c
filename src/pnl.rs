//! Batched PNL (position) records keyed by condition id, plus the single-id backfill pass.
//!
//! Bulk queries (`market=a,b,c`) may silently omit ids; every requested id that comes back
//! with nothing is fetched again on its own.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::backoff::{pause, BackoffPolicy};
use crate::config::{self, Config};
use crate::http::Transport;
use crate::progress::Progress;
use crate::types::UserPosition;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PnlSettings {
    pub markets_per_request: usize,
    pub page_size: usize,
    /// Batches fetched in parallel.
    pub workers: usize,
    pub policy: BackoffPolicy,
    /// Statuses that end a batch without retry.
    pub fatal_statuses: Vec<u16>,
    /// No pagination goes past this offset.
    pub offset_cap: usize,
    pub page_delay: Duration,
    pub backfill_page_size: usize,
    pub backfill_policy: BackoffPolicy,
}

impl Default for PnlSettings {
    fn default() -> Self {
        Self {
            markets_per_request: config::pnl::MARKETS_PER_REQUEST,
            page_size: config::pnl::PAGE_SIZE,
            workers: config::pnl::WORKERS,
            policy: BackoffPolicy::pnl_batch(),
            fatal_statuses: config::pnl::FATAL_STATUSES.to_vec(),
            offset_cap: config::pnl::OFFSET_CAP,
            page_delay: Duration::from_millis(config::pnl::PAGE_DELAY_MS),
            backfill_page_size: config::pnl::BACKFILL_PAGE_SIZE,
            backfill_policy: BackoffPolicy::backfill(),
        }
    }
}

impl PnlSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            workers: cfg.pnl_workers,
            ..Self::default()
        }
    }
}

/// Why a batch (or a backfill id) stopped paginating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStop {
    Complete,
    OffsetCap,
    RetriesExhausted,
    Fatal(u16),
    /// A 2xx body that was not a JSON array.
    Malformed,
}

impl BatchStop {
    /// Every record the server had (up to the cap) was collected.
    pub fn is_clean(self) -> bool {
        matches!(self, BatchStop::Complete | BatchStop::OffsetCap)
    }
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub batch: usize,
    pub ids: usize,
    pub records: Vec<UserPosition>,
    pub pages: usize,
    pub stop: BatchStop,
}

#[derive(Debug, Clone, Default)]
pub struct PnlFetch {
    pub records: Vec<UserPosition>,
    /// Ids recovered by the single-id backfill.
    pub recovered: Vec<String>,
    /// Ids with no records even after backfill.
    pub still_missing: Vec<String>,
    /// Backfill ids whose own fetch ended on a failure. Any records they did return are kept.
    pub failed_backfill: Vec<(String, BatchStop)>,
    /// Batches that ended on a failure.
    pub failed_batches: usize,
}

pub struct PnlFetcher {
    transport: Arc<dyn Transport>,
    url: String,
    user: String,
    settings: PnlSettings,
    progress: Progress,
}

impl PnlFetcher {
    pub fn new(transport: Arc<dyn Transport>, url: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            transport,
            url: url.into(),
            user: user.into(),
            settings: PnlSettings::default(),
            progress: Progress::disabled(),
        }
    }

    pub fn with_settings(mut self, settings: PnlSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    /// Batch fetch, then backfill whatever the batches did not return.
    pub async fn fetch_with_backfill(&self, condition_ids: &[String]) -> PnlFetch {
        let started = Instant::now();
        let ids = unique_ids(condition_ids);
        let outcomes = self.fetch_batches(&ids).await;

        let failed_batches = outcomes.iter().filter(|o| !o.stop.is_clean()).count();
        let mut records: Vec<UserPosition> = outcomes.into_iter().flat_map(|o| o.records).collect();

        let missing = missing_ids(&ids, &records);
        let mut recovered = Vec::new();
        let mut still_missing = Vec::new();
        let mut failed_backfill = Vec::new();
        if !missing.is_empty() {
            info!(missing = missing.len(), "Condition ids without records, fetching individually");
            for (i, id) in missing.iter().enumerate() {
                self.progress
                    .publish(format!("Fetching missing condition ids ({}/{})", i + 1, missing.len()));
                let (found, stop) = self.fetch_single(id).await;
                if !stop.is_clean() {
                    warn!(
                        condition_id = %id,
                        stop = ?stop,
                        records = found.len(),
                        "Backfill fetch ended early"
                    );
                    failed_backfill.push((id.clone(), stop));
                } else if found.is_empty() {
                    still_missing.push(id.clone());
                } else {
                    recovered.push(id.clone());
                }
                records.extend(found);
            }
        }

        info!(
            ids = ids.len(),
            records = records.len(),
            recovered = recovered.len(),
            still_missing = still_missing.len(),
            failed_backfill = failed_backfill.len(),
            failed_batches,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "PNL fetch complete"
        );

        PnlFetch {
            records,
            recovered,
            still_missing,
            failed_backfill,
            failed_batches,
        }
    }

    /// Split `ids` into batches and fetch them in parallel, `workers` at a time.
    /// Outcomes come back in completion order.
    pub async fn fetch_batches(&self, ids: &[String]) -> Vec<BatchOutcome> {
        let batches: Vec<Vec<String>> = ids
            .chunks(self.settings.markets_per_request.max(1))
            .map(|c| c.to_vec())
            .collect();
        let total = batches.len();
        let pool = Arc::new(Semaphore::new(self.settings.workers.max(1)));

        let mut set = JoinSet::new();
        for (n, batch) in batches.into_iter().enumerate() {
            let pool = Arc::clone(&pool);
            let transport = Arc::clone(&self.transport);
            let url = self.url.clone();
            let user = self.user.clone();
            let settings = self.settings.clone();
            set.spawn(async move {
                let _slot = pool.acquire_owned().await.ok();
                fetch_batch(transport.as_ref(), &url, &user, n + 1, batch, &settings).await
            });
        }

        let mut outcomes = Vec::with_capacity(total);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => {
                    if !outcome.stop.is_clean() {
                        warn!(
                            batch = outcome.batch,
                            stop = ?outcome.stop,
                            records = outcome.records.len(),
                            "PNL batch ended early"
                        );
                    }
                    outcomes.push(outcome);
                }
                Err(e) => warn!("PNL batch task died: {e}"),
            }
            self.progress
                .publish(format!("Fetching PNL ({}/{total} batches)", outcomes.len()));
        }
        outcomes
    }

    /// All records for one condition id. Sleep-and-retry on 429, stop on anything else.
    pub async fn fetch_single(&self, condition_id: &str) -> (Vec<UserPosition>, BatchStop) {
        let s = &self.settings;
        let mut records = Vec::new();
        let mut offset = 0usize;
        let mut retry = 0u32;

        let stop = loop {
            let query = [
                ("user", self.user.clone()),
                ("market", condition_id.to_string()),
                ("limit", s.backfill_page_size.to_string()),
                ("offset", offset.to_string()),
            ];
            match self.transport.get(&self.url, &query).await {
                Ok(resp) if resp.is_success() => {
                    let (page, returned) = match parse_records(resp.body) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            debug!(condition_id, offset, error = %e, "backfill page unreadable");
                            break BatchStop::Malformed;
                        }
                    };
                    records.extend(page);
                    if returned < s.backfill_page_size {
                        break BatchStop::Complete;
                    }
                    offset += s.backfill_page_size;
                    if offset >= s.offset_cap {
                        break BatchStop::OffsetCap;
                    }
                    pause(s.page_delay).await;
                }
                Ok(resp) if resp.is_rate_limited() => {
                    if !s.backfill_policy.allows_retry(retry) {
                        break BatchStop::RetriesExhausted;
                    }
                    pause(s.backfill_policy.delay(retry, 0)).await;
                    retry += 1;
                }
                Ok(resp) => break BatchStop::Fatal(resp.status),
                Err(e) => {
                    debug!(condition_id, error = %e, "backfill request failed");
                    break BatchStop::Fatal(0);
                }
            }
        };
        (records, stop)
    }
}

/// Paginate one batch by offset with the batch retry policy.
pub async fn fetch_batch(
    transport: &dyn Transport,
    url: &str,
    user: &str,
    batch: usize,
    ids: Vec<String>,
    settings: &PnlSettings,
) -> BatchOutcome {
    let market = ids.join(",");
    let mut records = Vec::new();
    let mut offset = 0usize;
    let mut retry = 0u32;
    let mut pages = 0usize;

    let stop = loop {
        let query = [
            ("user", user.to_string()),
            ("market", market.clone()),
            ("limit", settings.page_size.to_string()),
            ("offset", offset.to_string()),
        ];
        let failure = match transport.get(url, &query).await {
            Ok(resp) if resp.is_success() => {
                let (page, returned) = match parse_records(resp.body) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        debug!(batch, offset, error = %e, "PNL page unreadable");
                        break BatchStop::Malformed;
                    }
                };
                records.extend(page);
                pages += 1;
                if returned < settings.page_size {
                    break BatchStop::Complete;
                }
                offset += settings.page_size;
                if offset >= settings.offset_cap {
                    break BatchStop::OffsetCap;
                }
                retry = 0;
                pause(settings.page_delay).await;
                continue;
            }
            Ok(resp) if settings.fatal_statuses.contains(&resp.status) => {
                break BatchStop::Fatal(resp.status);
            }
            Ok(resp) => format!("HTTP {}", resp.status),
            Err(e) => e.to_string(),
        };

        if !settings.policy.allows_retry(retry) {
            break BatchStop::RetriesExhausted;
        }
        let delay = settings.policy.delay(retry, 0);
        debug!(batch, offset, retry, error = %failure, ?delay, "PNL page failed, retrying");
        pause(delay).await;
        retry += 1;
    };

    BatchOutcome {
        batch,
        ids: ids.len(),
        records,
        pages,
        stop,
    }
}

/// Requested ids (in request order) that no record refers to.
pub fn missing_ids(requested: &[String], records: &[UserPosition]) -> Vec<String> {
    let found: HashSet<&str> = records.iter().map(|r| r.condition_id.as_str()).collect();
    requested
        .iter()
        .filter(|id| !found.contains(id.as_str()))
        .cloned()
        .collect()
}

fn unique_ids(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .filter(|id| !id.is_empty() && seen.insert(id.as_str()))
        .cloned()
        .collect()
}

/// A page must be a JSON array (`null` reads as empty). Rows that do not deserialize are
/// dropped and counted; they still count toward the page length so pagination stays aligned.
fn parse_records(body: Value) -> Result<(Vec<UserPosition>, usize), String> {
    let items = match body {
        Value::Array(items) => items,
        Value::Null => return Ok((Vec::new(), 0)),
        other => return Err(format!("expected a JSON array, got {other}")),
    };
    let returned = items.len();
    let mut dropped = 0usize;
    let records: Vec<UserPosition> = items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(r) => Some(r),
            Err(e) => {
                dropped += 1;
                debug!(error = %e, "unreadable PNL row");
                None
            }
        })
        .collect();
    if dropped > 0 {
        debug!(dropped, returned, "PNL rows dropped");
    }
    Ok((records, returned))
}
