//! End-to-end orchestration: positions (REST or subgraph), closing prices, trades, CLV.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::Serialize;
use tracing::{info, warn};

use crate::clv::{self, ClvInput};
use crate::config::{self, Config, Endpoints};
use crate::error::{AppError, Result};
use crate::http::{LatencyStats, ReqwestTransport, Transport};
use crate::market_trades::{MarketFetchSettings, MarketTradeFetcher};
use crate::metadata::MetadataClient;
use crate::pager::{OffsetPager, PageWindow, PagerSettings};
use crate::pnl::{PnlFetcher, PnlSettings};
use crate::price_history::{PriceHistoryClient, PriceSettings};
use crate::progress::Progress;
use crate::subgraph::{split_positions, GraphPager};
use crate::types::{CompositeKey, EnrichedPosition, MarketMeta, PositionStatus, UserPosition};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub closed_position_workers: usize,
    pub records_per_worker: u64,
    pub pager: PagerSettings,
    pub markets: MarketFetchSettings,
    pub pnl: PnlSettings,
    pub prices: PriceSettings,
    pub graph_page_delay: Duration,
}

impl PipelineSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            closed_position_workers: cfg.closed_position_workers,
            records_per_worker: cfg.records_per_worker,
            pager: PagerSettings::default(),
            markets: MarketFetchSettings::from_config(cfg),
            pnl: PnlSettings::from_config(cfg),
            prices: PriceSettings::from_config(cfg),
            graph_page_delay: Duration::from_millis(config::subgraph::PAGE_DELAY_MS),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// One output row: the position, its closing price and either CLV values or the skip reason.
#[derive(Debug, Clone, Serialize)]
pub struct ClvRow {
    #[serde(flatten)]
    pub position: EnrichedPosition,
    pub closing_price: Option<f64>,
    pub avg_entry_price: Option<f64>,
    pub price_clv: Option<f64>,
    pub odds_clv: Option<f64>,
    pub clv_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ClvOutcome {
    pub rows: Vec<ClvRow>,
    pub reason_counts: BTreeMap<String, usize>,
    /// Markets whose trades could not be fetched even after the retry pass.
    pub failed_markets: Vec<String>,
    pub unmatched_trades: usize,
}

impl ClvOutcome {
    pub fn calculated(&self) -> usize {
        self.rows.iter().filter(|r| r.price_clv.is_some()).count()
    }
}

pub struct Pipeline {
    endpoints: Endpoints,
    transport: Arc<dyn Transport>,
    settings: PipelineSettings,
    progress: Progress,
    latency: Option<Arc<LatencyStats>>,
}

impl Pipeline {
    pub fn new(endpoints: Endpoints, transport: Arc<dyn Transport>, settings: PipelineSettings) -> Self {
        Self {
            endpoints,
            transport,
            settings,
            progress: Progress::disabled(),
            latency: None,
        }
    }

    /// Real HTTP transport with the configured timeout; request latency is tracked.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let transport = ReqwestTransport::new(cfg.http_timeout)?;
        let latency = transport.latency();
        let mut pipeline = Self::new(
            cfg.endpoints.clone(),
            Arc::new(transport),
            PipelineSettings::from_config(cfg),
        );
        pipeline.latency = Some(latency);
        Ok(pipeline)
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    // -----------------------------------------------------------------------
    // Positions
    // -----------------------------------------------------------------------

    /// Closed positions on the staggered worker layout, active positions on one unbounded
    /// worker, combined and enriched with market metadata.
    pub async fn fetch_all_positions(&self, user: &str) -> Vec<EnrichedPosition> {
        let pager = OffsetPager::new(Arc::clone(&self.transport))
            .with_settings(self.settings.pager.clone())
            .with_progress(self.progress.clone());

        let closed = pager
            .fetch::<UserPosition>(
                &self.endpoints.closed_positions(),
                user,
                PageWindow::staggered(self.settings.records_per_worker, self.settings.closed_position_workers),
                "Fetching closed positions",
            )
            .await;
        let active = pager
            .fetch::<UserPosition>(
                &self.endpoints.active_positions(),
                user,
                PageWindow::staggered(self.settings.records_per_worker, 1),
                "Fetching active positions",
            )
            .await;

        for worker in closed.incomplete_workers().chain(active.incomplete_workers()) {
            warn!(
                worker = worker.window.worker_id,
                start = worker.window.start,
                records = worker.records,
                "Position window incomplete, results may be missing rows"
            );
        }

        let rows = combine_positions(active.records, closed.records);
        self.enrich(rows).await
    }

    /// Positions listed by the subgraph, resolved to PNL records for one status class.
    pub async fn positions_from_subgraph(&self, user: &str, status: PositionStatus) -> Vec<EnrichedPosition> {
        let graph = GraphPager::new(Arc::clone(&self.transport), self.endpoints.subgraph.clone())
            .with_page_delay(self.settings.graph_page_delay)
            .with_progress(self.progress.clone())
            .fetch_all_positions(user)
            .await;
        if let Some(e) = &graph.stopped_on_error {
            warn!(collected = graph.positions.len(), "Subgraph listing may be truncated: {e}");
        }

        let (active, closed) = split_positions(graph.positions);
        let selected = match status {
            PositionStatus::Active => active,
            PositionStatus::Closed => closed,
        };
        let mut seen = HashSet::new();
        let condition_ids: Vec<String> = selected
            .into_iter()
            .filter_map(|p| p.condition_id)
            .filter(|c| seen.insert(c.clone()))
            .collect();
        info!(status = %status, condition_ids = condition_ids.len(), "Resolving subgraph positions");

        let url = match status {
            PositionStatus::Active => self.endpoints.active_positions(),
            PositionStatus::Closed => self.endpoints.closed_positions(),
        };
        let pnl = PnlFetcher::new(Arc::clone(&self.transport), url, user)
            .with_settings(self.settings.pnl.clone())
            .with_progress(self.progress.clone())
            .fetch_with_backfill(&condition_ids)
            .await;

        if pnl.failed_batches > 0 || !pnl.failed_backfill.is_empty() {
            warn!(
                failed_batches = pnl.failed_batches,
                failed_ids = pnl.failed_backfill.len(),
                "PNL records may be incomplete: {:?}",
                pnl.failed_backfill
            );
        }

        let rows = pnl.records.into_iter().map(|p| (p, status)).collect();
        self.enrich(rows).await
    }

    pub async fn traded_count(&self, user: &str) -> Option<u64> {
        self.metadata().traded_count(user).await
    }

    async fn enrich(&self, rows: Vec<(UserPosition, PositionStatus)>) -> Vec<EnrichedPosition> {
        let slugs: Vec<String> = rows.iter().map(|(p, _)| p.slug.clone()).collect();
        let meta = self.metadata().fetch_markets(&slugs).await;
        rows.into_iter()
            .map(|(position, status)| {
                let market = meta.get(&position.slug).cloned().unwrap_or_default();
                EnrichedPosition {
                    position,
                    status: Some(status),
                    meta: market,
                }
            })
            .collect()
    }

    fn metadata(&self) -> MetadataClient {
        MetadataClient::new(
            Arc::clone(&self.transport),
            self.endpoints.markets(),
            self.endpoints.traded(),
        )
        .with_progress(self.progress.clone())
    }

    // -----------------------------------------------------------------------
    // CLV
    // -----------------------------------------------------------------------

    /// Closing prices, trades and CLV for every position.
    ///
    /// Fails only when a start time is present but unparseable; every per-position or
    /// per-market failure ends up in the outcome instead.
    pub async fn calculate_clv(&self, user: &str, positions: Vec<EnrichedPosition>) -> Result<ClvOutcome> {
        let mut starts = Vec::with_capacity(positions.len());
        for p in &positions {
            starts.push(start_timestamp(&p.meta, &p.key())?);
        }

        self.progress.publish("Fetching closing prices");
        let requests: Vec<(String, i64)> = positions
            .iter()
            .zip(&starts)
            .filter_map(|(p, start)| start.map(|ts| (p.position.asset.clone(), ts)))
            .collect();
        let prices = PriceHistoryClient::new(Arc::clone(&self.transport), self.endpoints.prices_history())
            .with_settings(self.settings.prices.clone())
            .closing_prices(&requests)
            .await;

        let markets: Vec<String> = positions.iter().map(|p| p.position.condition_id.clone()).collect();
        let trades = MarketTradeFetcher::new(Arc::clone(&self.transport), self.endpoints.trades(), user)
            .with_settings(self.settings.markets.clone())
            .with_progress(self.progress.clone())
            .fetch_all(&markets)
            .await;

        let inputs: Vec<ClvInput> = positions
            .iter()
            .zip(&starts)
            .map(|(p, start)| ClvInput {
                key: p.key(),
                start_ts: *start,
                closing_price: start
                    .and_then(|ts| prices.get(&(p.position.asset.clone(), ts)).copied().flatten()),
            })
            .collect();
        let report = clv::aggregate(&inputs, &trades.trades);

        let rows = positions
            .into_iter()
            .zip(inputs)
            .map(|(position, input)| {
                let result = report.results.get(&input.key);
                ClvRow {
                    position,
                    closing_price: input.closing_price,
                    avg_entry_price: result.map(|r| r.avg_entry_price),
                    price_clv: result.map(|r| r.price_clv),
                    odds_clv: result.map(|r| r.odds_clv),
                    clv_reason: report.reasons.get(&input.key).map(|r| r.to_string()),
                }
            })
            .collect();

        let outcome = ClvOutcome {
            rows,
            reason_counts: report.reason_counts(),
            failed_markets: trades.failed_markets,
            unmatched_trades: report.unmatched_trades,
        };
        info!(
            positions = outcome.rows.len(),
            calculated = outcome.calculated(),
            failed_markets = outcome.failed_markets.len(),
            "CLV calculation complete"
        );
        Ok(outcome)
    }

    /// Log p50/p95/p99 request latency, when the transport records it.
    pub fn log_latency_summary(&self) {
        let Some(latency) = &self.latency else {
            return;
        };
        if latency.is_empty() {
            return;
        }
        let (p50, p95, p99) = latency.percentiles();
        info!(
            requests = latency.len(),
            p50_ms = p50.unwrap_or(0) / 1000,
            p95_ms = p95.unwrap_or(0) / 1000,
            p99_ms = p99.unwrap_or(0) / 1000,
            "HTTP latency"
        );
    }
}

/// Closed rows as-is; active rows only when their key is not already closed.
pub fn combine_positions(active: Vec<UserPosition>, closed: Vec<UserPosition>) -> Vec<(UserPosition, PositionStatus)> {
    let closed_keys: HashSet<CompositeKey> = closed.iter().map(UserPosition::key).collect();
    let dropped = active.iter().filter(|p| closed_keys.contains(&p.key())).count();
    if dropped > 0 {
        info!(dropped, "Active positions already closed");
    }

    closed
        .into_iter()
        .map(|p| (p, PositionStatus::Closed))
        .chain(
            active
                .into_iter()
                .filter(|p| !closed_keys.contains(&p.key()))
                .map(|p| (p, PositionStatus::Active)),
        )
        .collect()
}

/// ISO-8601 start time to unix seconds. Offsets may be `Z`, `+00`, `+00:00`; naive values are UTC.
pub fn parse_start_time(raw: &str) -> Option<i64> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%#z", "%Y-%m-%dT%H:%M:%S%#z", "%Y-%m-%d %H:%M:%S%.f%#z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.timestamp());
        }
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc().timestamp());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
}

/// `None` when the market has no start time; an error when it has one we cannot read.
fn start_timestamp(meta: &MarketMeta, key: &CompositeKey) -> Result<Option<i64>> {
    match meta.start_time.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => parse_start_time(raw)
            .map(Some)
            .ok_or_else(|| AppError::InvalidInput(format!("unparseable start_time '{raw}' for {key}"))),
    }
}
