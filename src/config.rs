use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, Result};

pub const DATA_API_URL: &str = "https://data-api.polymarket.com";
pub const GAMMA_API_URL: &str = "https://gamma-api.polymarket.com";
pub const CLOB_API_URL: &str = "https://clob.polymarket.com";
pub const SUBGRAPH_URL: &str =
    "https://api.goldsky.com/api/public/project_cl6mb8i9h0003e201j6li0diw/subgraphs/positions-subgraph/0.0.7/gn";

/// Per-call HTTP timeout (seconds).
pub const HTTP_TIMEOUT_SECS: u64 = 30;

/// Offset pager: records requested per page and records owned by each bounded worker.
pub mod pager {
    pub const PAGE_SIZE: usize = 500;
    pub const RECORDS_PER_WORKER: u64 = 250;
    pub const CLOSED_POSITION_WORKERS: usize = 20;
}

/// Gated market fetcher.
pub mod market_trades {
    pub const PAGE_SIZE: usize = 100;
    pub const PAGE_DELAY_MS: u64 = 100;
    /// Capacity of the process-wide concurrency gate.
    pub const SIMULTANEOUS_REQUESTS: usize = 10;
    /// Bound on market-level tasks in flight. Independent of the gate.
    pub const MARKET_WORKERS: usize = 25;
}

/// Cursor pager over the positions subgraph.
pub mod subgraph {
    pub const PAGE_SIZE: usize = 1000;
    pub const PAGE_DELAY_MS: u64 = 200;
}

/// Batched PNL fetch and single-id backfill.
pub mod pnl {
    pub const MARKETS_PER_REQUEST: usize = 50;
    pub const PAGE_SIZE: usize = 25;
    pub const WORKERS: usize = 4;
    /// No batch or backfill pagination goes past this many records.
    pub const OFFSET_CAP: usize = 10_000;
    pub const FATAL_STATUSES: &[u16] = &[400, 401, 403, 404];
    pub const PAGE_DELAY_MS: u64 = 100;
    pub const BACKFILL_PAGE_SIZE: usize = 500;
}

/// Market metadata lookups.
pub mod metadata {
    pub const SLUGS_PER_REQUEST: usize = 100;
}

/// Closing (reference) price lookups.
pub mod price_history {
    /// Look-back window before match start.
    pub const LOOKBACK_SECS: i64 = 3600;
    /// Resolution of the returned history, in minutes.
    pub const FIDELITY: u32 = 1;
    pub const WORKERS: usize = 10;
    pub const REQUEST_DELAY_MS: u64 = 100;
}

/// Base URLs of every service the crate talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub data_api: String,
    pub gamma_api: String,
    pub clob_api: String,
    pub subgraph: String,
}

impl Endpoints {
    /// Point every service at one base URL. Used against mock servers.
    pub fn single_host(base: &str) -> Self {
        let base = base.trim_end_matches('/').to_string();
        Self {
            data_api: base.clone(),
            gamma_api: base.clone(),
            clob_api: base.clone(),
            subgraph: format!("{base}/subgraph"),
        }
    }

    pub fn trades(&self) -> String {
        format!("{}/trades", self.data_api)
    }

    pub fn closed_positions(&self) -> String {
        format!("{}/closed-positions", self.data_api)
    }

    pub fn active_positions(&self) -> String {
        format!("{}/positions", self.data_api)
    }

    pub fn traded(&self) -> String {
        format!("{}/traded", self.data_api)
    }

    pub fn markets(&self) -> String {
        format!("{}/markets", self.gamma_api)
    }

    pub fn prices_history(&self) -> String {
        format!("{}/prices-history", self.clob_api)
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            data_api: DATA_API_URL.to_string(),
            gamma_api: GAMMA_API_URL.to_string(),
            clob_api: CLOB_API_URL.to_string(),
            subgraph: SUBGRAPH_URL.to_string(),
        }
    }
}

/// Where the CLI reads a user's positions from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSource {
    /// Closed + active REST endpoints through the offset pager.
    Rest,
    /// Positions subgraph, then batched PNL records.
    Subgraph,
}

impl FromStr for PositionSource {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "rest" => Ok(PositionSource::Rest),
            "subgraph" => Ok(PositionSource::Subgraph),
            other => Err(AppError::Config(format!(
                "POSITION_SOURCE must be 'rest' or 'subgraph', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub endpoints: Endpoints,
    pub log_level: String,
    /// Wallet to analyse (USER_ADDRESS). Only the CLI requires it.
    pub user_address: Option<String>,
    pub http_timeout: Duration,
    /// Concurrency gate capacity for trade fetching (SIMULTANEOUS_REQUESTS)
    pub simultaneous_requests: usize,
    /// Market-level task pool (MARKET_WORKERS)
    pub market_workers: usize,
    /// Offset-pager workers for closed positions (CLOSED_POSITION_WORKERS)
    pub closed_position_workers: usize,
    /// Records owned by each bounded pager worker (RECORDS_PER_WORKER)
    pub records_per_worker: u64,
    /// Parallel PNL batch fetches (PNL_WORKERS)
    pub pnl_workers: usize,
    /// Parallel closing-price lookups (PRICE_WORKERS)
    pub price_workers: usize,
    pub position_source: PositionSource,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let endpoints = Endpoints {
            data_api: env_or("DATA_API_URL", DATA_API_URL),
            gamma_api: env_or("GAMMA_API_URL", GAMMA_API_URL),
            clob_api: env_or("CLOB_API_URL", CLOB_API_URL),
            subgraph: env_or("SUBGRAPH_URL", SUBGRAPH_URL),
        };

        Ok(Self {
            endpoints,
            log_level: env_or("LOG_LEVEL", "info"),
            user_address: std::env::var("USER_ADDRESS")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            http_timeout: Duration::from_secs(parse_env("HTTP_TIMEOUT_SECS", HTTP_TIMEOUT_SECS)?),
            simultaneous_requests: non_zero(
                "SIMULTANEOUS_REQUESTS",
                parse_env("SIMULTANEOUS_REQUESTS", market_trades::SIMULTANEOUS_REQUESTS)?,
            )?,
            market_workers: non_zero(
                "MARKET_WORKERS",
                parse_env("MARKET_WORKERS", market_trades::MARKET_WORKERS)?,
            )?,
            closed_position_workers: non_zero(
                "CLOSED_POSITION_WORKERS",
                parse_env("CLOSED_POSITION_WORKERS", pager::CLOSED_POSITION_WORKERS)?,
            )?,
            records_per_worker: parse_env("RECORDS_PER_WORKER", pager::RECORDS_PER_WORKER)?,
            pnl_workers: non_zero("PNL_WORKERS", parse_env("PNL_WORKERS", pnl::WORKERS)?)?,
            price_workers: non_zero(
                "PRICE_WORKERS",
                parse_env("PRICE_WORKERS", price_history::WORKERS)?,
            )?,
            position_source: std::env::var("POSITION_SOURCE")
                .unwrap_or_else(|_| "rest".to_string())
                .parse()?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoints: Endpoints::default(),
            log_level: "info".to_string(),
            user_address: None,
            http_timeout: Duration::from_secs(HTTP_TIMEOUT_SECS),
            simultaneous_requests: market_trades::SIMULTANEOUS_REQUESTS,
            market_workers: market_trades::MARKET_WORKERS,
            closed_position_workers: pager::CLOSED_POSITION_WORKERS,
            records_per_worker: pager::RECORDS_PER_WORKER,
            pnl_workers: pnl::WORKERS,
            price_workers: price_history::WORKERS,
            position_source: PositionSource::Rest,
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{name} must be a number, got '{raw}'"))),
        Err(_) => Ok(default),
    }
}

fn non_zero(name: &str, value: usize) -> Result<usize> {
    if value == 0 {
        return Err(AppError::Config(format!("{name} must be greater than zero")));
    }
    Ok(value)
}
