//! Cursor (skip) pagination over the positions subgraph.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::backoff::pause;
use crate::config;
use crate::http::Transport;
use crate::progress::Progress;
use crate::types::Position;

/// Every balance the user has ever held.
pub const POSITIONS_QUERY: &str = r#"
query GetUserPositions($userAddress: String!, $first: Int!, $skip: Int!) {
  userBalances(
    where: { user: $userAddress }
    first: $first
    skip: $skip
    orderBy: balance
    orderDirection: desc
  ) {
    id
    user
    balance
    asset {
      id
      condition {
        id
      }
      outcomeIndex
    }
  }
}
"#;

/// Zero balances only.
pub const CLOSED_POSITIONS_QUERY: &str = r#"
query GetUserPositions($userAddress: String!, $first: Int!, $skip: Int!) {
  userBalances(
    where: { user: $userAddress, balance: "0" }
    first: $first
    skip: $skip
    orderBy: balance
    orderDirection: desc
  ) {
    id
    user
    balance
    asset {
      id
      condition {
        id
      }
      outcomeIndex
    }
  }
}
"#;

#[derive(Debug, Clone, PartialEq)]
pub enum GraphPage {
    Positions(Vec<Position>),
    /// Transport error, non-2xx status, or a GraphQL `errors`/`error` body.
    Error(String),
}

#[derive(Debug, Clone, Default)]
pub struct GraphFetch {
    pub positions: Vec<Position>,
    pub pages: usize,
    /// Set when pagination ended on a failed page rather than a short one.
    /// The positions collected up to that point are still returned.
    pub stopped_on_error: Option<String>,
}

pub struct GraphPager {
    transport: Arc<dyn Transport>,
    endpoint: String,
    query: &'static str,
    page_size: usize,
    page_delay: Duration,
    progress: Progress,
}

impl GraphPager {
    pub fn new(transport: Arc<dyn Transport>, endpoint: impl Into<String>) -> Self {
        Self {
            transport,
            endpoint: endpoint.into(),
            query: POSITIONS_QUERY,
            page_size: config::subgraph::PAGE_SIZE,
            page_delay: Duration::from_millis(config::subgraph::PAGE_DELAY_MS),
            progress: Progress::disabled(),
        }
    }

    pub fn with_query(mut self, query: &'static str) -> Self {
        self.query = query;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_page_delay(mut self, page_delay: Duration) -> Self {
        self.page_delay = page_delay;
        self
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    pub async fn fetch_page(&self, user: &str, skip: usize) -> GraphPage {
        let payload = json!({
            "query": self.query,
            "variables": {
                "userAddress": user,
                "first": self.page_size,
                "skip": skip,
            }
        });

        let resp = match self.transport.post_json(&self.endpoint, &payload).await {
            Ok(resp) => resp,
            Err(e) => return GraphPage::Error(e.to_string()),
        };
        if !resp.is_success() {
            return GraphPage::Error(format!("HTTP {}", resp.status));
        }
        parse_positions(resp.body)
    }

    /// Page with `skip` until a short page. A failed page also ends pagination; it is recorded
    /// in `stopped_on_error` instead of being mistaken for the end of data.
    pub async fn fetch_all_positions(&self, user: &str) -> GraphFetch {
        let mut out = GraphFetch::default();
        let mut skip = 0usize;

        loop {
            self.progress.publish(format!(
                "Fetching subgraph positions (page {}, total {})",
                out.pages + 1,
                out.positions.len()
            ));

            let batch = match self.fetch_page(user, skip).await {
                GraphPage::Positions(batch) => batch,
                GraphPage::Error(e) => {
                    warn!(skip, collected = out.positions.len(), error = %e, "Subgraph page failed, stopping pagination");
                    out.stopped_on_error = Some(e);
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }

            let returned = batch.len();
            out.positions.extend(batch);
            out.pages += 1;
            debug!(skip, returned, "subgraph page");

            if returned < self.page_size {
                break;
            }
            skip += self.page_size;
            pause(self.page_delay).await;
        }

        info!(positions = out.positions.len(), pages = out.pages, "Subgraph positions collected");
        out
    }
}

/// `(active, closed)`: a balance of exactly `"0"` is closed, anything else is active.
pub fn split_positions(positions: Vec<Position>) -> (Vec<Position>, Vec<Position>) {
    positions.into_iter().partition(|p| !p.is_closed())
}

#[derive(Deserialize)]
struct RawBalance {
    #[serde(default)]
    id: String,
    #[serde(default)]
    user: String,
    balance: Option<Value>,
    asset: Option<RawAsset>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAsset {
    id: Option<String>,
    condition: Option<RawCondition>,
    outcome_index: Option<Value>,
}

#[derive(Deserialize)]
struct RawCondition {
    id: Option<String>,
}

fn scalar_string(v: Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_positions(body: Value) -> GraphPage {
    if let Some(errors) = body.get("errors").or_else(|| body.get("error")) {
        return GraphPage::Error(errors.to_string());
    }
    let rows = match body.pointer("/data/userBalances") {
        Some(rows) => rows.clone(),
        None => return GraphPage::Positions(Vec::new()),
    };
    let raw: Vec<RawBalance> = match serde_json::from_value(rows) {
        Ok(raw) => raw,
        Err(e) => return GraphPage::Error(format!("malformed userBalances: {e}")),
    };

    let positions = raw
        .into_iter()
        .map(|r| {
            let asset = r.asset;
            Position {
                id: r.id,
                user: r.user,
                balance: r.balance.and_then(scalar_string).unwrap_or_else(|| "0".to_string()),
                token_id: asset.as_ref().and_then(|a| a.id.clone()),
                condition_id: asset.as_ref().and_then(|a| a.condition.as_ref()).and_then(|c| c.id.clone()),
                outcome_index: asset.and_then(|a| a.outcome_index).and_then(scalar_string),
            }
        })
        .collect();
    GraphPage::Positions(positions)
}
