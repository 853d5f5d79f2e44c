//! Closing line value: volume-weighted pre-market entry price against the reference price at
//! match start, per (condition id, token id).

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tracing::{debug, info};

use crate::types::{CompositeKey, Trade};

/// Per-position inputs. `start_ts` is unix seconds, parsed once before the join.
#[derive(Debug, Clone, PartialEq)]
pub struct ClvInput {
    pub key: CompositeKey,
    pub start_ts: Option<i64>,
    pub closing_price: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClvResult {
    pub avg_entry_price: f64,
    pub closing_price: f64,
    /// `closing - avg_entry`
    pub price_clv: f64,
    /// `1/avg_entry - 1/closing`, with zero denominators contributing 0.
    pub odds_clv: f64,
    /// Pre-market trades that went into the average.
    pub trades: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SkipReason {
    ClosingPriceIsNan,
    NoPreMarketTrades,
    ProcessingError(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::ClosingPriceIsNan => write!(f, "closing_price_is_nan"),
            SkipReason::NoPreMarketTrades => write!(f, "sem_trades_pre_market"),
            SkipReason::ProcessingError(msg) => {
                let short: String = msg.chars().take(50).collect();
                write!(f, "erro_processamento: {short}")
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClvReport {
    pub results: HashMap<CompositeKey, ClvResult>,
    pub reasons: HashMap<CompositeKey, SkipReason>,
    /// Trades whose key matched no position.
    pub unmatched_trades: usize,
}

impl ClvReport {
    /// How many positions were skipped for each reason label.
    pub fn reason_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for reason in self.reasons.values() {
            *counts.entry(reason.to_string()).or_insert(0) += 1;
        }
        counts
    }
}

/// `n / d`, or 0 when `d` is exactly zero.
pub fn safe_divide(n: f64, d: f64) -> f64 {
    if d == 0.0 {
        0.0
    } else {
        n / d
    }
}

/// Millisecond epoch to seconds, floored.
pub fn trade_seconds(timestamp_ms: i64) -> i64 {
    timestamp_ms.div_euclid(1000)
}

/// Join trades to positions and compute CLV for every position key.
///
/// The first input row wins when a key repeats. Positions with no trades at all are still
/// evaluated, so they get a reason rather than silently vanishing. A failure in one key never
/// affects another.
pub fn aggregate(positions: &[ClvInput], trades: &[Trade]) -> ClvReport {
    let mut lookup: HashMap<&CompositeKey, &ClvInput> = HashMap::with_capacity(positions.len());
    for p in positions {
        lookup.entry(&p.key).or_insert(p);
    }

    let mut report = ClvReport::default();
    let mut groups: HashMap<CompositeKey, Vec<&Trade>> = HashMap::new();
    for trade in trades {
        let key = trade.key();
        if lookup.contains_key(&key) {
            groups.entry(key).or_default().push(trade);
        } else {
            report.unmatched_trades += 1;
        }
    }

    for (key, input) in lookup {
        let group = groups.get(key).map(Vec::as_slice).unwrap_or(&[]);
        match evaluate(input, group) {
            Ok(result) => {
                report.results.insert(key.clone(), result);
            }
            Err(reason) => {
                debug!(key = %key, reason = %reason, "CLV skipped");
                report.reasons.insert(key.clone(), reason);
            }
        }
    }

    info!(
        positions = positions.len(),
        calculated = report.results.len(),
        skipped = report.reasons.len(),
        unmatched_trades = report.unmatched_trades,
        "CLV aggregation complete"
    );
    report
}

/// CLV for one position from its trade group.
pub fn evaluate(input: &ClvInput, trades: &[&Trade]) -> Result<ClvResult, SkipReason> {
    let closing_price = match input.closing_price {
        Some(p) if !p.is_nan() => p,
        _ => return Err(SkipReason::ClosingPriceIsNan),
    };
    let start_ts = input
        .start_ts
        .ok_or_else(|| SkipReason::ProcessingError("position has no start time".to_string()))?;

    let mut total_size = 0.0;
    let mut notional = 0.0;
    let mut count = 0usize;
    for trade in trades {
        let ts = trade
            .timestamp
            .ok_or_else(|| SkipReason::ProcessingError("trade without timestamp".to_string()))?;
        if trade_seconds(ts) >= start_ts {
            continue;
        }
        let price = trade
            .price
            .ok_or_else(|| SkipReason::ProcessingError("trade without numeric price".to_string()))?;
        let size = trade
            .size
            .ok_or_else(|| SkipReason::ProcessingError("trade without numeric size".to_string()))?;
        total_size += size;
        notional += size * price;
        count += 1;
    }

    if total_size == 0.0 {
        return Err(SkipReason::NoPreMarketTrades);
    }

    let avg_entry_price = notional / total_size;
    if !avg_entry_price.is_finite() {
        return Err(SkipReason::ProcessingError(format!(
            "average entry price is not finite ({avg_entry_price})"
        )));
    }

    Ok(ClvResult {
        avg_entry_price,
        closing_price,
        price_clv: closing_price - avg_entry_price,
        odds_clv: safe_divide(1.0, avg_entry_price) - safe_divide(1.0, closing_price),
        trades: count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(cond: &str, asset: &str, price: f64, size: f64, ts_ms: i64) -> Trade {
        Trade {
            condition_id: cond.to_string(),
            asset: asset.to_string(),
            price: Some(price),
            size: Some(size),
            timestamp: Some(ts_ms),
            side: Some("BUY".to_string()),
            market_id: cond.to_string(),
        }
    }

    fn input(cond: &str, asset: &str, start_ts: i64, closing: Option<f64>) -> ClvInput {
        ClvInput {
            key: CompositeKey::new(cond, asset),
            start_ts: Some(start_ts),
            closing_price: closing,
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-3
    }

    #[test]
    fn volume_weighted_example() {
        let trades = vec![trade("c", "t", 0.40, 100.0, 10_000), trade("c", "t", 0.60, 50.0, 20_000)];
        let report = aggregate(&[input("c", "t", 30, Some(0.55))], &trades);

        let r = report.results[&CompositeKey::new("c", "t")];
        assert!(close(r.avg_entry_price, 0.4667), "{}", r.avg_entry_price);
        assert!(close(r.price_clv, 0.0833), "{}", r.price_clv);
        assert!(close(r.odds_clv, 0.325), "{}", r.odds_clv);
        assert_eq!(r.trades, 2);
        assert!(report.reasons.is_empty());
    }

    #[test]
    fn trades_at_or_after_start_are_ignored() {
        let trades = vec![
            trade("c", "t", 0.50, 10.0, 29_999),
            // 30_000 ms floors to 30, not strictly before start
            trade("c", "t", 0.90, 1_000.0, 30_000),
            trade("c", "t", 0.10, 1_000.0, 45_000),
        ];
        let r = aggregate(&[input("c", "t", 30, Some(0.6))], &trades).results[&CompositeKey::new("c", "t")];
        assert_eq!(r.avg_entry_price, 0.5);
        assert_eq!(r.trades, 1);
    }

    #[test]
    fn only_post_start_trades_is_a_skip_not_a_zero() {
        let trades = vec![trade("c", "t", 0.4, 10.0, 50_000)];
        let report = aggregate(&[input("c", "t", 30, Some(0.5))], &trades);
        assert!(report.results.is_empty());
        assert_eq!(report.reasons[&CompositeKey::new("c", "t")], SkipReason::NoPreMarketTrades);
        assert_eq!(report.reason_counts()["sem_trades_pre_market"], 1);
    }

    #[test]
    fn position_without_any_trades_gets_a_reason() {
        let report = aggregate(&[input("c", "t", 30, Some(0.5)), input("d", "u", 30, None)], &[]);
        assert_eq!(report.reasons[&CompositeKey::new("c", "t")], SkipReason::NoPreMarketTrades);
        assert_eq!(report.reasons[&CompositeKey::new("d", "u")], SkipReason::ClosingPriceIsNan);
    }

    #[test]
    fn nan_closing_price_is_checked_first() {
        let trades = vec![trade("c", "t", 0.4, 10.0, 1_000)];
        let report = aggregate(&[input("c", "t", 30, Some(f64::NAN))], &trades);
        assert_eq!(report.reasons[&CompositeKey::new("c", "t")], SkipReason::ClosingPriceIsNan);
        assert_eq!(report.reason_counts()["closing_price_is_nan"], 1);
    }

    #[test]
    fn bad_trade_fails_only_its_own_key() {
        let mut broken = trade("c", "t", 0.4, 10.0, 1_000);
        broken.price = None;
        let trades = vec![broken, trade("d", "u", 0.5, 10.0, 1_000)];
        let report = aggregate(&[input("c", "t", 30, Some(0.5)), input("d", "u", 30, Some(0.5))], &trades);

        let reason = &report.reasons[&CompositeKey::new("c", "t")];
        assert!(matches!(reason, SkipReason::ProcessingError(_)));
        assert!(reason.to_string().starts_with("erro_processamento: "));
        assert!(report.results.contains_key(&CompositeKey::new("d", "u")));
    }

    #[test]
    fn unmatched_trades_are_skipped() {
        let trades = vec![trade("c", "t", 0.4, 10.0, 1_000), trade("x", "y", 0.4, 10.0, 1_000)];
        let report = aggregate(&[input("c", "t", 30, Some(0.5))], &trades);
        assert_eq!(report.unmatched_trades, 1);
        assert_eq!(report.results.len(), 1);
    }

    #[test]
    fn zero_closing_price_uses_safe_division() {
        let trades = vec![trade("c", "t", 0.5, 10.0, 1_000)];
        let r = aggregate(&[input("c", "t", 30, Some(0.0))], &trades).results[&CompositeKey::new("c", "t")];
        assert_eq!(r.odds_clv, 2.0);
        assert_eq!(r.price_clv, -0.5);
    }

    #[test]
    fn duplicate_position_rows_use_the_first() {
        let trades = vec![trade("c", "t", 0.5, 10.0, 1_000)];
        let positions = [input("c", "t", 30, Some(0.7)), input("c", "t", 30, Some(0.1))];
        let r = aggregate(&positions, &trades).results[&CompositeKey::new("c", "t")];
        assert_eq!(r.closing_price, 0.7);
    }

    #[test]
    fn long_error_messages_are_truncated() {
        let reason = SkipReason::ProcessingError("x".repeat(80));
        assert_eq!(reason.to_string(), format!("erro_processamento: {}", "x".repeat(50)));
    }

    #[test]
    fn millisecond_timestamps_floor() {
        assert_eq!(trade_seconds(1_700_000_000_999), 1_700_000_000);
        assert_eq!(trade_seconds(-1), -1);
        assert_eq!(safe_divide(1.0, 0.0), 0.0);
        assert_eq!(safe_divide(1.0, 4.0), 0.25);
    }
}
