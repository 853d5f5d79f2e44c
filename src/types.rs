use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Join key
// ---------------------------------------------------------------------------

/// (condition id, token id) pair that joins positions, trades and prices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompositeKey {
    pub condition_id: String,
    pub asset: String,
}

impl CompositeKey {
    pub fn new(condition_id: impl Into<String>, asset: impl Into<String>) -> Self {
        Self {
            condition_id: condition_id.into(),
            asset: asset.into(),
        }
    }
}

impl std::fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.condition_id, self.asset)
    }
}

impl Serialize for CompositeKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ---------------------------------------------------------------------------
// Subgraph positions
// ---------------------------------------------------------------------------

/// One `userBalances` row from the positions subgraph, flattened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: String,
    pub user: String,
    /// Raw balance as the subgraph returns it. `"0"` means closed.
    pub balance: String,
    pub token_id: Option<String>,
    pub condition_id: Option<String>,
    pub outcome_index: Option<String>,
}

impl Position {
    pub fn is_closed(&self) -> bool {
        self.balance == "0"
    }

    pub fn status(&self) -> PositionStatus {
        if self.is_closed() {
            PositionStatus::Closed
        } else {
            PositionStatus::Active
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Active,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PositionStatus::Active => "active",
            PositionStatus::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// REST positions
// ---------------------------------------------------------------------------

/// A position (or PNL) row from the data API.
///
/// Only the join fields are typed; everything else the endpoint returns is kept in `extra`
/// and written back out unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPosition {
    #[serde(default, deserialize_with = "lenient_string")]
    pub condition_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub asset: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub slug: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserPosition {
    pub fn key(&self) -> CompositeKey {
        CompositeKey::new(&self.condition_id, &self.asset)
    }
}

/// Market-level metadata joined onto positions by slug.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketMeta {
    pub tags: Vec<String>,
    /// ISO-8601 game start, used as the CLV reference instant.
    pub start_time: Option<String>,
    pub volume: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedPosition {
    #[serde(flatten)]
    pub position: UserPosition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PositionStatus>,
    #[serde(flatten)]
    pub meta: MarketMeta,
}

impl EnrichedPosition {
    pub fn key(&self) -> CompositeKey {
        self.position.key()
    }
}

// ---------------------------------------------------------------------------
// Trades and prices
// ---------------------------------------------------------------------------

/// A trade from the data API `/trades` endpoint.
///
/// Numeric fields are parsed leniently (numbers or numeric strings); anything unparseable
/// becomes `None` and is reported by the CLV aggregator instead of failing the whole page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    #[serde(default, deserialize_with = "lenient_string")]
    pub condition_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub asset: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub size: Option<f64>,
    /// Epoch milliseconds.
    #[serde(default, deserialize_with = "lenient_i64")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<String>,
    /// Market the trade was requested for. Set by the fetcher, not the server.
    #[serde(default)]
    pub market_id: String,
}

impl Trade {
    /// Falls back to the requested market id when the payload does not echo a condition id.
    pub fn key(&self) -> CompositeKey {
        let condition_id = if self.condition_id.is_empty() {
            &self.market_id
        } else {
            &self.condition_id
        };
        CompositeKey::new(condition_id, &self.asset)
    }
}

/// One point of a `prices-history` series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceEntry {
    /// Unix seconds.
    pub t: i64,
    /// Price in [0, 1].
    pub p: f64,
}

// ---------------------------------------------------------------------------
// Lenient fields
// ---------------------------------------------------------------------------

/// `null` reads as empty; numeric ids are kept as their decimal text.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let v: Option<Value> = Deserialize::deserialize(deserializer)?;
    Ok(match v {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    })
}

pub(crate) fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|f| f.is_finite())
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v: Option<Value> = Deserialize::deserialize(deserializer)?;
    Ok(v.as_ref().and_then(value_as_f64))
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v: Option<Value> = Deserialize::deserialize(deserializer)?;
    Ok(v.as_ref().and_then(|v| match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.floor() as i64)),
        other => value_as_f64(other).map(|f| f.floor() as i64),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_join_fields_do_not_fail_the_row() {
        let pos: UserPosition = serde_json::from_value(json!({
            "conditionId": null,
            "asset": 12345,
            "slug": null,
            "realizedPnl": 3.5
        }))
        .unwrap();
        assert_eq!(pos.condition_id, "");
        assert_eq!(pos.asset, "12345");
        assert_eq!(pos.slug, "");
        assert_eq!(pos.extra["realizedPnl"], 3.5);

        let trade: Trade = serde_json::from_value(json!({"conditionId": null, "asset": null, "price": 0.5})).unwrap();
        assert_eq!(trade.condition_id, "");
        assert_eq!(trade.asset, "");
    }

    #[test]
    fn composite_key_formats_with_underscore() {
        let key = CompositeKey::new("0xcond", "123");
        assert_eq!(key.to_string(), "0xcond_123");
        assert_eq!(serde_json::to_value(&key).unwrap(), json!("0xcond_123"));
    }

    #[test]
    fn zero_balance_is_closed() {
        let mut pos = Position {
            id: "1".into(),
            user: "0xu".into(),
            balance: "0".into(),
            token_id: Some("t".into()),
            condition_id: Some("c".into()),
            outcome_index: Some("0".into()),
        };
        assert!(pos.is_closed());
        assert_eq!(pos.status(), PositionStatus::Closed);
        pos.balance = "1500000".into();
        assert!(!pos.is_closed());
        pos.balance = "0.0".into();
        assert_eq!(pos.status(), PositionStatus::Active);
    }

    #[test]
    fn trade_parses_numeric_strings_and_keeps_garbage_as_none() {
        let trade: Trade = serde_json::from_value(json!({
            "conditionId": "0xc",
            "asset": "42",
            "price": "0.41",
            "size": 12,
            "timestamp": 1_700_000_000_123i64,
            "side": "BUY"
        }))
        .unwrap();
        assert_eq!(trade.price, Some(0.41));
        assert_eq!(trade.size, Some(12.0));
        assert_eq!(trade.timestamp, Some(1_700_000_000_123));

        let broken: Trade = serde_json::from_value(json!({"asset": "42", "price": "n/a"})).unwrap();
        assert_eq!(broken.price, None);
        assert_eq!(broken.size, None);
        assert_eq!(broken.timestamp, None);
    }

    #[test]
    fn trade_key_falls_back_to_requested_market() {
        let trade: Trade = serde_json::from_value(json!({"asset": "7", "price": 0.5, "size": 1})).unwrap();
        let tagged = Trade {
            market_id: "0xmarket".into(),
            ..trade
        };
        assert_eq!(tagged.key(), CompositeKey::new("0xmarket", "7"));
    }

    #[test]
    fn user_position_keeps_unknown_fields() {
        let raw = json!({
            "conditionId": "0xc",
            "asset": "9",
            "slug": "lakers-vs-celtics",
            "realizedPnl": 12.5,
            "title": "Lakers vs Celtics"
        });
        let pos: UserPosition = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(pos.key(), CompositeKey::new("0xc", "9"));
        assert_eq!(pos.extra.get("realizedPnl"), Some(&json!(12.5)));
        assert_eq!(serde_json::to_value(&pos).unwrap(), raw);
    }

    #[test]
    fn enriched_position_flattens_metadata() {
        let position: UserPosition =
            serde_json::from_value(json!({"conditionId": "0xc", "asset": "9", "slug": "s"})).unwrap();
        let enriched = EnrichedPosition {
            position,
            status: Some(PositionStatus::Closed),
            meta: MarketMeta {
                tags: vec!["NBA".into()],
                start_time: Some("2025-10-26T18:45:00Z".into()),
                volume: Some(1000.0),
            },
        };
        let out = serde_json::to_value(&enriched).unwrap();
        assert_eq!(out["status"], "closed");
        assert_eq!(out["tags"], json!(["NBA"]));
        assert_eq!(out["start_time"], "2025-10-26T18:45:00Z");
        assert_eq!(out["slug"], "s");
    }
}
