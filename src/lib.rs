pub mod backoff;
pub mod clv;
pub mod config;
pub mod error;
pub mod http;
pub mod market_trades;
pub mod metadata;
pub mod pager;
pub mod pipeline;
pub mod pnl;
pub mod price_history;
pub mod progress;
pub mod subgraph;
pub mod types;

pub use error::{AppError, Result};
