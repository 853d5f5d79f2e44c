use std::io::Write;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use polymarket_clv::config::{Config, PositionSource};
use polymarket_clv::error::{AppError, Result};
use polymarket_clv::pipeline::Pipeline;
use polymarket_clv::progress::{spawn_log_display, Progress};
use polymarket_clv::types::PositionStatus;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    let user = cfg
        .user_address
        .clone()
        .ok_or_else(|| AppError::Config("USER_ADDRESS is required".to_string()))?;

    let (progress, rx) = Progress::channel("Starting");
    let display = spawn_log_display(rx);
    let pipeline = Pipeline::from_config(&cfg)?.with_progress(progress);

    if let Some(traded) = pipeline.traded_count(&user).await {
        info!(user = %user, traded, "Markets traded");
    }

    let positions = match cfg.position_source {
        PositionSource::Rest => pipeline.fetch_all_positions(&user).await,
        PositionSource::Subgraph => pipeline.positions_from_subgraph(&user, PositionStatus::Closed).await,
    };
    info!(source = ?cfg.position_source, positions = positions.len(), "Positions collected");

    let outcome = pipeline.calculate_clv(&user, positions).await?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for row in &outcome.rows {
        serde_json::to_writer(&mut out, row)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;

    for (reason, count) in &outcome.reason_counts {
        info!(count, "Skipped: {reason}");
    }
    if !outcome.failed_markets.is_empty() {
        warn!(
            markets = outcome.failed_markets.len(),
            "Trades missing for permanently failed markets: {:?}", outcome.failed_markets
        );
    }
    info!(
        rows = outcome.rows.len(),
        calculated = outcome.calculated(),
        unmatched_trades = outcome.unmatched_trades,
        "Done"
    );
    pipeline.log_latency_summary();

    drop(pipeline);
    display.abort();
    Ok(())
}
