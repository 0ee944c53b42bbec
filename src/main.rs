use std::path::PathBuf;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gapbot::config::{AppConfig, Mode};
use gapbot::engine;

// ============================================================
// Entry point: load config, pick a mode, run until stopped
// ============================================================

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let config_path = std::env::var("GAPBOT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.txt"));
    let cfg = AppConfig::load(Some(&config_path))?;

    info!(
        mode = cfg.mode.as_str(),
        symbol = %cfg.symbol,
        interval = %cfg.interval,
        "starting gapbot"
    );

    match cfg.mode {
        Mode::Live => engine::run_live(cfg).await?,
        Mode::Backtest => {
            let report = engine::run_backtest(cfg).await?;
            println!(
                "backtest: {} trades, {} wins / {} losses ({:.1}% win rate), balance {:.2} -> {:.2}",
                report.trades,
                report.wins,
                report.losses,
                report.win_rate() * 100.0,
                report.starting_balance,
                report.final_balance,
            );
        }
    }

    Ok(())
}
