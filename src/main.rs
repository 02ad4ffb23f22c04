mod config;
mod export;
mod models;
mod pipeline;
mod planner;
mod reshape;
mod scraper;
mod storage;
mod utils;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::AppConfig;
use crate::pipeline::Pipeline;
use crate::storage::{IndicatorCache, PriceCache};

#[derive(Parser)]
#[command(name = "ashare-etl", about = "A-share market data ETL", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Full run: snapshot, incremental backfill, merge & export
    Run,

    /// Rebuild data.json from the caches plus a fresh snapshot (no backfill)
    Export,

    /// Show cache coverage
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "ashare_market_etl=info,warn",
        1 => "ashare_market_etl=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::new(filter))
        .init();

    let config = AppConfig::load()?;

    match cli.command {
        Command::Run => {
            let _t = utils::Timer::start("Full run");
            let stats = Pipeline::new(config).run().await?;
            info!(
                "Done: {} securities, {} price fetches, {} financial fetches, {} exported",
                stats.snapshot_rows,
                stats.prices_fetched,
                stats.financial_fetched,
                stats.exported
            );
        }

        Command::Export => {
            let _t = utils::Timer::start("Export");
            let stats = Pipeline::new(config).export_only().await?;
            info!("Done: {} records exported", stats.exported);
        }

        Command::Stats => {
            let prices = PriceCache::new(&config.cache.price_path).load();
            let indicators = IndicatorCache::new(&config.cache.financial_path).load();
            let covered = IndicatorCache::codes(&indicators);

            let month_span = |first: bool| {
                let mut months: Vec<&String> =
                    prices.values().flat_map(|m| m.periods.keys()).collect();
                months.sort();
                let pick = if first { months.first() } else { months.last() };
                pick.map(|s| s.to_string()).unwrap_or("—".into())
            };

            println!("─────────────────────────────────");
            println!("  A-share ETL — Cache Stats");
            println!("─────────────────────────────────");
            println!("  Price cache      : {} securities", utils::fmt_count(prices.len()));
            println!("  Month range      : {} → {}", month_span(true), month_span(false));
            println!("  Indicator rows   : {}", utils::fmt_count(indicators.len()));
            println!("  Covered codes    : {}", utils::fmt_count(covered.len()));
            println!("─────────────────────────────────");
        }
    }

    Ok(())
}
