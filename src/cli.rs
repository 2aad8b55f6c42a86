use crate::config::Settings;
use crate::database::{CandleRepository, MemoryRepository, PostgresRepository};
use crate::exchange::connector_for;
use crate::ingest::{stream_market, sweep_markets, Supervisor};
use crate::market::{Asset, Exchange, Market, TimeFrame};
use crate::model::{Candle, CarryState};
use crate::utils::retry;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "market-data-ingestor")]
#[command(about = "Candle ingestion for Binance and Bybit", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full service: stream every market and keep history filled
    Run,

    /// Crawl historical klines once and exit
    Backfill {
        /// Restrict to one exchange (e.g. "binance")
        #[arg(short, long)]
        exchange: Option<String>,

        /// Restrict to one asset (e.g. "BTCUSDT")
        #[arg(short, long)]
        asset: Option<String>,

        /// Restrict to one interval (e.g. "1h")
        #[arg(short, long)]
        interval: Option<String>,

        /// Fetch and parse everything but keep rows in memory
        #[arg(long)]
        dry_run: bool,
    },

    /// Stream one market into the database
    Stream {
        /// Exchange (e.g. "bybit")
        #[arg(short, long)]
        exchange: String,

        /// Asset (e.g. "ETHUSDT")
        #[arg(short, long)]
        asset: String,

        /// Interval (e.g. "5m")
        #[arg(short, long)]
        interval: String,
    },

    /// Load candles from a kline CSV export
    ImportCsv {
        /// Input file
        #[arg(short, long)]
        file: PathBuf,

        /// Exchange the rows belong to
        #[arg(short, long)]
        exchange: String,

        /// Asset the rows belong to
        #[arg(short, long)]
        asset: String,

        /// Interval the rows belong to
        #[arg(short, long)]
        interval: String,
    },

    /// Create database tables and indexes
    InitDb,
}

/// Execute a parsed command against the loaded settings.
pub async fn execute_command(command: Commands, settings: Settings) -> Result<()> {
    match command {
        Commands::Run => run_service(settings).await,
        Commands::Backfill {
            exchange,
            asset,
            interval,
            dry_run,
        } => run_backfill(settings, exchange, asset, interval, dry_run).await,
        Commands::Stream {
            exchange,
            asset,
            interval,
        } => run_single_stream(settings, exchange, asset, interval).await,
        Commands::ImportCsv {
            file,
            exchange,
            asset,
            interval,
        } => import_csv(settings, file, exchange, asset, interval).await,
        Commands::InitDb => init_db(settings).await,
    }
}

/// Open the configured Postgres pool behind the repository trait.
async fn connect_repository(settings: &Settings) -> Result<Arc<dyn CandleRepository>> {
    let repository = PostgresRepository::connect(&settings.database).await?;
    Ok(Arc::new(repository))
}

/// Narrow the full grid down to whatever filters were given.
fn select_markets(
    exchange: Option<&str>,
    asset: Option<&str>,
    interval: Option<&str>,
) -> Result<Vec<Market>> {
    let exchange = exchange.map(str::parse::<Exchange>).transpose()?;
    let asset = asset.map(str::parse::<Asset>).transpose()?;
    let interval = interval.map(str::parse::<TimeFrame>).transpose()?;

    let markets: Vec<Market> = Market::all()
        .into_iter()
        .filter(|m| exchange.map_or(true, |e| m.exchange == e))
        .filter(|m| asset.map_or(true, |a| m.asset == a))
        .filter(|m| interval.map_or(true, |i| m.time_frame == i))
        .collect();

    if markets.is_empty() {
        bail!("no market matches the given filters");
    }
    Ok(markets)
}

async fn run_service(settings: Settings) -> Result<()> {
    let repository = connect_repository(&settings).await?;
    repository.init_tables().await?;

    let supervisor = Supervisor::new(
        Arc::clone(&repository),
        settings.retry.policy(),
        settings.binance_source,
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut supervisor_task = tokio::spawn(supervisor.run(shutdown_rx));

    tokio::select! {
        result = &mut supervisor_task => result??,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
            supervisor_task.await??;
        }
    }
    Ok(())
}

async fn run_backfill(
    settings: Settings,
    exchange: Option<String>,
    asset: Option<String>,
    interval: Option<String>,
    dry_run: bool,
) -> Result<()> {
    let markets = select_markets(exchange.as_deref(), asset.as_deref(), interval.as_deref())?;
    let policy = settings.retry.policy();

    if dry_run {
        let repository = Arc::new(MemoryRepository::new());
        sweep_markets(
            Arc::clone(&repository) as Arc<dyn CandleRepository>,
            policy,
            settings.binance_source,
            &markets,
        )
        .await;
        println!(
            "Dry run complete: {} candles, {} return rows (not persisted)",
            repository.candle_count(),
            repository.derived_count()
        );
        return Ok(());
    }

    let repository = connect_repository(&settings).await?;
    repository.init_tables().await?;
    sweep_markets(repository, policy, settings.binance_source, &markets).await;
    Ok(())
}

async fn run_single_stream(
    settings: Settings,
    exchange: String,
    asset: String,
    interval: String,
) -> Result<()> {
    let market = Market::new(exchange.parse()?, asset.parse()?, interval.parse()?);
    let repository = connect_repository(&settings).await?;
    repository.init_tables().await?;

    let connector = connector_for(market.exchange)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut task = tokio::spawn(stream_market(
        connector,
        repository,
        settings.retry.policy(),
        market,
        shutdown_rx,
    ));

    tokio::select! {
        result = &mut task => result??,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
            task.await??;
        }
    }
    Ok(())
}

/// One-shot bulk load of an exchange kline CSV export. The whole file is
/// parsed before anything is written, so a bad row aborts the import
/// with nothing persisted.
async fn import_csv(
    settings: Settings,
    file: PathBuf,
    exchange: String,
    asset: String,
    interval: String,
) -> Result<()> {
    let exchange: Exchange = exchange.parse()?;
    let asset: Asset = asset.parse()?;
    let interval: TimeFrame = interval.parse()?;

    let text = std::fs::read_to_string(&file)
        .with_context(|| format!("could not read {}", file.display()))?;

    let mut carry = CarryState::default();
    let mut candles = Vec::new();
    let mut metrics = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let candle = Candle::from_csv_kline(exchange, asset, interval, line)
            .with_context(|| format!("{}:{}", file.display(), number + 1))?;
        metrics.push(carry.observe(&candle));
        candles.push(candle);
    }

    let repository = connect_repository(&settings).await?;
    repository.init_tables().await?;
    let policy = settings.retry.policy();
    retry(&policy, "candle batch upsert", || {
        repository.upsert_candles(&candles)
    })
    .await?;
    retry(&policy, "derived batch upsert", || {
        repository.upsert_derived(&metrics)
    })
    .await?;

    println!("Imported {} candles from {}", candles.len(), file.display());
    Ok(())
}

async fn init_db(settings: Settings) -> Result<()> {
    let repository = connect_repository(&settings).await?;
    repository.init_tables().await?;
    println!("Database tables are ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_filters_narrow_the_grid() {
        let all = select_markets(None, None, None).unwrap();
        assert_eq!(all.len(), Market::all().len());

        let binance = select_markets(Some("binance"), None, None).unwrap();
        assert!(binance.iter().all(|m| m.exchange == Exchange::Binance));
        assert_eq!(binance.len(), all.len() / 2);

        let one = select_markets(Some("bybit"), Some("ETHUSDT"), Some("4h")).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].asset, Asset::EthUsdt);
        assert_eq!(one[0].time_frame, TimeFrame::H4);

        assert!(select_markets(Some("kraken"), None, None).is_err());
        assert!(select_markets(None, Some("DOGEUSDT"), None).is_err());
    }
}
