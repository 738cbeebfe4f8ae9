use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use tradecore::trading::ProbeStrategy;
use tradecore::{
    MarketDataHub, OrderExecutionEngine, PaperExchange, Settings, SqliteOrderStore, Strategy,
};

/// Candle synchronization and order execution against a paper exchange
#[derive(Parser, Debug)]
#[command(name = "tradecore", version)]
struct Cli {
    /// Settings file (defaults to ./tradecore.toml when present)
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a paper trading session until Ctrl+C
    Run {
        /// Send a probe order every N confirmed candles
        #[arg(long, default_value_t = 1)]
        every: usize,

        /// Probe order size
        #[arg(long, default_value_t = 0.01)]
        qty: f64,

        /// Seconds to wait for a probe order to close before cancelling it
        #[arg(long, default_value_t = 10)]
        close_timeout: u64,
    },

    /// Print persisted order requests as JSON lines, newest first
    Orders {
        /// Look-back window in hours
        #[arg(long, default_value_t = 24)]
        hours: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;

    match cli.command {
        Command::Run {
            every,
            qty,
            close_timeout,
        } => run(settings, every, qty, Duration::from_secs(close_timeout)).await,
        Command::Orders { hours } => list_orders(settings, hours).await,
    }
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tradecore=info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(
    settings: Settings,
    every: usize,
    qty: f64,
    close_timeout: Duration,
) -> anyhow::Result<()> {
    let interval = settings.market.interval()?;

    tracing::info!("Tradecore starting paper session");
    tracing::info!("  Symbols: {:?}", settings.market.symbols);
    tracing::info!("  Interval: {}", interval);
    tracing::info!("  Database: {}", settings.database_url);

    let token = CancellationToken::new();
    let paper = Arc::new(PaperExchange::new(settings.paper.clone()));
    let store = Arc::new(
        SqliteOrderStore::open(&settings.database_url)
            .await
            .context("failed to open order store")?,
    );
    let hub = Arc::new(MarketDataHub::new(
        paper.clone(),
        settings.market.buffer_size,
        token.child_token(),
    ));

    let engine = OrderExecutionEngine::new(
        paper.clone(),
        store.clone(),
        hub.clone(),
        settings.engine_config(),
        token.clone(),
    );
    let mut polling = engine.start()?;

    let strategies: Vec<Box<dyn Strategy>> = settings
        .market
        .symbols
        .iter()
        .map(|symbol| {
            Box::new(
                ProbeStrategy::new(symbol, interval, qty)
                    .with_every(every)
                    .with_close_timeout(close_timeout),
            ) as Box<dyn Strategy>
        })
        .collect();
    engine.add_strategies(strategies).await;

    tracing::info!("Press Ctrl+C to stop...");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        result = &mut polling => {
            tracing::error!("Order execution engine exited: {:?}", result);
        }
    }

    token.cancel();
    if !polling.is_finished() {
        if let Err(e) = polling.await {
            tracing::error!("Order execution engine task failed: {}", e);
        }
    }
    store.close().await;

    tracing::info!("Tradecore stopped");
    Ok(())
}

async fn list_orders(settings: Settings, hours: u64) -> anyhow::Result<()> {
    let store = SqliteOrderStore::open(&settings.database_url)
        .await
        .context("failed to open order store")?;

    let requests = store
        .order_requests_since(Duration::from_secs(hours * 3600))
        .await?;

    for request in &requests {
        println!("{}", serde_json::to_string(request)?);
    }
    tracing::info!("{} order requests in the last {}h", requests.len(), hours);

    store.close().await;
    Ok(())
}
