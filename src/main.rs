use chrono::Utc;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

use polybot::api::clob::{ClobClient, Exchange};
use polybot::api::gamma::{GammaClient, MarketFeed, PriceHistory};
use polybot::config::{load_config, BotConfig, TradingConfig};
use polybot::db::{PostgresStore, TradeStore};
use polybot::execution::{PositionManager, PositionMonitor, TickOutcome};
use polybot::history::{record_recent_candles, IntegrityPipeline};
use polybot::notify::{Notifier, TracingNotifier};
use polybot::presets::{parse_selector, MonitorPreset};
use polybot::risk::TradeLimits;
use polybot::Result;

/// Windowed up/down trading bot for a CLOB prediction exchange
#[derive(Parser)]
#[command(name = "polybot")]
struct Args {
    /// Optional TOML config file; environment variables override it
    #[arg(long)]
    config: Option<String>,

    /// Run the history integrity pass for every preset, then exit
    #[arg(long)]
    reconcile_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    let presets = resolve_presets(&config)?;

    tracing::info!("🚀 polybot starting with {} preset(s)", presets.len());
    for preset in &presets {
        tracing::info!("  - {} ({})", preset.display_name(), preset.series_slug);
    }

    let store: Arc<dyn TradeStore> = Arc::new(PostgresStore::new(&config.database_url).await?);
    let exchange: Arc<dyn Exchange> = Arc::new(ClobClient::new(&config.exchange)?);
    let gamma = Arc::new(GammaClient::new(&config.exchange)?);
    let feed: Arc<dyn MarketFeed> = gamma.clone();
    let prices: Arc<dyn PriceHistory> = gamma;
    let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);

    let pipeline = Arc::new(IntegrityPipeline::new(
        store.clone(),
        prices.clone(),
        notifier.clone(),
    ));

    // Startup integrity pass before any trading decision
    for preset in &presets {
        record_candles_quietly(
            store.as_ref(),
            prices.as_ref(),
            preset,
            config.trading.reconcile_lookback_windows,
        )
        .await;
        pipeline.reconcile(preset, Utc::now()).await;
    }
    if args.reconcile_only {
        tracing::info!("Reconcile-only run complete");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    for preset in presets.clone() {
        let persisted = store.load_positions(&preset.series_slug).await?;
        let manager = PositionManager::with_positions(&preset.series_slug, persisted);
        let mut monitor = PositionMonitor::new(
            preset.clone(),
            config.trading.clone(),
            TradeLimits::from(&config.limits),
            exchange.clone(),
            feed.clone(),
            store.clone(),
            notifier.clone(),
            manager,
        );

        // Resolve anything the previous process left in flight before
        // the first tick
        if let Err(e) = monitor.recover(Utc::now()).await {
            tracing::error!(
                "Recovery for {} failed (continuing): {}",
                preset.series_slug,
                e
            );
        }

        let store = store.clone();
        let prices = prices.clone();
        let trading = config.trading.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            trading_loop(monitor, store, prices, trading, shutdown).await;
        }));
    }

    {
        let pipeline = pipeline.clone();
        let presets = presets.clone();
        let store = store.clone();
        let prices = prices.clone();
        let trading = config.trading.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            reconcile_loop(pipeline, presets, store, prices, trading, shutdown).await;
        }));
    }

    tracing::info!("✅ All loops running; press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("⚠️  Shutdown requested; letting in-flight work finish...");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }

    tracing::info!("👋 polybot stopped");
    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "polybot=info".into()),
        )
        .init();
}

fn resolve_presets(config: &BotConfig) -> Result<Vec<MonitorPreset>> {
    let mut presets = Vec::new();
    for selector in &config.presets {
        let preset = parse_selector(selector)
            .ok_or_else(|| format!("Unknown preset selector: {}", selector))?;
        presets.push(preset);
    }
    Ok(presets)
}

/// One monitor, one loop. The shutdown check only interrupts the wait for
/// the next tick; a tick in progress always finishes its exchange calls,
/// and the next start reconciles whatever was cut short.
async fn trading_loop(
    mut monitor: PositionMonitor,
    store: Arc<dyn TradeStore>,
    prices: Arc<dyn PriceHistory>,
    trading: TradingConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let slug = monitor.preset().series_slug.clone();
    let mut ticker = interval_at(
        Instant::now(),
        Duration::from_secs(trading.tick_interval_seconds.max(1)),
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!("💹 Trading loop for {} starting", slug);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                tracing::info!("Trading loop for {} stopping", slug);
                break;
            }
        }

        let now = Utc::now();
        record_candles_quietly(store.as_ref(), prices.as_ref(), monitor.preset(), 2).await;

        match monitor.tick(now).await {
            Ok(TickOutcome::NoAction) => {}
            Ok(outcome) => tracing::info!(preset = %slug, "tick: {:?}", outcome),
            Err(e) => tracing::error!(preset = %slug, "tick failed: {}", e),
        }
    }
}

async fn reconcile_loop(
    pipeline: Arc<IntegrityPipeline>,
    presets: Vec<MonitorPreset>,
    store: Arc<dyn TradeStore>,
    prices: Arc<dyn PriceHistory>,
    trading: TradingConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(
        Instant::now() + Duration::from_secs(trading.reconcile_interval_seconds),
        Duration::from_secs(trading.reconcile_interval_seconds.max(1)),
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!("🧾 Reconcile loop starting");
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                tracing::info!("Reconcile loop stopping");
                break;
            }
        }

        for preset in &presets {
            record_candles_quietly(
                store.as_ref(),
                prices.as_ref(),
                preset,
                trading.reconcile_lookback_windows,
            )
            .await;
            pipeline.reconcile(preset, Utc::now()).await;
        }
    }
}

async fn record_candles_quietly(
    store: &dyn TradeStore,
    prices: &dyn PriceHistory,
    preset: &MonitorPreset,
    lookback: u32,
) {
    if let Err(e) = record_recent_candles(store, prices, preset, Utc::now(), lookback).await {
        tracing::debug!(preset = %preset.series_slug, "candle recording failed: {}", e);
    }
}
