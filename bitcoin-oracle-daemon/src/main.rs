//! Bitcoin Oracle Daemon - rolling on-chain BTC/USD price estimation

use anyhow::{Context, Result};
use bitcoin_oracle_daemon::{
    bitcoin::{BitcoinClient, BitcoinRpcClient, LedgerSource, MockLedger},
    cache::PriceCache,
    cli::Cli,
    retry::RetryPolicy,
    service::{block_channel, BlockFeed, FeedStats, PriceTracker},
};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Tip height the synthetic ledger starts from in test mode
const MOCK_TIP_HEIGHT: u32 = 900_000;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing to stderr
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| cli.log_filter.as_str().into()))
        .with((!cli.json_logs).then(|| {
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact()
        }))
        .with(
            cli.json_logs
                .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr).json()),
        )
        .init();

    info!("Bitcoin Oracle Daemon starting...");

    let config = cli.load_config()?;
    let baseline_config = config.to_baseline_config();
    baseline_config.validate().context("Invalid estimator configuration")?;

    info!("Configuration loaded:");
    info!("  Bitcoin RPC: {}", config.bitcoin_rpc.url);
    info!(
        "  Window: {} blocks (estimates from {})",
        config.estimator.window_blocks, config.estimator.min_blocks
    );
    info!("  Poll interval: {}ms", config.ingestion.poll_interval_ms);
    info!("  Price cache TTL: {}s", config.cache.ttl_secs);

    let client = if cli.test_mode {
        warn!("Test mode: following a synthetic ledger at ${:.0}", cli.mock_price);
        BitcoinClient::Mock(MockLedger::new(cli.mock_price, MOCK_TIP_HEIGHT))
    } else {
        BitcoinClient::Real(BitcoinRpcClient::new(config.to_bitcoin_rpc_config()))
    };

    // Test Bitcoin connection
    match client.test_connection().await {
        Ok(_) => info!("Successfully connected to Bitcoin Core"),
        Err(e) => {
            error!("Failed to connect to Bitcoin Core: {}", e);
            error!("Please ensure Bitcoin Core is running and RPC credentials are correct");
            // Continue anyway - requests are retried
        }
    }
    let source: Arc<dyn LedgerSource> = Arc::new(client);

    let retry = RetryPolicy::from_config(&config.retry);
    let cache = Arc::new(PriceCache::new(Duration::from_secs(config.cache.ttl_secs)));
    let stats = Arc::new(FeedStats::new());
    let tracker = Arc::new(
        PriceTracker::new(baseline_config, Arc::clone(&cache), Arc::clone(&stats))
            .context("Failed to create price tracker")?,
    );

    let start_height = tracker
        .backfill(source.as_ref(), &retry, config.ingestion.backfill_blocks)
        .await
        .context("Failed to backfill the rolling window")?;

    let (sender, receiver) = block_channel(config.ingestion.queue_capacity);
    let feed = BlockFeed::new(Arc::clone(&source), retry, sender, Arc::clone(&stats), start_height);

    let tracker_handle = tokio::spawn(Arc::clone(&tracker).start(receiver));
    let feed_handle = tokio::spawn(feed.start(config.ingestion.poll_interval_ms));

    // Periodic status line
    let status_tracker = Arc::clone(&tracker);
    let status_interval = Duration::from_secs(cli.status_interval_secs.max(1));
    let status_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(status_interval);
        loop {
            interval.tick().await;
            let state = status_tracker.get_state().await;
            match status_tracker.get_latest_price().await {
                Some(baseline) => info!(
                    "Price {:.0} USD (band {:.0}-{:.0}, confidence {:.2}) at tip {:?}",
                    baseline.price.unwrap_or_default(),
                    baseline.price_min.unwrap_or_default(),
                    baseline.price_max.unwrap_or_default(),
                    baseline.confidence,
                    state.tip_height
                ),
                None => info!(
                    "No fresh price ({} blocks in window, tip {:?})",
                    state.blocks_in_window, state.tip_height
                ),
            }
            if state.dropped_blocks > 0 || state.stale_estimates > 0 {
                info!(
                    "  {} blocks ({} transactions) dropped, {} stale estimates discarded",
                    state.dropped_blocks, state.dropped_transactions, state.stale_estimates
                );
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    feed_handle.abort();
    status_handle.abort();
    // The tracker drains what is queued once the feed's sender is gone
    if let Err(e) = tracker_handle.await {
        error!("Price tracker task failed: {}", e);
    }

    if let Ok(state) = serde_json::to_string(&tracker.get_state().await) {
        info!("Final state: {}", state);
    }
    info!("Bitcoin Oracle Daemon shut down");

    Ok(())
}
