//! Feed → queue → tracker → cache, wired the way the daemon runs it

use bitcoin_oracle::CalculatorState;
use bitcoin_oracle_daemon::bitcoin::{LedgerSource, MockLedger};
use bitcoin_oracle_daemon::cache::PriceCache;
use bitcoin_oracle_daemon::config::AppConfig;
use bitcoin_oracle_daemon::retry::RetryPolicy;
use bitcoin_oracle_daemon::service::{block_channel, BlockFeed, FeedStats, PriceTracker};
use std::sync::Arc;
use std::time::Duration;

const PRICE: f64 = 42_000.0;

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.estimator.window_blocks = 24;
    config.ingestion.backfill_blocks = 12;
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 2;
    config
}

#[tokio::test]
async fn test_live_blocks_roll_the_window() {
    let config = config();
    let ledger = Arc::new(MockLedger::new(PRICE, 500).with_transactions_per_block(60));
    let source: Arc<dyn LedgerSource> = ledger.clone();
    let retry = RetryPolicy::from_config(&config.retry);
    let cache = Arc::new(PriceCache::new(Duration::from_secs(config.cache.ttl_secs)));
    let stats = Arc::new(FeedStats::new());
    let tracker =
        Arc::new(PriceTracker::new(config.to_baseline_config(), Arc::clone(&cache), Arc::clone(&stats)).unwrap());

    let start = tracker
        .backfill(source.as_ref(), &retry, config.ingestion.backfill_blocks)
        .await
        .unwrap();
    assert_eq!(start, 501);
    let first = cache.get().await.unwrap();
    assert!((first.price.unwrap() / PRICE - 1.0).abs() < 0.05);

    // Twenty more blocks arrive; the window fills and starts evicting
    let (sender, receiver) = block_channel(32);
    let mut feed = BlockFeed::new(Arc::clone(&source), retry, sender, Arc::clone(&stats), start);
    let tracker_task = tokio::spawn(Arc::clone(&tracker).start(receiver));

    ledger.advance(20);
    assert_eq!(feed.poll_once().await.unwrap(), 20);
    drop(feed);
    tracker_task.await.unwrap();

    let state = tracker.get_state().await;
    assert_eq!(state.tip_height, Some(520));
    assert_eq!(state.blocks_in_window, 24);
    assert_eq!(state.calculator_state, CalculatorState::Ready);
    assert_eq!(state.fetched_blocks, 20);
    assert_eq!(state.dropped_blocks, 0);

    let latest = tracker.refresh().await.unwrap().unwrap();
    assert_eq!(latest.tip_height, Some(520));
    assert_eq!(latest.blocks_used, 24);
    assert!((latest.price.unwrap() / PRICE - 1.0).abs() < 0.05);
    // Background estimates may land after ours; all describe the same window
    let cached = cache.get().await.unwrap();
    assert_eq!(cached.window_version, latest.window_version);
    assert!((cached.price.unwrap() / latest.price.unwrap() - 1.0).abs() < 0.01);
}
