use bitcoin_oracle::{
    BaselineConfig, BaselineResult, BlockSummary, CalculatorState, OracleError, PriceResult,
    RollingBaselineCalculator, WindowEstimate,
};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::bitcoin::{LedgerBlock, LedgerSource, RpcError};
use crate::cache::PriceCache;
use crate::retry::RetryPolicy;
use crate::service::FeedStats;

/// Price tracker errors
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("RPC error: {0}")]
    RpcError(#[from] RpcError),

    #[error("Estimation error: {0}")]
    EstimationError(#[from] OracleError),

    #[error("Estimation task failed: {0}")]
    TaskFailed(String),

    #[error("Service is shutting down")]
    Shutdown,
}

/// Owned view of the tracker for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OracleState {
    pub baseline: Option<BaselineResult>,
    pub price: Option<PriceResult>,
    pub calculator_state: CalculatorState,
    pub tip_height: Option<u32>,
    pub blocks_in_window: usize,
    pub window_version: u64,
    pub fetched_blocks: u64,
    pub dropped_blocks: u64,
    pub dropped_transactions: u64,
    pub stale_estimates: u64,
}

/// Single writer of the rolling calculator.
///
/// Blocks are ingested under the lock; estimation runs on a snapshot on a
/// blocking thread and is abandoned as soon as another block arrives.
pub struct PriceTracker {
    calculator: Arc<Mutex<RollingBaselineCalculator>>,
    generation: Arc<AtomicU64>,
    latest: Arc<RwLock<Option<WindowEstimate>>>,
    cache: Arc<PriceCache>,
    stats: Arc<FeedStats>,
    stale_estimates: AtomicU64,
}

impl PriceTracker {
    pub fn new(config: BaselineConfig, cache: Arc<PriceCache>, stats: Arc<FeedStats>) -> Result<Self, TrackerError> {
        Ok(Self {
            calculator: Arc::new(Mutex::new(RollingBaselineCalculator::new(config)?)),
            generation: Arc::new(AtomicU64::new(0)),
            latest: Arc::new(RwLock::new(None)),
            cache,
            stats,
            stale_estimates: AtomicU64::new(0),
        })
    }

    /// Adds a block to the window.
    ///
    /// A block at or below the current tip replaces the branch it forks from.
    pub async fn ingest(&self, block: LedgerBlock) -> Result<BlockSummary, TrackerError> {
        let mut calculator = self.calculator.lock().await;

        if calculator.tip_height().is_some_and(|tip| block.height <= tip) {
            let removed = calculator.rollback_to(block.height.saturating_sub(1))?;
            warn!(
                "Reorganisation at height {}: rolled back {} blocks",
                block.height, removed
            );
        }

        let result = calculator.add_block(&block.transactions, block.height);
        // Any change to the window, even a partial rollback, outdates sweeps in flight
        self.generation.fetch_add(1, Ordering::SeqCst);
        let summary = result?;

        debug!(
            "Ingested block {} ({} of {} transactions passed, {} in window)",
            summary.height,
            summary.diagnostics.passed_filter,
            summary.tx_count,
            calculator.block_count()
        );
        Ok(summary)
    }

    /// Estimates the current window off the lock.
    ///
    /// Returns None when a newer block made the sweep pointless.
    pub async fn compute(&self) -> Result<Option<WindowEstimate>, TrackerError> {
        let (snapshot, estimator, generation) = {
            let calculator = self.calculator.lock().await;
            (
                calculator.snapshot(),
                calculator.estimator(),
                self.generation.load(Ordering::SeqCst),
            )
        };

        let current = Arc::clone(&self.generation);
        let outcome = tokio::task::spawn_blocking(move || {
            estimator.estimate(&snapshot, &|| current.load(Ordering::SeqCst) != generation)
        })
        .await
        .map_err(|e| {
            if e.is_cancelled() {
                TrackerError::Shutdown
            } else {
                TrackerError::TaskFailed(e.to_string())
            }
        })?;

        match outcome {
            Ok(estimate) => Ok(Some(estimate)),
            Err(OracleError::Cancelled) => {
                self.stale_estimates.fetch_add(1, Ordering::Relaxed);
                debug!("Sweep for generation {} cancelled by a newer block", generation);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Makes an estimate current unless the window moved since its snapshot.
    pub async fn publish(&self, estimate: WindowEstimate) -> bool {
        let accepted = self.calculator.lock().await.accept_baseline(estimate.clone());
        if !accepted {
            self.stale_estimates.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let baseline = &estimate.baseline;
        match baseline.price {
            Some(price) if baseline.is_ready() => {
                info!(
                    "BTC/USD {:.0} (confidence {:.2}, {} blocks, tip {:?})",
                    price, baseline.confidence, baseline.blocks_used, baseline.tip_height
                );
                self.cache.store(baseline.clone()).await;
            }
            _ => debug!("No price for window version {}: {:?}", baseline.window_version, baseline.status),
        }

        *self.latest.write().await = Some(estimate);
        true
    }

    /// Computes and publishes an estimate for the current window.
    pub async fn refresh(&self) -> Result<Option<BaselineResult>, TrackerError> {
        let Some(estimate) = self.compute().await? else {
            return Ok(None);
        };
        let baseline = estimate.baseline.clone();
        Ok(self.publish(estimate).await.then_some(baseline))
    }

    /// Loads the `blocks` most recent blocks and estimates once.
    ///
    /// Returns the height the live feed should continue from.
    pub async fn backfill(
        &self,
        source: &dyn LedgerSource,
        retry: &RetryPolicy,
        blocks: u32,
    ) -> Result<u32, TrackerError> {
        let tip = retry
            .run("getblockcount", || source.tip_height(), RpcError::is_retryable)
            .await?;
        if blocks == 0 {
            return Ok(tip + 1);
        }

        let start = tip.saturating_sub(blocks - 1);
        info!("Backfilling blocks {} to {}", start, tip);
        for height in start..=tip {
            let block = retry
                .run("getblock", || source.block_at(height), RpcError::is_retryable)
                .await?;
            self.ingest(block).await?;
        }

        self.refresh().await?;
        Ok(tip + 1)
    }

    /// Ingests queued blocks until the feed closes the queue.
    ///
    /// Every block starts a fresh estimation in the background; ingestion
    /// never waits for it.
    pub async fn start(self: Arc<Self>, mut receiver: mpsc::Receiver<LedgerBlock>) {
        info!("Price tracker waiting for blocks");

        while let Some(block) = receiver.recv().await {
            let height = block.height;
            if let Err(e) = self.ingest(block).await {
                error!("Failed to ingest block {}: {}", height, e);
                continue;
            }

            let tracker = Arc::clone(&self);
            tokio::spawn(async move {
                match tracker.refresh().await {
                    Ok(_) => {}
                    Err(TrackerError::Shutdown) => debug!("Estimation abandoned on shutdown"),
                    Err(e) => warn!("Failed to estimate window at height {}: {}", height, e),
                }
            });
        }

        info!("Block queue closed, price tracker stopping");
    }

    /// Gets the latest published estimate
    pub async fn get_latest_estimate(&self) -> Option<WindowEstimate> {
        self.latest.read().await.clone()
    }

    /// Gets the latest fresh price from the cache
    pub async fn get_latest_price(&self) -> Option<BaselineResult> {
        self.cache.get().await
    }

    pub async fn get_state(&self) -> OracleState {
        let (calculator_state, tip_height, blocks_in_window, window_version) = {
            let calculator = self.calculator.lock().await;
            (
                calculator.state(),
                calculator.tip_height(),
                calculator.block_count(),
                calculator.version(),
            )
        };
        let latest = self.latest.read().await.clone();
        let (baseline, price) = match latest {
            Some(estimate) => (Some(estimate.baseline), estimate.price),
            None => (None, None),
        };

        OracleState {
            baseline,
            price,
            calculator_state,
            tip_height,
            blocks_in_window,
            window_version,
            fetched_blocks: self.stats.fetched_blocks(),
            dropped_blocks: self.stats.dropped_blocks(),
            dropped_transactions: self.stats.dropped_transactions(),
            stale_estimates: self.stale_estimates.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
#[path = "price_tracker_tests.rs"]
mod tests;
