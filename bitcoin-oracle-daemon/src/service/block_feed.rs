use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::bitcoin::{LedgerBlock, LedgerSource, RpcError};
use crate::retry::RetryPolicy;

/// Counters shared between the feed and whoever reports on it.
#[derive(Debug, Default)]
pub struct FeedStats {
    fetched_blocks: AtomicU64,
    dropped_blocks: AtomicU64,
    dropped_transactions: AtomicU64,
}

impl FeedStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fetched_blocks(&self) -> u64 {
        self.fetched_blocks.load(Ordering::Relaxed)
    }

    pub fn dropped_blocks(&self) -> u64 {
        self.dropped_blocks.load(Ordering::Relaxed)
    }

    pub fn dropped_transactions(&self) -> u64 {
        self.dropped_transactions.load(Ordering::Relaxed)
    }
}

/// What happened to a block handed to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queue full; the block is lost to the window.
    Dropped,
    /// The receiving side is gone.
    Closed,
}

/// Bounded queue between the feed and the tracker.
pub fn block_channel(capacity: usize) -> (mpsc::Sender<LedgerBlock>, mpsc::Receiver<LedgerBlock>) {
    mpsc::channel(capacity.max(1))
}

/// Follows the chain tip and queues every new block for the tracker.
///
/// The feed never waits for the tracker: when the queue is full the block is
/// dropped and counted.
pub struct BlockFeed {
    source: Arc<dyn LedgerSource>,
    retry: RetryPolicy,
    sender: mpsc::Sender<LedgerBlock>,
    stats: Arc<FeedStats>,
    next_height: u32,
}

impl BlockFeed {
    pub fn new(
        source: Arc<dyn LedgerSource>,
        retry: RetryPolicy,
        sender: mpsc::Sender<LedgerBlock>,
        stats: Arc<FeedStats>,
        start_height: u32,
    ) -> Self {
        Self {
            source,
            retry,
            sender,
            stats,
            next_height: start_height,
        }
    }

    /// Height of the next block to fetch
    pub fn next_height(&self) -> u32 {
        self.next_height
    }

    pub fn push(&self, block: LedgerBlock) -> PushOutcome {
        match self.sender.try_send(block) {
            Ok(()) => PushOutcome::Queued,
            Err(TrySendError::Full(block)) => {
                let dropped = self.stats.dropped_blocks.fetch_add(1, Ordering::Relaxed) + 1;
                self.stats
                    .dropped_transactions
                    .fetch_add(block.transactions.len() as u64, Ordering::Relaxed);
                warn!(
                    "Ingestion queue full, dropped block {} ({} transactions, {} blocks dropped so far)",
                    block.height,
                    block.transactions.len(),
                    dropped
                );
                PushOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => PushOutcome::Closed,
        }
    }

    /// Fetches every block between the last one seen and the current tip.
    ///
    /// Returns the number of blocks fetched, queued or not.
    pub async fn poll_once(&mut self) -> Result<usize, RpcError> {
        let source = Arc::clone(&self.source);
        let tip = self
            .retry
            .run("getblockcount", || source.tip_height(), RpcError::is_retryable)
            .await?;

        let mut fetched = 0;
        while self.next_height <= tip {
            let height = self.next_height;
            let block = self
                .retry
                .run("getblock", || source.block_at(height), RpcError::is_retryable)
                .await?;
            self.stats.fetched_blocks.fetch_add(1, Ordering::Relaxed);
            fetched += 1;
            self.next_height = height + 1;

            if self.push(block) == PushOutcome::Closed {
                debug!("Block queue closed at height {}", height);
                break;
            }
        }
        Ok(fetched)
    }

    /// Polls the tip every `interval_ms` until the tracker goes away.
    pub async fn start(mut self, interval_ms: u64) {
        let mut ticker = interval(Duration::from_millis(interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Starting block feed at height {} with {}ms interval",
            self.next_height, interval_ms
        );

        loop {
            ticker.tick().await;
            if self.sender.is_closed() {
                info!("Block queue closed, stopping feed");
                return;
            }

            match self.poll_once().await {
                Ok(0) => debug!("No new blocks (next height {})", self.next_height),
                Ok(fetched) => debug!("Fetched {} new blocks", fetched),
                // Continue running despite errors
                Err(e) => error!("Failed to fetch blocks at height {}: {}", self.next_height, e),
            }
        }
    }
}
