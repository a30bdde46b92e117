use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use crate::{
    diagnostics::Diagnostics,
    error::{OracleError, Result},
    estimator::{EstimatorConfig, PriceEstimator},
    filter::{FilterConfig, TransactionFilter},
    histogram::{Histogram, HistogramBuilder},
    intraday::{IntradayPoint, IntradayTracer, TimedCandidate},
    price_result::{EstimateStatus, PriceResult},
    transaction::RawTransaction,
};

/// Fewest blocks an estimate may be based on.
pub const MIN_HISTORY_BLOCKS: usize = 10;

/// Settings for [`RollingBaselineCalculator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    /// Blocks kept in the window (default: 144, about one day)
    pub window_blocks: usize,
    /// Blocks required before an estimate is attempted (default and minimum: 10)
    pub min_blocks: usize,
    /// Relative half-width of the reported price band (default: 5%)
    pub band_pct: f64,
    /// Candidates per intraday sample (default: 100)
    pub intraday_chunk_size: usize,
    /// Search band around the baseline for intraday samples (default: 15%)
    pub intraday_search_pct: f64,
    pub filter: FilterConfig,
    pub estimator: EstimatorConfig,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            window_blocks: 144,
            min_blocks: 10,
            band_pct: 0.05,
            intraday_chunk_size: 100,
            intraday_search_pct: 0.15,
            filter: FilterConfig::default(),
            estimator: EstimatorConfig::default(),
        }
    }
}

impl BaselineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_blocks < MIN_HISTORY_BLOCKS {
            return Err(OracleError::invalid_config(format!(
                "window_blocks must be at least {MIN_HISTORY_BLOCKS}"
            )));
        }
        if self.min_blocks < MIN_HISTORY_BLOCKS || self.min_blocks > self.window_blocks {
            return Err(OracleError::invalid_config(format!(
                "min_blocks must be between {MIN_HISTORY_BLOCKS} and window_blocks ({})",
                self.window_blocks
            )));
        }
        if !(0.0..1.0).contains(&self.band_pct) {
            return Err(OracleError::invalid_config("band_pct must be in [0, 1)"));
        }
        self.filter.validate()?;
        self.estimator.validate()
    }
}

/// Lifecycle of a calculator's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CalculatorState {
    /// No blocks ingested.
    Empty,
    /// Fewer blocks than the window holds.
    Warming { blocks: usize },
    /// Window full; every further block evicts the oldest.
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BaselineStatus {
    Ready,
    InsufficientData { blocks_available: usize, blocks_required: usize },
    NoEstimate { reason: EstimateStatus },
}

/// Window-level price estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineResult {
    pub price: Option<f64>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub confidence: f64,
    pub intraday: Vec<IntradayPoint>,
    pub status: BaselineStatus,
    pub tip_height: Option<u32>,
    pub blocks_used: usize,
    pub window_version: u64,
    /// Timestamp of the newest block in the window that held transactions
    pub as_of: Option<DateTime<Utc>>,
}

impl BaselineResult {
    fn without_price(snapshot: &WindowSnapshot, status: BaselineStatus) -> Self {
        Self {
            price: None,
            price_min: None,
            price_max: None,
            confidence: 0.0,
            intraday: Vec::new(),
            status,
            tip_height: snapshot.tip_height,
            blocks_used: snapshot.block_count,
            window_version: snapshot.version,
            as_of: snapshot.as_of,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == BaselineStatus::Ready
    }
}

/// What [`RollingBaselineCalculator::add_block`] did with a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub height: u32,
    pub tx_count: usize,
    pub candidate_count: usize,
    pub diagnostics: Diagnostics,
    pub evicted_height: Option<u32>,
}

#[derive(Debug)]
struct BlockEntry {
    height: u32,
    time: Option<DateTime<Utc>>,
    histogram: Histogram,
    diagnostics: Diagnostics,
    candidates: Arc<[TimedCandidate]>,
}

/// Consistent copy of the window, detached from the calculator.
///
/// Per-block candidates are shared with the window rather than copied.
#[derive(Debug, Clone)]
pub struct WindowSnapshot {
    pub version: u64,
    pub block_count: usize,
    pub tip_height: Option<u32>,
    pub as_of: Option<DateTime<Utc>>,
    pub histogram: Histogram,
    pub diagnostics: Diagnostics,
    pub previous_price: Option<f64>,
    candidates: Vec<Arc<[TimedCandidate]>>,
}

impl WindowSnapshot {
    pub fn candidates(&self) -> impl Iterator<Item = &TimedCandidate> + '_ {
        self.candidates.iter().flat_map(|block| block.iter())
    }
}

/// Baseline plus the full estimator output it was derived from.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowEstimate {
    pub baseline: BaselineResult,
    /// None when the window held too few blocks to run the estimator
    pub price: Option<PriceResult>,
}

/// Stateless half of the calculator: turns snapshots into estimates.
///
/// Cheap to clone, so it can be moved onto a blocking thread while the
/// calculator keeps ingesting.
#[derive(Debug, Clone)]
pub struct BaselineEstimator {
    min_blocks: usize,
    band_pct: f64,
    estimator: PriceEstimator,
    tracer: IntradayTracer,
}

impl BaselineEstimator {
    pub fn new(config: &BaselineConfig) -> Result<Self> {
        config.validate()?;
        let estimator = PriceEstimator::with_config(config.estimator.clone())?;
        let tracer = IntradayTracer::new(
            config.intraday_chunk_size,
            config.intraday_search_pct,
            config.estimator.tolerance_bins,
            config.estimator.references_usd.clone(),
            (config.estimator.min_price, config.estimator.max_price),
        )?;

        Ok(Self {
            min_blocks: config.min_blocks,
            band_pct: config.band_pct,
            estimator,
            tracer,
        })
    }

    pub fn price_estimator(&self) -> &PriceEstimator {
        &self.estimator
    }

    /// Estimates a snapshot, polling `should_cancel` during the sweep.
    pub fn estimate(&self, snapshot: &WindowSnapshot, should_cancel: &dyn Fn() -> bool) -> Result<WindowEstimate> {
        if snapshot.block_count < self.min_blocks {
            let status = BaselineStatus::InsufficientData {
                blocks_available: snapshot.block_count,
                blocks_required: self.min_blocks,
            };
            return Ok(WindowEstimate {
                baseline: BaselineResult::without_price(snapshot, status),
                price: None,
            });
        }

        let result = self.estimator.estimate_with_cancel(
            &snapshot.histogram,
            &snapshot.diagnostics,
            snapshot.previous_price,
            should_cancel,
        )?;

        let baseline = match result.price_usd {
            Some(price) => BaselineResult {
                price: Some(price),
                price_min: Some(price * (1.0 - self.band_pct)),
                price_max: Some(price * (1.0 + self.band_pct)),
                confidence: result.confidence,
                intraday: self.tracer.trace(snapshot.candidates(), price)?,
                status: BaselineStatus::Ready,
                tip_height: snapshot.tip_height,
                blocks_used: snapshot.block_count,
                window_version: snapshot.version,
                as_of: snapshot.as_of,
            },
            None => BaselineResult::without_price(snapshot, BaselineStatus::NoEstimate { reason: result.status }),
        };

        Ok(WindowEstimate {
            baseline,
            price: Some(result),
        })
    }

    pub fn trace(&self, candidates: &[TimedCandidate], rough_price: f64) -> Result<Vec<IntradayPoint>> {
        self.tracer.trace(candidates, rough_price)
    }
}

/// Rolling-window price calculator.
///
/// Keeps one histogram per block so that eviction is an exact subtraction
/// from the aggregate. Estimates are computed on demand and cached until the
/// window changes.
///
/// # Example
/// ```
/// use bitcoin_oracle::{BaselineConfig, BaselineStatus, RollingBaselineCalculator};
///
/// let mut calculator = RollingBaselineCalculator::new(BaselineConfig::default()).unwrap();
/// calculator.add_block(&[], 840_000).unwrap();
///
/// let baseline = calculator.calculate_baseline().unwrap();
/// assert!(matches!(baseline.status, BaselineStatus::InsufficientData { .. }));
/// ```
#[derive(Debug)]
pub struct RollingBaselineCalculator {
    config: BaselineConfig,
    filter: TransactionFilter,
    estimator: BaselineEstimator,
    window: VecDeque<BlockEntry>,
    aggregate: HistogramBuilder,
    diagnostics: Diagnostics,
    version: u64,
    last_price: Option<f64>,
    cached: Option<WindowEstimate>,
}

impl RollingBaselineCalculator {
    pub fn new(config: BaselineConfig) -> Result<Self> {
        let estimator = BaselineEstimator::new(&config)?;
        Ok(Self {
            filter: TransactionFilter::new(config.filter.clone()),
            estimator,
            window: VecDeque::with_capacity(config.window_blocks + 1),
            aggregate: HistogramBuilder::new(),
            diagnostics: Diagnostics::new(),
            version: 0,
            last_price: None,
            cached: None,
            config,
        })
    }

    pub fn config(&self) -> &BaselineConfig {
        &self.config
    }

    /// Ingests one block and evicts the oldest when the window overflows.
    ///
    /// On error the window is left as it was.
    ///
    /// # Arguments
    /// * `transactions` - Every transaction of the block
    /// * `height` - Block height, strictly above the current tip
    pub fn add_block(&mut self, transactions: &[RawTransaction], height: u32) -> Result<BlockSummary> {
        if let Some(tip) = self.tip_height() {
            if height <= tip {
                return Err(OracleError::invalid_parameter(format!(
                    "block height {height} is not above tip {tip}"
                )));
            }
        }
        if let Some(tx) = transactions.iter().find(|tx| tx.block_height() != height) {
            return Err(OracleError::invalid_parameter(format!(
                "transaction {} belongs to block {}, not {height}",
                tx.txid(),
                tx.block_height()
            )));
        }

        let mut builder = HistogramBuilder::new();
        let mut diagnostics = Diagnostics::new();
        let mut candidates = Vec::new();
        for tx in transactions {
            let outcome = self.filter.filter(tx);
            diagnostics.record(outcome.rejection, outcome.round_outputs);
            for candidate in outcome.candidates {
                builder.add(candidate.value_sats);
                candidates.push(TimedCandidate {
                    value_sats: candidate.value_sats,
                    block_height: height,
                    timestamp: tx.block_time(),
                });
            }
        }

        let evicted_height = if self.window.len() >= self.config.window_blocks {
            self.evict_front()?
        } else {
            None
        };

        let histogram = builder.build();
        self.aggregate.merge(&histogram);
        self.diagnostics.merge(&diagnostics);
        let candidate_count = candidates.len();
        self.window.push_back(BlockEntry {
            height,
            time: transactions.iter().map(|tx| tx.block_time()).max(),
            histogram,
            diagnostics: diagnostics.clone(),
            candidates: candidates.into(),
        });

        self.invalidate();
        debug!(
            "Added block {} ({} txs, {} candidates, {} passed filter)",
            height,
            transactions.len(),
            candidate_count,
            diagnostics.passed_filter
        );

        Ok(BlockSummary {
            height,
            tx_count: transactions.len(),
            candidate_count,
            diagnostics,
            evicted_height,
        })
    }

    /// Drops every block above `height`, as after a chain reorganisation.
    ///
    /// Returns the number of blocks removed.
    pub fn rollback_to(&mut self, height: u32) -> Result<usize> {
        let mut removed = 0;
        while let Some(entry) = self.window.back().filter(|entry| entry.height > height) {
            if let Err(e) = Self::remove_entry(&mut self.aggregate, &mut self.diagnostics, entry) {
                if removed > 0 {
                    self.invalidate();
                }
                return Err(e);
            }
            self.window.pop_back();
            removed += 1;
        }

        if removed > 0 {
            self.invalidate();
            debug!("Rolled back {} blocks to height {}", removed, height);
        }
        Ok(removed)
    }

    /// Copies the current window for an estimation that runs elsewhere.
    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            version: self.version,
            block_count: self.window.len(),
            tip_height: self.tip_height(),
            as_of: self.window.iter().rev().find_map(|entry| entry.time),
            histogram: self.aggregate.snapshot(),
            diagnostics: self.diagnostics.clone(),
            previous_price: self.last_price,
            candidates: self.window.iter().map(|entry| Arc::clone(&entry.candidates)).collect(),
        }
    }

    /// Handle for estimating snapshots off the calculator.
    pub fn estimator(&self) -> BaselineEstimator {
        self.estimator.clone()
    }

    pub fn estimate_snapshot(
        &self,
        snapshot: &WindowSnapshot,
        should_cancel: &dyn Fn() -> bool,
    ) -> Result<WindowEstimate> {
        self.estimator.estimate(snapshot, should_cancel)
    }

    /// Stores an estimate computed from a snapshot.
    ///
    /// Returns false, leaving the calculator untouched, if the window changed
    /// since the snapshot was taken.
    pub fn accept_baseline(&mut self, estimate: WindowEstimate) -> bool {
        if estimate.baseline.window_version != self.version {
            debug!(
                "Discarding estimate for window version {} (current {})",
                estimate.baseline.window_version, self.version
            );
            return false;
        }

        if let Some(price) = estimate.baseline.price {
            self.last_price = Some(price);
        }
        self.cached = Some(estimate);
        true
    }

    /// Baseline and estimator output for the current window, from cache when
    /// the window has not changed.
    pub fn calculate_estimate(&mut self) -> Result<WindowEstimate> {
        if let Some(cached) = &self.cached {
            return Ok(cached.clone());
        }

        let snapshot = self.snapshot();
        let estimate = self.estimator.estimate(&snapshot, &|| false)?;
        self.accept_baseline(estimate.clone());
        Ok(estimate)
    }

    pub fn calculate_baseline(&mut self) -> Result<BaselineResult> {
        self.calculate_estimate().map(|estimate| estimate.baseline)
    }

    /// Intraday trace for an arbitrary set of transactions around `rough_price`.
    ///
    /// Transactions go through the same filter as ingested blocks.
    pub fn generate_intraday_points(
        &self,
        transactions: &[RawTransaction],
        rough_price: f64,
    ) -> Result<Vec<IntradayPoint>> {
        let candidates: Vec<TimedCandidate> = transactions
            .iter()
            .flat_map(|tx| {
                self.filter
                    .filter(tx)
                    .candidates
                    .into_iter()
                    .map(move |candidate| TimedCandidate {
                        value_sats: candidate.value_sats,
                        block_height: tx.block_height(),
                        timestamp: tx.block_time(),
                    })
            })
            .collect();

        self.estimator.trace(&candidates, rough_price)
    }

    pub fn state(&self) -> CalculatorState {
        match self.window.len() {
            0 => CalculatorState::Empty,
            n if n < self.config.window_blocks => CalculatorState::Warming { blocks: n },
            _ => CalculatorState::Ready,
        }
    }

    pub fn block_count(&self) -> usize {
        self.window.len()
    }

    pub fn tip_height(&self) -> Option<u32> {
        self.window.back().map(|entry| entry.height)
    }

    /// Heights currently in the window, oldest first.
    pub fn heights(&self) -> impl Iterator<Item = u32> + '_ {
        self.window.iter().map(|entry| entry.height)
    }

    pub fn aggregate_histogram(&self) -> Histogram {
        self.aggregate.snapshot()
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Incremented on every change to the window.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Most recent accepted baseline price.
    pub fn last_price(&self) -> Option<f64> {
        self.last_price
    }

    /// Removes the oldest block. The entry is only popped once its counts
    /// are out of the aggregate.
    fn evict_front(&mut self) -> Result<Option<u32>> {
        let Some(entry) = self.window.front() else {
            return Ok(None);
        };
        Self::remove_entry(&mut self.aggregate, &mut self.diagnostics, entry)?;
        let height = entry.height;
        self.window.pop_front();
        debug!("Evicted block {}", height);
        Ok(Some(height))
    }

    fn remove_entry(aggregate: &mut HistogramBuilder, diagnostics: &mut Diagnostics, entry: &BlockEntry) -> Result<()> {
        aggregate.subtract(&entry.histogram)?;
        diagnostics.subtract(&entry.diagnostics);
        Ok(())
    }

    fn invalidate(&mut self) {
        self.version += 1;
        self.cached = None;
    }
}
