use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::{
    diagnostics::Diagnostics,
    error::{OracleError, Result},
    histogram::{bin_position, DenseHistogram, Histogram},
    price_result::{EstimateStatus, PriceResult},
    transaction::SATS_PER_BTC,
};

/// Round fiat amounts people pay with, in USD.
pub const DEFAULT_REFERENCE_USD: &[f64] = &[
    1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1_000.0, 2_000.0, 5_000.0, 10_000.0,
];

/// How often (in trial prices) a sweep polls its cancellation predicate.
const CANCEL_POLL_INTERVAL: usize = 16;

/// Scores how well a histogram is explained by a trial price.
///
/// Implementations return the histogram weight they consider aligned with the
/// trial price. The estimator divides by the total weight to get a confidence,
/// so a score must never exceed [`DenseHistogram::total`].
pub trait AlignmentScorer: Send + Sync + fmt::Debug {
    fn score(&self, histogram: &DenseHistogram, trial_price: f64) -> f64;
}

/// Default scoring strategy: weight gathered within a fixed number of bins
/// around the implied amount of each reference fiat amount, net of the local
/// background.
///
/// Inside a window a bin counts in proportion to its closeness to the implied
/// bin, so the score peaks where the spikes sit instead of staying flat while
/// they drift across the window. The bins flanking a window estimate the
/// background (change outputs, unrelated payments) it collects by chance;
/// that share is taken off, and no window contributes less than zero. Each
/// bin is counted in at most one window.
#[derive(Debug, Clone)]
pub struct SpikeAlignment {
    references_usd: Vec<f64>,
    tolerance_bins: i32,
    flank_bins: i32,
}

impl SpikeAlignment {
    /// Creates the strategy.
    ///
    /// # Arguments
    /// * `references_usd` - Reference amounts, positive and strictly ascending
    /// * `tolerance_bins` - Half-width of the window around each implied bin
    pub fn new(references_usd: Vec<f64>, tolerance_bins: i32) -> Result<Self> {
        if references_usd.is_empty() {
            return Err(OracleError::invalid_config("At least one reference amount must be provided"));
        }
        if references_usd.iter().any(|&usd| !usd.is_finite() || usd <= 0.0) {
            return Err(OracleError::invalid_config("Reference amounts must be positive"));
        }
        if references_usd.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(OracleError::invalid_config("Reference amounts must be strictly ascending"));
        }
        if tolerance_bins < 0 {
            return Err(OracleError::invalid_config("tolerance_bins must not be negative"));
        }

        Ok(Self::unchecked(references_usd, tolerance_bins))
    }

    fn unchecked(references_usd: Vec<f64>, tolerance_bins: i32) -> Self {
        Self {
            references_usd,
            tolerance_bins,
            flank_bins: 2 * tolerance_bins.max(1),
        }
    }

    /// Bin where `usd` lands if one bitcoin costs `price` dollars.
    pub fn implied_bin(usd: f64, price: f64) -> i32 {
        bin_position(usd / price * SATS_PER_BTC as f64).round() as i32
    }
}

impl AlignmentScorer for SpikeAlignment {
    fn score(&self, histogram: &DenseHistogram, trial_price: f64) -> f64 {
        let radius = f64::from(self.tolerance_bins + 1);
        let mut matched = 0.0;
        let mut next_free = i32::MIN;

        // Ascending references map to ascending bins
        for &usd in &self.references_usd {
            let center = Self::implied_bin(usd, trial_price);
            let lo = (center - self.tolerance_bins).max(next_free);
            let hi = center + self.tolerance_bins;
            if lo > hi {
                continue;
            }
            next_free = hi + 1;

            let mut weighted = 0.0;
            let mut kernel = 0.0;
            for bin in lo..=hi {
                let closeness = 1.0 - f64::from((bin - center).abs()) / radius;
                weighted += closeness * histogram.weight_at(bin);
                kernel += closeness;
            }

            let below = center - self.tolerance_bins;
            let flanks = histogram.sum_range(below - self.flank_bins, below - 1)
                + histogram.sum_range(hi + 1, hi + self.flank_bins);
            let background = flanks / f64::from(2 * self.flank_bins) * kernel;
            matched += (weighted - background).max(0.0);
        }

        matched
    }
}

/// Settings for [`PriceEstimator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Lowest acceptable price in USD (default: 10,000)
    pub min_price: f64,
    /// Highest acceptable price in USD (default: 500,000)
    pub max_price: f64,
    /// Relative step of the coarse sweep (default: 1%)
    pub coarse_step: f64,
    /// Relative step of the refining sweep (default: 0.05%)
    pub fine_step: f64,
    /// Half-width of the matching window in bins (default: 2)
    pub tolerance_bins: i32,
    /// Reference fiat amounts in USD
    pub references_usd: Vec<f64>,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            min_price: 10_000.0,
            max_price: 500_000.0,
            coarse_step: 0.01,
            fine_step: 0.0005,
            tolerance_bins: 2,
            references_usd: DEFAULT_REFERENCE_USD.to_vec(),
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.min_price.is_finite() || self.min_price <= 0.0 {
            return Err(OracleError::invalid_config("min_price must be positive"));
        }
        if !self.max_price.is_finite() || self.max_price <= self.min_price {
            return Err(OracleError::invalid_config("max_price must be greater than min_price"));
        }
        if !(self.coarse_step > 0.0 && self.coarse_step < 1.0) {
            return Err(OracleError::invalid_config("coarse_step must be between 0 and 1"));
        }
        if !(self.fine_step > 0.0 && self.fine_step <= self.coarse_step) {
            return Err(OracleError::invalid_config("fine_step must be positive and at most coarse_step"));
        }
        Ok(())
    }

    /// True if `price` lies within the sanity bounds.
    pub fn in_bounds(&self, price: f64) -> bool {
        (self.min_price..=self.max_price).contains(&price)
    }
}

/// Finds the price that best explains a histogram of candidate amounts.
///
/// The estimator sweeps trial prices geometrically across the sanity bounds,
/// then refines around the best coarse trial. Scoring is delegated to an
/// [`AlignmentScorer`]; [`SpikeAlignment`] is used unless another is supplied.
///
/// # Example
/// ```
/// use bitcoin_oracle::{Diagnostics, EstimateStatus, Histogram, PriceEstimator};
///
/// let estimator = PriceEstimator::new();
/// let result = estimator.estimate(&Histogram::empty(), &Diagnostics::new(), None);
///
/// assert_eq!(result.price_usd, None);
/// assert_eq!(result.status, EstimateStatus::NoSignal);
/// ```
#[derive(Debug, Clone)]
pub struct PriceEstimator {
    config: EstimatorConfig,
    scorer: Arc<dyn AlignmentScorer>,
}

impl PriceEstimator {
    /// Creates an estimator with default bounds, grid and references.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an estimator using [`SpikeAlignment`] built from `config`.
    pub fn with_config(config: EstimatorConfig) -> Result<Self> {
        let scorer = SpikeAlignment::new(config.references_usd.clone(), config.tolerance_bins)?;
        Self::with_scorer(config, Arc::new(scorer))
    }

    /// Creates an estimator with a custom scoring strategy.
    pub fn with_scorer(config: EstimatorConfig, scorer: Arc<dyn AlignmentScorer>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, scorer })
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Estimates a price, running the sweep to completion.
    ///
    /// # Arguments
    /// * `histogram` - Aggregate histogram of candidate amounts
    /// * `diagnostics` - Filter counters for the transactions behind it
    /// * `previous` - Last reported price, used to break ties
    pub fn estimate(&self, histogram: &Histogram, diagnostics: &Diagnostics, previous: Option<f64>) -> PriceResult {
        self.estimate_with_cancel(histogram, diagnostics, previous, &|| false)
            .unwrap_or_else(|_| {
                PriceResult::no_estimate(EstimateStatus::DegenerateHistogram, histogram.clone(), diagnostics.clone())
            })
    }

    /// Estimates a price, polling `should_cancel` during the sweep.
    ///
    /// Returns [`OracleError::Cancelled`] as soon as the predicate reports true.
    pub fn estimate_with_cancel(
        &self,
        histogram: &Histogram,
        diagnostics: &Diagnostics,
        previous: Option<f64>,
        should_cancel: &dyn Fn() -> bool,
    ) -> Result<PriceResult> {
        if diagnostics.passed_filter == 0 {
            return Ok(PriceResult::no_estimate(EstimateStatus::NoSignal, histogram.clone(), diagnostics.clone()));
        }
        if histogram.is_empty() {
            return Ok(PriceResult::no_estimate(
                EstimateStatus::DegenerateHistogram,
                histogram.clone(),
                diagnostics.clone(),
            ));
        }

        let config = &self.config;
        let dense = DenseHistogram::from_histogram(histogram);
        let previous = previous.filter(|p| p.is_finite() && *p > 0.0);

        // One guard trial beyond each bound, so a maximum outside the range is seen as such
        let ratio = 1.0 + config.coarse_step;
        let coarse_grid = geometric_grid(config.min_price / ratio, config.max_price * ratio, config.coarse_step);
        let coarse = self.sweep(&dense, &coarse_grid, should_cancel)?;

        let best = max_score(&coarse);
        if best <= 0.0 {
            debug!("No histogram weight aligned with any trial price");
            return Ok(PriceResult::no_estimate(
                EstimateStatus::DegenerateHistogram,
                histogram.clone(),
                diagnostics.clone(),
            ));
        }

        let anchor = previous.unwrap_or_else(|| (config.min_price * config.max_price).sqrt());
        let Some(pick) = closest_index(&coarse, best, anchor) else {
            return Ok(PriceResult::no_estimate(
                EstimateStatus::DegenerateHistogram,
                histogram.clone(),
                diagnostics.clone(),
            ));
        };
        let coarse_pick = coarse[pick].0;

        if !config.in_bounds(coarse_pick) {
            debug!("Best alignment at {:.0} USD lies outside the sanity bounds", coarse_pick);
            return Ok(PriceResult::no_estimate(EstimateStatus::OutOfBounds, histogram.clone(), diagnostics.clone()));
        }

        // Refine across the whole run of tied coarse trials around the pick
        let (run_lo, run_hi) = tied_run(&coarse, pick);
        let fine_grid = geometric_grid(
            (coarse[run_lo].0 / ratio).max(config.min_price),
            (coarse[run_hi].0 * ratio).min(config.max_price),
            config.fine_step,
        );
        let mut fine = self.sweep(&dense, &fine_grid, should_cancel)?;
        fine.push((coarse_pick, best));

        let fine_best = max_score(&fine);
        let tied: Vec<f64> = tied_prices(&fine, fine_best).collect();
        let target = match previous {
            Some(p) => p,
            None => geometric_centre(&tied).unwrap_or(coarse_pick),
        };
        let price = closest_to(tied.iter().copied(), target).unwrap_or(coarse_pick);

        let confidence = fine_best / dense.total();
        debug!(
            "Estimated {:.2} USD with confidence {:.3} ({} coarse, {} fine trials)",
            price,
            confidence,
            coarse.len(),
            fine.len()
        );

        Ok(PriceResult::estimated(price, confidence, histogram.clone(), diagnostics.clone()))
    }

    /// Share of the histogram explained by a single trial price.
    pub fn alignment_at(&self, histogram: &Histogram, price: f64) -> f64 {
        let dense = DenseHistogram::from_histogram(histogram);
        if dense.total() <= 0.0 || !price.is_finite() || price <= 0.0 {
            return 0.0;
        }
        (self.scorer.score(&dense, price) / dense.total()).clamp(0.0, 1.0)
    }

    fn sweep(
        &self,
        dense: &DenseHistogram,
        grid: &[f64],
        should_cancel: &dyn Fn() -> bool,
    ) -> Result<Vec<(f64, f64)>> {
        let mut scored = Vec::with_capacity(grid.len());
        for (i, &price) in grid.iter().enumerate() {
            if i % CANCEL_POLL_INTERVAL == 0 && should_cancel() {
                return Err(OracleError::Cancelled);
            }
            scored.push((price, self.scorer.score(dense, price)));
        }
        Ok(scored)
    }
}

impl Default for PriceEstimator {
    fn default() -> Self {
        let config = EstimatorConfig::default();
        let scorer = SpikeAlignment::unchecked(config.references_usd.clone(), config.tolerance_bins);
        Self {
            config,
            scorer: Arc::new(scorer),
        }
    }
}

/// Prices from `start` to `end` inclusive, each `step` (relative) apart.
fn geometric_grid(start: f64, end: f64, step: f64) -> Vec<f64> {
    if end <= start {
        return vec![start];
    }
    let ratio = 1.0 + step;
    let n = ((end / start).ln() / ratio.ln()).ceil() as i32;
    let mut grid: Vec<f64> = (0..=n).map(|i| (start * ratio.powi(i)).min(end)).collect();
    grid.dedup();
    grid
}

fn max_score(scored: &[(f64, f64)]) -> f64 {
    scored.iter().map(|&(_, score)| score).fold(0.0, f64::max)
}

fn tied_prices(scored: &[(f64, f64)], best: f64) -> impl Iterator<Item = f64> + '_ {
    scored
        .iter()
        .filter(move |&&(_, score)| score == best)
        .map(|&(price, _)| price)
}

/// Index of the best-scoring trial closest to `anchor`.
fn closest_index(scored: &[(f64, f64)], best: f64, anchor: f64) -> Option<usize> {
    scored
        .iter()
        .enumerate()
        .filter(|&(_, &(_, score))| score == best)
        .min_by(|(_, a), (_, b)| {
            let da = (a.0 / anchor).ln().abs();
            let db = (b.0 / anchor).ln().abs();
            da.total_cmp(&db)
        })
        .map(|(i, _)| i)
}

/// Bounds of the contiguous run of trials scoring the same as `scored[pick]`.
fn tied_run(scored: &[(f64, f64)], pick: usize) -> (usize, usize) {
    let score = scored[pick].1;
    let mut lo = pick;
    while lo > 0 && scored[lo - 1].1 == score {
        lo -= 1;
    }
    let mut hi = pick;
    while hi + 1 < scored.len() && scored[hi + 1].1 == score {
        hi += 1;
    }
    (lo, hi)
}

/// The price with the smallest log distance to `anchor`.
fn closest_to(prices: impl Iterator<Item = f64>, anchor: f64) -> Option<f64> {
    prices.min_by(|a, b| {
        let da = (a / anchor).ln().abs();
        let db = (b / anchor).ln().abs();
        da.total_cmp(&db)
    })
}

fn geometric_centre(prices: &[f64]) -> Option<f64> {
    let lo = prices.iter().copied().reduce(f64::min)?;
    let hi = prices.iter().copied().reduce(f64::max)?;
    Some((lo * hi).sqrt())
}
