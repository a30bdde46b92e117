use serde::{Deserialize, Serialize};

use crate::diagnostics::Diagnostics;
use crate::histogram::Histogram;

/// Outcome of a price estimation.
///
/// Everything except `Estimated` means "no estimate". Callers should not
/// retry on these; more data or a different window is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateStatus {
    /// A price within the sanity bounds was found.
    Estimated,
    /// No transaction passed the filter.
    NoSignal,
    /// Zero total weight, or no weight aligned with any reference amount.
    DegenerateHistogram,
    /// The best alignment lies outside the sanity bounds.
    OutOfBounds,
}

/// Result of running the price estimator over a histogram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceResult {
    /// Estimated price in USD, None when no estimate could be made
    pub price_usd: Option<f64>,

    /// Share of histogram weight explained by the estimate, in [0, 1]
    pub confidence: f64,

    /// Transactions that passed the filter
    pub tx_count: u64,

    /// Candidate outputs in the histogram
    pub output_count: u64,

    /// The histogram the estimate was computed from
    pub histogram: Histogram,

    pub diagnostics: Diagnostics,

    pub status: EstimateStatus,
}

impl PriceResult {
    pub(crate) fn estimated(
        price_usd: f64,
        confidence: f64,
        histogram: Histogram,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            price_usd: Some(price_usd),
            confidence: confidence.clamp(0.0, 1.0),
            tx_count: diagnostics.passed_filter,
            output_count: histogram.total_weight(),
            histogram,
            diagnostics,
            status: EstimateStatus::Estimated,
        }
    }

    /// A result carrying no price, zero confidence and the inputs' diagnostics.
    pub fn no_estimate(status: EstimateStatus, histogram: Histogram, diagnostics: Diagnostics) -> Self {
        Self {
            price_usd: None,
            confidence: 0.0,
            tx_count: diagnostics.passed_filter,
            output_count: histogram.total_weight(),
            histogram,
            diagnostics,
            status,
        }
    }

    pub fn has_estimate(&self) -> bool {
        self.price_usd.is_some()
    }
}
