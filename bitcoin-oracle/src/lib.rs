//! Bitcoin Oracle - on-chain BTC/USD price discovery
//!
//! People pay round fiat amounts ($5, $20, $100, ...). Converted to bitcoin at
//! the going rate, those payments pile up at predictable output values. This
//! library filters confirmed transactions down to organic payments, bins their
//! output values on a logarithmic axis and searches for the price that lines
//! the histogram up with the round fiat amounts.
//!
//! # Features
//! - Ordered, counted transaction filtering (coinbase, consolidations, data
//!   carriers, large witnesses, same-day spends, round BTC amounts)
//! - Log-scale histograms with exact merge and removal
//! - Coarse-to-fine price sweep with pluggable alignment scoring
//! - Rolling window over the most recent blocks with an intraday trace
//!
//! # Example
//! ```no_run
//! use bitcoin_oracle::{BaselineConfig, RawTransaction, RollingBaselineCalculator};
//!
//! let mut calculator = RollingBaselineCalculator::new(BaselineConfig::default())
//!     .expect("valid default config");
//!
//! // Feed confirmed blocks in height order
//! let blocks: Vec<(u32, Vec<RawTransaction>)> = Vec::new(); // from a node or a dump
//! for (height, transactions) in &blocks {
//!     calculator.add_block(transactions, *height).expect("block in order");
//! }
//!
//! let baseline = calculator.calculate_baseline().expect("estimation ran");
//! if let Some(price) = baseline.price {
//!     println!("BTC/USD ≈ {:.0} (confidence {:.2})", price, baseline.confidence);
//! }
//! ```

// Public modules
pub mod error;

// Data structures
mod baseline;
mod diagnostics;
mod estimator;
mod filter;
mod histogram;
mod intraday;
mod price_result;
mod transaction;

// Internal implementation modules
pub(crate) mod internal;

// Public exports
pub use baseline::{
    BaselineConfig, BaselineEstimator, BaselineResult, BaselineStatus, BlockSummary, CalculatorState,
    RollingBaselineCalculator, WindowEstimate, WindowSnapshot, MIN_HISTORY_BLOCKS,
};
pub use diagnostics::Diagnostics;
pub use error::{OracleError, Result};
pub use estimator::{AlignmentScorer, EstimatorConfig, PriceEstimator, SpikeAlignment, DEFAULT_REFERENCE_USD};
pub use filter::{is_round_amount, CandidateAmount, FilterConfig, FilterOutcome, Rejection, TransactionFilter};
pub use histogram::{
    bin_center_sats, bin_index, bin_position, DenseHistogram, Histogram, HistogramBuilder, BINS_PER_DECADE,
    MAX_BINNED_SATS, MIN_BINNED_SATS,
};
pub use intraday::{IntradayPoint, IntradayTracer, TimedCandidate};
pub use price_result::{EstimateStatus, PriceResult};
pub use transaction::{
    OutPoint, PrevoutTimes, RawTransaction, RawTransactionRecord, ScriptKind, TxInput, TxOutput, Txid,
    MAX_MONEY_SATS, SATS_PER_BTC,
};
