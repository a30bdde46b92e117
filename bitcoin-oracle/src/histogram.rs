use ndarray::{Array1, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{OracleError, Result};
use crate::filter::CandidateAmount;

/// Resolution of the logarithmic amount axis.
pub const BINS_PER_DECADE: u32 = 200;

/// Smallest binned amount (0.00001 BTC). Smaller outputs are dust for pricing purposes.
pub const MIN_BINNED_SATS: u64 = 1_000;

/// Largest binned amount (100,000 BTC).
pub const MAX_BINNED_SATS: u64 = 10_000_000_000_000;

/// Continuous position of an amount on the bin axis.
pub fn bin_position(sats: f64) -> f64 {
    sats.log10() * BINS_PER_DECADE as f64
}

/// Calculates the bin index of an amount.
///
/// The formula is: round(log10(sats) * BINS_PER_DECADE)
///
/// Returns None for amounts outside [MIN_BINNED_SATS, MAX_BINNED_SATS].
pub fn bin_index(sats: u64) -> Option<i32> {
    if !(MIN_BINNED_SATS..=MAX_BINNED_SATS).contains(&sats) {
        return None;
    }
    Some(bin_position(sats as f64).round() as i32)
}

/// Amount in satoshis at the centre of a bin.
pub fn bin_center_sats(bin: i32) -> f64 {
    10f64.powf(bin as f64 / BINS_PER_DECADE as f64)
}

/// Immutable bin → count view of candidate amounts.
///
/// Deserialized histograms are checked so that `total_weight` equals the sum
/// of the bins and no bin is empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "HistogramRecord")]
pub struct Histogram {
    bins: BTreeMap<i32, u64>,
    total_weight: u64,
}

#[derive(Deserialize)]
struct HistogramRecord {
    bins: BTreeMap<i32, u64>,
    total_weight: u64,
}

impl TryFrom<HistogramRecord> for Histogram {
    type Error = OracleError;

    fn try_from(record: HistogramRecord) -> Result<Self> {
        if let Some((bin, _)) = record.bins.iter().find(|(_, &count)| count == 0) {
            return Err(OracleError::malformed(format!("histogram bin {bin} is empty")));
        }
        let sum = record
            .bins
            .values()
            .try_fold(0u64, |acc, &count| acc.checked_add(count))
            .ok_or_else(|| OracleError::malformed("histogram weight overflows"))?;
        if sum != record.total_weight {
            return Err(OracleError::malformed(format!(
                "histogram total_weight {} does not match its bins ({sum})",
                record.total_weight
            )));
        }

        Ok(Self {
            bins: record.bins,
            total_weight: record.total_weight,
        })
    }
}

impl Histogram {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a histogram from candidate amounts in one pass.
    pub fn from_candidates<'a>(candidates: impl IntoIterator<Item = &'a CandidateAmount>) -> Self {
        let mut builder = HistogramBuilder::new();
        for candidate in candidates {
            builder.add(candidate.value_sats);
        }
        builder.build()
    }

    pub fn get(&self, bin: i32) -> u64 {
        self.bins.get(&bin).copied().unwrap_or(0)
    }

    pub fn bins(&self) -> &BTreeMap<i32, u64> {
        &self.bins
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, u64)> + '_ {
        self.bins.iter().map(|(&bin, &count)| (bin, count))
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// Number of non-empty bins.
    pub fn bin_count(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_weight == 0
    }
}

/// Accumulates candidate amounts into log-scale bins.
///
/// Supports exact removal of a previously merged histogram, which is what
/// lets a sliding window evict a block without rebuilding.
#[derive(Debug, Clone, Default)]
pub struct HistogramBuilder {
    bins: BTreeMap<i32, u64>,
    total_weight: u64,
}

impl HistogramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one amount. Returns false if it falls outside the binned range.
    pub fn add(&mut self, sats: u64) -> bool {
        match bin_index(sats) {
            Some(bin) => {
                *self.bins.entry(bin).or_insert(0) += 1;
                self.total_weight += 1;
                true
            }
            None => false,
        }
    }

    /// Folds another histogram into this one.
    pub fn merge(&mut self, other: &Histogram) {
        for (&bin, &count) in &other.bins {
            *self.bins.entry(bin).or_insert(0) += count;
        }
        self.total_weight += other.total_weight;
    }

    /// Removes the exact contribution of a previously merged histogram.
    ///
    /// Fails without modifying anything if `other` holds weight this builder
    /// does not have.
    pub fn subtract(&mut self, other: &Histogram) -> Result<()> {
        for (&bin, &count) in &other.bins {
            let present = self.bins.get(&bin).copied().unwrap_or(0);
            if present < count {
                return Err(OracleError::calculation(format!(
                    "cannot subtract {count} from bin {bin} holding {present}"
                )));
            }
        }

        for (&bin, &count) in &other.bins {
            if let Some(present) = self.bins.get_mut(&bin) {
                *present -= count;
                if *present == 0 {
                    self.bins.remove(&bin);
                }
            }
        }
        self.total_weight -= other.total_weight;
        Ok(())
    }

    /// Returns an immutable copy of the current bins.
    pub fn snapshot(&self) -> Histogram {
        Histogram {
            bins: self.bins.clone(),
            total_weight: self.total_weight,
        }
    }

    /// Consumes the builder.
    pub fn build(self) -> Histogram {
        Histogram {
            bins: self.bins,
            total_weight: self.total_weight,
        }
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    pub fn is_empty(&self) -> bool {
        self.total_weight == 0
    }
}

/// Dense array form of a [`Histogram`] for sweeps.
///
/// Holds cumulative weights over the bin range [offset, offset + len), so any
/// range sum is two lookups.
#[derive(Debug, Clone)]
pub struct DenseHistogram {
    offset: i32,
    /// `cumulative[i]` is the weight of the first `i` bins
    cumulative: Array1<f64>,
    total: f64,
}

impl DenseHistogram {
    pub fn from_histogram(histogram: &Histogram) -> Self {
        let (first, last) = match (histogram.bins.keys().next(), histogram.bins.keys().next_back()) {
            (Some(&first), Some(&last)) => (first, last),
            _ => {
                return Self {
                    offset: 0,
                    cumulative: Array1::zeros(1),
                    total: 0.0,
                }
            }
        };

        let mut cumulative = Array1::zeros((last - first + 2) as usize);
        for (&bin, &count) in &histogram.bins {
            cumulative[(bin - first) as usize + 1] = count as f64;
        }
        cumulative.accumulate_axis_inplace(Axis(0), |&prev, curr| *curr += prev);

        Self {
            offset: first,
            cumulative,
            total: histogram.total_weight as f64,
        }
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn weight_at(&self, bin: i32) -> f64 {
        self.sum_range(bin, bin)
    }

    /// Sum of weights over the inclusive bin range [lo, hi].
    pub fn sum_range(&self, lo: i32, hi: i32) -> f64 {
        let len = self.cumulative.len() as i64 - 1;
        let start = (lo as i64 - self.offset as i64).max(0);
        let end = (hi as i64 - self.offset as i64).min(len - 1);
        if start > end {
            return 0.0;
        }
        self.cumulative[end as usize + 1] - self.cumulative[start as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_index() {
        assert_eq!(bin_index(0), None);
        assert_eq!(bin_index(999), None);
        assert_eq!(bin_index(MAX_BINNED_SATS + 1), None);

        // 10^3 sats → 3 decades → bin 600
        assert_eq!(bin_index(1_000), Some(600));
        assert_eq!(bin_index(100_000_000), Some(1600));
    }

    #[test]
    fn test_same_ratio_same_bin_distance() {
        // Doubling an amount always moves it by the same number of bins
        let a = bin_index(10_000).unwrap();
        let b = bin_index(20_000).unwrap();
        let c = bin_index(1_000_000).unwrap();
        let d = bin_index(2_000_000).unwrap();
        assert_eq!(b - a, d - c);
    }

    #[test]
    fn test_bin_center_round_trip() {
        let bin = bin_index(123_456).unwrap();
        let center = bin_center_sats(bin);
        assert!((center / 123_456.0 - 1.0).abs() < 0.006);
    }

    #[test]
    fn test_builder_add_merge_subtract() {
        let mut block_a = HistogramBuilder::new();
        assert!(block_a.add(50_000));
        assert!(block_a.add(50_100));
        assert!(!block_a.add(10));
        let block_a = block_a.build();

        let mut block_b = HistogramBuilder::new();
        block_b.add(2_000_000);
        let block_b = block_b.build();

        let mut window = HistogramBuilder::new();
        window.merge(&block_a);
        window.merge(&block_b);
        assert_eq!(window.total_weight(), 3);

        window.subtract(&block_a).unwrap();
        assert_eq!(window.snapshot(), block_b);

        window.subtract(&block_b).unwrap();
        assert!(window.is_empty());
        assert_eq!(window.snapshot().bin_count(), 0);
    }

    #[test]
    fn test_subtract_more_than_present_is_atomic() {
        let mut builder = HistogramBuilder::new();
        builder.add(50_000);
        let before = builder.snapshot();

        let mut other = HistogramBuilder::new();
        other.add(50_000);
        other.add(50_000);
        other.add(9_000_000);

        assert!(builder.subtract(&other.build()).is_err());
        assert_eq!(builder.snapshot(), before);
    }

    #[test]
    fn test_dense_histogram() {
        let mut builder = HistogramBuilder::new();
        builder.add(10_000); // bin 800
        builder.add(10_000);
        builder.add(100_000); // bin 1000
        let dense = DenseHistogram::from_histogram(&builder.build());

        assert_eq!(dense.total(), 3.0);
        assert_eq!(dense.weight_at(800), 2.0);
        assert_eq!(dense.weight_at(900), 0.0);
        assert_eq!(dense.sum_range(0, 5_000), 3.0);
        assert_eq!(dense.sum_range(801, 999), 0.0);
        assert_eq!(dense.sum_range(1_001, 2_000), 0.0);

        let empty = DenseHistogram::from_histogram(&Histogram::empty());
        assert_eq!(empty.sum_range(0, 10), 0.0);
        assert_eq!(empty.weight_at(0), 0.0);
    }

    #[test]
    fn test_dense_range_sums_match_bins() {
        let mut builder = HistogramBuilder::new();
        for sats in [1_000, 1_200, 1_200, 5_000, 75_000, 75_100, 9_000_000] {
            builder.add(sats);
        }
        let histogram = builder.build();
        let dense = DenseHistogram::from_histogram(&histogram);

        for lo in 590..1_400 {
            for hi in [lo, lo + 3, lo + 40, lo + 700] {
                let expected: u64 = histogram.bins().range(lo..=hi).map(|(_, &count)| count).sum();
                assert_eq!(dense.sum_range(lo, hi), expected as f64, "[{lo}, {hi}]");
            }
        }
        assert_eq!(dense.sum_range(i32::MIN, i32::MAX), 7.0);
    }

    #[test]
    fn test_deserialization_checks_total_weight() {
        let mut builder = HistogramBuilder::new();
        builder.add(50_000);
        builder.add(50_000);
        let histogram = builder.build();

        let json = serde_json::to_string(&histogram).unwrap();
        assert_eq!(serde_json::from_str::<Histogram>(&json).unwrap(), histogram);

        let inflated = r#"{"bins":{"940":2},"total_weight":9}"#;
        assert!(serde_json::from_str::<Histogram>(inflated).is_err());
        let empty_bin = r#"{"bins":{"940":0},"total_weight":0}"#;
        assert!(serde_json::from_str::<Histogram>(empty_bin).is_err());
        let overflow = r#"{"bins":{"940":18446744073709551615,"941":1},"total_weight":0}"#;
        assert!(serde_json::from_str::<Histogram>(overflow).is_err());

        // A checked histogram can only subtract what a builder holds
        let mut window = HistogramBuilder::new();
        window.add(50_000);
        let forged: Histogram = serde_json::from_str(r#"{"bins":{"940":1},"total_weight":1}"#).unwrap();
        window.subtract(&forged).unwrap();
        assert!(window.is_empty());
    }
}
