//! Time-localized price samples within a window.
//!
//! Candidates are ordered by block timestamp and cut into fixed-size chunks.
//! Each chunk is matched against the reference amounts near a rough price and
//! reports the median implied price of its densest cluster.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, OrderStatistics};

use crate::error::{OracleError, Result};
use crate::histogram::BINS_PER_DECADE;
use crate::transaction::SATS_PER_BTC;

/// A candidate amount with the block it was confirmed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedCandidate {
    pub value_sats: u64,
    pub block_height: u32,
    pub timestamp: DateTime<Utc>,
}

/// One price sample of the intraday trace.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntradayPoint {
    pub price: f64,
    pub block_height: u32,
    pub timestamp: DateTime<Utc>,
}

/// Derives intraday points from timed candidates.
#[derive(Debug, Clone)]
pub struct IntradayTracer {
    chunk_size: usize,
    search_pct: f64,
    cluster_ratio: f64,
    references_usd: Vec<f64>,
    min_price: f64,
    max_price: f64,
}

impl IntradayTracer {
    /// # Arguments
    /// * `chunk_size` - Candidates per sample
    /// * `search_pct` - Half-width of the search band around the rough price
    /// * `tolerance_bins` - Cluster width, in histogram bins on either side
    /// * `references_usd` - Reference fiat amounts
    /// * `bounds` - Sanity bounds; samples outside are dropped
    pub fn new(
        chunk_size: usize,
        search_pct: f64,
        tolerance_bins: i32,
        references_usd: Vec<f64>,
        bounds: (f64, f64),
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(OracleError::invalid_config("intraday_chunk_size must be at least 1"));
        }
        if !(search_pct > 0.0 && search_pct < 1.0) {
            return Err(OracleError::invalid_config("intraday_search_pct must be between 0 and 1"));
        }
        if references_usd.is_empty() {
            return Err(OracleError::invalid_config("At least one reference amount must be provided"));
        }

        let width_bins = (2 * tolerance_bins.max(0) + 1) as f64;
        Ok(Self {
            chunk_size,
            search_pct,
            cluster_ratio: 10f64.powf(width_bins / BINS_PER_DECADE as f64),
            references_usd,
            min_price: bounds.0,
            max_price: bounds.1,
        })
    }

    /// Produces one point per chunk that yields an in-bounds price.
    ///
    /// Ordering of the output follows block timestamps; candidates sharing a
    /// timestamp keep their input order.
    pub fn trace<'a>(
        &self,
        candidates: impl IntoIterator<Item = &'a TimedCandidate>,
        rough_price: f64,
    ) -> Result<Vec<IntradayPoint>> {
        if !rough_price.is_finite() || rough_price <= 0.0 {
            return Err(OracleError::invalid_parameter(format!(
                "rough price must be positive, got {rough_price}"
            )));
        }

        let mut ordered: Vec<&TimedCandidate> = candidates.into_iter().collect();
        ordered.sort_by_key(|candidate| candidate.timestamp);

        let mut points = Vec::new();
        for chunk in ordered.chunks(self.chunk_size) {
            let Some(last) = chunk.last() else { continue };
            let implied: Vec<f64> = chunk
                .iter()
                .filter_map(|candidate| self.implied_price(candidate.value_sats, rough_price))
                .collect();

            let Some(price) = self.cluster_median(implied, rough_price) else {
                continue;
            };
            if !(self.min_price..=self.max_price).contains(&price) {
                continue;
            }

            points.push(IntradayPoint {
                price,
                block_height: last.block_height,
                timestamp: last.timestamp,
            });
        }

        Ok(points)
    }

    /// Price implied by the reference amount closest to `rough_price`, if any
    /// falls within the search band.
    fn implied_price(&self, value_sats: u64, rough_price: f64) -> Option<f64> {
        if value_sats == 0 {
            return None;
        }
        let btc = value_sats as f64 / SATS_PER_BTC as f64;
        let lo = rough_price * (1.0 - self.search_pct);
        let hi = rough_price * (1.0 + self.search_pct);

        self.references_usd
            .iter()
            .map(|usd| usd / btc)
            .filter(|price| (lo..=hi).contains(price))
            .min_by(|a, b| {
                let da = (a / rough_price).ln().abs();
                let db = (b / rough_price).ln().abs();
                da.total_cmp(&db)
            })
    }

    /// Median of the densest run of implied prices within the cluster ratio.
    fn cluster_median(&self, mut prices: Vec<f64>, rough_price: f64) -> Option<f64> {
        if prices.is_empty() {
            return None;
        }
        prices.sort_by(f64::total_cmp);

        let mut best: Option<(usize, usize)> = None;
        let mut start = 0;
        for end in 0..prices.len() {
            while prices[end] / prices[start] > self.cluster_ratio {
                start += 1;
            }
            best = match best {
                None => Some((start, end)),
                Some((s, e)) => {
                    let (len, best_len) = (end - start, e - s);
                    let closer = || {
                        let centre = (prices[start] * prices[end]).sqrt();
                        let best_centre = (prices[s] * prices[e]).sqrt();
                        (centre / rough_price).ln().abs() < (best_centre / rough_price).ln().abs()
                    };
                    if len > best_len || (len == best_len && closer()) {
                        Some((start, end))
                    } else {
                        Some((s, e))
                    }
                }
            };
        }

        let (s, e) = best?;
        let mut cluster = Data::new(prices[s..=e].to_vec());
        Some(cluster.median())
    }
}
