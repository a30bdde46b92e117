//! Histogram binning and sliding-window aggregation.


use bitcoin_oracle::{
    bin_center_sats, bin_index, BaselineConfig, Histogram, HistogramBuilder, RawTransaction,
    RollingBaselineCalculator, TransactionFilter, BINS_PER_DECADE,
};
use test_utils::TestUtils;

fn rebuild(blocks: &[Vec<RawTransaction>]) -> Histogram {
    let filter = TransactionFilter::default();
    let mut builder = HistogramBuilder::new();
    for block in blocks {
        let (candidates, _) = filter.filter_batch(block);
        builder.merge(&Histogram::from_candidates(&candidates));
    }
    builder.build()
}

#[test]
fn test_aggregate_matches_rebuild_after_eviction() {
    let config = BaselineConfig {
        window_blocks: 10,
        min_blocks: 10,
        ..BaselineConfig::default()
    };
    let mut calculator = RollingBaselineCalculator::new(config).unwrap();
    let mut rng = TestUtils::rng(42);

    let mut blocks = Vec::new();
    for height in 100..125 {
        let block = TestUtils::mixed_block(&mut rng, height, 60, 70_000.0);
        calculator.add_block(&block, height).unwrap();
        blocks.push(block);

        let start = blocks.len().saturating_sub(10);
        let expected = rebuild(&blocks[start..]);
        let actual = calculator.aggregate_histogram();

        assert_eq!(actual.total_weight(), expected.total_weight());
        for (bin, count) in expected.iter() {
            assert_eq!(actual.get(bin), count, "bin {bin} after block {height}");
        }
        assert_eq!(actual, expected);
    }

    assert_eq!(calculator.block_count(), 10);
    assert_eq!(calculator.heights().collect::<Vec<_>>(), (115..125).collect::<Vec<_>>());
    assert!(calculator.diagnostics().is_consistent());
    assert_eq!(calculator.diagnostics().total_txs, 10 * 60);
}

#[test]
fn test_relative_amounts_share_bin_distance_across_regimes() {
    // $20 vs $100 is the same bin distance at any price
    for price in [20_000.0, 60_000.0, 150_000.0] {
        let twenty = bin_index((20.0 / price * 1e8) as u64).unwrap();
        let hundred = bin_index((100.0 / price * 1e8) as u64).unwrap();
        let expected = (5f64.log10() * BINS_PER_DECADE as f64).round() as i32;
        assert!((hundred - twenty - expected).abs() <= 1);
    }
}

#[test]
fn test_bin_centres_are_monotonic() {
    let centres: Vec<f64> = (600..2_600).map(bin_center_sats).collect();
    assert!(centres.windows(2).all(|w| w[1] > w[0]));
}

#[test]
fn test_out_of_range_amounts_are_not_counted() {
    let mut builder = HistogramBuilder::new();
    assert!(!builder.add(546));
    assert!(!builder.add(0));
    assert!(builder.add(1_000));
    assert_eq!(builder.total_weight(), 1);
}
