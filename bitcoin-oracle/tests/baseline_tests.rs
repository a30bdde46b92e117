//! Rolling baseline calculator, end to end.


use bitcoin_oracle::{
    BaselineConfig, BaselineStatus, CalculatorState, EstimateStatus, OracleError, RollingBaselineCalculator,
};
use std::cell::Cell;
use test_utils::TestUtils;

const TRUE_PRICE: f64 = 100_000.0;

fn fed_calculator(seed: u64, blocks: u32, config: BaselineConfig) -> RollingBaselineCalculator {
    let mut calculator = RollingBaselineCalculator::new(config).unwrap();
    let mut rng = TestUtils::rng(seed);
    for height in 1..=blocks {
        let block = TestUtils::fiat_block(&mut rng, height, 100, TRUE_PRICE);
        calculator.add_block(&block, height).unwrap();
    }
    calculator
}

#[test]
fn test_end_to_end_price_discovery() {
    let mut calculator = fed_calculator(2024, 20, BaselineConfig::default());
    assert_eq!(calculator.state(), CalculatorState::Warming { blocks: 20 });

    let baseline = calculator.calculate_baseline().unwrap();
    assert_eq!(baseline.status, BaselineStatus::Ready);

    let price = baseline.price.unwrap();
    assert!(
        (price / TRUE_PRICE - 1.0).abs() < 0.10,
        "expected ~{TRUE_PRICE}, got {price}"
    );
    assert!(baseline.confidence > 0.5);
    assert!((baseline.price_min.unwrap() - price * 0.95).abs() < 1e-6);
    assert!((baseline.price_max.unwrap() - price * 1.05).abs() < 1e-6);
    assert_eq!(baseline.blocks_used, 20);
    assert_eq!(baseline.tip_height, Some(20));
    assert_eq!(baseline.as_of, Some(TestUtils::block_time(20)));
    assert_eq!(calculator.last_price(), Some(price));

    assert!(!baseline.intraday.is_empty());
    assert!(baseline
        .intraday
        .windows(2)
        .all(|w| w[0].timestamp <= w[1].timestamp));
    for point in &baseline.intraday {
        assert!((point.price / TRUE_PRICE - 1.0).abs() < 0.05);
        assert!((1..=20).contains(&point.block_height));
    }
}

#[test]
fn test_identical_feeds_give_identical_results() {
    let mut a = fed_calculator(77, 15, BaselineConfig::default());
    let mut b = fed_calculator(77, 15, BaselineConfig::default());

    let first = a.calculate_baseline().unwrap();
    let second = b.calculate_baseline().unwrap();

    assert_eq!(first, second);
    assert_eq!(first.as_of, Some(TestUtils::block_time(15)));
    assert_eq!(a.aggregate_histogram(), b.aggregate_histogram());
    assert_eq!(a.diagnostics(), b.diagnostics());
}

#[test]
fn test_insufficient_data_is_explicit() {
    let mut calculator = fed_calculator(5, 9, BaselineConfig::default());
    let baseline = calculator.calculate_baseline().unwrap();

    assert_eq!(
        baseline.status,
        BaselineStatus::InsufficientData {
            blocks_available: 9,
            blocks_required: 10
        }
    );
    assert_eq!(baseline.price, None);
    assert_eq!(baseline.confidence, 0.0);
    assert!(baseline.intraday.is_empty());

    let estimate = calculator.calculate_estimate().unwrap();
    assert!(estimate.price.is_none());
}

#[test]
fn test_empty_blocks_report_no_signal() {
    let mut calculator = RollingBaselineCalculator::new(BaselineConfig::default()).unwrap();
    for height in 1..=10 {
        calculator.add_block(&[], height).unwrap();
    }

    let estimate = calculator.calculate_estimate().unwrap();
    assert_eq!(
        estimate.baseline.status,
        BaselineStatus::NoEstimate {
            reason: EstimateStatus::NoSignal
        }
    );
    assert_eq!(estimate.price.map(|p| p.status), Some(EstimateStatus::NoSignal));
}

#[test]
fn test_snapshot_estimation_off_the_calculator() {
    let mut calculator = fed_calculator(8, 12, BaselineConfig::default());
    let snapshot = calculator.snapshot();
    let estimator = calculator.estimator();

    let estimate = estimator.estimate(&snapshot, &|| false).unwrap();
    assert_eq!(estimate.baseline.window_version, calculator.version());
    assert!(calculator.accept_baseline(estimate.clone()));

    // Served from cache until the window changes
    let cached = calculator.calculate_estimate().unwrap();
    assert_eq!(cached, estimate);
}

#[test]
fn test_cancelled_sweep() {
    let calculator = fed_calculator(8, 12, BaselineConfig::default());
    let snapshot = calculator.snapshot();

    let polls = Cell::new(0);
    let cancel_after_first_poll = || {
        polls.set(polls.get() + 1);
        polls.get() > 1
    };
    let result = calculator.estimate_snapshot(&snapshot, &cancel_after_first_poll);

    assert!(matches!(result, Err(OracleError::Cancelled)));
    assert_eq!(polls.get(), 2);
}

#[test]
fn test_stale_estimate_is_discarded() {
    let mut calculator = fed_calculator(13, 12, BaselineConfig::default());
    let snapshot = calculator.snapshot();
    let estimate = calculator.estimate_snapshot(&snapshot, &|| false).unwrap();

    let mut rng = TestUtils::rng(99);
    let block = TestUtils::fiat_block(&mut rng, 13, 10, TRUE_PRICE);
    calculator.add_block(&block, 13).unwrap();

    assert!(!calculator.accept_baseline(estimate));
    assert_eq!(calculator.last_price(), None);
}

#[test]
fn test_generate_intraday_points() {
    let calculator = RollingBaselineCalculator::new(BaselineConfig {
        intraday_chunk_size: 50,
        ..BaselineConfig::default()
    })
    .unwrap();
    let mut rng = TestUtils::rng(31);
    let mut transactions = Vec::new();
    for height in 1..=4 {
        transactions.extend(TestUtils::fiat_block(&mut rng, height, 50, TRUE_PRICE));
    }

    let points = calculator.generate_intraday_points(&transactions, 97_000.0).unwrap();
    assert_eq!(points.len(), 8);
    assert_eq!(points.last().map(|p| p.block_height), Some(4));
    assert!(points.iter().all(|p| (p.price / TRUE_PRICE - 1.0).abs() < 0.02));

    assert!(calculator.generate_intraday_points(&[], 97_000.0).unwrap().is_empty());
}
