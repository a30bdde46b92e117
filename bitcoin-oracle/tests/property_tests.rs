//! Property-based tests for Bitcoin Oracle
//!
//! These tests verify invariants that must hold for any input: counter
//! consistency, sanity bounds on reported prices and exact histogram removal.


use bitcoin_oracle::{
    is_round_amount, Histogram, HistogramBuilder, PriceEstimator, RawTransaction, ScriptKind, TransactionFilter,
    TxInput, TxOutput,
};
use chrono::Duration;
use proptest::prelude::*;
use test_utils::TestUtils;

const HEIGHT: u32 = 850_000;

/// Generate an arbitrary transaction shape at a fixed height
fn transaction_strategy() -> impl Strategy<Value = RawTransaction> {
    (
        any::<bool>(),
        1usize..9,
        prop::collection::vec((1_000u64..2_000_000_000, 0usize..8), 1..5),
        prop::option::of(0usize..1_000),
        prop::collection::vec(prop::option::of(0i64..5), 1..9),
        any::<u32>(),
    )
        .prop_map(|(coinbase, input_count, outputs, witness_size, ages, index)| {
            let block_time = TestUtils::block_time(HEIGHT);
            let inputs = if coinbase {
                vec![TxInput::Coinbase]
            } else {
                (0..input_count)
                    .map(|i| {
                        let age = ages[i % ages.len()];
                        TxInput::spend(
                            bitcoin_oracle::OutPoint::new(TestUtils::txid(HEIGHT - 1, i as u32), 0),
                            age.map(|days| block_time - Duration::days(days)),
                        )
                    })
                    .collect()
            };
            let outputs = outputs
                .into_iter()
                .map(|(value, kind)| {
                    let script = match kind {
                        0 => ScriptKind::NullData,
                        1 => ScriptKind::P2pkh,
                        2 => ScriptKind::P2sh,
                        3 => ScriptKind::P2wsh,
                        4 => ScriptKind::P2tr,
                        _ => ScriptKind::P2wpkh,
                    };
                    TxOutput::new(value, script)
                })
                .collect();
            TestUtils::transaction_with_scripts(HEIGHT, index, inputs, outputs, witness_size)
        })
}

proptest! {
    #[test]
    fn prop_diagnostics_buckets_sum_to_total(
        transactions in prop::collection::vec(transaction_strategy(), 0..60)
    ) {
        let (candidates, diagnostics) = TransactionFilter::default().filter_batch(&transactions);

        prop_assert_eq!(diagnostics.total_txs, transactions.len() as u64);
        prop_assert_eq!(diagnostics.total_txs, diagnostics.bucket_sum() + diagnostics.passed_filter);
        prop_assert!(diagnostics.is_consistent());
        prop_assert!(candidates.iter().all(|c| !is_round_amount(c.value_sats)));
    }

    #[test]
    fn prop_estimate_within_bounds(
        amounts in prop::collection::vec(1_000u64..10_000_000_000, 1..300)
    ) {
        let mut builder = HistogramBuilder::new();
        for &sats in &amounts {
            builder.add(sats);
        }
        let histogram = builder.build();
        let mut diagnostics = bitcoin_oracle::Diagnostics::new();
        for _ in &amounts {
            diagnostics.record(None, 0);
        }

        let result = PriceEstimator::new().estimate(&histogram, &diagnostics, None);
        match result.price_usd {
            Some(price) => {
                prop_assert!((10_000.0..=500_000.0).contains(&price));
                prop_assert!((0.0..=1.0).contains(&result.confidence));
            }
            None => prop_assert_eq!(result.confidence, 0.0),
        }
    }

    #[test]
    fn prop_merge_then_subtract_is_identity(
        base in prop::collection::vec(1_000u64..1_000_000_000, 0..100),
        extra in prop::collection::vec(1_000u64..1_000_000_000, 0..100),
    ) {
        let mut builder = HistogramBuilder::new();
        for &sats in &base {
            builder.add(sats);
        }
        let before = builder.snapshot();

        let mut other = HistogramBuilder::new();
        for &sats in &extra {
            other.add(sats);
        }
        let other = other.build();

        builder.merge(&other);
        prop_assert_eq!(builder.total_weight(), (base.len() + extra.len()) as u64);
        builder.subtract(&other).unwrap();
        prop_assert_eq!(builder.snapshot(), before);
    }

    #[test]
    fn prop_histogram_weight_counts_binned_amounts(
        amounts in prop::collection::vec(0u64..100_000_000_000, 0..200)
    ) {
        let mut builder = HistogramBuilder::new();
        let accepted = amounts.iter().filter(|&&sats| builder.add(sats)).count();
        let histogram: Histogram = builder.build();

        prop_assert_eq!(histogram.total_weight(), accepted as u64);
        prop_assert_eq!(histogram.iter().map(|(_, count)| count).sum::<u64>(), accepted as u64);
    }
}
