#![no_main]

use bitcoin_oracle::{Diagnostics, HistogramBuilder, PriceEstimator};
use libfuzzer_sys::fuzz_target;

// Any histogram yields either no price or one inside the sanity bounds
fuzz_target!(|data: &[u8]| {
    let mut builder = HistogramBuilder::new();
    let mut diagnostics = Diagnostics::new();

    for chunk in data.chunks_exact(8).take(10_000) {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(chunk);
        // Up to 100 BTC
        builder.add(u64::from_le_bytes(bytes) % 10_000_000_000);
        diagnostics.record(None, 0);
    }

    let result = PriceEstimator::new().estimate(&builder.build(), &diagnostics, None);
    match result.price_usd {
        Some(price) => {
            assert!((10_000.0..=500_000.0).contains(&price));
            assert!((0.0..=1.0).contains(&result.confidence));
        }
        None => assert_eq!(result.confidence, 0.0),
    }
});
