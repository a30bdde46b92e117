#![no_main]

use bitcoin_oracle::{OracleError, RawTransaction, TransactionFilter};
use chrono::{TimeZone, Utc};
use libfuzzer_sys::fuzz_target;

// Arbitrary bytes must decode or fail with MalformedInput, never panic or
// allocate by declared counts
fuzz_target!(|data: &[u8]| {
    let block_time = Utc.with_ymd_and_hms(2024, 4, 20, 0, 0, 0).unwrap();

    match RawTransaction::from_consensus_bytes(data, 840_000, block_time, &()) {
        Ok(tx) => {
            assert!(!tx.outputs().is_empty());
            let outcome = TransactionFilter::default().filter(&tx);
            assert!(outcome.candidates.len() <= tx.outputs().len());
        }
        Err(OracleError::MalformedInput(_)) => {}
        Err(e) => panic!("unexpected error kind: {e}"),
    }
});
