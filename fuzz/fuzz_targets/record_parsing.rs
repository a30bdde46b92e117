#![no_main]

use bitcoin_oracle::{RawTransaction, TransactionFilter};
use libfuzzer_sys::fuzz_target;

// JSON transaction records are validated on deserialization; whatever gets
// through must be safe to filter
fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(transactions) = serde_json::from_str::<Vec<RawTransaction>>(s) {
            let (_, diagnostics) = TransactionFilter::default().filter_batch(&transactions);
            assert_eq!(diagnostics.total_txs, transactions.len() as u64);
            assert!(diagnostics.is_consistent());
        }
    }
});
