use serde::{Deserialize, Serialize};

use crate::diagnostics::Diagnostics;
use crate::error::{OracleError, Result};
use crate::transaction::{RawTransaction, Txid};

/// Smallest value treated as a round amount (0.00005 BTC).
pub const ROUND_AMOUNT_FLOOR_SATS: u64 = 5_000;

/// Why a transaction was excluded from the signal set.
///
/// Variants are listed in the order the rules are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    /// Spends the coinbase.
    Coinbase,
    /// More inputs than allowed (consolidation or mixing).
    TooManyInputs,
    /// Not the payment + change shape.
    OutputShape,
    /// Has an OP_RETURN output.
    DataCarrier,
    /// Witness stack above the size threshold.
    OversizedWitness,
    /// Spends an output created on the same UTC day.
    SameDaySpend,
}

/// Limits applied by [`TransactionFilter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Maximum number of inputs (default: 5)
    pub max_inputs: usize,
    /// Exact number of outputs required (default: 2)
    pub required_outputs: usize,
    /// Largest per-input witness stack in bytes (default: 500)
    pub max_witness_bytes: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_inputs: 5,
            required_outputs: 2,
            max_witness_bytes: 500,
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_inputs == 0 {
            return Err(OracleError::invalid_config("max_inputs must be at least 1"));
        }
        if self.required_outputs == 0 {
            return Err(OracleError::invalid_config("required_outputs must be at least 1"));
        }
        Ok(())
    }
}

/// An output value eligible to contribute to price discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateAmount {
    pub txid: Txid,
    pub value_sats: u64,
}

/// Verdict for a single transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterOutcome {
    pub rejection: Option<Rejection>,
    pub candidates: Vec<CandidateAmount>,
    /// Outputs of an accepted transaction dropped as round amounts.
    pub round_outputs: u64,
}

impl FilterOutcome {
    pub fn is_accepted(&self) -> bool {
        self.rejection.is_none()
    }
}

/// Returns true when `sats` is d × 10^k satoshis with d in {1, 2, 5} and
/// 10^k ≥ 1,000, at or above 0.00005 BTC.
///
/// These are amounts people pick in BTC terms, so they carry no fiat signal.
pub fn is_round_amount(sats: u64) -> bool {
    if sats < ROUND_AMOUNT_FLOOR_SATS {
        return false;
    }
    let mut mantissa = sats;
    let mut scale = 1u64;
    while mantissa % 10 == 0 {
        mantissa /= 10;
        scale *= 10;
    }
    scale >= 1_000 && matches!(mantissa, 1 | 2 | 5)
}

/// Classifies transactions as price signal or noise.
///
/// Stateless: the same transaction always yields the same outcome.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    config: FilterConfig,
}

impl TransactionFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Applies the rejection rules in order and returns the first that matches.
    pub fn classify(&self, tx: &RawTransaction) -> Option<Rejection> {
        if tx.inputs().iter().any(|input| input.is_coinbase()) {
            return Some(Rejection::Coinbase);
        }
        if tx.inputs().len() > self.config.max_inputs {
            return Some(Rejection::TooManyInputs);
        }
        if tx.outputs().len() != self.config.required_outputs {
            return Some(Rejection::OutputShape);
        }
        if tx.outputs().iter().any(|output| output.script.is_data_carrier()) {
            return Some(Rejection::DataCarrier);
        }
        if tx
            .witness_size()
            .is_some_and(|size| size > self.config.max_witness_bytes)
        {
            return Some(Rejection::OversizedWitness);
        }

        let block_day = tx.block_time().date_naive();
        let same_day = tx
            .inputs()
            .iter()
            .filter_map(|input| input.created_at())
            .any(|created| created.date_naive() == block_day);
        if same_day {
            return Some(Rejection::SameDaySpend);
        }

        None
    }

    /// Filters one transaction and extracts its candidate amounts.
    pub fn filter(&self, tx: &RawTransaction) -> FilterOutcome {
        if let Some(rejection) = self.classify(tx) {
            return FilterOutcome {
                rejection: Some(rejection),
                candidates: Vec::new(),
                round_outputs: 0,
            };
        }

        let mut candidates = Vec::with_capacity(tx.outputs().len());
        let mut round_outputs = 0;
        for output in tx.outputs() {
            if is_round_amount(output.value_sats) {
                round_outputs += 1;
            } else {
                candidates.push(CandidateAmount {
                    txid: tx.txid(),
                    value_sats: output.value_sats,
                });
            }
        }

        FilterOutcome {
            rejection: None,
            candidates,
            round_outputs,
        }
    }

    /// Filters a batch, returning all candidates and the batch counters.
    pub fn filter_batch(&self, transactions: &[RawTransaction]) -> (Vec<CandidateAmount>, Diagnostics) {
        let mut diagnostics = Diagnostics::new();
        let mut candidates = Vec::new();

        for tx in transactions {
            let outcome = self.filter(tx);
            diagnostics.record(outcome.rejection, outcome.round_outputs);
            candidates.extend(outcome.candidates);
        }

        (candidates, diagnostics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{OutPoint, RawTransactionRecord, ScriptKind, TxInput, TxOutput, SATS_PER_BTC};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn block_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 15, 30, 0).unwrap()
    }

    fn spend(days_old: i64) -> TxInput {
        TxInput::spend(
            OutPoint::new(Txid::from_bytes([3u8; 32]), 0),
            Some(block_time() - Duration::days(days_old)),
        )
    }

    fn tx(inputs: Vec<TxInput>, outputs: Vec<TxOutput>, witness_size: Option<usize>) -> RawTransaction {
        RawTransaction::from_record(RawTransactionRecord {
            txid: Txid::from_bytes([5u8; 32]),
            version: 2,
            inputs,
            outputs,
            locktime: 0,
            witness_size,
            block_height: 840_000,
            block_time: block_time(),
        })
        .unwrap()
    }

    fn payment() -> Vec<TxOutput> {
        vec![
            TxOutput::new(123_457, ScriptKind::P2wpkh),
            TxOutput::new(8_765_431, ScriptKind::P2wpkh),
        ]
    }

    #[test]
    fn test_round_amounts() {
        assert!(is_round_amount(5_000));
        assert!(is_round_amount(10_000));
        assert!(is_round_amount(20_000));
        assert!(is_round_amount(1_000_000));
        assert!(is_round_amount(SATS_PER_BTC));
        assert!(is_round_amount(2 * SATS_PER_BTC));

        assert!(!is_round_amount(0));
        assert!(!is_round_amount(1_000));
        assert!(!is_round_amount(2_000));
        assert!(!is_round_amount(30_000));
        assert!(!is_round_amount(1_000_001));
        assert!(!is_round_amount(123_456));
    }

    #[test]
    fn test_accepts_organic_payment() {
        let filter = TransactionFilter::default();
        let outcome = filter.filter(&tx(vec![spend(3)], payment(), Some(107)));

        assert!(outcome.is_accepted());
        assert_eq!(outcome.candidates.len(), 2);
        assert_eq!(outcome.round_outputs, 0);
    }

    #[test]
    fn test_rule_order() {
        let filter = TransactionFilter::default();

        // Coinbase wins over every later rule
        let coinbase = tx(vec![TxInput::Coinbase], vec![TxOutput::new(1, ScriptKind::NullData)], None);
        assert_eq!(filter.classify(&coinbase), Some(Rejection::Coinbase));

        let many_inputs = tx(vec![spend(0); 6], vec![TxOutput::new(1, ScriptKind::P2tr)], None);
        assert_eq!(filter.classify(&many_inputs), Some(Rejection::TooManyInputs));

        let three_outputs = tx(
            vec![spend(3)],
            vec![TxOutput::new(1_111, ScriptKind::P2tr); 3],
            None,
        );
        assert_eq!(filter.classify(&three_outputs), Some(Rejection::OutputShape));

        let op_return = tx(
            vec![spend(0)],
            vec![TxOutput::new(0, ScriptKind::NullData), TxOutput::new(77_777, ScriptKind::P2tr)],
            Some(10_000),
        );
        assert_eq!(filter.classify(&op_return), Some(Rejection::DataCarrier));

        let big_witness = tx(vec![spend(0)], payment(), Some(501));
        assert_eq!(filter.classify(&big_witness), Some(Rejection::OversizedWitness));

        let same_day = tx(vec![spend(3), spend(0)], payment(), Some(500));
        assert_eq!(filter.classify(&same_day), Some(Rejection::SameDaySpend));
    }

    #[test]
    fn test_unknown_creation_time_is_not_same_day() {
        let filter = TransactionFilter::default();
        let input = TxInput::spend(OutPoint::new(Txid::from_bytes([3u8; 32]), 1), None);
        assert_eq!(filter.classify(&tx(vec![input], payment(), None)), None);
    }

    #[test]
    fn test_round_output_excluded_without_rejection() {
        let filter = TransactionFilter::default();
        let outputs = vec![
            TxOutput::new(1_000_000, ScriptKind::P2wpkh), // 0.01 BTC
            TxOutput::new(4_321_987, ScriptKind::P2wpkh),
        ];
        let outcome = filter.filter(&tx(vec![spend(2)], outputs, None));

        assert!(outcome.is_accepted());
        assert_eq!(outcome.round_outputs, 1);
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.candidates[0].value_sats, 4_321_987);
    }

    #[test]
    fn test_filter_batch_diagnostics() {
        let filter = TransactionFilter::default();
        let batch = vec![
            tx(vec![spend(3)], payment(), None),
            tx(vec![TxInput::Coinbase], payment(), None),
            tx(vec![spend(0)], payment(), None),
            tx(vec![spend(1)], vec![TxOutput::new(500_000, ScriptKind::P2wpkh), TxOutput::new(654_321, ScriptKind::P2sh)], None),
        ];

        let (candidates, diag) = filter.filter_batch(&batch);

        assert_eq!(diag.total_txs, 4);
        assert_eq!(diag.filtered_coinbase, 1);
        assert_eq!(diag.filtered_same_day, 1);
        assert_eq!(diag.passed_filter, 2);
        assert_eq!(diag.round_outputs, 1);
        assert!(diag.is_consistent());
        assert_eq!(candidates.len(), 3);
    }

    #[test]
    fn test_custom_limits() {
        let filter = TransactionFilter::new(FilterConfig {
            max_inputs: 1,
            required_outputs: 2,
            max_witness_bytes: 100,
        });
        assert_eq!(
            filter.classify(&tx(vec![spend(3), spend(4)], payment(), None)),
            Some(Rejection::TooManyInputs)
        );
        assert_eq!(
            filter.classify(&tx(vec![spend(3)], payment(), Some(107))),
            Some(Rejection::OversizedWitness)
        );
        assert!(FilterConfig { max_inputs: 0, ..FilterConfig::default() }.validate().is_err());
    }
}
