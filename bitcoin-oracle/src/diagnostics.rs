use serde::{Deserialize, Serialize};

use crate::filter::Rejection;

/// Filter counters for a batch of transactions.
///
/// Invariants maintained by every mutator:
/// - `total_filtered` is the sum of the six rejection buckets
/// - `passed_filter == total_txs - total_filtered`
///
/// `round_outputs` counts outputs of accepted transactions that were dropped
/// as round BTC amounts; it is not one of the six transaction buckets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub total_txs: u64,
    pub filtered_inputs: u64,
    pub filtered_outputs: u64,
    pub filtered_coinbase: u64,
    pub filtered_op_return: u64,
    pub filtered_witness: u64,
    pub filtered_same_day: u64,
    pub total_filtered: u64,
    pub passed_filter: u64,
    pub round_outputs: u64,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the verdict for one transaction.
    pub fn record(&mut self, rejection: Option<Rejection>, round_outputs: u64) {
        self.total_txs += 1;
        match rejection {
            None => {
                self.passed_filter += 1;
                self.round_outputs += round_outputs;
            }
            Some(reason) => {
                *self.bucket_mut(reason) += 1;
                self.total_filtered += 1;
            }
        }
    }

    /// Adds another batch's counters to this one.
    pub fn merge(&mut self, other: &Diagnostics) {
        self.total_txs += other.total_txs;
        self.filtered_inputs += other.filtered_inputs;
        self.filtered_outputs += other.filtered_outputs;
        self.filtered_coinbase += other.filtered_coinbase;
        self.filtered_op_return += other.filtered_op_return;
        self.filtered_witness += other.filtered_witness;
        self.filtered_same_day += other.filtered_same_day;
        self.total_filtered += other.total_filtered;
        self.passed_filter += other.passed_filter;
        self.round_outputs += other.round_outputs;
    }

    /// Removes a batch previously merged into this one.
    ///
    /// Saturates at zero; callers only subtract batches they merged.
    pub fn subtract(&mut self, other: &Diagnostics) {
        self.total_txs = self.total_txs.saturating_sub(other.total_txs);
        self.filtered_inputs = self.filtered_inputs.saturating_sub(other.filtered_inputs);
        self.filtered_outputs = self.filtered_outputs.saturating_sub(other.filtered_outputs);
        self.filtered_coinbase = self.filtered_coinbase.saturating_sub(other.filtered_coinbase);
        self.filtered_op_return = self.filtered_op_return.saturating_sub(other.filtered_op_return);
        self.filtered_witness = self.filtered_witness.saturating_sub(other.filtered_witness);
        self.filtered_same_day = self.filtered_same_day.saturating_sub(other.filtered_same_day);
        self.total_filtered = self.total_filtered.saturating_sub(other.total_filtered);
        self.passed_filter = self.passed_filter.saturating_sub(other.passed_filter);
        self.round_outputs = self.round_outputs.saturating_sub(other.round_outputs);
    }

    /// Sum of the six rejection buckets.
    pub fn bucket_sum(&self) -> u64 {
        self.filtered_inputs
            + self.filtered_outputs
            + self.filtered_coinbase
            + self.filtered_op_return
            + self.filtered_witness
            + self.filtered_same_day
    }

    /// Checks both counter invariants.
    pub fn is_consistent(&self) -> bool {
        self.total_filtered == self.bucket_sum()
            && self.passed_filter + self.total_filtered == self.total_txs
    }

    pub fn count_for(&self, reason: Rejection) -> u64 {
        match reason {
            Rejection::Coinbase => self.filtered_coinbase,
            Rejection::TooManyInputs => self.filtered_inputs,
            Rejection::OutputShape => self.filtered_outputs,
            Rejection::DataCarrier => self.filtered_op_return,
            Rejection::OversizedWitness => self.filtered_witness,
            Rejection::SameDaySpend => self.filtered_same_day,
        }
    }

    fn bucket_mut(&mut self, reason: Rejection) -> &mut u64 {
        match reason {
            Rejection::Coinbase => &mut self.filtered_coinbase,
            Rejection::TooManyInputs => &mut self.filtered_inputs,
            Rejection::OutputShape => &mut self.filtered_outputs,
            Rejection::DataCarrier => &mut self.filtered_op_return,
            Rejection::OversizedWitness => &mut self.filtered_witness,
            Rejection::SameDaySpend => &mut self.filtered_same_day,
        }
    }
}
