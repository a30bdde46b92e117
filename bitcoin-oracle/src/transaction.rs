use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{OracleError, Result};
use crate::internal::wire;

/// Satoshis per bitcoin.
pub const SATS_PER_BTC: u64 = 100_000_000;

/// Total supply cap in satoshis. No output, and no transaction total, may exceed it.
pub const MAX_MONEY_SATS: u64 = 21_000_000 * SATS_PER_BTC;

/// A transaction id in internal byte order.
///
/// Displayed and serialized in the conventional reversed hex form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Txid([u8; 32]);

impl Txid {
    /// The all-zero id referenced by coinbase inputs.
    pub const ZERO: Txid = Txid([0u8; 32]);

    /// Wraps raw bytes in internal (hash output) order.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parses the reversed hex form used by block explorers and node RPC.
    pub fn from_hex(s: &str) -> Result<Self> {
        let decoded = hex::decode(s)
            .map_err(|e| OracleError::malformed(format!("invalid txid hex: {e}")))?;
        let mut bytes: [u8; 32] = decoded
            .try_into()
            .map_err(|_| OracleError::malformed("txid must be 32 bytes"))?;
        bytes.reverse();
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut reversed = self.0;
        reversed.reverse();
        f.write_str(&hex::encode(reversed))
    }
}

impl fmt::Debug for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Txid({self})")
    }
}

impl Serialize for Txid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Txid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Txid::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Reference to a previous transaction output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Txid,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Txid, vout: u32) -> Self {
        Self { txid, vout }
    }

    /// True for the null outpoint carried by coinbase inputs.
    pub fn is_null(&self) -> bool {
        self.txid == Txid::ZERO && self.vout == u32::MAX
    }
}

/// A transaction input: either the coinbase or a spend of a previous output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TxInput {
    Coinbase,
    Spend {
        previous_output: OutPoint,
        /// Timestamp of the block that created the spent output, when known.
        created_at: Option<DateTime<Utc>>,
    },
}

impl TxInput {
    pub fn spend(previous_output: OutPoint, created_at: Option<DateTime<Utc>>) -> Self {
        Self::Spend {
            previous_output,
            created_at,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self, Self::Coinbase)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Coinbase => None,
            Self::Spend { created_at, .. } => *created_at,
        }
    }
}

/// Output script classification. Only the data-carrier distinction matters
/// to the filter; the other variants are kept for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptKind {
    P2pkh,
    P2sh,
    P2wpkh,
    P2wsh,
    P2tr,
    /// OP_RETURN output; carries data, not spendable value.
    NullData,
    Other,
}

impl ScriptKind {
    /// Classifies a scriptPubKey by its standard template.
    pub fn classify(script: &[u8]) -> Self {
        match script {
            [0x6a, ..] => Self::NullData,
            [0x76, 0xa9, 0x14, body @ .., 0x88, 0xac] if body.len() == 20 => Self::P2pkh,
            [0xa9, 0x14, body @ .., 0x87] if body.len() == 20 => Self::P2sh,
            [0x00, 0x14, body @ ..] if body.len() == 20 => Self::P2wpkh,
            [0x00, 0x20, body @ ..] if body.len() == 32 => Self::P2wsh,
            [0x51, 0x20, body @ ..] if body.len() == 32 => Self::P2tr,
            _ => Self::Other,
        }
    }

    pub fn is_data_carrier(&self) -> bool {
        matches!(self, Self::NullData)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value_sats: u64,
    pub script: ScriptKind,
}

impl TxOutput {
    pub fn new(value_sats: u64, script: ScriptKind) -> Self {
        Self { value_sats, script }
    }
}

/// Lookup of creation timestamps for spent outputs, supplied by the ledger
/// collaborator when decoding serialized transactions.
pub trait PrevoutTimes {
    fn creation_time(&self, outpoint: &OutPoint) -> Option<DateTime<Utc>>;
}

impl PrevoutTimes for HashMap<OutPoint, DateTime<Utc>> {
    fn creation_time(&self, outpoint: &OutPoint) -> Option<DateTime<Utc>> {
        self.get(outpoint).copied()
    }
}

/// No creation times available; the same-day rule never fires.
impl PrevoutTimes for () {
    fn creation_time(&self, _outpoint: &OutPoint) -> Option<DateTime<Utc>> {
        None
    }
}

/// Unvalidated transaction record as received from an external collaborator.
///
/// Convert with [`RawTransaction::from_record`] (or `TryFrom`), which is the
/// only way records enter the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTransactionRecord {
    pub txid: Txid,
    pub version: i32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub locktime: u32,
    #[serde(default)]
    pub witness_size: Option<usize>,
    pub block_height: u32,
    pub block_time: DateTime<Utc>,
}

/// A validated, immutable confirmed transaction.
///
/// # Example
/// ```
/// use bitcoin_oracle::{RawTransaction, RawTransactionRecord, ScriptKind, TxInput, TxOutput, Txid, OutPoint};
/// use chrono::{Duration, Utc};
///
/// let now = Utc::now();
/// let record = RawTransactionRecord {
///     txid: Txid::from_bytes([7u8; 32]),
///     version: 2,
///     inputs: vec![TxInput::spend(
///         OutPoint::new(Txid::from_bytes([1u8; 32]), 0),
///         Some(now - Duration::days(3)),
///     )],
///     outputs: vec![
///         TxOutput::new(123_456, ScriptKind::P2wpkh),
///         TxOutput::new(7_654_321, ScriptKind::P2tr),
///     ],
///     locktime: 0,
///     witness_size: Some(107),
///     block_height: 850_000,
///     block_time: now,
/// };
///
/// let tx = RawTransaction::from_record(record).expect("valid record");
/// assert_eq!(tx.outputs().len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTransactionRecord", into = "RawTransactionRecord")]
pub struct RawTransaction {
    txid: Txid,
    version: i32,
    inputs: Vec<TxInput>,
    outputs: Vec<TxOutput>,
    locktime: u32,
    witness_size: Option<usize>,
    block_height: u32,
    block_time: DateTime<Utc>,
}

impl RawTransaction {
    /// Validates a record and turns it into a transaction.
    ///
    /// Rejects records without inputs or outputs and values above the
    /// supply cap.
    pub fn from_record(record: RawTransactionRecord) -> Result<Self> {
        if record.inputs.is_empty() {
            return Err(OracleError::malformed(format!(
                "transaction {} has no inputs",
                record.txid
            )));
        }
        if record.outputs.is_empty() {
            return Err(OracleError::malformed(format!(
                "transaction {} has no outputs",
                record.txid
            )));
        }

        let mut total: u64 = 0;
        for output in &record.outputs {
            if output.value_sats > MAX_MONEY_SATS {
                return Err(OracleError::malformed(format!(
                    "transaction {} has an output above the supply cap",
                    record.txid
                )));
            }
            total = total
                .checked_add(output.value_sats)
                .filter(|&t| t <= MAX_MONEY_SATS)
                .ok_or_else(|| {
                    OracleError::malformed(format!(
                        "transaction {} outputs exceed the supply cap",
                        record.txid
                    ))
                })?;
        }

        Ok(Self {
            txid: record.txid,
            version: record.version,
            inputs: record.inputs,
            outputs: record.outputs,
            locktime: record.locktime,
            witness_size: record.witness_size,
            block_height: record.block_height,
            block_time: record.block_time,
        })
    }

    /// Decodes a consensus-serialized transaction (legacy or segwit).
    ///
    /// Every declared count is checked against the bytes remaining in
    /// `bytes` before anything is allocated for it, so adversarial length
    /// prefixes fail with [`OracleError::MalformedInput`].
    ///
    /// # Arguments
    /// * `bytes` - The serialized transaction
    /// * `block_height` - Height of the block that confirmed it
    /// * `block_time` - Timestamp of that block
    /// * `prevouts` - Creation times of the outputs it spends
    pub fn from_consensus_bytes(
        bytes: &[u8],
        block_height: u32,
        block_time: DateTime<Utc>,
        prevouts: &impl PrevoutTimes,
    ) -> Result<Self> {
        let decoded = wire::decode_transaction(bytes)?;

        let inputs = decoded
            .inputs
            .iter()
            .map(|outpoint| {
                if outpoint.is_null() {
                    TxInput::Coinbase
                } else {
                    TxInput::spend(*outpoint, prevouts.creation_time(outpoint))
                }
            })
            .collect();

        let outputs = decoded
            .outputs
            .iter()
            .map(|o| TxOutput::new(o.value_sats, o.script))
            .collect();

        Self::from_record(RawTransactionRecord {
            txid: decoded.txid,
            version: decoded.version,
            inputs,
            outputs,
            locktime: decoded.locktime,
            witness_size: decoded.witness_size,
            block_height,
            block_time,
        })
    }

    pub fn txid(&self) -> Txid {
        self.txid
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn inputs(&self) -> &[TxInput] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TxOutput] {
        &self.outputs
    }

    pub fn locktime(&self) -> u32 {
        self.locktime
    }

    /// Size in bytes of the largest per-input witness stack, if the
    /// transaction carries witness data.
    pub fn witness_size(&self) -> Option<usize> {
        self.witness_size
    }

    pub fn block_height(&self) -> u32 {
        self.block_height
    }

    pub fn block_time(&self) -> DateTime<Utc> {
        self.block_time
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.iter().any(TxInput::is_coinbase)
    }
}

impl TryFrom<RawTransactionRecord> for RawTransaction {
    type Error = OracleError;

    fn try_from(record: RawTransactionRecord) -> Result<Self> {
        Self::from_record(record)
    }
}

impl From<RawTransaction> for RawTransactionRecord {
    fn from(tx: RawTransaction) -> Self {
        Self {
            txid: tx.txid,
            version: tx.version,
            inputs: tx.inputs,
            outputs: tx.outputs,
            locktime: tx.locktime,
            witness_size: tx.witness_size,
            block_height: tx.block_height,
            block_time: tx.block_time,
        }
    }
}
