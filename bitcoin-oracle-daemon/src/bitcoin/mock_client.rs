use async_trait::async_trait;
use bitcoin_oracle::{
    OutPoint, RawTransaction, RawTransactionRecord, ScriptKind, TxInput, TxOutput, Txid, DEFAULT_REFERENCE_USD,
};
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicU32, Ordering};

use super::{LedgerBlock, LedgerSource, RpcError};

const GENESIS_TIMESTAMP: i64 = 1_231_006_505;
const BLOCK_SUBSIDY_SATS: u64 = 312_500_000;

/// Synthetic ledger whose blocks are full of payments of round dollar
/// amounts at a fixed price.
///
/// Blocks are a pure function of their height, so refetching a height always
/// yields the same transactions.
#[derive(Debug)]
pub struct MockLedger {
    price_usd: f64,
    transactions_per_block: u32,
    tip: AtomicU32,
}

impl MockLedger {
    pub fn new(price_usd: f64, tip_height: u32) -> Self {
        Self {
            price_usd,
            transactions_per_block: 200,
            tip: AtomicU32::new(tip_height),
        }
    }

    pub fn with_transactions_per_block(mut self, count: u32) -> Self {
        self.transactions_per_block = count;
        self
    }

    pub fn price_usd(&self) -> f64 {
        self.price_usd
    }

    /// Mines `blocks` more blocks and returns the new tip.
    pub fn advance(&self, blocks: u32) -> u32 {
        self.tip.fetch_add(blocks, Ordering::SeqCst) + blocks
    }

    /// Test connection (always succeeds in mock mode)
    pub async fn test_connection(&self) -> Result<(), RpcError> {
        Ok(())
    }

    pub fn block_time(height: u32) -> DateTime<Utc> {
        DateTime::UNIX_EPOCH + Duration::seconds(GENESIS_TIMESTAMP + 600 * height as i64)
    }

    fn txid(height: u32, index: u32, tag: u8) -> Txid {
        let mut bytes = [tag; 32];
        bytes[..4].copy_from_slice(&height.to_le_bytes());
        bytes[4..8].copy_from_slice(&index.to_le_bytes());
        Txid::from_bytes(bytes)
    }

    fn coinbase(height: u32, block_time: DateTime<Utc>) -> Result<RawTransaction, RpcError> {
        Ok(RawTransaction::from_record(RawTransactionRecord {
            txid: Self::txid(height, u32::MAX, 0xcb),
            version: 2,
            inputs: vec![TxInput::Coinbase],
            outputs: vec![TxOutput::new(BLOCK_SUBSIDY_SATS, ScriptKind::P2wpkh)],
            locktime: 0,
            witness_size: Some(34),
            block_height: height,
            block_time,
        })?)
    }

    fn payment(&self, height: u32, index: u32, block_time: DateTime<Utc>) -> Result<RawTransaction, RpcError> {
        let usd = DEFAULT_REFERENCE_USD[(index as usize * 7 + height as usize) % DEFAULT_REFERENCE_USD.len()];
        // Deterministic spread of ±0.25% around the exact amount
        let wobble = 1.0 + ((index + height) % 11) as f64 * 0.0005 - 0.0025;
        let payment = (usd / self.price_usd * wobble * 1e8) as u64;
        let change = 1_000_003 + (index as u64 * 7_919 + height as u64 * 104_729) % 50_000_000;

        Ok(RawTransaction::from_record(RawTransactionRecord {
            txid: Self::txid(height, index, 0x11),
            version: 2,
            inputs: vec![TxInput::spend(
                OutPoint::new(Self::txid(height.saturating_sub(288), index, 0x11), 1),
                Some(block_time - Duration::days(2)),
            )],
            outputs: vec![
                TxOutput::new(payment, ScriptKind::P2wpkh),
                TxOutput::new(change, ScriptKind::P2tr),
            ],
            locktime: 0,
            witness_size: Some(107),
            block_height: height,
            block_time,
        })?)
    }
}

#[async_trait]
impl LedgerSource for MockLedger {
    async fn tip_height(&self) -> Result<u32, RpcError> {
        Ok(self.tip.load(Ordering::SeqCst))
    }

    async fn block_at(&self, height: u32) -> Result<LedgerBlock, RpcError> {
        if height > self.tip.load(Ordering::SeqCst) {
            return Err(RpcError::RpcError {
                code: -8,
                message: "Block height out of range".to_string(),
            });
        }

        let time = Self::block_time(height);
        let mut transactions = Vec::with_capacity(self.transactions_per_block as usize + 1);
        transactions.push(Self::coinbase(height, time)?);
        for index in 0..self.transactions_per_block {
            transactions.push(self.payment(height, index, time)?);
        }

        Ok(LedgerBlock {
            height,
            hash: format!("{:064x}", height),
            time,
            transactions,
        })
    }
}
