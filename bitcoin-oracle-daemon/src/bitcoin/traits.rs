use async_trait::async_trait;
use bitcoin_oracle::RawTransaction;
use chrono::{DateTime, Utc};

use super::RpcError;

/// A confirmed block with its decoded transactions.
#[derive(Debug, Clone)]
pub struct LedgerBlock {
    pub height: u32,
    pub hash: String,
    pub time: DateTime<Utc>,
    pub transactions: Vec<RawTransaction>,
}

/// Source of confirmed blocks
#[async_trait]
pub trait LedgerSource: Send + Sync {
    /// Height of the current best block
    async fn tip_height(&self) -> Result<u32, RpcError>;

    /// Block at the given height, fully decoded
    async fn block_at(&self, height: u32) -> Result<LedgerBlock, RpcError>;
}

/// Wrapper enum for real or mock client
pub enum BitcoinClient {
    Real(super::BitcoinRpcClient),
    Mock(super::MockLedger),
}

impl BitcoinClient {
    pub async fn test_connection(&self) -> Result<(), RpcError> {
        match self {
            BitcoinClient::Real(client) => client.test_connection().await,
            BitcoinClient::Mock(client) => client.test_connection().await,
        }
    }
}

#[async_trait]
impl LedgerSource for BitcoinClient {
    async fn tip_height(&self) -> Result<u32, RpcError> {
        match self {
            BitcoinClient::Real(client) => client.tip_height().await,
            BitcoinClient::Mock(client) => client.tip_height().await,
        }
    }

    async fn block_at(&self, height: u32) -> Result<LedgerBlock, RpcError> {
        match self {
            BitcoinClient::Real(client) => client.block_at(height).await,
            BitcoinClient::Mock(client) => client.block_at(height).await,
        }
    }
}

#[async_trait]
impl LedgerSource for super::BitcoinRpcClient {
    async fn tip_height(&self) -> Result<u32, RpcError> {
        self.get_block_count().await
    }

    async fn block_at(&self, height: u32) -> Result<LedgerBlock, RpcError> {
        self.fetch_block(height).await
    }
}
