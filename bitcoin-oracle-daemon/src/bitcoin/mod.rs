//! Ledger sources: a Bitcoin Core RPC client and a synthetic mock

mod mock_client;
mod rpc_client;
mod traits;

pub use mock_client::MockLedger;
pub use rpc_client::{BitcoinRpcClient, BitcoinRpcConfig, RpcError, DEFAULT_HEADER_CACHE_CAPACITY};
pub use traits::{BitcoinClient, LedgerBlock, LedgerSource};
