use base64::Engine;
use bitcoin_oracle::{OracleError, OutPoint, RawTransaction, Txid};
use chrono::{DateTime, Utc};
use reqwest::{header, Client};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, error, info};

use super::LedgerBlock;

/// Header times kept for prevout lookups. Roughly two months of blocks.
pub const DEFAULT_HEADER_CACHE_CAPACITY: usize = 8_192;

/// Bitcoin RPC configuration
#[derive(Debug, Clone)]
pub struct BitcoinRpcConfig {
    pub url: String,
    pub username: String,
    pub password: String,
}

/// Bitcoin RPC error types
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("RPC error {code}: {message}")]
    RpcError { code: i32, message: String },

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Transaction decoding failed: {0}")]
    Decode(#[from] OracleError),
}

impl RpcError {
    /// Bitcoin Core reports -28 while it is still loading the block index.
    pub const RPC_IN_WARMUP: i32 = -28;

    /// Errors worth retrying: transport failures, non-success statuses and
    /// a node that is still warming up. Malformed payloads are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            RpcError::HttpError(_) | RpcError::InvalidResponse(_) => true,
            RpcError::RpcError { code, .. } => *code == Self::RPC_IN_WARMUP,
            RpcError::JsonError(_) | RpcError::MissingField(_) | RpcError::Decode(_) => false,
        }
    }

    fn invalid(msg: impl Into<String>) -> Self {
        RpcError::InvalidResponse(msg.into())
    }
}

#[derive(Serialize)]
struct RpcRequest {
    jsonrpc: &'static str,
    id: String,
    method: &'static str,
    params: Vec<Value>,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorResponse>,
    id: Value,
}

#[derive(Deserialize)]
struct RpcErrorResponse {
    code: i32,
    message: String,
}

impl RpcResponse {
    fn into_result<T: DeserializeOwned>(self) -> Result<T, RpcError> {
        if let Some(error) = self.error {
            return Err(RpcError::RpcError {
                code: error.code,
                message: error.message,
            });
        }
        let result = self.result.ok_or_else(|| RpcError::MissingField("result".to_string()))?;
        Ok(serde_json::from_value(result)?)
    }
}

/// `getblock` at verbosity 3: every transaction with its raw hex and prevouts.
#[derive(Deserialize)]
struct VerboseBlock {
    hash: String,
    height: u32,
    time: i64,
    tx: Vec<VerboseTransaction>,
}

#[derive(Deserialize)]
struct VerboseTransaction {
    txid: String,
    hex: String,
    vin: Vec<VerboseInput>,
}

#[derive(Deserialize)]
struct VerboseInput {
    txid: Option<String>,
    vout: Option<u32>,
    prevout: Option<Prevout>,
}

#[derive(Deserialize)]
struct Prevout {
    height: u32,
}

#[derive(Deserialize)]
struct BlockHeader {
    time: i64,
}

/// Bounded height → block time map, evicting the oldest insertion.
#[derive(Debug)]
struct HeaderTimeCache {
    capacity: usize,
    times: HashMap<u32, DateTime<Utc>>,
    order: VecDeque<u32>,
}

impl HeaderTimeCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            times: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, height: u32) -> Option<DateTime<Utc>> {
        self.times.get(&height).copied()
    }

    fn insert(&mut self, height: u32, time: DateTime<Utc>) {
        if self.times.insert(height, time).is_some() {
            return;
        }
        self.order.push_back(height);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.times.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.times.len()
    }
}

/// JSON-RPC client for a Bitcoin Core node
pub struct BitcoinRpcClient {
    client: Client,
    config: BitcoinRpcConfig,
    auth_header: String,
    header_times: Mutex<HeaderTimeCache>,
}

impl BitcoinRpcClient {
    /// Creates a new Bitcoin RPC client
    pub fn new(config: BitcoinRpcConfig) -> Self {
        Self::with_header_cache(config, DEFAULT_HEADER_CACHE_CAPACITY)
    }

    pub fn with_header_cache(config: BitcoinRpcConfig, capacity: usize) -> Self {
        let auth = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", config.username, config.password));

        Self {
            client: Client::new(),
            auth_header: format!("Basic {}", auth),
            config,
            header_times: Mutex::new(HeaderTimeCache::new(capacity)),
        }
    }

    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(&self, body: &B) -> Result<R, RpcError> {
        let response = self
            .client
            .post(&self.config.url)
            .header(header::AUTHORIZATION, &self.auth_header)
            .header(header::CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            error!("RPC request failed with status: {}", response.status());
            return Err(RpcError::invalid(format!("HTTP status {}", response.status())));
        }

        Ok(response.json().await?)
    }

    async fn call<T: DeserializeOwned>(&self, method: &'static str, params: Vec<Value>) -> Result<T, RpcError> {
        let request = RpcRequest {
            jsonrpc: "1.0",
            id: method.to_string(),
            method,
            params,
        };
        let response: RpcResponse = self.post(&request).await?;
        response.into_result()
    }

    /// Sends one batch and returns the results in request order.
    async fn batch<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Vec<Vec<Value>>,
    ) -> Result<Vec<T>, RpcError> {
        if params.is_empty() {
            return Ok(Vec::new());
        }

        let requests: Vec<RpcRequest> = params
            .into_iter()
            .enumerate()
            .map(|(i, params)| RpcRequest {
                jsonrpc: "1.0",
                id: i.to_string(),
                method,
                params,
            })
            .collect();
        let responses: Vec<RpcResponse> = self.post(&requests).await?;

        if responses.len() != requests.len() {
            return Err(RpcError::invalid(format!(
                "batch of {} {} requests answered with {} responses",
                requests.len(),
                method,
                responses.len()
            )));
        }

        let mut slots: Vec<Option<T>> = (0..requests.len()).map(|_| None).collect();
        for response in responses {
            let index = response
                .id
                .as_str()
                .and_then(|id| id.parse::<usize>().ok())
                .filter(|&i| i < slots.len())
                .ok_or_else(|| RpcError::invalid(format!("unexpected batch response id {}", response.id)))?;
            slots[index] = Some(response.into_result()?);
        }
        slots
            .into_iter()
            .map(|slot| slot.ok_or_else(|| RpcError::invalid("duplicate batch response id")))
            .collect()
    }

    /// Tests the RPC connection
    pub async fn test_connection(&self) -> Result<(), RpcError> {
        debug!("Testing Bitcoin RPC connection");
        let height = self.get_block_count().await?;
        info!("Bitcoin RPC connection successful (tip {})", height);
        Ok(())
    }

    pub async fn get_block_count(&self) -> Result<u32, RpcError> {
        self.call("getblockcount", vec![]).await
    }

    pub async fn get_block_hash(&self, height: u32) -> Result<String, RpcError> {
        self.call("getblockhash", vec![json!(height)]).await
    }

    /// Fetches a block with raw transactions and decodes it.
    ///
    /// Creation times of spent outputs come from the headers of the blocks
    /// that created them, fetched in batches and cached.
    pub async fn fetch_block(&self, height: u32) -> Result<LedgerBlock, RpcError> {
        let hash = self.get_block_hash(height).await?;
        let block: VerboseBlock = self.call("getblock", vec![json!(hash), json!(3)]).await?;
        if block.height != height {
            return Err(RpcError::invalid(format!(
                "asked for block {height}, node returned {}",
                block.height
            )));
        }
        let block_time = timestamp(block.time)?;

        let prevout_heights: HashSet<u32> = block
            .tx
            .iter()
            .flat_map(|tx| tx.vin.iter())
            .filter_map(|input| input.prevout.as_ref().map(|p| p.height))
            .collect();
        let times = self.header_times(prevout_heights).await?;

        let mut transactions = Vec::with_capacity(block.tx.len());
        for tx in &block.tx {
            let mut prevouts = HashMap::new();
            for input in &tx.vin {
                if let (Some(txid), Some(vout), Some(prevout)) = (&input.txid, input.vout, &input.prevout) {
                    if let Some(time) = times.get(&prevout.height) {
                        prevouts.insert(OutPoint::new(Txid::from_hex(txid)?, vout), *time);
                    }
                }
            }

            let bytes = hex::decode(&tx.hex).map_err(|e| RpcError::invalid(format!("tx {}: {e}", tx.txid)))?;
            let decoded = RawTransaction::from_consensus_bytes(&bytes, height, block_time, &prevouts)?;
            if decoded.txid().to_string() != tx.txid {
                return Err(RpcError::invalid(format!(
                    "decoded txid {} does not match {}",
                    decoded.txid(),
                    tx.txid
                )));
            }
            transactions.push(decoded);
        }

        debug!(
            "Fetched block {} ({} transactions, {} prevout heights)",
            height,
            transactions.len(),
            times.len()
        );

        Ok(LedgerBlock {
            height,
            hash: block.hash,
            time: block_time,
            transactions,
        })
    }

    /// Block times for the given heights, from cache where possible.
    async fn header_times(&self, heights: HashSet<u32>) -> Result<HashMap<u32, DateTime<Utc>>, RpcError> {
        let mut times = HashMap::with_capacity(heights.len());
        let mut missing = Vec::new();
        {
            let cache = self.header_times.lock().unwrap_or_else(|e| e.into_inner());
            for height in heights {
                match cache.get(height) {
                    Some(time) => {
                        times.insert(height, time);
                    }
                    None => missing.push(height),
                }
            }
        }
        if missing.is_empty() {
            return Ok(times);
        }
        missing.sort_unstable();

        let hashes: Vec<String> = self
            .batch("getblockhash", missing.iter().map(|h| vec![json!(h)]).collect())
            .await?;
        let headers: Vec<BlockHeader> = self
            .batch("getblockheader", hashes.iter().map(|h| vec![json!(h)]).collect())
            .await?;

        let mut cache = self.header_times.lock().unwrap_or_else(|e| e.into_inner());
        for (height, header) in missing.into_iter().zip(headers) {
            let time = timestamp(header.time)?;
            cache.insert(height, time);
            times.insert(height, time);
        }
        debug!("Header time cache holds {} entries", cache.len());
        Ok(times)
    }

    /// Number of cached header times
    pub fn cached_header_times(&self) -> usize {
        self.header_times.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn timestamp(seconds: i64) -> Result<DateTime<Utc>, RpcError> {
    DateTime::from_timestamp(seconds, 0).ok_or_else(|| RpcError::invalid(format!("timestamp {seconds} out of range")))
}
