//! JSON-RPC ledger client.
//!
//! Talks to a bitcoind-compatible node over HTTP:
//! `getblockhash <height>`, `getblock <hash> 2`, `getblockchaininfo`.
//! Amounts arrive as JSON numbers in coin units and are converted to
//! satoshis exactly via their decimal text, never through `f64` scaling.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use jsonrpsee::core::client::ClientT;
use jsonrpsee::core::params::ArrayParams;
use jsonrpsee::core::ClientError;
use jsonrpsee::http_client::{HeaderMap, HeaderValue, HttpClient, HttpClientBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use tally_core::error::FetchError;
use tally_core::traits::LedgerSource;
use tally_core::types::{parse_amount, Block, ChainTip, Hash256, OutPoint, Transaction, TxInput, TxOutput};

/// RPC error codes meaning "no such block": invalid address or key, and
/// parameter out of range.
const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;
const RPC_INVALID_PARAMETER: i32 = -8;

/// Verbosity argument of `getblock` that includes decoded transactions.
const VERBOSITY_WITH_TXS: u8 = 2;

/// [`LedgerSource`] backed by a node's JSON-RPC interface.
pub struct RpcLedger {
    client: HttpClient,
}

impl RpcLedger {
    /// Build a client for `url`, optionally with HTTP basic auth.
    pub fn new(url: &str, auth: Option<(String, String)>, timeout: Duration) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        if let Some((user, password)) = auth {
            let token = STANDARD.encode(format!("{user}:{password}"));
            let value = HeaderValue::from_str(&format!("Basic {token}"))
                .map_err(|e| FetchError::Malformed(format!("authorization header: {e}")))?;
            headers.insert("Authorization", value);
        }

        let client = HttpClientBuilder::default()
            .request_timeout(timeout)
            .set_headers(headers)
            .build(url)
            .map_err(|e| FetchError::Transient(format!("failed to build RPC client: {e}")))?;
        Ok(Self { client })
    }

    async fn call<R: DeserializeOwned>(&self, method: &str, params: ArrayParams) -> Result<R, FetchError> {
        debug!(method, "ledger request");
        self.client
            .request(method, params)
            .await
            .map_err(|e| map_client_error(method, e))
    }
}

#[async_trait]
impl LedgerSource for RpcLedger {
    async fn block_hash(&self, height: u64) -> Result<Hash256, FetchError> {
        let mut params = ArrayParams::new();
        params.insert(height).map_err(|e| FetchError::Malformed(e.to_string()))?;
        let hash: String = self.call("getblockhash", params).await?;
        parse_hash(&hash)
    }

    async fn block(&self, hash: &Hash256) -> Result<Block, FetchError> {
        let mut params = ArrayParams::new();
        params.insert(hash.to_string()).map_err(|e| FetchError::Malformed(e.to_string()))?;
        params.insert(VERBOSITY_WITH_TXS).map_err(|e| FetchError::Malformed(e.to_string()))?;
        let block: RpcBlock = self.call("getblock", params).await?;
        block.into_block()
    }

    async fn chain_tip(&self) -> Result<ChainTip, FetchError> {
        let info: RpcChainInfo = self.call("getblockchaininfo", ArrayParams::new()).await?;
        Ok(ChainTip {
            height: info.blocks,
            best_hash: parse_hash(&info.bestblockhash)?,
        })
    }
}

fn map_client_error(method: &str, e: ClientError) -> FetchError {
    match e {
        ClientError::Call(obj) if matches!(obj.code(), RPC_INVALID_ADDRESS_OR_KEY | RPC_INVALID_PARAMETER) => {
            FetchError::NotFound(format!("{method}: {}", obj.message()))
        }
        ClientError::ParseError(e) => FetchError::Malformed(format!("{method}: {e}")),
        other => FetchError::Transient(format!("{method}: {other}")),
    }
}

fn parse_hash(s: &str) -> Result<Hash256, FetchError> {
    s.parse()
        .map_err(|e| FetchError::Malformed(format!("bad hash {s:?}: {e}")))
}

#[derive(Debug, Deserialize)]
struct RpcChainInfo {
    blocks: u64,
    bestblockhash: String,
}

#[derive(Debug, Deserialize)]
struct RpcBlock {
    hash: String,
    height: u64,
    tx: Vec<RpcTransaction>,
}

#[derive(Debug, Deserialize)]
struct RpcTransaction {
    txid: String,
    vin: Vec<RpcInput>,
    vout: Vec<RpcOutput>,
}

#[derive(Debug, Deserialize)]
struct RpcInput {
    #[serde(default)]
    coinbase: Option<String>,
    #[serde(default)]
    txid: Option<String>,
    #[serde(default)]
    vout: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RpcOutput {
    value: serde_json::Number,
    n: u32,
    #[serde(rename = "scriptPubKey")]
    script_pubkey: RpcScript,
}

#[derive(Debug, Deserialize)]
struct RpcScript {
    hex: String,
}

impl RpcBlock {
    fn into_block(self) -> Result<Block, FetchError> {
        let transactions = self
            .tx
            .into_iter()
            .map(RpcTransaction::into_transaction)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Block {
            hash: parse_hash(&self.hash)?,
            height: self.height,
            transactions,
        })
    }
}

impl RpcTransaction {
    fn into_transaction(self) -> Result<Transaction, FetchError> {
        let txid = parse_hash(&self.txid)?;
        let inputs = self
            .vin
            .into_iter()
            .map(|vin| match (vin.coinbase, vin.txid, vin.vout) {
                (Some(_), _, _) => Ok(TxInput::coinbase()),
                (None, Some(prev), Some(vout)) => Ok(TxInput::spending(OutPoint::new(parse_hash(&prev)?, vout))),
                _ => Err(FetchError::Malformed(format!("input of {txid} has no previous output"))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = self
            .vout
            .into_iter()
            .map(|vout| {
                let value = parse_amount(&vout.value.to_string())
                    .map_err(|e| FetchError::Malformed(format!("output {txid}:{}: {e}", vout.n)))?;
                let script_pubkey = hex::decode(&vout.script_pubkey.hex)
                    .map_err(|e| FetchError::Malformed(format!("output {txid}:{}: {e}", vout.n)))?;
                Ok(TxOutput { index: vout.n, value, script_pubkey })
            })
            .collect::<Result<Vec<_>, FetchError>>()?;
        Ok(Transaction { txid, inputs, outputs })
    }
}
