//! Shared helpers for the integration tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use tally_core::address::decode_script;
use tally_core::constants::{Network, NetworkParams};
use tally_core::error::FetchError;
use tally_core::traits::LedgerSource;
use tally_core::types::{Block, ChainTip, Hash256, OutPoint, Transaction, TxInput, TxOutput};
use tally_index::config::ScanConfig;
use tally_index::storage::IndexStore;

/// Injected failure for one height.
#[derive(Debug, Clone, Copy)]
enum Fault {
    Always,
    Times(u32),
}

/// In-memory ledger with per-height failure injection.
///
/// Failures are raised from `block_hash`, the first call of every fetch.
#[derive(Default)]
pub struct MockLedger {
    blocks: Mutex<BTreeMap<u64, Block>>,
    faults: Mutex<HashMap<u64, Fault>>,
    hash_requests: Mutex<HashMap<u64, u32>>,
    latency: Mutex<Duration>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chain(blocks: Vec<Block>) -> Self {
        let ledger = Self::new();
        for block in blocks {
            ledger.push_block(block);
        }
        ledger
    }

    pub fn push_block(&self, block: Block) {
        self.blocks.lock().insert(block.height, block);
    }

    /// Every fetch of `height` fails with a transient error.
    pub fn fail_always(&self, height: u64) {
        self.faults.lock().insert(height, Fault::Always);
    }

    /// The next `times` fetches of `height` fail, later ones succeed.
    pub fn fail_times(&self, height: u64, times: u32) {
        self.faults.lock().insert(height, Fault::Times(times));
    }

    /// Every `block_hash` call sleeps this long first.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn heal(&self, height: u64) {
        self.faults.lock().remove(&height);
    }

    /// How many times `height` was requested.
    pub fn hash_requests(&self, height: u64) -> u32 {
        self.hash_requests.lock().get(&height).copied().unwrap_or(0)
    }
}

#[async_trait]
impl LedgerSource for MockLedger {
    async fn block_hash(&self, height: u64) -> Result<Hash256, FetchError> {
        *self.hash_requests.lock().entry(height).or_insert(0) += 1;
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        {
            let mut faults = self.faults.lock();
            match faults.get_mut(&height) {
                Some(Fault::Always) => {
                    return Err(FetchError::Transient(format!("injected failure at {height}")));
                }
                Some(Fault::Times(left)) if *left > 0 => {
                    *left -= 1;
                    return Err(FetchError::Transient(format!("injected failure at {height}")));
                }
                _ => {}
            }
        }

        self.blocks
            .lock()
            .get(&height)
            .map(|b| b.hash)
            .ok_or_else(|| FetchError::NotFound(format!("height {height}")))
    }

    async fn block(&self, hash: &Hash256) -> Result<Block, FetchError> {
        self.blocks
            .lock()
            .values()
            .find(|b| b.hash == *hash)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(hash.to_string()))
    }

    async fn chain_tip(&self) -> Result<ChainTip, FetchError> {
        let blocks = self.blocks.lock();
        let (&height, block) = blocks
            .last_key_value()
            .ok_or_else(|| FetchError::NotFound("empty chain".into()))?;
        Ok(ChainTip { height, best_hash: block.hash })
    }
}

pub fn params() -> NetworkParams {
    Network::Main.params()
}

/// P2WPKH script paying a key hash filled with `seed`.
pub fn p2wpkh(seed: u8) -> Vec<u8> {
    let mut script = vec![0x00, 0x14];
    script.extend_from_slice(&[seed; 20]);
    script
}

/// Address text of [`p2wpkh`]`(seed)`.
pub fn address(seed: u8) -> String {
    match decode_script(&p2wpkh(seed), &params()).address() {
        Some(address) => address.to_string(),
        None => unreachable!("p2wpkh always decodes"),
    }
}

/// OP_RETURN script; never decodes to an address.
pub fn op_return() -> Vec<u8> {
    vec![0x6a, 0x04, 0xde, 0xad, 0xbe, 0xef]
}

/// Transaction id derived from a counter.
pub fn txid(n: u64) -> Hash256 {
    let mut bytes = [0u8; 32];
    bytes[0] = 0x7a;
    bytes[24..].copy_from_slice(&n.to_be_bytes());
    Hash256(bytes)
}

/// Block hash derived from a height.
pub fn block_hash(height: u64) -> Hash256 {
    let mut bytes = [0u8; 32];
    bytes[0] = 0xb1;
    bytes[24..].copy_from_slice(&height.to_be_bytes());
    Hash256(bytes)
}

/// Coinbase transaction paying `(seed, value)` pairs.
pub fn make_coinbase(id: u64, outputs: &[(u8, u64)]) -> Transaction {
    make_tx(id, &[], outputs)
}

/// Transaction spending `inputs` and paying `(seed, value)` pairs. No
/// inputs makes it a coinbase.
pub fn make_tx(id: u64, inputs: &[OutPoint], outputs: &[(u8, u64)]) -> Transaction {
    let inputs = if inputs.is_empty() {
        vec![TxInput::coinbase()]
    } else {
        inputs.iter().copied().map(TxInput::spending).collect()
    };
    Transaction {
        txid: txid(id),
        inputs,
        outputs: outputs
            .iter()
            .enumerate()
            .map(|(i, &(seed, value))| TxOutput { index: i as u32, value, script_pubkey: p2wpkh(seed) })
            .collect(),
    }
}

pub fn make_block(height: u64, transactions: Vec<Transaction>) -> Block {
    Block { hash: block_hash(height), height, transactions }
}

/// Chain of `len` blocks, each a coinbase of 50 to a distinct address.
pub fn coinbase_chain(len: u64) -> Vec<Block> {
    (0..len)
        .map(|h| make_block(h, vec![make_coinbase(h, &[((h % 251) as u8, 50)])]))
        .collect()
}

pub fn open_store(dir: &tempfile::TempDir) -> Arc<IndexStore> {
    match IndexStore::open(dir.path().join("index"), Duration::from_millis(2_000)) {
        Ok(store) => Arc::new(store),
        Err(e) => panic!("failed to open index store: {e}"),
    }
}

/// Scan settings with no backoff and short polling.
pub fn fast_scan_config() -> ScanConfig {
    ScanConfig {
        workers: 4,
        poll_interval_ms: 10,
        progress_interval_ms: 60_000,
        backoff_unit_ms: 0,
        ..ScanConfig::default()
    }
}

/// Sum of all balances.
pub fn total_balance(store: &IndexStore) -> u64 {
    match store.balances(0) {
        Ok(rows) => rows.iter().map(|(_, v)| v).sum(),
        Err(e) => panic!("balances: {e}"),
    }
}

/// Sum of all unspent output values.
pub fn total_unspent(store: &IndexStore) -> u64 {
    match store.utxos() {
        Ok(rows) => rows.iter().map(|u| u.value).sum(),
        Err(e) => panic!("utxos: {e}"),
    }
}
