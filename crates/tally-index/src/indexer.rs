//! One index instance: configuration, store and ledger wired together.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use tally_core::error::{IndexError, StoreError};
use tally_core::traits::LedgerSource;
use tally_core::types::ChainTip;

use crate::config::IndexerConfig;
use crate::ledger::RpcLedger;
use crate::orchestrator::{Orchestrator, ScanReport};
use crate::storage::IndexStore;

pub struct Indexer {
    config: IndexerConfig,
    store: Arc<IndexStore>,
    ledger: Arc<dyn LedgerSource>,
}

impl Indexer {
    /// Open the store under the configured data directory and connect the
    /// JSON-RPC ledger client.
    pub fn open(config: IndexerConfig) -> Result<Self, IndexError> {
        let ledger = RpcLedger::new(&config.rpc_url, config.rpc_auth(), config.rpc_timeout())?;
        Self::with_ledger(config, Arc::new(ledger))
    }

    /// Open the store with an arbitrary ledger source.
    pub fn with_ledger(config: IndexerConfig, ledger: Arc<dyn LedgerSource>) -> Result<Self, IndexError> {
        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| StoreError::Backend(format!("create {}: {e}", data_dir.display())))?;
        let store = Arc::new(IndexStore::open(config.db_path(), config.lock_timeout())?);
        info!(network = %config.network, path = %config.db_path().display(), "index opened");
        Ok(Self { config, store, ledger })
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    /// Current chain tip as reported by the ledger.
    pub async fn ledger_tip(&self) -> Result<ChainTip, IndexError> {
        Ok(self.ledger.chain_tip().await?)
    }

    /// Scan up to `target` (inclusive).
    pub async fn scan(&self, target: u64, shutdown: watch::Receiver<bool>) -> Result<ScanReport, IndexError> {
        let orchestrator = Orchestrator::new(
            Arc::clone(&self.store),
            Arc::clone(&self.ledger),
            self.config.network.params(),
            self.config.scan.clone(),
        );
        Ok(orchestrator.run(target, shutdown).await?)
    }
}
