//! Trait interfaces for Tally.
//!
//! - [`LedgerSource`]: read access to a ledger node (tally-index's
//!   `RpcLedger` implements it; tests use an in-memory mock)

use async_trait::async_trait;

use crate::error::FetchError;
use crate::types::{Block, ChainTip, Hash256};

/// Read-only access to the ledger being indexed.
///
/// Every failure is reported as a [`FetchError`] so callers can record the
/// attempt and retry later; implementations never panic on bad responses.
#[async_trait]
pub trait LedgerSource: Send + Sync {
    /// Identifier of the block at `height` on the current best chain.
    async fn block_hash(&self, height: u64) -> Result<Hash256, FetchError>;

    /// Full block, with every transaction's inputs and outputs.
    async fn block(&self, hash: &Hash256) -> Result<Block, FetchError>;

    /// Height and hash of the current best block.
    async fn chain_tip(&self) -> Result<ChainTip, FetchError>;
}
