//! Block applier: folds one block into the index exactly once.
//!
//! The block is fetched before any unit is opened, so no row lock is held
//! across ledger I/O. Inside a single unit the applier then
//!
//! 1. re-checks under the status row lock that the height is not processed,
//! 2. records every output of the block (crediting its address), and only
//!    then consumes every input (debiting the spent output's address), so a
//!    transaction may spend an output created earlier in the same block,
//! 3. advances the confirmed tip if this height extends it,
//! 4. marks the height processed and commits.
//!
//! Heights may complete out of order. An input whose output has not been
//! recorded yet leaves an early-spend marker, and the creating block later
//! skips that output, so the projection converges to the same state in any
//! application order.
//!
//! Any failure drops the unit, rolling back every balance and UTXO change,
//! and the height is marked failed in a separate unit. A worker that will
//! attempt the height again keeps it pending instead, so no other claimer
//! picks it up in between.
//!
//! Store work runs on the blocking pool: a unit may wait up to the lock
//! timeout on a row another unit holds.

use std::sync::Arc;

use tracing::{debug, warn};

use tally_core::address::{decode_script, ScriptAddress};
use tally_core::constants::NetworkParams;
use tally_core::error::{ApplyError, StoreError};
use tally_core::traits::LedgerSource;
use tally_core::types::{Block, OutPoint};

use crate::storage::{BlockState, IndexStore, OutputInsert};

/// What a successful [`BlockApplier::apply`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(BlockSummary),
    /// The height was already processed; nothing was fetched or written.
    AlreadyDone,
}

/// Effect of one applied block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockSummary {
    pub height: u64,
    /// Outputs recorded and credited.
    pub outputs_created: usize,
    /// Outputs with no standard address, skipped.
    pub outputs_nonstandard: usize,
    /// Outputs already present from an earlier transaction with the same id.
    pub outputs_duplicate: usize,
    /// Outputs already consumed by a block applied before this one.
    pub outputs_prespent: usize,
    /// Inputs that consumed an indexed output.
    pub inputs_spent: usize,
    /// Inputs whose output was not indexed (coinbase, non-standard, unknown).
    pub inputs_unmatched: usize,
    pub confirmed_tip: Option<u64>,
}

pub struct BlockApplier {
    store: Arc<IndexStore>,
    ledger: Arc<dyn LedgerSource>,
    params: NetworkParams,
    retry_limit: u32,
}

impl BlockApplier {
    pub fn new(
        store: Arc<IndexStore>,
        ledger: Arc<dyn LedgerSource>,
        params: NetworkParams,
        retry_limit: u32,
    ) -> Self {
        Self { store, ledger, params, retry_limit }
    }

    /// Apply the block at `height`.
    ///
    /// On error the height has been marked failed (unless it was processed
    /// concurrently) and no partial mutation is visible.
    pub async fn apply(&self, height: u64) -> Result<ApplyOutcome, ApplyError> {
        self.attempt(height, false).await
    }

    /// Like [`apply`](Self::apply), but with `will_retry` a retryable
    /// failure leaves the height pending under this caller's claim rather
    /// than failed.
    pub async fn attempt(&self, height: u64, will_retry: bool) -> Result<ApplyOutcome, ApplyError> {
        if self.store.is_processed(height)? {
            return Ok(ApplyOutcome::AlreadyDone);
        }

        let result = self.fetch_and_apply(height).await;
        if let Err(e) = &result {
            let hold = will_retry && e.is_retryable();
            let store = Arc::clone(&self.store);
            let retry_limit = self.retry_limit;
            let recorded = blocking(move || {
                if hold {
                    store.record_retry(height, retry_limit)
                } else {
                    store.record_failure(height, retry_limit)
                }
            })
            .await;
            match recorded {
                Ok(status) => warn!(
                    height,
                    state = %status.state,
                    retry_count = status.retry_count,
                    error = %e,
                    "block apply failed"
                ),
                Err(mark_err) => warn!(
                    height,
                    error = %e,
                    mark_error = %mark_err,
                    "block apply failed and its status could not be recorded"
                ),
            }
        }
        result
    }

    async fn fetch_and_apply(&self, height: u64) -> Result<ApplyOutcome, ApplyError> {
        let hash = self.ledger.block_hash(height).await?;
        let block = self.ledger.block(&hash).await?;
        if block.height != height {
            return Err(ApplyError::HeightMismatch { expected: height, got: block.height });
        }
        let store = Arc::clone(&self.store);
        let params = self.params;
        let retry_limit = self.retry_limit;
        blocking(move || fold_block(&store, &params, retry_limit, &block)).await
    }

    /// Apply an already-fetched block inside one unit, on the calling thread.
    pub fn apply_block(&self, block: &Block) -> Result<ApplyOutcome, ApplyError> {
        fold_block(&self.store, &self.params, self.retry_limit, block)
    }
}

/// Run store work on the blocking pool.
async fn blocking<T, E>(f: impl FnOnce() -> Result<T, E> + Send + 'static) -> Result<T, E>
where
    T: Send + 'static,
    E: From<StoreError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => Err(StoreError::Backend(format!("store task failed: {e}")).into()),
    }
}

fn fold_block(
    store: &IndexStore,
    params: &NetworkParams,
    retry_limit: u32,
    block: &Block,
) -> Result<ApplyOutcome, ApplyError> {
    let height = block.height;
    let mut unit = store.begin_unit()?;

    if unit
        .status_for_update(height)?
        .is_some_and(|s| s.state == BlockState::Processed)
    {
        debug!(height, "height processed concurrently");
        return Ok(ApplyOutcome::AlreadyDone);
    }

    let mut summary = BlockSummary { height, ..BlockSummary::default() };

    for tx in &block.transactions {
        for output in &tx.outputs {
            let outpoint = OutPoint::new(tx.txid, output.index);
            let address = match decode_script(&output.script_pubkey, params) {
                ScriptAddress::Standard(address) => address,
                ScriptAddress::NonStandard => {
                    debug!(height, %outpoint, "non-standard output skipped");
                    summary.outputs_nonstandard += 1;
                    continue;
                }
            };
            let amount = i64::try_from(output.value)
                .map_err(|_| ApplyError::ValueOverflow(format!("output {outpoint}")))?;
            match unit.upsert_output(&outpoint, address.as_str(), output.value)? {
                OutputInsert::Inserted => {
                    unit.credit_balance(address.as_str(), amount)?;
                    summary.outputs_created += 1;
                }
                OutputInsert::Duplicate => summary.outputs_duplicate += 1,
                OutputInsert::SpentEarlier => summary.outputs_prespent += 1,
            }
        }
    }

    for tx in &block.transactions {
        for input in &tx.inputs {
            let Some(prev) = &input.previous_output else {
                continue;
            };
            match unit.consume_output(prev, height)? {
                Some(spent) => {
                    let amount = i64::try_from(spent.value)
                        .map_err(|_| ApplyError::ValueOverflow(format!("spent output {prev}")))?;
                    unit.debit_balance(&spent.address, amount)?;
                    summary.inputs_spent += 1;
                }
                None => summary.inputs_unmatched += 1,
            }
        }
    }

    summary.confirmed_tip = unit.advance_tip_if_contiguous(height)?;
    unit.mark_status(height, BlockState::Processed, retry_limit)?;
    unit.commit()?;

    debug!(
        height,
        txs = block.transactions.len(),
        created = summary.outputs_created,
        spent = summary.inputs_spent,
        confirmed_tip = ?summary.confirmed_tip,
        "applied block"
    );
    Ok(ApplyOutcome::Applied(summary))
}
