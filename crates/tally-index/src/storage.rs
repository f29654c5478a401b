//! RocksDB-backed index store.
//!
//! Persists the unspent-output set, per-address balances, per-height
//! processing status and the confirmed-tip watermark in separate column
//! families of a pessimistic [`TransactionDB`]. Every mutation happens inside
//! an [`IndexUnit`]; a unit that is dropped without [`IndexUnit::commit`] is
//! rolled back, so nothing is ever observable half-applied.
//!
//! Balances are never read-then-written. Credits and debits are merge
//! operands carrying a signed delta that RocksDB folds with an associative
//! add, so two units touching the same address from different heights both
//! land. The per-state height counts are kept the same way, moved on
//! every status transition, so progress reporting never scans the status
//! table.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, ErrorKind, IteratorMode, MergeOperands,
    Options, Transaction, TransactionDB, TransactionDBOptions, TransactionOptions, WriteOptions,
};
use tracing::debug;

use tally_core::error::StoreError;
use tally_core::types::{Hash256, OutPoint};

// --- Column family names ---

const CF_BALANCES: &str = "balances";
const CF_UTXOS: &str = "utxos";
const CF_ADDRESS_UTXOS: &str = "address_utxos";
const CF_BLOCK_STATUS: &str = "block_status";
const CF_BACKLOG: &str = "status_backlog";
const CF_EARLY_SPENDS: &str = "early_spends";
const CF_EARLY_BY_HEIGHT: &str = "early_spends_by_height";
const CF_STATUS_COUNTS: &str = "status_counts";
const CF_META: &str = "meta";

/// All column family names.
const ALL_CFS: &[&str] = &[
    CF_BALANCES,
    CF_UTXOS,
    CF_ADDRESS_UTXOS,
    CF_BLOCK_STATUS,
    CF_BACKLOG,
    CF_EARLY_SPENDS,
    CF_EARLY_BY_HEIGHT,
    CF_STATUS_COUNTS,
    CF_META,
];

// --- Metadata keys ---

const META_CONFIRMED_TIP: &[u8] = b"confirmed_tip";

/// Length of a `utxos` key: txid || vout(BE).
const OUTPOINT_KEY_LEN: usize = 36;

/// Processing state of one height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, bincode::Encode, bincode::Decode)]
pub enum BlockState {
    Pending,
    Processed,
    Failed,
}

impl BlockState {
    /// Key of this state's counter in the `status_counts` column family.
    fn counter_key(self) -> &'static [u8] {
        match self {
            BlockState::Pending => b"pending",
            BlockState::Processed => b"processed",
            BlockState::Failed => b"failed",
        }
    }
}

impl std::fmt::Display for BlockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockState::Pending => write!(f, "pending"),
            BlockState::Processed => write!(f, "processed"),
            BlockState::Failed => write!(f, "failed"),
        }
    }
}

/// Status record of one height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockStatus {
    pub height: u64,
    pub state: BlockState,
    pub retry_count: u32,
    pub last_attempt: DateTime<Utc>,
}

impl BlockStatus {
    /// True if a claim may take this height under the given policy.
    pub fn is_claimable(&self, retry_limit: u32, stale_before: DateTime<Utc>) -> bool {
        match self.state {
            BlockState::Processed => false,
            BlockState::Failed => self.retry_count < retry_limit,
            BlockState::Pending => self.retry_count < retry_limit && self.last_attempt <= stale_before,
        }
    }
}

/// An unspent output as stored in the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoEntry {
    pub outpoint: OutPoint,
    pub address: String,
    pub value: u64,
}

/// Result of [`IndexUnit::upsert_output`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputInsert {
    /// Recorded as a new unspent output.
    Inserted,
    /// The outpoint was already present; nothing written.
    Duplicate,
    /// A block applied earlier already spent it; nothing recorded.
    SpentEarlier,
}

/// Number of heights in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: u64,
    pub processed: u64,
    pub failed: u64,
}

/// Unfinished heights, partitioned by what a scheduler may do with them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backlog {
    /// Failed or stale-pending heights still under the retry limit.
    pub retryable: Vec<u64>,
    /// Pending heights whose claim is still within its lease.
    pub in_flight: Vec<u64>,
    /// Failed or stale-pending heights that reached the retry limit.
    pub exhausted: Vec<u64>,
}

#[derive(bincode::Encode, bincode::Decode)]
struct StatusRow {
    state: BlockState,
    retry_count: u32,
    last_attempt_ms: i64,
}

#[derive(bincode::Encode, bincode::Decode)]
struct UtxoRow {
    address: String,
    value: u64,
}

/// Persistent index state.
pub struct IndexStore {
    db: TransactionDB,
    lock_timeout: Duration,
}

impl IndexStore {
    /// Open or create the index at `path`.
    ///
    /// `lock_timeout` bounds how long a unit waits for a row held by a
    /// concurrent unit before failing with [`StoreError::Busy`].
    pub fn open(path: impl AsRef<Path>, lock_timeout: Duration) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| {
                let mut opts = Options::default();
                if *name == CF_BALANCES || *name == CF_STATUS_COUNTS {
                    opts.set_merge_operator_associative("i64_add", add_merge);
                }
                ColumnFamilyDescriptor::new(*name, opts)
            })
            .collect();

        let mut txn_db_opts = TransactionDBOptions::default();
        txn_db_opts.set_default_lock_timeout(millis_i64(lock_timeout));

        let db = TransactionDB::open_cf_descriptors(&db_opts, &txn_db_opts, path.as_ref(), cf_descriptors)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(Self { db, lock_timeout })
    }

    /// Start an atomic unit of work.
    pub fn begin_unit(&self) -> Result<IndexUnit<'_>, StoreError> {
        let mut txn_opts = TransactionOptions::new();
        txn_opts.set_lock_timeout(millis_i64(self.lock_timeout));
        txn_opts.set_deadlock_detect(true);
        let txn = self.db.transaction_opt(&WriteOptions::default(), &txn_opts);
        Ok(IndexUnit { store: self, txn })
    }

    /// Claim up to `limit` of `candidates`, in the given order.
    ///
    /// Runs in its own unit with a zero lock timeout: a row another claimer
    /// (or an applier) currently holds is skipped, never awaited. Each locked
    /// row is re-checked against the claim policy and, if still claimable,
    /// marked pending with its retry count incremented before the unit
    /// commits.
    pub fn try_claim(
        &self,
        candidates: &[u64],
        limit: usize,
        retry_limit: u32,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<u64>, StoreError> {
        let mut txn_opts = TransactionOptions::new();
        txn_opts.set_lock_timeout(0);
        let txn = self.db.transaction_opt(&WriteOptions::default(), &txn_opts);
        let cf_status = self.cf_handle(CF_BLOCK_STATUS)?;
        let cf_backlog = self.cf_handle(CF_BACKLOG)?;
        let cf_counts = self.cf_handle(CF_STATUS_COUNTS)?;
        let now = Utc::now();

        let mut claimed = Vec::new();
        for &height in candidates {
            if claimed.len() >= limit {
                break;
            }
            let key = height_key(height);
            let current = match txn.get_for_update_cf(cf_status, key, true) {
                Ok(bytes) => bytes,
                Err(e) if is_lock_conflict(&e) => {
                    debug!(height, "height locked by another unit, skipping");
                    continue;
                }
                Err(e) => return Err(store_err(e)),
            };
            let status = current.map(|bytes| decode_status(height, &bytes)).transpose()?;
            if let Some(status) = &status {
                if !status.is_claimable(retry_limit, stale_before) {
                    continue;
                }
            }

            let prior_state = status.as_ref().map(|s| s.state);
            let row = StatusRow {
                state: BlockState::Pending,
                retry_count: status.map_or(0, |s| s.retry_count).saturating_add(1),
                last_attempt_ms: now.timestamp_millis(),
            };
            txn.put_cf(cf_status, key, encode_status(&row)?).map_err(store_err)?;
            txn.put_cf(cf_backlog, key, b"").map_err(store_err)?;
            move_counter(&txn, cf_counts, prior_state, BlockState::Pending)?;
            claimed.push(height);
        }

        txn.commit().map_err(store_err)?;
        Ok(claimed)
    }

    /// Mark `height` failed in a unit of its own.
    ///
    /// The retry count is incremented and pinned at `retry_limit`. A height
    /// that is already processed is left untouched.
    pub fn record_failure(&self, height: u64, retry_limit: u32) -> Result<BlockStatus, StoreError> {
        self.record_attempt(height, BlockState::Failed, retry_limit)
    }

    /// Count a failed attempt but keep the height claimed.
    ///
    /// The row stays pending with a fresh `last_attempt`, so other claimers
    /// skip it until its lease runs out. Used between attempts of one worker.
    pub fn record_retry(&self, height: u64, retry_limit: u32) -> Result<BlockStatus, StoreError> {
        self.record_attempt(height, BlockState::Pending, retry_limit)
    }

    fn record_attempt(&self, height: u64, state: BlockState, retry_limit: u32) -> Result<BlockStatus, StoreError> {
        let mut unit = self.begin_unit()?;
        let status = unit.mark_status(height, state, retry_limit)?;
        unit.commit()?;
        Ok(status)
    }

    /// Highest height H such that every height in `[0, H]` is processed.
    pub fn confirmed_tip(&self) -> Result<Option<u64>, StoreError> {
        let cf = self.cf_handle(CF_META)?;
        let bytes = self.db.get_cf(cf, META_CONFIRMED_TIP).map_err(store_err)?;
        bytes.map(|b| decode_tip(&b)).transpose()
    }

    pub fn block_status(&self, height: u64) -> Result<Option<BlockStatus>, StoreError> {
        let cf = self.cf_handle(CF_BLOCK_STATUS)?;
        let bytes = self.db.get_cf(cf, height_key(height)).map_err(store_err)?;
        bytes.map(|b| decode_status(height, &b)).transpose()
    }

    pub fn is_processed(&self, height: u64) -> Result<bool, StoreError> {
        Ok(self
            .block_status(height)?
            .is_some_and(|s| s.state == BlockState::Processed))
    }

    /// Highest height with any status row.
    pub fn max_known_height(&self) -> Result<Option<u64>, StoreError> {
        let cf = self.cf_handle(CF_BLOCK_STATUS)?;
        match self.db.iterator_cf(cf, IteratorMode::End).next() {
            Some(item) => {
                let (key, _) = item.map_err(store_err)?;
                Ok(Some(decode_height(&key)?))
            }
            None => Ok(None),
        }
    }

    /// Every height that is not processed, partitioned for claiming.
    pub fn backlog(&self, retry_limit: u32, stale_before: DateTime<Utc>) -> Result<Backlog, StoreError> {
        let cf_backlog = self.cf_handle(CF_BACKLOG)?;
        let mut backlog = Backlog::default();

        for item in self.db.iterator_cf(cf_backlog, IteratorMode::Start) {
            let (key, _) = item.map_err(store_err)?;
            let height = decode_height(&key)?;
            let Some(status) = self.block_status(height)? else {
                continue;
            };
            match status.state {
                BlockState::Processed => {}
                _ if status.is_claimable(retry_limit, stale_before) => backlog.retryable.push(height),
                BlockState::Pending if status.last_attempt > stale_before => backlog.in_flight.push(height),
                BlockState::Pending | BlockState::Failed => backlog.exhausted.push(height),
            }
        }
        Ok(backlog)
    }

    /// Number of heights in each state, read from the running counters.
    pub fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        Ok(StatusCounts {
            pending: self.state_count(BlockState::Pending)?,
            processed: self.state_count(BlockState::Processed)?,
            failed: self.state_count(BlockState::Failed)?,
        })
    }

    fn state_count(&self, state: BlockState) -> Result<u64, StoreError> {
        let cf = self.cf_handle(CF_STATUS_COUNTS)?;
        let key = state.counter_key();
        let Some(bytes) = self.db.get_cf(cf, key).map_err(store_err)? else {
            return Ok(0);
        };
        let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| StoreError::Corrupt {
            table: CF_STATUS_COUNTS,
            reason: format!("{state} counter is {} bytes", bytes.len()),
        })?;
        let count = i64::from_le_bytes(raw);
        u64::try_from(count).map_err(|_| StoreError::Corrupt {
            table: CF_STATUS_COUNTS,
            reason: format!("negative {state} count {count}"),
        })
    }

    /// Spends recorded ahead of their creating block and not yet resolved.
    pub fn early_spend_count(&self) -> Result<u64, StoreError> {
        let cf = self.cf_handle(CF_EARLY_SPENDS)?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item.map_err(store_err)?;
            count += 1;
        }
        Ok(count)
    }

    /// Current balance of `address`; zero if it was never credited.
    pub fn balance(&self, address: &str) -> Result<u64, StoreError> {
        let cf = self.cf_handle(CF_BALANCES)?;
        match self.db.get_cf(cf, address.as_bytes()).map_err(store_err)? {
            Some(bytes) => decode_balance(address, &bytes),
            None => Ok(0),
        }
    }

    /// Every address with a balance of at least `min_balance`, largest first.
    pub fn balances(&self, min_balance: u64) -> Result<Vec<(String, u64)>, StoreError> {
        let mut result = Vec::new();
        self.for_each_balance(min_balance, |address, balance| result.push((address, balance)))?;
        result.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(result)
    }

    /// The `limit` largest balances of at least `min_balance`, largest
    /// first, and how many addresses matched in total.
    ///
    /// Holds at most `limit` rows in memory.
    pub fn top_balances(&self, min_balance: u64, limit: usize) -> Result<(Vec<(String, u64)>, u64), StoreError> {
        let mut heap = BinaryHeap::new();
        let mut matched = 0;
        self.for_each_balance(min_balance, |address, balance| {
            matched += 1;
            heap.push(Reverse((balance, Reverse(address))));
            if heap.len() > limit {
                heap.pop();
            }
        })?;
        let rows = heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse((balance, Reverse(address)))| (address, balance))
            .collect();
        Ok((rows, matched))
    }

    /// Stream every balance of at least `min_balance`, in address order.
    pub fn for_each_balance(&self, min_balance: u64, mut f: impl FnMut(String, u64)) -> Result<(), StoreError> {
        let cf = self.cf_handle(CF_BALANCES)?;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item.map_err(store_err)?;
            let address = String::from_utf8(key.into_vec()).map_err(|e| StoreError::Corrupt {
                table: CF_BALANCES,
                reason: e.to_string(),
            })?;
            let balance = decode_balance(&address, &value)?;
            if balance >= min_balance {
                f(address, balance);
            }
        }
        Ok(())
    }

    pub fn utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, StoreError> {
        let cf = self.cf_handle(CF_UTXOS)?;
        let bytes = self.db.get_cf(cf, outpoint_key(outpoint)).map_err(store_err)?;
        bytes.map(|b| decode_utxo(*outpoint, &b)).transpose()
    }

    /// The full unspent-output set, ordered by outpoint.
    pub fn utxos(&self) -> Result<Vec<UtxoEntry>, StoreError> {
        let cf = self.cf_handle(CF_UTXOS)?;
        let mut result = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item.map_err(store_err)?;
            result.push(decode_utxo(decode_outpoint(&key)?, &value)?);
        }
        Ok(result)
    }

    /// Unspent outputs owned by `address`, via the address index.
    pub fn utxos_for_address(&self, address: &str) -> Result<Vec<UtxoEntry>, StoreError> {
        let cf_addr = self.cf_handle(CF_ADDRESS_UTXOS)?;
        let prefix = address_prefix(address);

        let mut result = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf_addr, IteratorMode::From(prefix.as_slice(), Direction::Forward));
        for item in iter {
            let (key, _) = item.map_err(store_err)?;
            let Some(rest) = key.strip_prefix(prefix.as_slice()) else {
                break;
            };
            let outpoint = decode_outpoint(rest)?;
            if let Some(entry) = self.utxo(&outpoint)? {
                result.push(entry);
            }
        }
        Ok(result)
    }

    /// Get a column family handle.
    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::MissingColumnFamily(name.to_string()))
    }
}

/// A scoped atomic unit of work over the index.
///
/// Reads taken with `*_for_update` lock their row until the unit ends.
/// Dropping the unit without committing rolls back every write.
pub struct IndexUnit<'a> {
    store: &'a IndexStore,
    txn: Transaction<'a, TransactionDB>,
}

impl IndexUnit<'_> {
    pub fn commit(self) -> Result<(), StoreError> {
        self.txn.commit().map_err(store_err)
    }

    pub fn rollback(self) -> Result<(), StoreError> {
        self.txn.rollback().map_err(store_err)
    }

    /// Record an unspent output, insert-or-ignore.
    ///
    /// If a later height was applied first and already consumed this
    /// outpoint, its early-spend marker is cleared instead and nothing is
    /// recorded, so the final state does not depend on application order.
    pub fn upsert_output(&mut self, outpoint: &OutPoint, address: &str, value: u64) -> Result<OutputInsert, StoreError> {
        let cf_utxos = self.store.cf_handle(CF_UTXOS)?;
        let cf_addr = self.store.cf_handle(CF_ADDRESS_UTXOS)?;
        let cf_early = self.store.cf_handle(CF_EARLY_SPENDS)?;
        let key = outpoint_key(outpoint);

        if self.txn.get_for_update_cf(cf_utxos, key, true).map_err(store_err)?.is_some() {
            return Ok(OutputInsert::Duplicate);
        }
        if let Some(spent_at) = self.txn.get_for_update_cf(cf_early, key, true).map_err(store_err)? {
            let spent_at = decode_early_height(&spent_at)?;
            self.delete_early_spend(spent_at, outpoint)?;
            return Ok(OutputInsert::SpentEarlier);
        }

        let row = UtxoRow { address: address.to_string(), value };
        let bytes = bincode::encode_to_vec(&row, bincode::config::standard())
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        self.txn.put_cf(cf_utxos, key, bytes).map_err(store_err)?;
        self.txn
            .put_cf(cf_addr, address_index_key(address, outpoint), b"")
            .map_err(store_err)?;
        Ok(OutputInsert::Inserted)
    }

    /// Remove an unspent output, returning what it held.
    ///
    /// `None` if it was never recorded or has already been consumed. A miss
    /// leaves an early-spend marker, tagged with the spending height
    /// `spent_at`, so that a creating block applied later does not resurrect
    /// the output. Markers at or below the confirmed tip are pruned as the
    /// tip advances.
    pub fn consume_output(&mut self, outpoint: &OutPoint, spent_at: u64) -> Result<Option<UtxoEntry>, StoreError> {
        let cf_utxos = self.store.cf_handle(CF_UTXOS)?;
        let cf_addr = self.store.cf_handle(CF_ADDRESS_UTXOS)?;
        let key = outpoint_key(outpoint);

        let Some(bytes) = self.txn.get_for_update_cf(cf_utxos, key, true).map_err(store_err)? else {
            let cf_early = self.store.cf_handle(CF_EARLY_SPENDS)?;
            let cf_by_height = self.store.cf_handle(CF_EARLY_BY_HEIGHT)?;
            self.txn.put_cf(cf_early, key, height_key(spent_at)).map_err(store_err)?;
            self.txn
                .put_cf(cf_by_height, early_height_key(spent_at, outpoint), b"")
                .map_err(store_err)?;
            return Ok(None);
        };
        let entry = decode_utxo(*outpoint, &bytes)?;
        self.txn.delete_cf(cf_utxos, key).map_err(store_err)?;
        self.txn
            .delete_cf(cf_addr, address_index_key(&entry.address, outpoint))
            .map_err(store_err)?;
        Ok(Some(entry))
    }

    /// Add `amount` to the balance of `address`, creating it if absent.
    pub fn credit_balance(&mut self, address: &str, amount: i64) -> Result<(), StoreError> {
        self.merge_balance(address, amount)
    }

    /// Subtract `amount` (non-negative) from the balance of `address`.
    pub fn debit_balance(&mut self, address: &str, amount: i64) -> Result<(), StoreError> {
        let delta = amount.checked_neg().ok_or_else(|| StoreError::Corrupt {
            table: CF_BALANCES,
            reason: format!("debit of {amount} for {address}"),
        })?;
        self.merge_balance(address, delta)
    }

    fn delete_early_spend(&mut self, spent_at: u64, outpoint: &OutPoint) -> Result<(), StoreError> {
        let cf_early = self.store.cf_handle(CF_EARLY_SPENDS)?;
        let cf_by_height = self.store.cf_handle(CF_EARLY_BY_HEIGHT)?;
        self.txn.delete_cf(cf_early, outpoint_key(outpoint)).map_err(store_err)?;
        self.txn
            .delete_cf(cf_by_height, early_height_key(spent_at, outpoint))
            .map_err(store_err)
    }

    /// Drop early-spend markers left by heights at or below `tip`.
    ///
    /// Every creating block of such a marker is at or below the tip as well,
    /// so it has either consumed the marker already or never indexed the
    /// output (non-standard script).
    fn prune_early_spends(&mut self, tip: u64) -> Result<usize, StoreError> {
        let cf_by_height = self.store.cf_handle(CF_EARLY_BY_HEIGHT)?;
        let mut dead = Vec::new();
        for item in self.txn.iterator_cf(cf_by_height, IteratorMode::Start) {
            let (key, _) = item.map_err(store_err)?;
            let (spent_at, outpoint) = decode_early_height_key(&key)?;
            if spent_at > tip {
                break;
            }
            dead.push((spent_at, outpoint));
        }
        for (spent_at, outpoint) in &dead {
            self.delete_early_spend(*spent_at, outpoint)?;
        }
        Ok(dead.len())
    }

    fn merge_balance(&mut self, address: &str, delta: i64) -> Result<(), StoreError> {
        let cf = self.store.cf_handle(CF_BALANCES)?;
        self.txn
            .merge_cf(cf, address.as_bytes(), delta.to_le_bytes())
            .map_err(store_err)
    }

    /// Read the status of `height`, locking its row for the rest of the unit.
    pub fn status_for_update(&mut self, height: u64) -> Result<Option<BlockStatus>, StoreError> {
        let cf = self.store.cf_handle(CF_BLOCK_STATUS)?;
        let bytes = self
            .txn
            .get_for_update_cf(cf, height_key(height), true)
            .map_err(store_err)?;
        bytes.map(|b| decode_status(height, &b)).transpose()
    }

    /// Set the status of `height`.
    ///
    /// Processed resets the retry count to zero. Pending and failed increment
    /// it, pinned at `retry_limit`. A processed height never changes again.
    pub fn mark_status(&mut self, height: u64, state: BlockState, retry_limit: u32) -> Result<BlockStatus, StoreError> {
        let current = self.status_for_update(height)?;
        if let Some(status) = &current {
            if status.state == BlockState::Processed {
                return Ok(status.clone());
            }
        }

        let retry_count = match state {
            BlockState::Processed => 0,
            BlockState::Pending | BlockState::Failed => current
                .as_ref()
                .map_or(0, |s| s.retry_count)
                .saturating_add(1)
                .min(retry_limit),
        };
        let now = Utc::now();
        let row = StatusRow {
            state,
            retry_count,
            last_attempt_ms: now.timestamp_millis(),
        };

        let cf_status = self.store.cf_handle(CF_BLOCK_STATUS)?;
        let cf_backlog = self.store.cf_handle(CF_BACKLOG)?;
        let cf_counts = self.store.cf_handle(CF_STATUS_COUNTS)?;
        let key = height_key(height);
        self.txn.put_cf(cf_status, key, encode_status(&row)?).map_err(store_err)?;
        move_counter(&self.txn, cf_counts, current.as_ref().map(|s| s.state), state)?;
        if state == BlockState::Processed {
            self.txn.delete_cf(cf_backlog, key).map_err(store_err)?;
        } else {
            self.txn.put_cf(cf_backlog, key, b"").map_err(store_err)?;
        }

        Ok(BlockStatus {
            height,
            state,
            retry_count,
            last_attempt: millis_to_datetime(height, row.last_attempt_ms)?,
        })
    }

    /// Move the confirmed tip forward if `height` extends it.
    ///
    /// Locks the tip row for the rest of the unit, so concurrent units
    /// advance the tip one at a time and each sees the other's committed
    /// heights. When `height` is exactly one past the tip (or zero on an
    /// empty index) the tip walks forward over every contiguous height that
    /// is already processed. `height` itself counts as processed. Returns
    /// the resulting tip.
    pub fn advance_tip_if_contiguous(&mut self, height: u64) -> Result<Option<u64>, StoreError> {
        let cf_meta = self.store.cf_handle(CF_META)?;
        let prior = self
            .txn
            .get_for_update_cf(cf_meta, META_CONFIRMED_TIP, true)
            .map_err(store_err)?
            .map(|b| decode_tip(&b))
            .transpose()?;

        let extends = match prior {
            Some(tip) => tip.checked_add(1) == Some(height),
            None => height == 0,
        };
        if !extends {
            return Ok(prior);
        }

        let cf_status = self.store.cf_handle(CF_BLOCK_STATUS)?;
        let mut tip = height;
        loop {
            let Some(next) = tip.checked_add(1) else {
                break;
            };
            let processed = match self.txn.get_cf(cf_status, height_key(next)).map_err(store_err)? {
                Some(bytes) => decode_status(next, &bytes)?.state == BlockState::Processed,
                None => false,
            };
            if !processed {
                break;
            }
            tip = next;
        }

        self.txn
            .put_cf(cf_meta, META_CONFIRMED_TIP, tip.to_be_bytes())
            .map_err(store_err)?;
        let pruned = self.prune_early_spends(tip)?;
        if pruned > 0 {
            debug!(tip, pruned, "pruned early-spend markers");
        }
        Ok(Some(tip))
    }
}

/// Move one height's count from `from` to `to`. Callers hold the height's
/// status row lock, so transitions of one height never interleave.
fn move_counter(
    txn: &Transaction<'_, TransactionDB>,
    cf: &ColumnFamily,
    from: Option<BlockState>,
    to: BlockState,
) -> Result<(), StoreError> {
    if from == Some(to) {
        return Ok(());
    }
    if let Some(from) = from {
        txn.merge_cf(cf, from.counter_key(), (-1i64).to_le_bytes()).map_err(store_err)?;
    }
    txn.merge_cf(cf, to.counter_key(), 1i64.to_le_bytes()).map_err(store_err)
}

/// Associative add over little-endian i64 deltas.
fn add_merge(_key: &[u8], existing: Option<&[u8]>, operands: &MergeOperands) -> Option<Vec<u8>> {
    let mut total = match existing {
        Some(bytes) => i64::from_le_bytes(bytes.try_into().ok()?),
        None => 0,
    };
    for op in operands.iter() {
        total = total.checked_add(i64::from_le_bytes(op.try_into().ok()?))?;
    }
    Some(total.to_le_bytes().to_vec())
}

fn is_lock_conflict(e: &rocksdb::Error) -> bool {
    matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Busy)
}

fn store_err(e: rocksdb::Error) -> StoreError {
    if is_lock_conflict(&e) {
        StoreError::Busy(e.to_string())
    } else {
        StoreError::Backend(e.to_string())
    }
}

fn millis_i64(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Encode a height as big-endian bytes for ordered iteration.
fn height_key(height: u64) -> [u8; 8] {
    height.to_be_bytes()
}

fn decode_height(key: &[u8]) -> Result<u64, StoreError> {
    let bytes: [u8; 8] = key.try_into().map_err(|_| StoreError::Corrupt {
        table: CF_BLOCK_STATUS,
        reason: format!("height key of {} bytes", key.len()),
    })?;
    Ok(u64::from_be_bytes(bytes))
}

fn decode_tip(bytes: &[u8]) -> Result<u64, StoreError> {
    let bytes: [u8; 8] = bytes.try_into().map_err(|_| StoreError::Corrupt {
        table: CF_META,
        reason: "confirmed tip is not 8 bytes".into(),
    })?;
    Ok(u64::from_be_bytes(bytes))
}

/// Encode an outpoint key: txid || vout(BE).
fn outpoint_key(outpoint: &OutPoint) -> [u8; OUTPOINT_KEY_LEN] {
    let mut key = [0u8; OUTPOINT_KEY_LEN];
    key[..32].copy_from_slice(outpoint.txid.as_bytes());
    key[32..].copy_from_slice(&outpoint.vout.to_be_bytes());
    key
}

fn decode_outpoint(key: &[u8]) -> Result<OutPoint, StoreError> {
    match key {
        [txid @ .., a, b, c, d] if txid.len() == 32 => {
            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(txid);
            Ok(OutPoint::new(Hash256(bytes), u32::from_be_bytes([*a, *b, *c, *d])))
        }
        _ => Err(StoreError::Corrupt {
            table: CF_UTXOS,
            reason: format!("outpoint key of {} bytes", key.len()),
        }),
    }
}

/// Address strings never contain NUL, so `address || 0x00` is an
/// unambiguous prefix.
fn address_prefix(address: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(address.len() + 1);
    prefix.extend_from_slice(address.as_bytes());
    prefix.push(0);
    prefix
}

/// Encode an address index key: address || 0x00 || txid || vout(BE).
fn address_index_key(address: &str, outpoint: &OutPoint) -> Vec<u8> {
    let mut key = address_prefix(address);
    key.extend_from_slice(&outpoint_key(outpoint));
    key
}

/// Encode an early-spend index key: spent_at(BE) || txid || vout(BE).
fn early_height_key(spent_at: u64, outpoint: &OutPoint) -> [u8; 8 + OUTPOINT_KEY_LEN] {
    let mut key = [0u8; 8 + OUTPOINT_KEY_LEN];
    key[..8].copy_from_slice(&height_key(spent_at));
    key[8..].copy_from_slice(&outpoint_key(outpoint));
    key
}

fn decode_early_height_key(key: &[u8]) -> Result<(u64, OutPoint), StoreError> {
    if key.len() != 8 + OUTPOINT_KEY_LEN {
        return Err(StoreError::Corrupt {
            table: CF_EARLY_BY_HEIGHT,
            reason: format!("key of {} bytes", key.len()),
        });
    }
    let (height, outpoint) = key.split_at(8);
    Ok((decode_height(height)?, decode_outpoint(outpoint)?))
}

fn decode_early_height(bytes: &[u8]) -> Result<u64, StoreError> {
    let bytes: [u8; 8] = bytes.try_into().map_err(|_| StoreError::Corrupt {
        table: CF_EARLY_SPENDS,
        reason: format!("spending height of {} bytes", bytes.len()),
    })?;
    Ok(u64::from_be_bytes(bytes))
}

fn encode_status(row: &StatusRow) -> Result<Vec<u8>, StoreError> {
    bincode::encode_to_vec(row, bincode::config::standard()).map_err(|e| StoreError::Backend(e.to_string()))
}

fn decode_status(height: u64, bytes: &[u8]) -> Result<BlockStatus, StoreError> {
    let (row, _): (StatusRow, usize) = bincode::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Corrupt {
            table: CF_BLOCK_STATUS,
            reason: e.to_string(),
        })?;
    Ok(BlockStatus {
        height,
        state: row.state,
        retry_count: row.retry_count,
        last_attempt: millis_to_datetime(height, row.last_attempt_ms)?,
    })
}

fn millis_to_datetime(height: u64, ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::Corrupt {
        table: CF_BLOCK_STATUS,
        reason: format!("timestamp {ms} out of range at height {height}"),
    })
}

fn decode_utxo(outpoint: OutPoint, bytes: &[u8]) -> Result<UtxoEntry, StoreError> {
    let (row, _): (UtxoRow, usize) = bincode::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Corrupt {
            table: CF_UTXOS,
            reason: e.to_string(),
        })?;
    Ok(UtxoEntry {
        outpoint,
        address: row.address,
        value: row.value,
    })
}

fn decode_balance(address: &str, bytes: &[u8]) -> Result<u64, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        table: CF_BALANCES,
        reason,
    };
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| corrupt(format!("balance of {address} is {} bytes", bytes.len())))?;
    let balance = i64::from_le_bytes(raw);
    u64::try_from(balance).map_err(|_| corrupt(format!("negative balance {balance} for {address}")))
}
