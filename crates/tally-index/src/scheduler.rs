//! Block claim scheduler.
//!
//! Picks the heights a worker pool should process next and reserves them in
//! the store. Candidates, in priority order:
//!
//! 1. failed heights still under the retry limit, and pending heights whose
//!    claim outlived its lease (the claimer died)
//! 2. the next `sequential_window` heights after the highest known height
//! 3. height 0 onward, if the store is empty
//!
//! Candidates above the target are dropped and the rest claimed in ascending
//! order with lock-and-skip, so concurrent schedulers never hand out the same
//! height and never wait on each other.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, error};

use tally_core::error::StoreError;

use crate::config::ScanConfig;
use crate::storage::IndexStore;

/// The subset of [`ScanConfig`] that governs claiming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimPolicy {
    pub retry_limit: u32,
    pub batch_size: usize,
    pub stale_claim_lease: Duration,
    pub sequential_window: u64,
}

impl From<&ScanConfig> for ClaimPolicy {
    fn from(cfg: &ScanConfig) -> Self {
        Self {
            retry_limit: cfg.retry_limit,
            batch_size: cfg.batch_size,
            stale_claim_lease: cfg.stale_claim_lease(),
            sequential_window: cfg.sequential_window,
        }
    }
}

impl ClaimPolicy {
    /// Pending claims last attempted at or before this instant are stale.
    pub fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let lease = TimeDelta::from_std(self.stale_claim_lease).unwrap_or(TimeDelta::MAX);
        now.checked_sub_signed(lease).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[derive(Clone)]
pub struct Scheduler {
    store: Arc<IndexStore>,
    policy: ClaimPolicy,
}

impl Scheduler {
    pub fn new(store: Arc<IndexStore>, policy: ClaimPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &ClaimPolicy {
        &self.policy
    }

    /// Ordered, de-duplicated candidate heights at or below `target`.
    pub fn candidates(&self, target: u64) -> Result<Vec<u64>, StoreError> {
        let stale_before = self.policy.stale_before(Utc::now());
        let mut candidates = self.store.backlog(self.policy.retry_limit, stale_before)?.retryable;

        let window = self.policy.sequential_window.max(1);
        match self.store.max_known_height()? {
            Some(max) => candidates.extend((1..=window).filter_map(|i| max.checked_add(i))),
            None => candidates.extend(0..window),
        }

        candidates.retain(|&h| h <= target);
        candidates.sort_unstable();
        candidates.dedup();
        Ok(candidates)
    }

    /// Reserve up to `batch_size` heights at or below `target`.
    ///
    /// Store failures yield an empty batch; nothing is marked pending unless
    /// the claiming unit commits.
    pub fn claim_batch(&self, target: u64) -> Vec<u64> {
        let result = self.candidates(target).and_then(|candidates| {
            if candidates.is_empty() {
                return Ok(Vec::new());
            }
            let stale_before = self.policy.stale_before(Utc::now());
            self.store.try_claim(
                &candidates,
                self.policy.batch_size,
                self.policy.retry_limit,
                stale_before,
            )
        });

        match result {
            Ok(batch) => {
                if !batch.is_empty() {
                    debug!(count = batch.len(), first = batch[0], "claimed heights");
                }
                batch
            }
            Err(e) => {
                error!(error = %e, "claim failed, treating batch as empty");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BlockState;

    fn setup(policy: ClaimPolicy) -> (tempfile::TempDir, Arc<IndexStore>, Scheduler) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(IndexStore::open(dir.path().join("index"), Duration::from_millis(200)).unwrap());
        let scheduler = Scheduler::new(Arc::clone(&store), policy);
        (dir, store, scheduler)
    }

    fn policy() -> ClaimPolicy {
        ClaimPolicy::from(&ScanConfig::default())
    }

    fn mark_processed(store: &IndexStore, height: u64) {
        let mut unit = store.begin_unit().unwrap();
        unit.mark_status(height, BlockState::Processed, 3).unwrap();
        unit.commit().unwrap();
    }

    #[test]
    fn empty_store_offers_genesis() {
        let (_dir, _store, scheduler) = setup(policy());
        assert_eq!(scheduler.candidates(100).unwrap(), vec![0]);
        assert_eq!(scheduler.claim_batch(100), vec![0]);
    }

    #[test]
    fn next_sequential_follows_max_known() {
        let (_dir, store, scheduler) = setup(policy());
        mark_processed(&store, 0);
        mark_processed(&store, 1);
        assert_eq!(scheduler.candidates(100).unwrap(), vec![2]);
    }

    #[test]
    fn retry_backlog_comes_first_in_height_order() {
        let (_dir, store, scheduler) = setup(policy());
        for h in 0..6 {
            mark_processed(&store, h);
        }
        store.record_failure(4, 3).unwrap();
        // record_failure leaves processed rows alone, so fail fresh heights.
        store.record_failure(7, 3).unwrap();
        store.record_failure(9, 3).unwrap();
        assert_eq!(scheduler.candidates(100).unwrap(), vec![7, 9, 10]);
    }

    #[test]
    fn exhausted_heights_are_not_candidates() {
        let (_dir, store, scheduler) = setup(policy());
        mark_processed(&store, 0);
        for _ in 0..3 {
            store.record_failure(1, 3).unwrap();
        }
        assert_eq!(scheduler.candidates(100).unwrap(), vec![2]);
    }

    #[test]
    fn target_caps_candidates() {
        let (_dir, store, scheduler) = setup(policy());
        mark_processed(&store, 0);
        assert_eq!(scheduler.candidates(0).unwrap(), Vec::<u64>::new());
        assert!(scheduler.claim_batch(0).is_empty());
    }

    #[test]
    fn sequential_window_widens_the_frontier() {
        let (_dir, store, scheduler) = setup(ClaimPolicy { sequential_window: 4, ..policy() });
        assert_eq!(scheduler.candidates(2).unwrap(), vec![0, 1, 2]);
        mark_processed(&store, 0);
        assert_eq!(scheduler.candidates(100).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn batch_size_limits_claim() {
        let (_dir, _store, scheduler) = setup(ClaimPolicy { sequential_window: 20, batch_size: 5, ..policy() });
        assert_eq!(scheduler.claim_batch(100), vec![0, 1, 2, 3, 4]);
        assert_eq!(scheduler.claim_batch(100), vec![5, 6, 7, 8, 9]);
    }

    #[test]
    fn stale_claims_are_reclaimed() {
        let (_dir, store, scheduler) = setup(ClaimPolicy { stale_claim_lease: Duration::ZERO, ..policy() });
        assert_eq!(scheduler.claim_batch(0), vec![0]);
        assert_eq!(scheduler.claim_batch(0), vec![0]);
        let status = store.block_status(0).unwrap().unwrap();
        assert_eq!(status.retry_count, 2);
    }

    #[test]
    fn live_claims_are_not_reclaimed() {
        let (_dir, _store, scheduler) = setup(policy());
        assert_eq!(scheduler.claim_batch(0), vec![0]);
        assert!(scheduler.claim_batch(0).is_empty());
    }

    #[test]
    fn stale_before_saturates() {
        let p = ClaimPolicy { stale_claim_lease: Duration::MAX, ..policy() };
        assert_eq!(p.stale_before(Utc::now()), DateTime::<Utc>::MIN_UTC);
    }
}
