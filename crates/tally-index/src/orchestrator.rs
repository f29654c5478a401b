//! Scan orchestrator.
//!
//! Drives claim → apply cycles until the confirmed tip reaches the target:
//!
//! ```text
//! Idle -> Draining(claim, dispatch, await) -> CheckTip -> Draining | Done
//! ```
//!
//! Each claimed height runs on a bounded worker pool with up to
//! `retry_limit` attempts and exponential backoff between them. When nothing
//! is claimable but the tip is short of the target, the orchestrator polls,
//! unless every remaining gap is a height that exhausted its retries, in
//! which case polling can never help and the run ends as
//! [`ScanOutcome::Stalled`].
//!
//! Progress is logged on a wall-clock ticker that keeps running while a
//! batch is in flight and while the run polls.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{error, info, warn};

use tally_core::constants::NetworkParams;
use tally_core::error::StoreError;
use tally_core::traits::LedgerSource;

use crate::applier::{ApplyOutcome, BlockApplier};
use crate::config::ScanConfig;
use crate::scheduler::{ClaimPolicy, Scheduler};
use crate::storage::IndexStore;

/// How a scan run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The confirmed tip reached the target.
    Completed,
    /// Shutdown was requested.
    Cancelled,
    /// Heights at or below the target are failed with exhausted retries.
    Stalled,
}

/// Totals over a whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub outcome: ScanOutcome,
    pub confirmed_tip: Option<u64>,
    pub applied: u64,
    pub already_done: u64,
    pub failed_attempts: u64,
    /// Progress lines emitted, including the final one.
    pub progress_reports: u64,
}

/// Result of one claim-and-dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub claimed: usize,
    pub applied: u64,
    pub already_done: u64,
    pub failed_attempts: u64,
    /// Heights left failed at the end of this pass.
    pub gave_up: u64,
}

/// Final state of one height's attempt loop.
enum HeightOutcome {
    Applied { failures: u64 },
    AlreadyDone { failures: u64 },
    GaveUp { failures: u64 },
}

pub struct Orchestrator {
    store: Arc<IndexStore>,
    scheduler: Scheduler,
    applier: Arc<BlockApplier>,
    config: ScanConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<IndexStore>,
        ledger: Arc<dyn LedgerSource>,
        params: NetworkParams,
        config: ScanConfig,
    ) -> Self {
        let scheduler = Scheduler::new(Arc::clone(&store), ClaimPolicy::from(&config));
        let applier = Arc::new(BlockApplier::new(
            Arc::clone(&store),
            ledger,
            params,
            config.retry_limit,
        ));
        Self { store, scheduler, applier, config }
    }

    /// Scan until the confirmed tip reaches `target`, the run stalls, or
    /// `shutdown` flips to `true`. Cancellation is observed between batches;
    /// in-flight heights finish or roll back on their own.
    pub async fn run(&self, target: u64, mut shutdown: watch::Receiver<bool>) -> Result<ScanReport, StoreError> {
        info!(target, workers = self.config.workers, batch_size = self.config.batch_size, "scan started");

        let mut report = ScanReport {
            outcome: ScanOutcome::Completed,
            confirmed_tip: None,
            applied: 0,
            already_done: 0,
            failed_attempts: 0,
            progress_reports: 0,
        };
        let mut ticker = progress_ticker(self.config.progress_interval());

        loop {
            if *shutdown.borrow() {
                report.outcome = ScanOutcome::Cancelled;
                break;
            }

            let pass = {
                let pass = self.run_pass(target);
                tokio::pin!(pass);
                loop {
                    tokio::select! {
                        pass = &mut pass => break pass,
                        _ = ticker.tick() => {
                            self.log_progress(target)?;
                            report.progress_reports += 1;
                        }
                    }
                }
            };
            report.applied += pass.applied;
            report.already_done += pass.already_done;
            report.failed_attempts += pass.failed_attempts;

            if pass.claimed > 0 {
                continue;
            }
            if self.store.confirmed_tip()?.is_some_and(|tip| tip >= target) {
                report.outcome = ScanOutcome::Completed;
                break;
            }
            if self.is_stalled(target)? {
                report.outcome = ScanOutcome::Stalled;
                break;
            }

            let poll = tokio::time::sleep(self.config.poll_interval());
            tokio::pin!(poll);
            let mut cancellable = true;
            loop {
                tokio::select! {
                    _ = &mut poll => break,
                    changed = shutdown.changed(), if cancellable => {
                        if changed.is_ok() {
                            break;
                        }
                        // Sender gone: nobody can cancel any more, finish the poll.
                        cancellable = false;
                    }
                    _ = ticker.tick() => {
                        self.log_progress(target)?;
                        report.progress_reports += 1;
                    }
                }
            }
        }

        report.confirmed_tip = self.store.confirmed_tip()?;
        self.log_progress(target)?;
        report.progress_reports += 1;
        match report.outcome {
            ScanOutcome::Stalled => error!(
                target,
                confirmed_tip = ?report.confirmed_tip,
                "scan stalled on heights that exhausted their retries"
            ),
            outcome => info!(
                ?outcome,
                target,
                confirmed_tip = ?report.confirmed_tip,
                applied = report.applied,
                failed_attempts = report.failed_attempts,
                "scan finished"
            ),
        }
        Ok(report)
    }

    /// Claim one batch and run it to completion on the worker pool.
    pub async fn run_pass(&self, target: u64) -> PassSummary {
        let scheduler = self.scheduler.clone();
        let batch = match tokio::task::spawn_blocking(move || scheduler.claim_batch(target)).await {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "claim task failed, treating batch as empty");
                Vec::new()
            }
        };
        let mut summary = PassSummary { claimed: batch.len(), ..PassSummary::default() };
        if batch.is_empty() {
            return summary;
        }

        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut workers = JoinSet::new();
        for height in batch {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let applier = Arc::clone(&self.applier);
            let config = self.config.clone();
            workers.spawn(async move {
                let _permit = permit;
                process_height(&applier, &config, height).await
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(HeightOutcome::Applied { failures }) => {
                    summary.applied += 1;
                    summary.failed_attempts += failures;
                }
                Ok(HeightOutcome::AlreadyDone { failures }) => {
                    summary.already_done += 1;
                    summary.failed_attempts += failures;
                }
                Ok(HeightOutcome::GaveUp { failures }) => {
                    summary.gave_up += 1;
                    summary.failed_attempts += failures;
                }
                Err(e) => error!(error = %e, "block worker panicked"),
            }
        }
        summary
    }

    /// Emit counts of processed, failed and pending heights.
    pub fn log_progress(&self, target: u64) -> Result<(), StoreError> {
        let counts = self.store.status_counts()?;
        let tip = self.store.confirmed_tip()?;
        info!(
            processed = counts.processed,
            failed = counts.failed,
            pending = counts.pending,
            confirmed_tip = ?tip,
            target,
            "scan progress"
        );
        Ok(())
    }

    /// Nothing in flight, nothing retryable at or below the target, and at
    /// least one exhausted height at or below it.
    fn is_stalled(&self, target: u64) -> Result<bool, StoreError> {
        let policy = self.scheduler.policy();
        let backlog = self
            .store
            .backlog(policy.retry_limit, policy.stale_before(Utc::now()))?;
        Ok(backlog.in_flight.is_empty()
            && backlog.retryable.iter().all(|&h| h > target)
            && backlog.exhausted.iter().any(|&h| h <= target))
    }
}

/// Ticks every `period` from one period after now; a slow tick is not
/// made up with a burst.
fn progress_ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Attempt `height` up to `retry_limit` times, sleeping between attempts.
/// The height stays claimed until the last attempt fails.
async fn process_height(applier: &BlockApplier, config: &ScanConfig, height: u64) -> HeightOutcome {
    let attempts = config.retry_limit.max(1);
    let mut failures = 0;
    for attempt in 1..=attempts {
        match applier.attempt(height, attempt < attempts).await {
            Ok(ApplyOutcome::Applied(_)) => return HeightOutcome::Applied { failures },
            Ok(ApplyOutcome::AlreadyDone) => return HeightOutcome::AlreadyDone { failures },
            Err(e) => {
                failures += 1;
                if attempt == attempts || !e.is_retryable() {
                    error!(height, attempts = attempt, error = %e, "giving up on height for this pass");
                    return HeightOutcome::GaveUp { failures };
                }
                let delay = config.backoff(attempt);
                warn!(height, attempt, delay_ms = delay.as_millis() as u64, "retrying block");
                tokio::time::sleep(delay).await;
            }
        }
    }
    HeightOutcome::GaveUp { failures }
}
