//! # tally-index: the indexing engine.
//!
//! Folds blocks from a ledger into a durable UTXO set and per-address
//! balances:
//! - [`storage::IndexStore`]: RocksDB-backed state with atomic units
//! - [`scheduler::Scheduler`]: lock-and-skip claiming of heights
//! - [`applier::BlockApplier`]: exactly-once application of one block
//! - [`orchestrator::Orchestrator`]: worker pool, retries and progress
//! - [`ledger::RpcLedger`]: JSON-RPC [`LedgerSource`](tally_core::traits::LedgerSource)
//! - [`config::IndexerConfig`]: engine configuration
//! - [`indexer::Indexer`]: the above wired together for one data directory

pub mod applier;
pub mod config;
pub mod indexer;
pub mod ledger;
pub mod orchestrator;
pub mod scheduler;
pub mod storage;

pub use applier::{ApplyOutcome, BlockApplier, BlockSummary};
pub use config::{IndexerConfig, ScanConfig};
pub use indexer::Indexer;
pub use ledger::RpcLedger;
pub use orchestrator::{Orchestrator, PassSummary, ScanOutcome, ScanReport};
pub use scheduler::{ClaimPolicy, Scheduler};
pub use storage::{BlockState, BlockStatus, IndexStore, IndexUnit, OutputInsert, StatusCounts, UtxoEntry};
