//! Integration test suite for the Tally indexer.
//!
//! Drives the scan engine against an in-memory ledger and checks the
//! projection end to end: balances, the UTXO set, retry bookkeeping and the
//! confirmed tip, including under concurrent workers.

pub mod helpers;
